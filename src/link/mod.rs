//! Line transport between the gateway and the camera device.
//!
//! The link carries newline-terminated text in both directions: protocol and
//! log lines from the device, acknowledgment lines back to it. Reading happens
//! on one thread only (the link reader); acknowledgments are written from
//! ingestion workers through an [`AckSink`].

pub mod serial;

use anyhow::{anyhow, Context, Result};
use std::fmt;
use std::io::{BufRead, ErrorKind, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use crate::frame::{DecoderEvent, FrameDecoder, MAX_IMAGE_BYTES};
use crate::images::sanitize_plate;
use crate::Image;

/// Longest line accepted from the device (a whole payload on one line plus slack).
pub const MAX_LINE_BYTES: usize = MAX_IMAGE_BYTES * 2 + 64;

/// Failure reason sent to the device when recognition fails.
pub const OCR_FAILED: &str = "OCR_FAILED";

/// Result of one read attempt on the link.
#[derive(Debug, PartialEq, Eq)]
pub enum LinkRead {
    Line(String),
    /// Nothing arrived within the transport's read timeout.
    Idle,
    /// The link is gone (EOF or device unplugged).
    Closed,
}

/// Source of device lines.
pub trait LineSource {
    fn read_line(&mut self) -> Result<LinkRead>;
}

/// Destination for lines sent back to the device.
pub trait AckSink: Send + Sync {
    fn send_line(&self, line: &str) -> Result<()>;
}

/// Acknowledgment line summarizing the outcome of one image. Field values are
/// reduced to `[A-Za-z0-9_-]` so they cannot split or inject protocol lines.
#[derive(Clone, Debug, PartialEq)]
pub enum DeviceAck {
    Success { plate: String, confidence: f64 },
    Failed { reason: String },
}

impl DeviceAck {
    pub fn ocr_failed() -> Self {
        DeviceAck::Failed {
            reason: OCR_FAILED.to_string(),
        }
    }
}

impl fmt::Display for DeviceAck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceAck::Success { plate, confidence } => {
                write!(
                    f,
                    "ACK:SUCCESS,PLATE:{},CONF:{:.2}",
                    sanitize_plate(plate),
                    confidence
                )
            }
            DeviceAck::Failed { reason } => {
                write!(f, "ACK:FAILED,ERROR:{}", sanitize_plate(reason))
            }
        }
    }
}

/// Decode one raw line: invalid UTF-8 is dropped and the terminator trimmed.
pub fn decode_line(raw: &[u8]) -> String {
    String::from_utf8_lossy(raw)
        .chars()
        .filter(|c| *c != char::REPLACEMENT_CHARACTER)
        .collect::<String>()
        .trim()
        .to_string()
}

/// Line source over any buffered reader (serial port, stdin, test input).
///
/// Read timeouts surface as [`LinkRead::Idle`]; a partially received line is
/// kept across timeouts until its terminator arrives.
pub struct BufReadSource<R: BufRead> {
    reader: R,
    partial: Vec<u8>,
    discarding: bool,
}

impl<R: BufRead> BufReadSource<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            partial: Vec::new(),
            discarding: false,
        }
    }
}

impl<R: BufRead> BufReadSource<R> {
    fn drop_oversized(&mut self) {
        if !self.discarding {
            log::warn!(
                "dropping oversized device line (more than {} bytes)",
                MAX_LINE_BYTES
            );
        }
        self.partial.clear();
        self.discarding = true;
    }
}

impl<R: BufRead> LineSource for BufReadSource<R> {
    fn read_line(&mut self) -> Result<LinkRead> {
        loop {
            // Never buffer more than one byte past the line limit.
            let budget = (MAX_LINE_BYTES + 1).saturating_sub(self.partial.len()).max(1) as u64;
            match (&mut self.reader)
                .take(budget)
                .read_until(b'\n', &mut self.partial)
            {
                Ok(0) => {
                    if self.partial.is_empty() || self.discarding {
                        self.partial.clear();
                        return Ok(LinkRead::Closed);
                    }
                    let raw = std::mem::take(&mut self.partial);
                    return Ok(LinkRead::Line(decode_line(&raw)));
                }
                Ok(_) if self.partial.last() == Some(&b'\n') => {
                    let raw = std::mem::take(&mut self.partial);
                    if self.discarding {
                        self.discarding = false;
                        continue;
                    }
                    return Ok(LinkRead::Line(decode_line(&raw)));
                }
                Ok(_) if self.partial.len() > MAX_LINE_BYTES => self.drop_oversized(),
                Ok(_) => {
                    // EOF without a terminator; the next call reports Closed.
                    let raw = std::mem::take(&mut self.partial);
                    if self.discarding {
                        return Ok(LinkRead::Closed);
                    }
                    return Ok(LinkRead::Line(decode_line(&raw)));
                }
                Err(err)
                    if matches!(
                        err.kind(),
                        ErrorKind::TimedOut | ErrorKind::WouldBlock | ErrorKind::Interrupted
                    ) =>
                {
                    return Ok(LinkRead::Idle);
                }
                Err(err) => return Err(err).context("read from device link"),
            }
        }
    }
}

/// Ack sink over a writer that can be swapped when the link reconnects.
pub struct WriterSink<W: Write + Send> {
    writer: Mutex<Option<W>>,
}

impl<W: Write + Send> WriterSink<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(Some(writer)),
        }
    }

    /// A sink with no link attached yet; sends fail until `replace` is called.
    pub fn disconnected() -> Self {
        Self {
            writer: Mutex::new(None),
        }
    }

    pub fn replace(&self, writer: W) {
        *self.writer.lock().unwrap_or_else(|e| e.into_inner()) = Some(writer);
    }

    pub fn disconnect(&self) {
        *self.writer.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }
}

impl<W: Write + Send> AckSink for WriterSink<W> {
    fn send_line(&self, line: &str) -> Result<()> {
        let mut guard = self.writer.lock().unwrap_or_else(|e| e.into_inner());
        let writer = guard
            .as_mut()
            .ok_or_else(|| anyhow!("device link is not connected"))?;
        writer
            .write_all(format!("{}\n", line).as_bytes())
            .context("write to device link")?;
        writer.flush().context("flush device link")?;
        Ok(())
    }
}

/// Counters for one link reader.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LinkStats {
    pub lines: u64,
    pub device_logs: u64,
    pub frames_ready: u64,
    pub frames_dropped: u64,
}

/// Feeds link lines through the frame decoder and hands out completed images.
#[derive(Debug, Default)]
pub struct LinkReader {
    decoder: FrameDecoder,
    stats: LinkStats,
}

impl LinkReader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self) -> &LinkStats {
        &self.stats
    }

    /// Abandon any partial frame (link dropped mid-frame).
    pub fn reset(&mut self) {
        if self.decoder.state() != crate::frame::DecoderState::Idle {
            log::warn!("link interrupted mid-frame; partial image discarded");
            self.stats.frames_dropped += 1;
        }
        self.decoder.reset();
    }

    /// Process one line. Returns the image when this line completed a frame.
    pub fn handle_line(&mut self, line: &str) -> Option<Image> {
        self.stats.lines += 1;
        match self.decoder.feed(line)? {
            DecoderEvent::FrameReady(image) => {
                self.stats.frames_ready += 1;
                log::info!("image received ({} bytes)", image.len());
                Some(image)
            }
            DecoderEvent::FrameError(err) => {
                self.stats.frames_dropped += 1;
                log::warn!("image dropped: {}", err);
                None
            }
            DecoderEvent::DeviceLog(text) => {
                self.stats.device_logs += 1;
                log::info!("device: {}", text);
                None
            }
        }
    }

    /// Read until the source closes or `shutdown` is set.
    ///
    /// `on_image` must not block on recognition; hand the image to a worker.
    pub fn run<S, F>(&mut self, source: &mut S, shutdown: &AtomicBool, mut on_image: F) -> Result<()>
    where
        S: LineSource + ?Sized,
        F: FnMut(Image),
    {
        while !shutdown.load(Ordering::SeqCst) {
            let read = match source.read_line() {
                Ok(read) => read,
                Err(err) => {
                    self.reset();
                    return Err(err);
                }
            };
            match read {
                LinkRead::Line(line) => {
                    if let Some(image) = self.handle_line(&line) {
                        on_image(image);
                    }
                }
                LinkRead::Idle => {}
                LinkRead::Closed => {
                    self.reset();
                    return Ok(());
                }
            }
        }
        self.reset();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::io::{BufReader, Cursor};

    #[test]
    fn success_ack_formats_two_decimals() {
        let ack = DeviceAck::Success {
            plate: "30A-12345".to_string(),
            confidence: 0.912,
        };
        assert_eq!(ack.to_string(), "ACK:SUCCESS,PLATE:30A-12345,CONF:0.91");
        assert_eq!(
            DeviceAck::ocr_failed().to_string(),
            "ACK:FAILED,ERROR:OCR_FAILED"
        );
    }

    #[test]
    fn decode_line_drops_invalid_utf8_and_terminator() {
        assert_eq!(decode_line(b"SIZE:4\r\n"), "SIZE:4");
        assert_eq!(decode_line(b"DATA\xff_START\n"), "DATA_START");
    }

    #[test]
    fn bufread_source_yields_lines_then_closed() {
        let mut source = BufReadSource::new(Cursor::new(b"one\r\ntwo\nthree".to_vec()));
        assert_eq!(source.read_line().unwrap(), LinkRead::Line("one".into()));
        assert_eq!(source.read_line().unwrap(), LinkRead::Line("two".into()));
        assert_eq!(source.read_line().unwrap(), LinkRead::Line("three".into()));
        assert_eq!(source.read_line().unwrap(), LinkRead::Closed);
    }

    #[test]
    fn ack_fields_cannot_inject_protocol_lines() {
        let ack = DeviceAck::Success {
            plate: "30A,1\nSTART_IMAGE".to_string(),
            confidence: 0.8,
        };
        assert_eq!(
            ack.to_string(),
            "ACK:SUCCESS,PLATE:30A_1_START_IMAGE,CONF:0.80"
        );
        let failed = DeviceAck::Failed {
            reason: "bad\r\nACK:SUCCESS".to_string(),
        };
        assert_eq!(failed.to_string(), "ACK:FAILED,ERROR:bad__ACK_SUCCESS");
    }

    /// Reader replaying chunks and transport errors in order.
    struct ScriptedReader {
        script: VecDeque<Result<Vec<u8>, ErrorKind>>,
    }

    impl Read for ScriptedReader {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            match self.script.pop_front() {
                Some(Ok(chunk)) => {
                    buf[..chunk.len()].copy_from_slice(&chunk);
                    Ok(chunk.len())
                }
                Some(Err(kind)) => Err(std::io::Error::new(kind, "serial timeout")),
                None => Ok(0),
            }
        }
    }

    #[test]
    fn partial_line_survives_read_timeouts() {
        let reader = ScriptedReader {
            script: VecDeque::from(vec![
                Ok(b"STAR".to_vec()),
                Err(ErrorKind::TimedOut),
                Ok(b"T_IMAGE\nSIZE".to_vec()),
                Err(ErrorKind::WouldBlock),
                Ok(b":4\n".to_vec()),
            ]),
        };
        let mut source = BufReadSource::new(BufReader::new(reader));
        assert_eq!(source.read_line().unwrap(), LinkRead::Idle);
        assert_eq!(source.read_line().unwrap(), LinkRead::Line("START_IMAGE".into()));
        assert_eq!(source.read_line().unwrap(), LinkRead::Idle);
        assert_eq!(source.read_line().unwrap(), LinkRead::Line("SIZE:4".into()));
        assert_eq!(source.read_line().unwrap(), LinkRead::Closed);
    }

    #[test]
    fn oversized_line_is_discarded_without_unbounded_buffering() {
        let mut input = vec![b'A'; MAX_LINE_BYTES * 2 + 10];
        input.extend_from_slice(b"\nnext\n");
        let mut source = BufReadSource::new(Cursor::new(input));
        assert_eq!(source.read_line().unwrap(), LinkRead::Line("next".into()));
        assert!(source.partial.capacity() <= 2 * (MAX_LINE_BYTES + 1));
        assert_eq!(source.read_line().unwrap(), LinkRead::Closed);

        let mut source = BufReadSource::new(Cursor::new(vec![b'B'; MAX_LINE_BYTES + 100]));
        assert_eq!(source.read_line().unwrap(), LinkRead::Closed);
    }

    #[test]
    fn writer_sink_appends_newline_and_reports_disconnect() {
        let sink = WriterSink::new(Vec::new());
        sink.send_line("ACK:FAILED,ERROR:OCR_FAILED").unwrap();
        let written = sink.writer.lock().unwrap().take().unwrap();
        assert_eq!(written, b"ACK:FAILED,ERROR:OCR_FAILED\n");
        assert!(sink.send_line("late").is_err());
    }

    #[test]
    fn reader_emits_images_in_line_order() {
        let input = "boot ok\nSTART_IMAGE\nSIZE:2\nDATA_START\n0102\nDATA_END\nEND_IMAGE\n\
                     START_IMAGE\nSIZE:1\nDATA_START\nff\nDATA_END\nEND_IMAGE\n";
        let mut source = BufReadSource::new(Cursor::new(input.as_bytes().to_vec()));
        let mut reader = LinkReader::new();
        let shutdown = AtomicBool::new(false);
        let mut images = Vec::new();
        reader
            .run(&mut source, &shutdown, |image| images.push(image))
            .unwrap();
        assert_eq!(images.len(), 2);
        assert_eq!(images[0].bytes(), &[1, 2]);
        assert_eq!(images[1].bytes(), &[0xff]);
        assert_eq!(reader.stats().device_logs, 1);
        assert_eq!(reader.stats().frames_ready, 2);
    }

    #[test]
    fn link_closing_mid_frame_discards_partial_image() {
        let input = "START_IMAGE\nSIZE:4\nDATA_START\nDEAD\n";
        let mut source = BufReadSource::new(Cursor::new(input.as_bytes().to_vec()));
        let mut reader = LinkReader::new();
        let shutdown = AtomicBool::new(false);
        let mut count = 0;
        reader.run(&mut source, &shutdown, |_| count += 1).unwrap();
        assert_eq!(count, 0);
        assert_eq!(reader.stats().frames_dropped, 1);
    }
}
