//! Line protocol frame decoder.
//!
//! The camera sends each image as a block of text lines:
//!
//! ```text
//! START_IMAGE
//! SIZE:<decoded byte length>
//! DATA_START
//! <hex payload, any number of lines, whitespace ignored>
//! DATA_END
//! END_IMAGE
//! ```
//!
//! Any other line outside the payload block is a device log line. The decoder
//! is a pure state machine over `(state, line)`: it performs no I/O and never
//! blocks, so it can be driven line-by-line from the link reader or from tests.
//!
//! Leniency rules:
//! - a second `START_IMAGE` before `END_IMAGE` abandons the partial frame
//! - stray size/data markers while idle are ignored
//! - a frame whose decoded length differs from its declaration is dropped

use crate::error::FrameError;
use crate::Image;

/// Upper bound on a single decoded image.
pub const MAX_IMAGE_BYTES: usize = 5 * 1024 * 1024;

pub const START_IMAGE: &str = "START_IMAGE";
pub const DATA_START: &str = "DATA_START";
pub const DATA_END: &str = "DATA_END";
pub const END_IMAGE: &str = "END_IMAGE";
pub const SIZE_PREFIX: &str = "SIZE:";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DecoderState {
    /// No frame in progress.
    Idle,
    /// `START_IMAGE` seen, waiting for the size and `DATA_START`.
    Sizing,
    /// `DATA_START` seen; payload lines accumulate until `DATA_END`.
    Collecting,
}

/// Output of feeding one line.
#[derive(Debug)]
pub enum DecoderEvent {
    /// A complete frame whose length matched its declaration.
    FrameReady(Image),
    /// A frame was dropped. The decoder is back in `Idle`.
    FrameError(FrameError),
    /// An opaque device log line, informational only.
    DeviceLog(String),
}

/// A completed, not yet validated payload.
#[derive(Debug)]
pub struct Frame {
    bytes: Vec<u8>,
    declared_len: usize,
}

impl Frame {
    pub fn new(bytes: Vec<u8>, declared_len: usize) -> Self {
        Self {
            bytes,
            declared_len,
        }
    }

    /// Promote to an `Image` if the decoded length matches the declaration.
    pub fn validate(self) -> Result<Image, FrameError> {
        if self.bytes.len() != self.declared_len {
            return Err(FrameError::LengthMismatch {
                expected: self.declared_len,
                actual: self.bytes.len(),
            });
        }
        Ok(Image::new(self.bytes))
    }
}

enum Token<'a> {
    StartImage,
    Size(&'a str),
    DataStart,
    DataEnd,
    EndImage,
    Other(&'a str),
}

fn classify(line: &str) -> Token<'_> {
    match line {
        START_IMAGE => Token::StartImage,
        DATA_START => Token::DataStart,
        DATA_END => Token::DataEnd,
        END_IMAGE => Token::EndImage,
        _ => match line.strip_prefix(SIZE_PREFIX) {
            Some(value) => Token::Size(value),
            None => Token::Other(line),
        },
    }
}

fn parse_size(value: &str) -> Result<usize, FrameError> {
    let declared: usize = value
        .trim()
        .parse()
        .map_err(|_| FrameError::InvalidSize(value.to_string()))?;
    if declared > MAX_IMAGE_BYTES {
        return Err(FrameError::SizeTooLarge {
            declared,
            limit: MAX_IMAGE_BYTES,
        });
    }
    Ok(declared)
}

/// Reconstructs images from protocol lines. One instance per link.
#[derive(Debug)]
pub struct FrameDecoder {
    state: DecoderState,
    declared_len: Option<usize>,
    hex: String,
    in_payload: bool,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self {
            state: DecoderState::Idle,
            declared_len: None,
            hex: String::new(),
            in_payload: false,
        }
    }

    pub fn state(&self) -> DecoderState {
        self.state
    }

    /// True while hex payload lines are being accumulated.
    pub fn in_payload(&self) -> bool {
        self.in_payload
    }

    /// Drop any partial frame and return to `Idle`.
    pub fn reset(&mut self) {
        self.state = DecoderState::Idle;
        self.declared_len = None;
        self.hex.clear();
        self.in_payload = false;
    }

    /// Feed one line (without its terminator).
    pub fn feed(&mut self, line: &str) -> Option<DecoderEvent> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }

        match (self.state, classify(line)) {
            (_, Token::StartImage) => {
                self.reset();
                self.state = DecoderState::Sizing;
                None
            }
            (DecoderState::Idle, Token::Other(text)) => Some(DecoderEvent::DeviceLog(text.into())),
            // Unconsumed markers outside a frame are malformed and ignored.
            (DecoderState::Idle, _) => None,
            (_, Token::Size(value)) => match parse_size(value) {
                Ok(declared) => {
                    self.declared_len = Some(declared);
                    None
                }
                Err(err) => {
                    self.reset();
                    Some(DecoderEvent::FrameError(err))
                }
            },
            (_, Token::DataStart) => {
                self.state = DecoderState::Collecting;
                self.in_payload = true;
                self.hex.clear();
                None
            }
            (DecoderState::Sizing, Token::DataEnd) => None,
            (DecoderState::Sizing, Token::EndImage) => {
                self.reset();
                Some(DecoderEvent::FrameError(FrameError::ClosedWithoutData))
            }
            (DecoderState::Collecting, Token::DataEnd) => {
                self.in_payload = false;
                None
            }
            (DecoderState::Collecting, Token::EndImage) => Some(self.finish()),
            (DecoderState::Collecting, Token::Other(chunk)) if self.in_payload => {
                self.append_payload(chunk)
            }
            (_, Token::Other(text)) => Some(DecoderEvent::DeviceLog(text.into())),
        }
    }

    fn append_payload(&mut self, chunk: &str) -> Option<DecoderEvent> {
        self.hex
            .extend(chunk.chars().filter(|c| !c.is_whitespace()));
        if self.hex.len() > MAX_IMAGE_BYTES * 2 {
            self.reset();
            return Some(DecoderEvent::FrameError(FrameError::PayloadTooLarge {
                limit: MAX_IMAGE_BYTES,
            }));
        }
        None
    }

    fn finish(&mut self) -> DecoderEvent {
        let hex = std::mem::take(&mut self.hex);
        let declared_len = self.declared_len;
        self.reset();

        let bytes = match hex::decode(hex.as_bytes()) {
            Ok(bytes) => bytes,
            Err(err) => return DecoderEvent::FrameError(err.into()),
        };
        let Some(declared_len) = declared_len else {
            return DecoderEvent::FrameError(FrameError::MissingSize);
        };
        match Frame::new(bytes, declared_len).validate() {
            Ok(image) => DecoderEvent::FrameReady(image),
            Err(err) => DecoderEvent::FrameError(err),
        }
    }
}
