//! Serial-port link to the camera device.

use anyhow::{Context, Result};
use serialport::{DataBits, FlowControl, Parity, SerialPort, StopBits};
use std::io::BufReader;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use super::{BufReadSource, LinkReader, WriterSink};
use crate::Image;

pub type SerialSource = BufReadSource<BufReader<Box<dyn SerialPort>>>;
pub type SerialAckSink = WriterSink<Box<dyn SerialPort>>;

#[derive(Clone, Debug)]
pub struct SerialSettings {
    pub device: String,
    pub baud: u32,
    /// How long one read may block before the reader re-checks shutdown.
    pub read_timeout: Duration,
    pub reconnect_delay: Duration,
}

impl SerialSettings {
    pub fn new(device: impl Into<String>, baud: u32) -> Self {
        Self {
            device: device.into(),
            baud,
            read_timeout: Duration::from_millis(200),
            reconnect_delay: Duration::from_secs(2),
        }
    }
}

/// Open the port 8N1 without flow control. Returns the line source and a
/// cloned handle for writing acknowledgments.
pub fn open(settings: &SerialSettings) -> Result<(SerialSource, Box<dyn SerialPort>)> {
    let port = serialport::new(settings.device.as_str(), settings.baud)
        .data_bits(DataBits::Eight)
        .parity(Parity::None)
        .stop_bits(StopBits::One)
        .flow_control(FlowControl::None)
        .timeout(settings.read_timeout)
        .open()
        .with_context(|| format!("failed to open serial device {}", settings.device))?;
    let writer = port
        .try_clone()
        .with_context(|| format!("failed to clone serial handle for {}", settings.device))?;
    log::info!("opened serial device {} at {} baud", settings.device, settings.baud);
    Ok((BufReadSource::new(BufReader::new(port)), writer))
}

/// Read the device until shutdown, reopening the port whenever it drops.
///
/// The ack sink is pointed at each new connection and detached while the
/// device is away, so acknowledgments for in-flight images fail fast.
pub fn run_with_reconnect<F>(
    settings: &SerialSettings,
    reader: &mut LinkReader,
    acks: &SerialAckSink,
    shutdown: &AtomicBool,
    mut on_image: F,
) where
    F: FnMut(Image),
{
    while !shutdown.load(Ordering::SeqCst) {
        match open(settings) {
            Ok((mut source, writer)) => {
                acks.replace(writer);
                match reader.run(&mut source, shutdown, &mut on_image) {
                    Ok(()) => log::warn!("serial input ended (EOF)"),
                    Err(err) => log::warn!("serial input ended: {:#}", err),
                }
                acks.disconnect();
            }
            Err(err) => log::warn!("serial device unavailable: {:#}", err),
        }
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        log::info!(
            "reconnecting to serial device in {}s",
            settings.reconnect_delay.as_secs()
        );
        sleep_unless_shutdown(settings.reconnect_delay, shutdown);
    }
}

fn sleep_unless_shutdown(delay: Duration, shutdown: &AtomicBool) {
    let deadline = Instant::now() + delay;
    while !shutdown.load(Ordering::SeqCst) {
        let now = Instant::now();
        if now >= deadline {
            return;
        }
        std::thread::sleep((deadline - now).min(Duration::from_millis(50)));
    }
}
