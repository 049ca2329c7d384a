//! receive_images - capture images from the camera link without recognition.
//!
//! Decodes the same line protocol as parkingd and writes each valid image to
//! `<output-dir>/image_<timestamp>.jpg`. Useful for checking a camera before
//! wiring it to the gateway.

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use plate_gateway::images::write_unique;
use plate_gateway::link::serial::{self, SerialAckSink, SerialSettings};
use plate_gateway::link::{BufReadSource, LinkReader};
use plate_gateway::Image;

#[derive(Parser, Debug)]
#[command(author, version, about = "Save images streamed by the gate camera")]
struct Args {
    /// Serial device to read; stdin is used when absent.
    #[arg(long, env = "PARKING_SERIAL_DEVICE")]
    serial_device: Option<String>,

    #[arg(long, env = "PARKING_SERIAL_BAUD", default_value = "115200")]
    baud: u32,

    /// Directory for received images.
    #[arg(long, default_value = "received_images")]
    output_dir: PathBuf,

    /// Delay between reconnect attempts when using --serial-device.
    #[arg(long, default_value = "2")]
    reconnect_delay_secs: u64,
}

fn save(output_dir: &Path, image: &Image) {
    let stem = format!("image_{}", image.timestamp_tag());
    match write_unique(output_dir, &stem, image.bytes()) {
        Ok(path) => log::info!("saved {} ({} bytes)", path.display(), image.len()),
        Err(err) => log::error!("failed to save image {}: {}", stem, err),
    }
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    std::fs::create_dir_all(&args.output_dir)
        .with_context(|| format!("create output dir {}", args.output_dir.display()))?;

    let shutdown = Arc::new(AtomicBool::new(false));
    {
        let shutdown = Arc::clone(&shutdown);
        ctrlc::set_handler(move || shutdown.store(true, Ordering::SeqCst))
            .map_err(|e| anyhow!("error setting Ctrl-C handler: {}", e))?;
    }

    let mut reader = LinkReader::new();
    match args.serial_device.as_deref() {
        Some(device) => {
            let mut settings = SerialSettings::new(device, args.baud);
            settings.reconnect_delay = Duration::from_secs(args.reconnect_delay_secs);
            let acks = SerialAckSink::disconnected();
            serial::run_with_reconnect(&settings, &mut reader, &acks, &shutdown, |image| {
                save(&args.output_dir, &image)
            });
        }
        None => {
            let mut source = BufReadSource::new(std::io::stdin().lock());
            reader.run(&mut source, &shutdown, |image| save(&args.output_dir, &image))?;
        }
    }

    let stats = reader.stats();
    log::info!(
        "received {} image(s), dropped {} ({} device log lines)",
        stats.frames_ready,
        stats.frames_dropped,
        stats.device_logs
    );
    Ok(())
}
