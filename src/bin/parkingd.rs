//! parkingd - parking gate gateway daemon
//!
//! This daemon:
//! 1. Reads the camera line protocol from a serial device (or stdin)
//! 2. Recognizes plates, archives images and records vehicle events
//! 3. Acknowledges each image back to the device
//! 4. Streams notifications to live feed clients (and MQTT, if configured)

use anyhow::{anyhow, Result};
use clap::Parser;
use crossbeam_channel::{bounded, select};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use plate_gateway::link::serial::{self, SerialAckSink, SerialSettings};
use plate_gateway::link::{AckSink, BufReadSource, LinkReader, WriterSink};
use plate_gateway::{Gateway, GatewayConfig};

#[derive(Parser, Debug)]
#[command(author, version, about = "Parking gate gateway: serial image ingest and plate recognition")]
struct Args {
    /// JSON config file.
    #[arg(long, env = "PARKING_CONFIG")]
    config: Option<PathBuf>,

    /// Serial device to read; stdin/stdout are used when absent.
    #[arg(long)]
    serial_device: Option<String>,

    #[arg(long)]
    baud: Option<u32>,

    /// Path to the event database.
    #[arg(long)]
    db_path: Option<String>,

    /// Number of ingest workers.
    #[arg(long)]
    workers: Option<usize>,

    /// Live feed listen address.
    #[arg(long)]
    feed_addr: Option<String>,

    /// Disable the live feed.
    #[arg(long, default_value_t = false)]
    no_feed: bool,
}

impl Args {
    fn apply(&self, cfg: &mut GatewayConfig) {
        if let Some(device) = &self.serial_device {
            cfg.serial.device = Some(device.clone());
        }
        if let Some(baud) = self.baud {
            cfg.serial.baud = baud;
        }
        if let Some(db_path) = &self.db_path {
            cfg.db_path = db_path.clone();
        }
        if let Some(workers) = self.workers {
            cfg.workers = workers;
        }
        if let Some(addr) = &self.feed_addr {
            if let Some(feed) = cfg.feed.as_mut() {
                feed.addr = addr.clone();
            }
        }
        if self.no_feed {
            cfg.feed = None;
        }
    }
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut cfg = GatewayConfig::load_from(args.config.as_deref())?;
    args.apply(&mut cfg);
    cfg.validate()?;

    let shutdown = Arc::new(AtomicBool::new(false));
    let (signal_tx, signal_rx) = bounded(1);
    {
        let shutdown = Arc::clone(&shutdown);
        ctrlc::set_handler(move || {
            shutdown.store(true, Ordering::SeqCst);
            let _ = signal_tx.try_send(());
        })
        .map_err(|e| anyhow!("error setting Ctrl-C handler: {}", e))?;
    }

    let (done_tx, done_rx) = bounded::<()>(1);
    let reader_thread;
    let gateway;

    match cfg.serial.device.clone() {
        Some(device) => {
            let acks = Arc::new(SerialAckSink::disconnected());
            gateway = Gateway::start(&cfg, acks.clone() as Arc<dyn AckSink>)?;
            let submitter = gateway.submitter();
            let mut settings = SerialSettings::new(device, cfg.serial.baud);
            settings.reconnect_delay = cfg.serial.reconnect_delay;
            let shutdown = Arc::clone(&shutdown);
            reader_thread = std::thread::Builder::new()
                .name("link-reader".to_string())
                .spawn(move || {
                    let mut reader = LinkReader::new();
                    serial::run_with_reconnect(&settings, &mut reader, &acks, &shutdown, |image| {
                        submitter.submit(image);
                    });
                    let _ = done_tx.send(());
                })?;
        }
        None => {
            log::info!("no serial device configured; reading device lines from stdin");
            let acks: Arc<dyn AckSink> = Arc::new(WriterSink::new(std::io::stdout()));
            gateway = Gateway::start(&cfg, acks)?;
            let submitter = gateway.submitter();
            let shutdown = Arc::clone(&shutdown);
            reader_thread = std::thread::Builder::new()
                .name("link-reader".to_string())
                .spawn(move || {
                    let mut source = BufReadSource::new(std::io::stdin().lock());
                    let mut reader = LinkReader::new();
                    if let Err(err) = reader.run(&mut source, &shutdown, |image| {
                        submitter.submit(image);
                    }) {
                        log::warn!("stdin input ended: {:#}", err);
                    } else {
                        log::info!("stdin input ended (EOF)");
                    }
                    let _ = done_tx.send(());
                })?;
        }
    }

    if let Some(addr) = gateway.feed_addr() {
        log::info!("live feed on {}", addr);
    }
    log::info!("parkingd running (workers: {}, db: {})", cfg.workers, cfg.db_path);

    select! {
        recv(signal_rx) -> _ => log::info!("shutdown signal received"),
        recv(done_rx) -> _ => log::info!("link reader finished"),
    }
    shutdown.store(true, Ordering::SeqCst);

    // A reader blocked on stdin cannot be interrupted; give it a moment only.
    if done_rx.recv_timeout(Duration::from_secs(2)).is_ok() || reader_thread.is_finished() {
        let _ = reader_thread.join();
    }

    let stats = gateway.stop();
    log::info!("parkingd exiting after {} image(s)", stats.completed());
    Ok(())
}
