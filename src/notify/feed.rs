//! Live feed for viewers: every TCP connection becomes a fan-out subscriber
//! and receives one JSON notification per line.

use anyhow::{anyhow, Context, Result};
use std::io::Write;
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use super::{NotificationEvent, Subscriber, SubscriberId, SubscriberRegistry};

#[derive(Clone, Debug)]
pub struct FeedConfig {
    pub addr: String,
    /// Per-client bound on one delivery attempt.
    pub write_timeout: Duration,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:8765".to_string(),
            write_timeout: Duration::from_secs(2),
        }
    }
}

pub struct TcpSubscriber {
    peer: SocketAddr,
    stream: Mutex<TcpStream>,
}

impl TcpSubscriber {
    pub fn new(stream: TcpStream, write_timeout: Duration) -> Result<Self> {
        let peer = stream.peer_addr()?;
        stream.set_nonblocking(false)?;
        stream.set_write_timeout(Some(write_timeout))?;
        stream.set_nodelay(true)?;
        Ok(Self {
            peer,
            stream: Mutex::new(stream),
        })
    }

    fn close(&self) {
        let stream = self.stream.lock().unwrap_or_else(|e| e.into_inner());
        let _ = stream.shutdown(Shutdown::Both);
    }
}

impl Subscriber for TcpSubscriber {
    fn describe(&self) -> String {
        format!("feed:{}", self.peer)
    }

    fn deliver(&self, event: &NotificationEvent) -> Result<()> {
        let mut line = event.to_json()?;
        line.push('\n');
        let mut stream = self.stream.lock().unwrap_or_else(|e| e.into_inner());
        stream
            .write_all(line.as_bytes())
            .with_context(|| format!("write to feed client {}", self.peer))?;
        Ok(())
    }
}

pub struct LiveFeedServer {
    cfg: FeedConfig,
    registry: Arc<SubscriberRegistry>,
}

pub struct FeedHandle {
    pub addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl FeedHandle {
    /// Stop accepting and disconnect every feed client.
    pub fn stop(mut self) -> Result<()> {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(join) = self.join.take() {
            join.join()
                .map_err(|_| anyhow!("live feed thread panicked"))?;
        }
        Ok(())
    }
}

impl LiveFeedServer {
    pub fn new(cfg: FeedConfig, registry: Arc<SubscriberRegistry>) -> Self {
        Self { cfg, registry }
    }

    pub fn spawn(self) -> Result<FeedHandle> {
        let configured_addr: SocketAddr = self
            .cfg
            .addr
            .parse()
            .with_context(|| format!("invalid feed address '{}'", self.cfg.addr))?;
        let listener = TcpListener::bind(configured_addr)
            .with_context(|| format!("bind live feed on {}", configured_addr))?;
        let addr = listener.local_addr()?;
        listener.set_nonblocking(true)?;
        log::info!("live feed listening on {}", addr);

        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_thread = Arc::clone(&shutdown);
        let join = std::thread::Builder::new()
            .name("live-feed".to_string())
            .spawn(move || {
                if let Err(err) = run_feed(listener, self.cfg, self.registry, shutdown_thread) {
                    log::error!("live feed stopped: {}", err);
                }
            })
            .context("spawn live feed")?;

        Ok(FeedHandle {
            addr,
            shutdown,
            join: Some(join),
        })
    }
}

fn run_feed(
    listener: TcpListener,
    cfg: FeedConfig,
    registry: Arc<SubscriberRegistry>,
    shutdown: Arc<AtomicBool>,
) -> Result<()> {
    let mut clients: Vec<(SubscriberId, Arc<TcpSubscriber>)> = Vec::new();
    let result = loop {
        if shutdown.load(Ordering::SeqCst) {
            break Ok(());
        }
        match listener.accept() {
            Ok((stream, peer)) => match TcpSubscriber::new(stream, cfg.write_timeout) {
                Ok(subscriber) => {
                    let subscriber = Arc::new(subscriber);
                    let id = registry.register(subscriber.clone());
                    clients.push((id, subscriber));
                }
                Err(err) => log::warn!("rejecting feed client {}: {}", peer, err),
            },
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                // Forget clients the fan-out has already dropped.
                clients.retain(|(id, _)| registry.contains(*id));
                std::thread::sleep(Duration::from_millis(50));
            }
            Err(err) => break Err(err.into()),
        }
    };
    for (id, client) in clients {
        registry.unregister(id);
        client.close();
    }
    result
}
