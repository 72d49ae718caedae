use std::{
    collections::HashMap,
    io,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

use async_trait::async_trait;
use comms::{OnoReceiver, OnoSender};
use log::{debug, error};
use parking_lot::Mutex;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpStream,
};
use worker::Service;

use crate::config::ResourceDescriptor;

type BoxRead = Box<dyn AsyncRead + Unpin + Send>;
type BoxWrite = Box<dyn AsyncWrite + Unpin + Send>;

/// An open, not yet authenticated, transport to a worker.
pub struct Link {
    pub(crate) rx: OnoReceiver<BoxRead>,
    pub(crate) tx: OnoSender<BoxWrite>,
    pub(crate) buf: Vec<u32>,
    /// A request went out and its reply hasn't been read completely.
    pub(crate) in_flight: bool,
}

impl Link {
    /// Wraps both halves of a transport.
    pub fn new<R, W>(rx: R, tx: W) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (rx, tx) = comms::channel(Box::new(rx) as BoxRead, Box::new(tx) as BoxWrite);

        Self {
            rx,
            tx,
            buf: Vec::new(),
            in_flight: false,
        }
    }
}

/// Opens transports to workers.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Opens a transport to the worker `name`.
    ///
    /// # Arguments
    /// * `name` - The name the worker is configured under.
    /// * `descriptor` - Where to find it.
    async fn connect(&self, name: &str, descriptor: &ResourceDescriptor) -> io::Result<Link>;
}

/// Reaches workers over TCP at `address:port`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpConnector;

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, name: &str, descriptor: &ResourceDescriptor) -> io::Result<Link> {
        let addr = (descriptor.address(), descriptor.port());
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;

        debug!(worker = name; "connected to {}:{}", addr.0, addr.1);

        let (rx, tx) = stream.into_split();
        Ok(Link::new(rx, tx))
    }
}

/// Serves each connection with an in-memory worker instead of going over the network.
///
/// Every worker keeps its own `Service`, so replicas outlive connections just like
/// with a long running `worker` process.
#[derive(Clone)]
pub struct MemoryConnector {
    workers: Arc<Mutex<HashMap<String, Service>>>,
    connects: Arc<AtomicUsize>,
    buffer: usize,
}

impl MemoryConnector {
    pub fn new() -> Self {
        Self {
            workers: Arc::default(),
            connects: Arc::default(),
            buffer: 1 << 16,
        }
    }

    /// Serves connections to `name` with `service`.
    pub fn add_worker(&self, name: impl Into<String>, service: Service) {
        self.workers.lock().insert(name.into(), service);
    }

    /// Makes `name` unreachable.
    pub fn remove_worker(&self, name: &str) -> Option<Service> {
        self.workers.lock().remove(name)
    }

    /// How many transports were opened so far, reachable or not.
    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::Relaxed)
    }
}

impl Default for MemoryConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self, name: &str, _: &ResourceDescriptor) -> io::Result<Link> {
        self.connects.fetch_add(1, Ordering::Relaxed);

        let service = self.workers.lock().get(name).cloned().ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::ConnectionRefused,
                format!("no in-memory worker named {name}"),
            )
        })?;

        let (ours, theirs) = tokio::io::duplex(self.buffer);

        let (rx, tx) = tokio::io::split(theirs);
        let (rx, tx) = comms::channel(rx, tx);
        let worker = name.to_string();
        tokio::spawn(async move {
            if let Err(e) = service.serve(rx, tx).await {
                error!(worker = worker.as_str(); "in-memory worker stopped: {e}");
            }
        });

        let (rx, tx) = tokio::io::split(ours);
        Ok(Link::new(rx, tx))
    }
}
