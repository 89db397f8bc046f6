//! Shared-memory transport seam.
//!
//! The ingestion core never implements a transport; it consumes one through the
//! `Transport` trait:
//! - `subscribe` registers an owned `DataHandler` for a source and returns an id
//! - `unsubscribe` removes it and returns only once no invocation of that handler
//!   is still running
//! - every delivered buffer arrives as a `BufferLease`, which hands the buffer back
//!   to the transport exactly once, on `release()` or on drop
//!
//! Backends:
//! - `memory`: in-process transport (tests, synthetic feeds, loopback writer)
//! - `shm`: GStreamer `shmsrc`/`shmsink` (feature: shm-gstreamer)

pub mod memory;
#[cfg(feature = "shm-gstreamer")]
pub mod shm;
pub mod synthetic;

use anyhow::Result;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use crate::error::TransportError;

pub use memory::MemoryTransport;
#[cfg(feature = "shm-gstreamer")]
pub use shm::ShmTransport;
pub use synthetic::{FeedHandle, SyntheticFeed, SyntheticFormat};

pub type SubscriptionId = u64;

/// Callback invoked on the transport's thread, once per delivered buffer.
pub type DataHandler = Box<dyn Fn(Delivery) + Send + Sync>;

/// One buffer as handed to a `DataHandler`.
pub struct Delivery {
    pub descriptor: String,
    pub lease: BufferLease,
    pub timestamp: u64,
}

type ReleaseFn = Box<dyn FnOnce() + Send>;

/// Ownership of one transport buffer. Released exactly once.
pub struct BufferLease {
    bytes: Box<dyn AsRef<[u8]> + Send>,
    release: Option<ReleaseFn>,
}

impl BufferLease {
    pub fn new<B, F>(bytes: B, release: F) -> Self
    where
        B: AsRef<[u8]> + Send + 'static,
        F: FnOnce() + Send + 'static,
    {
        Self {
            bytes: Box::new(bytes),
            release: Some(Box::new(release)),
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        (*self.bytes).as_ref()
    }

    pub fn len(&self) -> usize {
        self.as_bytes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.as_bytes().is_empty()
    }

    /// Hand the buffer back to the transport now.
    pub fn release(mut self) {
        self.release_once();
    }

    fn release_once(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl Drop for BufferLease {
    fn drop(&mut self) {
        self.release_once();
    }
}

impl fmt::Debug for BufferLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferLease")
            .field("len", &self.len())
            .field("released", &self.release.is_none())
            .finish()
    }
}

/// Reader side of a shared-memory transport.
pub trait Transport: Send + Sync {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    fn subscribe(&self, source: &str, on_data: DataHandler) -> Result<SubscriptionId, TransportError>;

    /// Must not return while a handler invocation for `id` is still in flight.
    fn unsubscribe(&self, id: SubscriptionId) -> Result<(), TransportError>;
}

/// Writer side of a shared-memory transport.
pub trait TransportWriter: Send + Sync {
    fn write(
        &self,
        destination: &str,
        descriptor: &str,
        bytes: &[u8],
        timestamp: u64,
    ) -> Result<(), TransportError>;
}

// ----------------------------------------------------------------------------
// Subscription: RAII handle
// ----------------------------------------------------------------------------

/// Open subscription. Unsubscribes on `close()` or, failing that, on drop.
pub struct Subscription {
    transport: Arc<dyn Transport>,
    id: SubscriptionId,
    source: String,
    open: bool,
}

impl Subscription {
    /// Subscribe `on_data` to `source`.
    pub fn open(
        transport: Arc<dyn Transport>,
        source: &str,
        on_data: DataHandler,
    ) -> Result<Self, TransportError> {
        let id = transport.subscribe(source, on_data)?;
        Ok(Self {
            transport,
            id,
            source: source.to_string(),
            open: true,
        })
    }

    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    /// Unsubscribe. On failure the handle stays open and can be retried or dropped.
    pub fn close(&mut self) -> Result<(), TransportError> {
        if !self.open {
            return Ok(());
        }
        self.transport.unsubscribe(self.id)?;
        self.open = false;
        Ok(())
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            log::warn!(
                "subscription {} to {} could not be closed: {}",
                self.id,
                self.source,
                err
            );
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("transport", &self.transport.name())
            .field("id", &self.id)
            .field("source", &self.source)
            .field("open", &self.open)
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Backend selection
// ----------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    #[default]
    Memory,
    Shm,
}

impl std::str::FromStr for TransportKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "memory" => Ok(TransportKind::Memory),
            "shm" => Ok(TransportKind::Shm),
            other => Err(format!(
                "unknown transport '{}'; expected memory or shm",
                other
            )),
        }
    }
}

/// Handle to an opened backend, keeping the concrete memory transport reachable
/// for callers that feed it directly.
#[derive(Clone)]
pub enum OpenedTransport {
    Memory(Arc<MemoryTransport>),
    #[cfg(feature = "shm-gstreamer")]
    Shm(Arc<ShmTransport>),
}

impl OpenedTransport {
    pub fn reader(&self) -> Arc<dyn Transport> {
        match self {
            OpenedTransport::Memory(transport) => transport.clone() as Arc<dyn Transport>,
            #[cfg(feature = "shm-gstreamer")]
            OpenedTransport::Shm(transport) => transport.clone() as Arc<dyn Transport>,
        }
    }

    pub fn writer(&self) -> Arc<dyn TransportWriter> {
        match self {
            OpenedTransport::Memory(transport) => transport.clone() as Arc<dyn TransportWriter>,
            #[cfg(feature = "shm-gstreamer")]
            OpenedTransport::Shm(transport) => transport.clone() as Arc<dyn TransportWriter>,
        }
    }

    pub fn memory(&self) -> Option<&Arc<MemoryTransport>> {
        match self {
            OpenedTransport::Memory(transport) => Some(transport),
            #[cfg(feature = "shm-gstreamer")]
            _ => None,
        }
    }
}

/// Open the configured backend.
pub fn open(kind: TransportKind) -> Result<OpenedTransport> {
    match kind {
        TransportKind::Memory => Ok(OpenedTransport::Memory(Arc::new(MemoryTransport::new()))),
        TransportKind::Shm => {
            #[cfg(feature = "shm-gstreamer")]
            {
                Ok(OpenedTransport::Shm(Arc::new(ShmTransport::new()?)))
            }
            #[cfg(not(feature = "shm-gstreamer"))]
            {
                anyhow::bail!("shm transport requires the shm-gstreamer feature")
            }
        }
    }
}

/// Fresh socket path for a scratch writer destination.
pub fn unique_socket_path() -> String {
    let mut bytes = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut bytes);
    std::env::temp_dir()
        .join(format!("shmframe_{:x}", u64::from_le_bytes(bytes)))
        .display()
        .to_string()
}
