//! In-process transport.
//!
//! `MemoryTransport` delivers buffers pushed by the caller to every subscriber of the
//! matching source, synchronously, on the pushing thread. It plays the role the
//! shared-memory reader plays in production and is what tests and synthetic feeds run
//! against. Writes loop back to subscribers of the destination.
//!
//! Each subscriber's handler sits behind its own mutex. Delivery holds that mutex for
//! the duration of the call and `unsubscribe` takes it to clear the handler, so
//! `unsubscribe` cannot return while a delivery to that subscriber is running.
//! Handlers must therefore not unsubscribe themselves.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::{BufferLease, DataHandler, Delivery, SubscriptionId, Transport, TransportWriter};
use crate::error::TransportError;

struct Subscriber {
    id: SubscriptionId,
    source: String,
    handler: Mutex<Option<DataHandler>>,
}

#[derive(Default)]
struct LeaseCounters {
    delivered: AtomicU64,
    released: AtomicU64,
}

/// Buffer accounting for a `MemoryTransport`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MemoryStats {
    pub delivered: u64,
    pub released: u64,
    pub written: u64,
}

impl MemoryStats {
    /// Leases handed out and not yet released.
    pub fn outstanding(&self) -> u64 {
        self.delivered.saturating_sub(self.released)
    }
}

#[derive(Default)]
pub struct MemoryTransport {
    subscribers: Mutex<Vec<Arc<Subscriber>>>,
    next_id: AtomicU64,
    rejected_sources: Mutex<HashSet<String>>,
    fail_unsubscribe: AtomicBool,
    leases: Arc<LeaseCounters>,
    written: AtomicU64,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver one buffer to every subscriber of `source`. Returns how many handlers ran.
    pub fn push(&self, source: &str, descriptor: &str, bytes: Vec<u8>, timestamp: u64) -> usize {
        let targets: Vec<Arc<Subscriber>> = lock(&self.subscribers)
            .iter()
            .filter(|subscriber| subscriber.source == source)
            .cloned()
            .collect();
        if targets.is_empty() {
            return 0;
        }

        let bytes: Arc<[u8]> = bytes.into();
        let mut delivered = 0;
        for subscriber in targets {
            let handler = lock(&subscriber.handler);
            let Some(handler) = handler.as_ref() else {
                continue;
            };
            handler(Delivery {
                descriptor: descriptor.to_string(),
                lease: self.lease(bytes.clone()),
                timestamp,
            });
            delivered += 1;
        }
        delivered
    }

    fn lease(&self, bytes: Arc<[u8]>) -> BufferLease {
        self.leases.delivered.fetch_add(1, Ordering::SeqCst);
        let counters = self.leases.clone();
        BufferLease::new(bytes, move || {
            counters.released.fetch_add(1, Ordering::SeqCst);
        })
    }

    /// Make future `subscribe` calls for `source` fail.
    pub fn reject_source(&self, source: &str) {
        lock(&self.rejected_sources).insert(source.to_string());
    }

    pub fn accept_source(&self, source: &str) {
        lock(&self.rejected_sources).remove(source);
    }

    /// Make `unsubscribe` fail until reset.
    pub fn fail_unsubscribe(&self, fail: bool) {
        self.fail_unsubscribe.store(fail, Ordering::SeqCst);
    }

    pub fn subscriber_count(&self, source: &str) -> usize {
        lock(&self.subscribers)
            .iter()
            .filter(|subscriber| subscriber.source == source)
            .count()
    }

    pub fn stats(&self) -> MemoryStats {
        MemoryStats {
            delivered: self.leases.delivered.load(Ordering::SeqCst),
            released: self.leases.released.load(Ordering::SeqCst),
            written: self.written.load(Ordering::SeqCst),
        }
    }
}

impl Transport for MemoryTransport {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn subscribe(&self, source: &str, on_data: DataHandler) -> Result<SubscriptionId, TransportError> {
        if source.trim().is_empty() {
            return Err(TransportError::Subscribe {
                source_id: source.to_string(),
                reason: "empty source identifier".to_string(),
            });
        }
        if lock(&self.rejected_sources).contains(source) {
            return Err(TransportError::Subscribe {
                source_id: source.to_string(),
                reason: "source unavailable".to_string(),
            });
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        lock(&self.subscribers).push(Arc::new(Subscriber {
            id,
            source: source.to_string(),
            handler: Mutex::new(Some(on_data)),
        }));
        Ok(id)
    }

    fn unsubscribe(&self, id: SubscriptionId) -> Result<(), TransportError> {
        if self.fail_unsubscribe.load(Ordering::SeqCst) {
            return Err(TransportError::Unsubscribe {
                id,
                reason: "transport refused to close the reader".to_string(),
            });
        }
        let removed = {
            let mut subscribers = lock(&self.subscribers);
            let index = subscribers
                .iter()
                .position(|subscriber| subscriber.id == id)
                .ok_or_else(|| TransportError::Unsubscribe {
                    id,
                    reason: "unknown subscription".to_string(),
                })?;
            subscribers.remove(index)
        };
        // Waits for an in-flight delivery to this subscriber to finish.
        lock(&removed.handler).take();
        Ok(())
    }
}

impl TransportWriter for MemoryTransport {
    fn write(
        &self,
        destination: &str,
        descriptor: &str,
        bytes: &[u8],
        timestamp: u64,
    ) -> Result<(), TransportError> {
        self.written.fetch_add(1, Ordering::SeqCst);
        self.push(destination, descriptor, bytes.to_vec(), timestamp);
        Ok(())
    }
}
