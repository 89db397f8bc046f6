//! Ingestion session.
//!
//! An `IngestSession` owns one transport subscription at a time and wires its
//! callback into parse -> resolve -> convert -> publish. The render side calls
//! `update()` once per frame and reads `current_frame()`.
//!
//! Every subscription gets a generation number. Callbacks carry the generation they
//! were registered with and discard their buffer when it is no longer the active one,
//! so a delivery racing with teardown or reconfiguration never reaches the exchange.
//! Teardown deactivates the generation first and unsubscribes second; the transport
//! guarantees `unsubscribe` returns only after in-flight callbacks have finished.
//!
//! The transport buffer is released right after conversion on every path.

use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::caps::CapsParser;
use crate::convert::{ChromaAddressing, FrameConverter};
use crate::error::{ConvertError, ParseError, TransportError, Unsupported};
use crate::exchange::FrameExchange;
use crate::frame::{CanonicalFrame, RawFrame};
use crate::layout::classify;
use crate::transport::{DataHandler, Delivery, Subscription, Transport};

const NO_GENERATION: u64 = 0;
const DEFAULT_HEALTH_GRACE: Duration = Duration::from_secs(2);

#[derive(Clone, Copy, Debug)]
pub struct SessionOptions {
    pub chroma: ChromaAddressing,
    /// How long the session may go without a frame and still report healthy.
    pub health_grace: Duration,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            chroma: ChromaAddressing::default(),
            health_grace: DEFAULT_HEALTH_GRACE,
        }
    }
}

/// Ingestion counters plus the current source.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct IngestStats {
    pub source: Option<String>,
    pub buffers_received: u64,
    pub frames_published: u64,
    pub frames_delivered: u64,
    pub frames_superseded: u64,
    pub parse_failures: u64,
    pub unsupported: u64,
    pub short_buffers: u64,
    /// Conversions refused for a reason other than a short buffer (e.g. size overflow).
    pub convert_failures: u64,
    pub stale_discarded: u64,
}

#[derive(Default)]
struct Counters {
    received: AtomicU64,
    published: AtomicU64,
    parse_failures: AtomicU64,
    unsupported: AtomicU64,
    short_buffers: AtomicU64,
    convert_failures: AtomicU64,
    stale: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

/// Why a buffer did not become a frame.
enum Rejected {
    Parse(ParseError),
    Unsupported(Unsupported),
    Convert(ConvertError),
}

/// Log context of one subscription, carried by its callback.
struct DeliveryContext {
    source: String,
    generation: u64,
    reported_unsupported: AtomicBool,
}

impl fmt::Display for DeliveryContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}#{}]", self.source, self.generation)
    }
}

// ----------------------------------------------------------------------------
// Pipeline: state shared with the transport callback
// ----------------------------------------------------------------------------

struct IngestPipeline {
    parser: CapsParser,
    converter: FrameConverter,
    exchange: FrameExchange,
    counters: Counters,
    active_generation: AtomicU64,
    created_at: Instant,
    /// Nanoseconds after `created_at` of the last published frame; 0 = none yet.
    last_frame_nanos: AtomicU64,
}

impl IngestPipeline {
    fn is_active(&self, generation: u64) -> bool {
        self.active_generation.load(Ordering::SeqCst) == generation
    }

    fn activate(&self, generation: u64) {
        self.active_generation.store(generation, Ordering::SeqCst);
    }

    fn on_delivery(&self, ctx: &DeliveryContext, delivery: Delivery) {
        let Delivery {
            descriptor,
            lease,
            timestamp,
        } = delivery;
        bump(&self.counters.received);

        if !self.is_active(ctx.generation) {
            bump(&self.counters.stale);
            log::debug!("{} discarding buffer from inactive subscription", ctx);
            lease.release();
            return;
        }

        let outcome = self.convert(&descriptor, lease.as_bytes(), timestamp);
        lease.release();

        match outcome {
            Ok(frame) => {
                if !self.is_active(ctx.generation) {
                    bump(&self.counters.stale);
                    log::debug!("{} subscription closed during conversion", ctx);
                    return;
                }
                self.exchange.publish(frame);
                bump(&self.counters.published);
                let nanos = self.created_at.elapsed().as_nanos().max(1) as u64;
                self.last_frame_nanos.store(nanos, Ordering::Relaxed);
            }
            Err(Rejected::Parse(err)) => {
                bump(&self.counters.parse_failures);
                log::warn!("{} dropping buffer with bad descriptor: {}", ctx, err);
            }
            Err(Rejected::Unsupported(reason)) => {
                bump(&self.counters.unsupported);
                if ctx.reported_unsupported.swap(true, Ordering::Relaxed) {
                    log::debug!("{} dropping unsupported buffer: {}", ctx, reason);
                } else {
                    log::info!("{} stream format unsupported ({}): {}", ctx, reason, descriptor);
                }
            }
            Err(Rejected::Convert(err @ ConvertError::ShortBuffer { .. })) => {
                bump(&self.counters.short_buffers);
                log::debug!("{} dropping buffer: {}", ctx, err);
            }
            Err(Rejected::Convert(err)) => {
                bump(&self.counters.convert_failures);
                log::warn!("{} dropping buffer: {}", ctx, err);
            }
        }
    }

    fn convert(&self, descriptor: &str, bytes: &[u8], timestamp: u64) -> Result<CanonicalFrame, Rejected> {
        let format = self.parser.parse(descriptor).map_err(Rejected::Parse)?;
        let layout = classify(&format).map_err(Rejected::Unsupported)?;
        let raw = RawFrame::new(bytes, layout, timestamp);
        let mut frame = self.exchange.take_spare().unwrap_or_default();
        self.converter
            .convert_into(&raw, &mut frame)
            .map_err(Rejected::Convert)?;
        Ok(frame)
    }

    fn handler(self: &Arc<Self>, source: &str, generation: u64) -> DataHandler {
        let pipeline = self.clone();
        let ctx = DeliveryContext {
            source: source.to_string(),
            generation,
            reported_unsupported: AtomicBool::new(false),
        };
        Box::new(move |delivery| pipeline.on_delivery(&ctx, delivery))
    }
}

// ----------------------------------------------------------------------------
// IngestSession
// ----------------------------------------------------------------------------

struct ActiveSubscription {
    handle: Subscription,
    generation: u64,
    opened_at: Instant,
}

pub struct IngestSession {
    subscription: Option<ActiveSubscription>,
    transport: Arc<dyn Transport>,
    pipeline: Arc<IngestPipeline>,
    current: Option<CanonicalFrame>,
    next_generation: u64,
    health_grace: Duration,
}

impl IngestSession {
    /// Fails only if the descriptor field rules cannot be compiled.
    pub fn new(transport: Arc<dyn Transport>, options: SessionOptions) -> Result<Self, ParseError> {
        let pipeline = IngestPipeline {
            parser: CapsParser::new()?,
            converter: FrameConverter::new(options.chroma),
            exchange: FrameExchange::new(),
            counters: Counters::default(),
            active_generation: AtomicU64::new(NO_GENERATION),
            created_at: Instant::now(),
            last_frame_nanos: AtomicU64::new(0),
        };
        Ok(Self {
            subscription: None,
            transport,
            pipeline: Arc::new(pipeline),
            current: None,
            next_generation: NO_GENERATION,
            health_grace: options.health_grace,
        })
    }

    /// Subscribe to `source`, replacing any current subscription. An empty source
    /// tears the current subscription down.
    ///
    /// On error the session keeps its previous subscription (or stays unconfigured).
    pub fn reconfigure(&mut self, source: &str) -> Result<(), TransportError> {
        let source = source.trim();
        if source.is_empty() {
            return self.close();
        }

        self.next_generation += 1;
        let generation = self.next_generation;
        let handler = self.pipeline.handler(source, generation);
        let handle = match Subscription::open(self.transport.clone(), source, handler) {
            Ok(handle) => handle,
            Err(err) => {
                log::warn!("[{}#{}] subscribe failed: {}", source, generation, err);
                return Err(err);
            }
        };
        let mut incoming = ActiveSubscription {
            handle,
            generation,
            opened_at: Instant::now(),
        };

        if let Some(mut previous) = self.subscription.take() {
            if let Err(err) = previous.handle.close() {
                log::warn!(
                    "[{}#{}] could not close, keeping it: {}",
                    previous.handle.source(),
                    previous.generation,
                    err
                );
                if let Err(close_err) = incoming.handle.close() {
                    log::warn!("[{}#{}] rollback close failed: {}", source, generation, close_err);
                }
                self.subscription = Some(previous);
                return Err(err);
            }
            log::info!(
                "[{}#{}] closed",
                previous.handle.source(),
                previous.generation
            );
        }

        self.pipeline.activate(generation);
        log::info!(
            "[{}#{}] subscribed via {} transport",
            source,
            generation,
            self.transport.name()
        );
        self.subscription = Some(incoming);
        Ok(())
    }

    /// Tear down the current subscription. The last frame stays readable.
    pub fn close(&mut self) -> Result<(), TransportError> {
        let Some(mut active) = self.subscription.take() else {
            return Ok(());
        };
        self.pipeline.activate(NO_GENERATION);
        if let Err(err) = active.handle.close() {
            log::warn!(
                "[{}#{}] close failed, subscription kept: {}",
                active.handle.source(),
                active.generation,
                err
            );
            self.pipeline.activate(active.generation);
            self.subscription = Some(active);
            return Err(err);
        }
        log::info!("[{}#{}] closed", active.handle.source(), active.generation);
        Ok(())
    }

    pub fn source(&self) -> Option<&str> {
        self.subscription
            .as_ref()
            .map(|active| active.handle.source())
    }

    /// Render side: swap in the newest frame if one arrived. Returns true on change.
    pub fn update(&mut self) -> bool {
        self.pipeline.exchange.swap_if_updated(&mut self.current)
    }

    /// Frame swapped in by the last successful `update()`.
    pub fn current_frame(&self) -> Option<&CanonicalFrame> {
        self.current.as_ref()
    }

    /// Take the newest frame directly, bypassing `current_frame()`.
    pub fn take_if_updated(&self) -> Option<CanonicalFrame> {
        self.pipeline.exchange.take_if_updated()
    }

    pub fn stats(&self) -> IngestStats {
        let counters = &self.pipeline.counters;
        let exchange = self.pipeline.exchange.stats();
        IngestStats {
            source: self.source().map(str::to_string),
            buffers_received: counters.received.load(Ordering::Relaxed),
            frames_published: counters.published.load(Ordering::Relaxed),
            frames_delivered: exchange.delivered,
            frames_superseded: exchange.superseded,
            parse_failures: counters.parse_failures.load(Ordering::Relaxed),
            unsupported: counters.unsupported.load(Ordering::Relaxed),
            short_buffers: counters.short_buffers.load(Ordering::Relaxed),
            convert_failures: counters.convert_failures.load(Ordering::Relaxed),
            stale_discarded: counters.stale.load(Ordering::Relaxed),
        }
    }

    /// True when a frame was published within the health grace, or the subscription
    /// is younger than the grace.
    pub fn is_healthy(&self) -> bool {
        let Some(active) = &self.subscription else {
            return false;
        };
        let last = self.pipeline.last_frame_nanos.load(Ordering::Relaxed);
        if last == 0 {
            return active.opened_at.elapsed() <= self.health_grace;
        }
        let since_start = self.pipeline.created_at.elapsed();
        since_start.saturating_sub(Duration::from_nanos(last)) <= self.health_grace
    }
}

impl Drop for IngestSession {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            log::warn!("ingest session dropped with an open subscription: {}", err);
        }
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::caps::{i420_descriptor, rgb_descriptor};
    use crate::transport::MemoryTransport;
    use anyhow::Result;

    fn session_on(transport: &Arc<MemoryTransport>) -> Result<IngestSession> {
        Ok(IngestSession::new(transport.clone(), SessionOptions::default())?)
    }

    #[test]
    fn rgb_buffer_becomes_current_frame() -> Result<()> {
        let transport = Arc::new(MemoryTransport::new());
        let mut session = session_on(&transport)?;
        session.reconfigure("cam")?;

        transport.push("cam", &rgb_descriptor(2, 1), vec![1, 2, 3, 4, 5, 6], 42);
        assert!(session.update());
        let frame = session.current_frame().expect("frame");
        assert_eq!(frame.as_bytes(), &[1, 2, 3, 4, 5, 6]);
        assert_eq!(frame.timestamp(), 42);
        assert!(!session.update());
        assert!(session.current_frame().is_some());
        Ok(())
    }

    #[test]
    fn rejected_buffers_are_counted_and_released() -> Result<()> {
        let transport = Arc::new(MemoryTransport::new());
        let session = {
            let mut session = session_on(&transport)?;
            session.reconfigure("cam")?;
            session
        };

        transport.push("cam", "", vec![0; 3], 0);
        transport.push("cam", "video/x-raw-foo;width=(int)1;height=(int)1", vec![0; 3], 0);
        transport.push("cam", &rgb_descriptor(4, 2), vec![0xFF; 10], 0);
        transport.push("cam", "video/x-raw-rgb;bpp=(int)24;width=(int)x", vec![0; 3], 0);

        let stats = session.stats();
        assert_eq!(stats.buffers_received, 4);
        assert_eq!(stats.parse_failures, 2);
        assert_eq!(stats.unsupported, 1);
        assert_eq!(stats.short_buffers, 1);
        assert_eq!(stats.convert_failures, 0);
        assert_eq!(stats.frames_published, 0);
        assert!(session.take_if_updated().is_none());
        assert_eq!(transport.stats().outstanding(), 0);
        Ok(())
    }

    #[test]
    fn oversized_geometry_is_not_a_short_buffer() -> Result<()> {
        let transport = Arc::new(MemoryTransport::new());
        let mut session = session_on(&transport)?;
        session.reconfigure("cam")?;

        transport.push("cam", &rgb_descriptor(u32::MAX, u32::MAX), vec![0; 3], 0);
        let stats = session.stats();
        assert_eq!(stats.convert_failures, 1);
        assert_eq!(stats.short_buffers, 0);
        assert!(!session.update());
        assert_eq!(transport.stats().outstanding(), 0);
        Ok(())
    }

    #[test]
    fn short_buffer_keeps_previous_frame() -> Result<()> {
        let transport = Arc::new(MemoryTransport::new());
        let mut session = session_on(&transport)?;
        session.reconfigure("cam")?;

        transport.push("cam", &rgb_descriptor(1, 1), vec![9, 9, 9], 1);
        assert!(session.update());
        transport.push("cam", &rgb_descriptor(4, 4), vec![1; 5], 2);
        assert!(!session.update());
        assert_eq!(session.current_frame().map(|f| f.as_bytes()), Some(&[9u8, 9, 9][..]));
        Ok(())
    }

    #[test]
    fn reconfigure_switches_source() -> Result<()> {
        let transport = Arc::new(MemoryTransport::new());
        let mut session = session_on(&transport)?;
        session.reconfigure("cam-a")?;
        session.reconfigure("cam-b")?;

        assert_eq!(session.source(), Some("cam-b"));
        assert_eq!(transport.subscriber_count("cam-a"), 0);
        assert_eq!(transport.subscriber_count("cam-b"), 1);
        assert_eq!(transport.push("cam-a", &rgb_descriptor(1, 1), vec![0; 3], 0), 0);
        assert_eq!(transport.push("cam-b", &i420_descriptor(2, 2), vec![128; 6], 0), 1);
        assert!(session.update());
        Ok(())
    }

    #[test]
    fn failed_subscribe_keeps_previous_subscription() -> Result<()> {
        let transport = Arc::new(MemoryTransport::new());
        let mut session = session_on(&transport)?;
        session.reconfigure("cam-a")?;
        transport.reject_source("cam-b");

        assert!(matches!(
            session.reconfigure("cam-b"),
            Err(TransportError::Subscribe { .. })
        ));
        assert_eq!(session.source(), Some("cam-a"));
        transport.push("cam-a", &rgb_descriptor(1, 1), vec![3; 3], 0);
        assert!(session.update());
        Ok(())
    }

    #[test]
    fn failed_subscribe_leaves_unconfigured_session_unconfigured() -> Result<()> {
        let transport = Arc::new(MemoryTransport::new());
        let mut session = session_on(&transport)?;
        transport.reject_source("cam");
        assert!(session.reconfigure("cam").is_err());
        assert_eq!(session.source(), None);
        assert!(!session.is_healthy());
        Ok(())
    }

    #[test]
    fn failed_close_rolls_back_to_previous_subscription() -> Result<()> {
        let transport = Arc::new(MemoryTransport::new());
        let mut session = session_on(&transport)?;
        session.reconfigure("cam-a")?;
        transport.fail_unsubscribe(true);

        assert!(matches!(
            session.reconfigure("cam-b"),
            Err(TransportError::Unsubscribe { .. })
        ));
        assert_eq!(session.source(), Some("cam-a"));

        // cam-b could not be closed either; its buffers must not reach the exchange.
        transport.push("cam-b", &rgb_descriptor(1, 1), vec![1; 3], 0);
        assert!(!session.update());
        transport.push("cam-a", &rgb_descriptor(1, 1), vec![2; 3], 0);
        assert!(session.update());

        transport.fail_unsubscribe(false);
        Ok(())
    }

    #[test]
    fn empty_source_tears_down() -> Result<()> {
        let transport = Arc::new(MemoryTransport::new());
        let mut session = session_on(&transport)?;
        session.reconfigure("cam")?;
        session.reconfigure("  ")?;
        assert_eq!(session.source(), None);
        assert_eq!(transport.subscriber_count("cam"), 0);
        Ok(())
    }

    #[test]
    fn drop_unsubscribes() -> Result<()> {
        let transport = Arc::new(MemoryTransport::new());
        {
            let mut session = session_on(&transport)?;
            session.reconfigure("cam")?;
            assert_eq!(transport.subscriber_count("cam"), 1);
        }
        assert_eq!(transport.subscriber_count("cam"), 0);
        assert_eq!(transport.push("cam", &rgb_descriptor(1, 1), vec![0; 3], 0), 0);
        Ok(())
    }

    #[test]
    fn health_follows_frames() -> Result<()> {
        let transport = Arc::new(MemoryTransport::new());
        let mut session = IngestSession::new(
            transport.clone(),
            SessionOptions {
                health_grace: Duration::from_millis(20),
                ..SessionOptions::default()
            },
        )?;
        assert!(!session.is_healthy());
        session.reconfigure("cam")?;
        assert!(session.is_healthy());
        std::thread::sleep(Duration::from_millis(40));
        assert!(!session.is_healthy());
        transport.push("cam", &rgb_descriptor(1, 1), vec![0; 3], 0);
        assert!(session.is_healthy());
        Ok(())
    }

    #[test]
    fn chroma_option_reaches_converter() -> Result<()> {
        // 4x2 frame whose second U sample differs: only legacy addressing reads it on row 1.
        let mut bytes = vec![128u8; 12];
        bytes[9] = 200;
        let mut blues = Vec::new();
        for chroma in [ChromaAddressing::Legacy, ChromaAddressing::Standard] {
            let transport = Arc::new(MemoryTransport::new());
            let mut session = IngestSession::new(
                transport.clone(),
                SessionOptions {
                    chroma,
                    ..SessionOptions::default()
                },
            )?;
            session.reconfigure("cam")?;
            transport.push("cam", &i420_descriptor(4, 2), bytes.clone(), 0);
            assert!(session.update());
            blues.push(session.current_frame().and_then(|f| f.pixel(0, 1)).map(|p| p[2]));
        }
        assert_ne!(blues[0], blues[1]);
        Ok(())
    }
}
