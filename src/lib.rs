//! shmframe: shared-memory raw video ingestion.
//!
//! Raw frames arrive from a shared-memory transport as opaque byte buffers, each with
//! a textual capability descriptor. This crate turns them into one canonical packed
//! RGB8 frame and hands the newest one to a render-rate consumer.
//!
//! # Pipeline
//!
//! ```text
//! transport callback -> caps::parse -> layout::classify -> FrameConverter -> FrameExchange
//!                                                                                 |
//!                                                    IngestSession::update() <----+
//! ```
//!
//! # Module Structure
//!
//! - `caps`: capability descriptor parsing (`StreamFormat`)
//! - `layout`: supported pixel layouts (`PixelLayout`) and plane geometry
//! - `convert`: RGB passthrough and I420 -> RGB conversion
//! - `exchange`: single-slot, latest-wins producer/consumer hand-off
//! - `session`: subscription lifecycle, generation gating, stats and health
//! - `transport`: the transport seam plus the memory and GStreamer shm backends
//! - `writer`: re-publishing canonical frames to a transport destination
//! - `config`: file + environment configuration

pub mod caps;
pub mod config;
pub mod convert;
pub mod error;
pub mod exchange;
pub mod frame;
pub mod layout;
pub mod session;
pub mod transport;
pub mod writer;

pub use caps::{parse, CapsParser, MediaFamily, StreamFormat};
pub use config::IngestConfig;
pub use convert::{ChromaAddressing, FrameConverter};
pub use error::{ConvertError, ParseError, TransportError, Unsupported};
pub use exchange::{ExchangeStats, FrameExchange};
pub use frame::{CanonicalFrame, RawFrame};
pub use layout::{classify, resolve, PixelLayout, PlaneGeometry};
pub use session::{IngestSession, IngestStats, SessionOptions};
pub use transport::{
    BufferLease, DataHandler, Delivery, MemoryTransport, Subscription, SubscriptionId,
    Transport, TransportKind, TransportWriter,
};
pub use writer::FrameWriter;
