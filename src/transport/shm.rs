//! GStreamer shared-memory transport.
//!
//! `shmsink`/`shmsrc` move raw bytes only, so both directions wrap the stream in the
//! GStreamer data protocol. The caps travel in-band with the buffers:
//!
//! - reader: `shmsrc socket-path=<source> ! gdpdepay ! appsink`, one pipeline per
//!   subscription. The appsink `new-sample` callback runs on the streaming thread and
//!   hands the sample's caps (as text) and its mapped buffer to the subscriber's
//!   handler. Dropping the mapped buffer returns it to GStreamer.
//! - writer: `appsrc ! gdppay ! shmsink socket-path=<destination>`, one pipeline per
//!   destination, created on first write. The descriptor becomes the `appsrc` caps.
//!
//! A producer that writes without `gdppay` is read as an undecodable stream and
//! reported on the bus.
//!
//! `unsubscribe` sets the pipeline to `Null`, which blocks until the streaming thread
//! has stopped, so no callback is running once it returns.

use anyhow::{anyhow, Context, Result};
use gstreamer::prelude::*;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use super::{BufferLease, DataHandler, Delivery, SubscriptionId, Transport, TransportWriter};
use crate::error::TransportError;

struct WriterPipeline {
    pipeline: gstreamer::Pipeline,
    appsrc: gstreamer_app::AppSrc,
    descriptor: String,
}

pub struct ShmTransport {
    readers: Mutex<HashMap<SubscriptionId, gstreamer::Pipeline>>,
    writers: Mutex<HashMap<String, WriterPipeline>>,
    next_id: AtomicU64,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ShmTransport {
    pub fn new() -> Result<Self> {
        gstreamer::init().context("initialize gstreamer")?;
        Ok(Self {
            readers: Mutex::new(HashMap::new()),
            writers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
        })
    }

    fn build_reader(source: &str, on_data: DataHandler) -> Result<gstreamer::Pipeline> {
        let pipeline = gstreamer::parse::launch(&reader_description(source))
            .context("build shm reader pipeline")?
            .downcast::<gstreamer::Pipeline>()
            .map_err(|_| anyhow!("shm reader pipeline is not a Pipeline"))?;
        let appsink = pipeline
            .by_name("appsink")
            .context("appsink element missing from pipeline")?
            .downcast::<gstreamer_app::AppSink>()
            .map_err(|_| anyhow!("appsink element has unexpected type"))?;

        appsink.set_callbacks(
            gstreamer_app::AppSinkCallbacks::builder()
                .new_sample(move |sink| {
                    let sample = sink.pull_sample().map_err(|_| gstreamer::FlowError::Eos)?;
                    let descriptor = sample
                        .caps()
                        .map(|caps| caps.to_string())
                        .unwrap_or_default();
                    let Some(buffer) = sample.buffer_owned() else {
                        return Ok(gstreamer::FlowSuccess::Ok);
                    };
                    let timestamp = buffer.pts().map(|pts| pts.nseconds()).unwrap_or(0);
                    let mapped = buffer
                        .into_mapped_buffer_readable()
                        .map_err(|_| gstreamer::FlowError::Error)?;
                    on_data(Delivery {
                        descriptor,
                        lease: BufferLease::new(mapped, || {}),
                        timestamp,
                    });
                    Ok(gstreamer::FlowSuccess::Ok)
                })
                .build(),
        );
        watch_bus(&pipeline, format!("reader {}", source));
        Ok(pipeline)
    }

    fn build_writer(destination: &str) -> Result<WriterPipeline> {
        let pipeline = gstreamer::parse::launch(&writer_description(destination))
            .context("build shm writer pipeline")?
            .downcast::<gstreamer::Pipeline>()
            .map_err(|_| anyhow!("shm writer pipeline is not a Pipeline"))?;
        let appsrc = pipeline
            .by_name("appsrc")
            .context("appsrc element missing from pipeline")?
            .downcast::<gstreamer_app::AppSrc>()
            .map_err(|_| anyhow!("appsrc element has unexpected type"))?;
        watch_bus(&pipeline, format!("writer {}", destination));
        pipeline
            .set_state(gstreamer::State::Playing)
            .context("set shm writer pipeline to Playing")?;
        log::info!("ShmTransport: writer open on {}", destination);
        Ok(WriterPipeline {
            pipeline,
            appsrc,
            descriptor: String::new(),
        })
    }
}

fn reader_description(source: &str) -> String {
    format!(
        "shmsrc socket-path=\"{}\" is-live=true ! gdpdepay ! \
         appsink name=appsink sync=false max-buffers=1 drop=true",
        source
    )
}

fn writer_description(destination: &str) -> String {
    format!(
        "appsrc name=appsrc is-live=true format=time ! gdppay ! \
         shmsink socket-path=\"{}\" wait-for-connection=false sync=false",
        destination
    )
}

/// Log pipeline errors as they are posted. Runs on whichever thread posts them, so no
/// main loop is needed.
fn watch_bus(pipeline: &gstreamer::Pipeline, label: String) {
    let Some(bus) = pipeline.bus() else {
        return;
    };
    bus.set_sync_handler(move |_bus, message| {
        use gstreamer::MessageView;
        match message.view() {
            MessageView::Error(err) => log::warn!(
                "ShmTransport: {} error from {:?}: {} ({:?})",
                label,
                err.src().map(|s| s.path_string()),
                err.error(),
                err.debug()
            ),
            MessageView::Warning(warning) => log::debug!(
                "ShmTransport: {} warning: {}",
                label,
                warning.error()
            ),
            MessageView::Eos(..) => log::info!("ShmTransport: {} reached end of stream", label),
            _ => {}
        }
        gstreamer::BusSyncReply::Drop
    });
}

/// GStreamer caps text uses `,` between fields; `;` separates structures.
fn descriptor_to_caps(descriptor: &str) -> Result<gstreamer::Caps> {
    let text = descriptor.replace(';', ", ");
    gstreamer::Caps::from_str(&text).map_err(|err| anyhow!("invalid caps '{}': {}", text, err))
}

impl Transport for ShmTransport {
    fn name(&self) -> &'static str {
        "shm"
    }

    fn subscribe(&self, source: &str, on_data: DataHandler) -> Result<SubscriptionId, TransportError> {
        let subscribe_error = |err: anyhow::Error| TransportError::Subscribe {
            source_id: source.to_string(),
            reason: format!("{:#}", err),
        };
        let pipeline = Self::build_reader(source, on_data).map_err(subscribe_error)?;
        if let Err(err) = pipeline.set_state(gstreamer::State::Playing) {
            let _ = pipeline.set_state(gstreamer::State::Null);
            return Err(subscribe_error(anyhow!(
                "set shm reader pipeline to Playing: {}",
                err
            )));
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        lock(&self.readers).insert(id, pipeline);
        log::info!("ShmTransport: reading {} (subscription {})", source, id);
        Ok(id)
    }

    fn unsubscribe(&self, id: SubscriptionId) -> Result<(), TransportError> {
        let pipeline = lock(&self.readers)
            .remove(&id)
            .ok_or_else(|| TransportError::Unsubscribe {
                id,
                reason: "unknown subscription".to_string(),
            })?;
        if let Err(err) = pipeline.set_state(gstreamer::State::Null) {
            lock(&self.readers).insert(id, pipeline);
            return Err(TransportError::Unsubscribe {
                id,
                reason: format!("set shm reader pipeline to Null: {}", err),
            });
        }
        Ok(())
    }
}

impl TransportWriter for ShmTransport {
    fn write(
        &self,
        destination: &str,
        descriptor: &str,
        bytes: &[u8],
        timestamp: u64,
    ) -> Result<(), TransportError> {
        let write_error = |reason: String| TransportError::Write {
            destination: destination.to_string(),
            reason,
        };
        let mut writers = lock(&self.writers);
        if !writers.contains_key(destination) {
            let writer =
                Self::build_writer(destination).map_err(|err| write_error(format!("{:#}", err)))?;
            writers.insert(destination.to_string(), writer);
        }
        let writer = writers
            .get_mut(destination)
            .ok_or_else(|| write_error("writer pipeline missing".to_string()))?;

        if writer.descriptor != descriptor {
            let caps = descriptor_to_caps(descriptor).map_err(|err| write_error(err.to_string()))?;
            writer.appsrc.set_caps(Some(&caps));
            writer.descriptor = descriptor.to_string();
        }

        let mut buffer = gstreamer::Buffer::from_mut_slice(bytes.to_vec());
        if let Some(buffer) = buffer.get_mut() {
            buffer.set_pts(gstreamer::ClockTime::from_nseconds(timestamp));
        }
        writer
            .appsrc
            .push_buffer(buffer)
            .map_err(|err| write_error(format!("push buffer: {:?}", err)))?;
        Ok(())
    }
}

impl Drop for ShmTransport {
    fn drop(&mut self) {
        for (_, pipeline) in lock(&self.readers).drain() {
            let _ = pipeline.set_state(gstreamer::State::Null);
        }
        for (destination, writer) in lock(&self.writers).drain() {
            if let Err(err) = writer.pipeline.set_state(gstreamer::State::Null) {
                log::warn!("ShmTransport: closing writer {} failed: {}", destination, err);
            }
        }
    }
}
