//! Location source contract and the sink sources deliver into.
//!
//! A source does not hand the tracker a queue of its own. Each observation
//! gets a [`LocationSink`] that writes straight onto the tracker's event
//! channel, the same channel tracking changes go through, so a fix and a
//! pause are applied in the order they happened.

use std::sync::{Arc, Mutex, MutexGuard};

use futures::stream::{BoxStream, StreamExt};
use log::debug;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::tracker::TrackerEvent;
use crate::{LocationError, LocationSample};

/// Items produced by a stream-based source. An `Err` ends the observation.
pub type LocationStream = BoxStream<'static, std::result::Result<LocationSample, LocationError>>;

/// Producer of timestamped location samples.
///
/// Each call to [`observe`](LocationSource::observe) starts a fresh
/// observation that delivers into `sink` until the sink closes. The
/// observation ends with [`LocationSink::fail`] or [`LocationSink::end`] when
/// permission is revoked or the hardware goes away; a source never retries on
/// its own.
pub trait LocationSource: Send + Sync + 'static {
    fn observe(&self, sink: LocationSink);
}

impl<S: LocationSource + ?Sized> LocationSource for Arc<S> {
    fn observe(&self, sink: LocationSink) {
        (**self).observe(sink)
    }
}

/// Write end of one observation.
///
/// Closed once the tracker stops observing; anything delivered after that is
/// ignored and the delivery methods return false.
#[derive(Debug, Clone)]
pub struct LocationSink {
    events: mpsc::UnboundedSender<TrackerEvent>,
    cancel: CancellationToken,
}

impl LocationSink {
    pub(crate) fn new(events: mpsc::UnboundedSender<TrackerEvent>, cancel: CancellationToken) -> Self {
        Self { events, cancel }
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled() || self.events.is_closed()
    }

    /// Deliver a sample. Returns false when the observation is over.
    pub fn push(&self, sample: LocationSample) -> bool {
        !self.is_closed() && self.events.send(TrackerEvent::Sample(sample)).is_ok()
    }

    /// Report a fatal error. Ends the observation.
    pub fn fail(self, error: LocationError) -> bool {
        !self.is_closed() && self.events.send(TrackerEvent::SourceEnded(error)).is_ok()
    }

    /// Report that the source has nothing more to deliver.
    pub fn end(self) -> bool {
        self.fail(LocationError::Exhausted)
    }

    /// Resolves once the tracker stops observing.
    pub async fn closed(&self) {
        tokio::select! {
            _ = self.cancel.cancelled() => {}
            _ = self.events.closed() => {}
        }
    }
}

/// Adapts a lazy, restartable stream into a [`LocationSource`].
///
/// `observe` spawns a task that forwards the stream into the sink, so it must
/// be called from inside a tokio runtime. Items count as delivered when the
/// stream yields them; the end of the stream is reported as
/// [`LocationError::Exhausted`].
pub struct StreamLocationSource<F> {
    open: F,
}

impl<F> StreamLocationSource<F>
where
    F: Fn() -> LocationStream + Send + Sync + 'static,
{
    pub fn new(open: F) -> Self {
        Self { open }
    }
}

impl<F> LocationSource for StreamLocationSource<F>
where
    F: Fn() -> LocationStream + Send + Sync + 'static,
{
    fn observe(&self, sink: LocationSink) {
        tokio::spawn(forward_stream((self.open)(), sink));
    }
}

async fn forward_stream(mut stream: LocationStream, sink: LocationSink) {
    loop {
        tokio::select! {
            biased;
            _ = sink.closed() => {
                debug!("[Source] Stream forwarding cancelled");
                break;
            }
            item = stream.next() => match item {
                Some(Ok(sample)) => {
                    if !sink.push(sample) {
                        break;
                    }
                }
                Some(Err(e)) => {
                    sink.fail(e);
                    break;
                }
                None => {
                    sink.end();
                    break;
                }
            },
        }
    }
}

/// A location source fed by hand.
///
/// Useful for bridging platform callbacks that deliver fixes one at a time,
/// replaying recorded runs, and tests. Clones share the same observation.
/// Only the most recent observation receives samples.
#[derive(Clone, Default)]
pub struct ManualLocationSource {
    observer: Arc<Mutex<Option<LocationSink>>>,
}

impl ManualLocationSource {
    pub fn new() -> Self {
        Self::default()
    }

    fn observer(&self) -> MutexGuard<'_, Option<LocationSink>> {
        self.observer.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// True while an observation is open.
    pub fn is_observed(&self) -> bool {
        self.observer().as_ref().is_some_and(|sink| !sink.is_closed())
    }

    /// Deliver a sample. Returns false when nobody is observing.
    pub fn push(&self, sample: LocationSample) -> bool {
        self.observer().as_ref().is_some_and(|sink| sink.push(sample))
    }

    /// Deliver a fatal error and end the current observation.
    pub fn fail(&self, error: LocationError) -> bool {
        self.observer().take().is_some_and(|sink| sink.fail(error))
    }

    /// End the current observation without an error.
    pub fn end(&self) -> bool {
        self.observer().take().is_some_and(LocationSink::end)
    }
}

impl LocationSource for ManualLocationSource {
    fn observe(&self, sink: LocationSink) {
        if self.observer().replace(sink).is_some() {
            debug!("[Source] Replacing previous observation");
        }
    }
}
