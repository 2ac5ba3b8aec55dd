//! # Live Run Tracker
//!
//! Async driver around [`RunAggregator`].
//!
//! ## Architecture
//!
//! While observing, one *worker* task owns the aggregator and applies events
//! from a single ordered channel: samples, tracking changes, source failure,
//! stop. The location source writes samples onto that channel through a
//! [`LocationSink`] at the moment it delivers them, and `set_tracking` writes
//! onto it synchronously, so the order the worker sees is the order things
//! happened in.
//!
//! Snapshots go out on a `watch` channel. Every subscriber sees the latest
//! value, nobody back-pressures the worker, and slow subscribers skip
//! intermediate snapshots.
//!
//! Stopping hands the aggregator back from the worker, so the trace stays
//! with the tracker until it is cleared or finished.

use std::sync::Arc;

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::source::LocationSink;
use crate::{
    AggregateMetrics, LocationError, LocationSample, LocationSource, Result, RunAggregator,
    RunSnapshot, RunSummary, Trace, TrackerConfig, TrackerError, TrackerState,
};

/// Events applied to the aggregator, in order.
#[derive(Debug)]
pub(crate) enum TrackerEvent {
    Sample(LocationSample),
    Tracking(bool),
    SourceEnded(LocationError),
    Stop,
}

/// Value carried by the snapshot feed.
#[derive(Debug, Clone, Default)]
struct Published {
    snapshot: RunSnapshot,
    /// Set when the current observation ended on a source failure
    terminal: Option<LocationError>,
    /// Every source failure so far, oldest first. Survives restarts so a
    /// subscriber that has not caught up still sees the failure of its run.
    failures: Arc<Vec<LocationError>>,
}

impl Published {
    /// Failures a subscriber has already accounted for when it subscribes.
    fn failures_before_current(&self) -> usize {
        self.failures.len() - usize::from(self.terminal.is_some())
    }
}

type Feed = Arc<watch::Sender<Published>>;

struct Session {
    events: mpsc::UnboundedSender<TrackerEvent>,
    cancel: CancellationToken,
    worker: JoinHandle<RunAggregator>,
    tracking: bool,
}

impl Session {
    fn worker_exited(&self) -> bool {
        self.worker.is_finished() || self.events.is_closed()
    }
}

enum Phase {
    Idle(RunAggregator),
    Observing(Session),
}

/// A finished run, ready to hand to persistence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinishedRun {
    pub trace: Trace,
    pub summary: RunSummary,
    /// Set when the run ended because the location source failed
    pub failure: Option<LocationError>,
}

/// Live tracker for one run at a time.
///
/// All control methods take `&mut self`: a run has exactly one driver.
/// Reading the current snapshot and subscribing only need `&self`.
///
/// # Example
/// ```no_run
/// use run_tracker::{ManualLocationSource, RunTracker};
///
/// # async fn demo() -> run_tracker::Result<()> {
/// let source = ManualLocationSource::new();
/// let mut tracker = RunTracker::new(source.clone());
/// let mut feed = tracker.subscribe();
///
/// tracker.start_observing().await?;
/// tracker.set_tracking(true)?;
/// // ... platform callbacks push samples into `source` ...
/// while let Some(Ok(snapshot)) = feed.next().await {
///     println!("{} m", snapshot.distance_meters);
/// }
/// let run = tracker.finish().await?;
/// println!("{:?}", run.summary);
/// # Ok(())
/// # }
/// ```
pub struct RunTracker<S: LocationSource> {
    source: S,
    config: TrackerConfig,
    phase: Phase,
    feed: Feed,
}

impl<S: LocationSource> RunTracker<S> {
    /// Create an idle tracker with default configuration.
    pub fn new(source: S) -> Self {
        let config = TrackerConfig::default();
        let (feed, _) = watch::channel(Published::default());
        Self {
            source,
            phase: Phase::Idle(RunAggregator::new(config.clone())),
            config,
            feed: Arc::new(feed),
        }
    }

    /// Create an idle tracker with custom configuration.
    pub fn with_config(source: S, config: TrackerConfig) -> Result<Self> {
        config.validate()?;
        let mut tracker = Self::new(source);
        tracker.phase = Phase::Idle(RunAggregator::new(config.clone()));
        tracker.config = config;
        Ok(tracker)
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    /// Current state as driven by the caller.
    ///
    /// Reports `Idle` as soon as the worker has gone away after a source failure.
    pub fn state(&self) -> TrackerState {
        match &self.phase {
            Phase::Idle(_) => TrackerState::Idle,
            Phase::Observing(session) if !self.session_alive(session) => TrackerState::Idle,
            Phase::Observing(session) if session.tracking => TrackerState::ObservingActive,
            Phase::Observing(_) => TrackerState::ObservingPaused,
        }
    }

    /// The worker publishes the terminal marker before it exits, so either
    /// signal means the session is over.
    fn session_alive(&self, session: &Session) -> bool {
        !session.worker_exited() && self.feed.borrow().terminal.is_none()
    }

    /// Latest published snapshot. Never blocks.
    pub fn current_snapshot(&self) -> RunSnapshot {
        self.feed.borrow().snapshot.clone()
    }

    /// Subscribe to snapshots. The first item is the current snapshot.
    pub fn subscribe(&self) -> SnapshotSubscription {
        let rx = self.feed.subscribe();
        let seen_failures = rx.borrow().failures_before_current();
        SnapshotSubscription {
            rx,
            seen_failures,
            delivered_current: false,
            finished: false,
        }
    }

    /// Compute the metrics of the current snapshot on a blocking worker.
    pub async fn current_metrics(&self) -> Result<AggregateMetrics> {
        let snapshot = self.current_snapshot();
        tokio::task::spawn_blocking(move || snapshot.metrics())
            .await
            .map_err(|e| TrackerError::WorkerFailed {
                message: e.to_string(),
            })
    }

    /// Subscribe to the location source. Idle → ObservingPaused.
    ///
    /// A trace retained from an earlier observation is continued; the next
    /// `set_tracking(true)` opens a new segment on it.
    pub async fn start_observing(&mut self) -> Result<()> {
        self.reap_finished_session().await?;

        let placeholder = self.placeholder();
        let mut aggregator = match std::mem::replace(&mut self.phase, placeholder) {
            Phase::Idle(aggregator) => aggregator,
            observing @ Phase::Observing(_) => {
                self.phase = observing;
                return Err(TrackerError::invalid_transition(
                    "start observing",
                    self.state(),
                ));
            }
        };

        if let Err(e) = aggregator.start_observing() {
            self.phase = Phase::Idle(aggregator);
            return Err(e);
        }

        // Clear the terminal marker of an earlier failure without waking
        // anyone; subscribers that missed it still find it in `failures`
        let snapshot = aggregator.snapshot();
        self.feed.send_if_modified(|published| {
            published.snapshot = snapshot;
            published.terminal = None;
            false
        });

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        let worker = tokio::spawn(run_worker(aggregator, events_rx, Arc::clone(&self.feed)));
        self.source.observe(LocationSink::new(events_tx.clone(), cancel.clone()));

        info!("[Tracker] Started observing location");
        self.phase = Phase::Observing(Session {
            events: events_tx,
            cancel,
            worker,
            tracking: false,
        });
        Ok(())
    }

    /// Enable or disable appending of samples. Never blocks.
    ///
    /// Enabling while idle is rejected immediately. Setting the current value
    /// again does nothing.
    pub fn set_tracking(&mut self, tracking: bool) -> Result<()> {
        let state = self.state();
        let session = match &mut self.phase {
            Phase::Observing(session) if state.is_observing() => session,
            _ if tracking => {
                return Err(TrackerError::invalid_transition("enable tracking", state));
            }
            _ => return Ok(()),
        };

        if session.tracking == tracking {
            return Ok(());
        }

        if session.events.send(TrackerEvent::Tracking(tracking)).is_err() {
            // Worker exited between the state check and the send
            return if tracking {
                Err(TrackerError::invalid_transition(
                    "enable tracking",
                    TrackerState::Idle,
                ))
            } else {
                Ok(())
            };
        }

        session.tracking = tracking;
        debug!("[Tracker] Tracking set to {}", tracking);
        Ok(())
    }

    /// Unsubscribe from the location source. Any state → Idle.
    ///
    /// Samples already delivered are applied first; anything the source
    /// delivers afterwards is ignored. Calling this while idle does nothing.
    pub async fn stop_observing(&mut self) -> Result<()> {
        let placeholder = self.placeholder();
        let session = match std::mem::replace(&mut self.phase, placeholder) {
            Phase::Observing(session) => session,
            idle @ Phase::Idle(_) => {
                self.phase = idle;
                return Ok(());
            }
        };

        // Everything already on the channel is applied before `Stop`; closing
        // the sink makes later deliveries fail at the source
        let _ = session.events.send(TrackerEvent::Stop);
        session.cancel.cancel();
        drop(session.events);

        match session.worker.await {
            Ok(aggregator) => {
                info!(
                    "[Tracker] Stopped observing, {} samples retained",
                    aggregator.trace().sample_count()
                );
                self.phase = Phase::Idle(aggregator);
                Ok(())
            }
            Err(e) => {
                // Fall back to the last trace the worker managed to publish
                let trace = Trace::clone(&self.current_snapshot().trace);
                self.phase = Phase::Idle(RunAggregator::with_trace(self.config.clone(), trace));
                Err(TrackerError::WorkerFailed {
                    message: e.to_string(),
                })
            }
        }
    }

    /// Discard the retained trace. Only allowed while idle.
    pub async fn clear(&mut self) -> Result<()> {
        self.take_idle_trace().await.map(|_| ())
    }

    /// Stop observing and hand off the run. The tracker is left idle with an
    /// empty trace, ready for the next run.
    pub async fn finish(&mut self) -> Result<FinishedRun> {
        self.stop_observing().await?;

        let failure = match &self.phase {
            Phase::Idle(aggregator) => aggregator.failure().cloned(),
            Phase::Observing(_) => None,
        };
        let trace = self.take_idle_trace().await?;
        let summary = RunSummary::from_trace(&trace);

        info!(
            "[Tracker] Finished run: {} m, {} segments",
            summary.metrics.distance_meters,
            trace.segments().len()
        );
        Ok(FinishedRun {
            trace,
            summary,
            failure,
        })
    }

    async fn take_idle_trace(&mut self) -> Result<Trace> {
        self.reap_finished_session().await?;
        let state = self.state();
        let aggregator = match &mut self.phase {
            Phase::Idle(aggregator) => aggregator,
            Phase::Observing(_) => {
                return Err(TrackerError::invalid_transition("release the trace", state));
            }
        };

        let trace = aggregator.take_trace()?;
        let snapshot = aggregator.snapshot();
        self.feed.send_modify(|published| {
            published.snapshot = snapshot;
            published.terminal = None;
        });
        Ok(trace)
    }

    /// Collect the aggregator from a worker that ended on its own.
    async fn reap_finished_session(&mut self) -> Result<()> {
        let finished =
            matches!(&self.phase, Phase::Observing(session) if !self.session_alive(session));
        if finished {
            debug!("[Tracker] Collecting run from finished worker");
            self.stop_observing().await?;
        }
        Ok(())
    }

    fn placeholder(&self) -> Phase {
        Phase::Idle(RunAggregator::new(self.config.clone()))
    }
}

impl<S: LocationSource> Drop for RunTracker<S> {
    fn drop(&mut self) {
        if let Phase::Observing(session) = &self.phase {
            let _ = session.events.send(TrackerEvent::Stop);
            session.cancel.cancel();
        }
    }
}

/// Apply events to the aggregator until stopped. Hands the aggregator back.
async fn run_worker(
    mut aggregator: RunAggregator,
    mut events: mpsc::UnboundedReceiver<TrackerEvent>,
    feed: Feed,
) -> RunAggregator {
    while let Some(event) = events.recv().await {
        match event {
            TrackerEvent::Sample(sample) => {
                if let Some(snapshot) = aggregator.on_sample(sample) {
                    feed.send_modify(|published| published.snapshot = snapshot);
                }
            }
            TrackerEvent::Tracking(tracking) => match aggregator.set_tracking(tracking) {
                Ok(true) if tracking => {
                    // New empty segment: visible to readers, not an emission
                    let snapshot = aggregator.snapshot();
                    feed.send_if_modified(|published| {
                        published.snapshot = snapshot;
                        false
                    });
                }
                Ok(_) => {}
                Err(e) => warn!("[Tracker] Dropped tracking change: {}", e),
            },
            TrackerEvent::SourceEnded(error) => {
                if aggregator.fail(error.clone()) {
                    let snapshot = aggregator.snapshot();
                    feed.send_modify(|published| {
                        published.snapshot = snapshot;
                        Arc::make_mut(&mut published.failures).push(error.clone());
                        published.terminal = Some(error);
                    });
                }
                break;
            }
            TrackerEvent::Stop => {
                aggregator.stop_observing();
                break;
            }
        }
    }
    aggregator
}

/// One subscriber's view of the snapshot feed.
///
/// Yields the snapshot current at subscription time, then each newer one.
/// Snapshots published faster than they are read are skipped, never queued.
/// A source failure arrives as a final `Err`, after which the subscription
/// ends; resubscribe to follow a restarted observation. The failure is
/// delivered even if the observation was restarted before it was read.
pub struct SnapshotSubscription {
    rx: watch::Receiver<Published>,
    seen_failures: usize,
    delivered_current: bool,
    finished: bool,
}

impl SnapshotSubscription {
    /// Wait for the next snapshot. `None` once the feed has ended.
    pub async fn next(&mut self) -> Option<Result<RunSnapshot>> {
        if self.finished {
            return None;
        }

        if self.delivered_current && self.rx.changed().await.is_err() {
            self.finished = true;
            return None;
        }
        self.delivered_current = true;

        let published = self.rx.borrow_and_update().clone();
        match published.failures.get(self.seen_failures) {
            Some(error) => {
                self.finished = true;
                Some(Err(TrackerError::SourceFailed(error.clone())))
            }
            None => Some(Ok(published.snapshot)),
        }
    }

    /// Latest value without waiting.
    pub fn latest(&self) -> RunSnapshot {
        self.rx.borrow().snapshot.clone()
    }
}
