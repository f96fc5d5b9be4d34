//! RX pipeline
//!
//! The RX worker is the only consumer of a session's transport and the only
//! writer of its trace buffer and data store. Each received frame is:
//!
//! 1. appended to the trace (always, before any filter or decode);
//! 2. forwarded to the logging sink if it passes the logging filter;
//! 3. dropped if it fails the plotting filter;
//! 4. dropped if no loaded catalog claims its id;
//! 5. decoded, with every signal passing the signal filter stored as a
//!    series point.
//!
//! Frames transmitted by the session are echoed back by the TX worker and go
//! through steps 1 and 2 only.

use crate::datastore::{DataStore, SeriesKey, SeriesPoint};
use crate::events::{EventBus, EventKind};
use crate::filter::{FilterPath, FilterSet};
use crate::message_codec::MessageCodec;
use crate::router::MultiDbcRouter;
use crate::session::StateCell;
use crate::sink::SinkSlot;
use crate::trace::TraceBuffer;
use crate::transport::Transport;
use crate::types::{CanFrame, Direction, Frame, SessionState, Timebase};
use crossbeam_channel::Receiver;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// What the pipeline did with one frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOutcome {
    /// Transmitted frame, traced (and possibly logged) only
    Echoed,
    /// Failed the plotting filter
    Filtered,
    /// No catalog claims the id
    Unrouted,
    /// Routed, but the payload does not match the message layout
    DecodeFailed,
    /// Decoded; `stored` series points were accepted by the data store
    Decoded { stored: usize },
}

/// RX counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RxStats {
    pub received: u64,
    pub echoed: u64,
    pub filtered: u64,
    pub unrouted: u64,
    pub decoded: u64,
    pub decode_errors: u64,
    pub logged: u64,
}

#[derive(Debug, Default)]
struct RxCounters {
    received: AtomicU64,
    echoed: AtomicU64,
    filtered: AtomicU64,
    unrouted: AtomicU64,
    decoded: AtomicU64,
    decode_errors: AtomicU64,
    logged: AtomicU64,
}

/// Per-frame processing shared by the RX worker and direct callers
pub struct RxPipeline {
    session_id: Arc<str>,
    channel: Arc<str>,
    timebase: Timebase,
    trace: Arc<TraceBuffer>,
    data: Arc<DataStore>,
    router: Arc<MultiDbcRouter>,
    filters: Arc<FilterSet>,
    sink: Arc<SinkSlot>,
    events: EventBus,
    counters: RxCounters,
}

impl RxPipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        session_id: Arc<str>,
        channel: Arc<str>,
        timebase: Timebase,
        trace: Arc<TraceBuffer>,
        data: Arc<DataStore>,
        router: Arc<MultiDbcRouter>,
        filters: Arc<FilterSet>,
        sink: Arc<SinkSlot>,
        events: EventBus,
    ) -> Self {
        Self {
            session_id,
            channel,
            timebase,
            trace,
            data,
            router,
            filters,
            sink,
            events,
            counters: RxCounters::default(),
        }
    }

    /// Stamp a wire frame received now
    pub fn stamp(&self, frame: CanFrame, direction: Direction) -> Arc<Frame> {
        Arc::new(Frame::from_can(
            self.timebase.now_us(),
            Arc::clone(&self.channel),
            direction,
            frame,
        ))
    }

    /// Run one frame through the pipeline
    pub fn process(&self, frame: Arc<Frame>) -> FrameOutcome {
        // One snapshot of each table for the whole frame
        let table = self.router.table();
        let filters = self.filters.snapshot();

        let routed = table.message(frame.key());
        let catalog = routed.map(|(key, _)| key.as_str());
        let message = routed.map(|(_, message)| message);

        let point = self.trace.append(
            Arc::clone(&frame),
            routed.map(|(key, _)| key.clone()),
            message.map(|m| m.name.clone()),
        );

        if filters.evaluate(FilterPath::Logging, &frame, catalog, message) {
            if let Some(sink) = self.sink.get() {
                sink.push(&frame);
                self.counters.logged.fetch_add(1, Ordering::Relaxed);
            }
        }

        if frame.direction == Direction::Tx {
            self.counters.echoed.fetch_add(1, Ordering::Relaxed);
            return FrameOutcome::Echoed;
        }
        self.counters.received.fetch_add(1, Ordering::Relaxed);

        if !filters.evaluate(FilterPath::Plotting, &frame, catalog, message) {
            self.counters.filtered.fetch_add(1, Ordering::Relaxed);
            return FrameOutcome::Filtered;
        }

        let Some((catalog, message)) = routed else {
            self.counters.unrouted.fetch_add(1, Ordering::Relaxed);
            return FrameOutcome::Unrouted;
        };

        match MessageCodec::decode(catalog, &frame.data, message) {
            Ok(decoded) => {
                let points = decoded
                    .signals
                    .iter()
                    .filter(|signal| {
                        filters.evaluate_signal(
                            FilterPath::Plotting,
                            &frame,
                            Some(catalog.as_str()),
                            &signal.name,
                        )
                    })
                    .map(|signal| {
                        (
                            SeriesKey::new(
                                Arc::clone(&self.session_id),
                                catalog.clone(),
                                frame.key(),
                                signal.name.clone(),
                            ),
                            SeriesPoint {
                                timestamp_us: frame.timestamp_us,
                                value: signal.value.as_f64(),
                            },
                        )
                    })
                    .collect::<Vec<_>>();
                let stored = self.data.append_batch(points);

                point.set_decoded(Some(Ok(decoded)));
                self.counters.decoded.fetch_add(1, Ordering::Relaxed);
                FrameOutcome::Decoded { stored }
            }
            Err(error) => {
                point.set_decoded(Some(Err(error.clone())));
                self.counters.decode_errors.fetch_add(1, Ordering::Relaxed);
                self.events.emit(EventKind::DecodeError {
                    seq: point.seq,
                    error,
                });
                FrameOutcome::DecodeFailed
            }
        }
    }

    pub fn stats(&self) -> RxStats {
        RxStats {
            received: self.counters.received.load(Ordering::Relaxed),
            echoed: self.counters.echoed.load(Ordering::Relaxed),
            filtered: self.counters.filtered.load(Ordering::Relaxed),
            unrouted: self.counters.unrouted.load(Ordering::Relaxed),
            decoded: self.counters.decoded.load(Ordering::Relaxed),
            decode_errors: self.counters.decode_errors.load(Ordering::Relaxed),
            logged: self.counters.logged.load(Ordering::Relaxed),
        }
    }
}

/// Everything the RX thread owns while a session runs
pub(crate) struct RxWorker {
    pub pipeline: Arc<RxPipeline>,
    pub transport: Arc<dyn Transport>,
    /// Frames sent by the TX worker
    pub echo: Receiver<Arc<Frame>>,
    pub stop: Arc<AtomicBool>,
    /// Raised on transport failure so the TX worker stops too
    pub tx_stop: Arc<AtomicBool>,
    pub state: Arc<StateCell>,
    pub poll: Duration,
}

impl RxWorker {
    pub fn spawn(self) -> io::Result<JoinHandle<()>> {
        let name = format!("rx-{}", self.pipeline.session_id);
        std::thread::Builder::new()
            .name(name)
            .spawn(move || self.run())
    }

    fn run(self) {
        let session_id = Arc::clone(&self.pipeline.session_id);
        log::debug!("[session {}] RX worker started", session_id);

        while !self.stop.load(Ordering::SeqCst) {
            self.drain_echo();

            match self.transport.recv(self.poll) {
                Ok(Some(frame)) => {
                    let frame = self.pipeline.stamp(frame, Direction::Rx);
                    self.pipeline.process(frame);
                }
                Ok(None) => {}
                Err(error) => {
                    self.tx_stop.store(true, Ordering::SeqCst);
                    self.pipeline
                        .events
                        .emit(EventKind::TransportError(error));
                    self.state
                        .transition(SessionState::Running, SessionState::Stopped);
                    self.transport.close();
                    break;
                }
            }
        }

        self.drain_echo();
        let stats = self.pipeline.stats();
        log::info!(
            "[session {}] RX worker finished: {} received, {} decoded, {} decode errors",
            session_id,
            stats.received,
            stats.decoded,
            stats.decode_errors
        );
    }

    fn drain_echo(&self) {
        for frame in self.echo.try_iter() {
            self.pipeline.process(frame);
        }
    }
}
