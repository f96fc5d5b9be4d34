//! CAN session lifecycle
//!
//! A [`CanSession`] ties one interface to its own router, filters, trace,
//! data store and the two workers. Nothing is shared between sessions.
//!
//! Lifecycle: `Stopped -> Running -> Stopped -> ... -> Closed`. A transport
//! failure moves a running session back to `Stopped`; it can be started
//! again without touching any other session.

use crate::config::SessionConfig;
use crate::datastore::DataStore;
use crate::error::{AnalyzerError, Result};
use crate::events::{EventBus, EventKind, SessionEvent};
use crate::filter::FilterSet;
use crate::router::{LoadReport, MultiDbcRouter};
use crate::rx::{RxPipeline, RxStats, RxWorker};
use crate::shared::lock;
use crate::signals::DbcCatalog;
use crate::sink::{FrameSink, QueuedSink, SinkSlot};
use crate::trace::{Expansion, TraceBuffer};
use crate::transport::{Transport, TransportFactory};
use crate::tx::{JobHandle, JobStatus, TxContext, TxRequest, TxScheduler};
use crate::types::{CatalogKey, Frame, SessionState, Timebase};
use crossbeam_channel::{unbounded, Receiver};
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

/// Formatted lines kept by a sink from [`CanSession::attach_queued_sink`]
const RECENT_SINK_LINES: usize = 1_000;

/// Lifecycle state shared with the RX worker
#[derive(Debug)]
pub(crate) struct StateCell {
    state: Mutex<SessionState>,
    events: EventBus,
}

impl StateCell {
    fn new(events: EventBus) -> Self {
        Self {
            state: Mutex::new(SessionState::Stopped),
            events,
        }
    }

    pub fn get(&self) -> SessionState {
        *lock(&self.state)
    }

    /// Move to `to` unconditionally; emits an event when the state changes
    pub fn set(&self, to: SessionState) {
        let from = std::mem::replace(&mut *lock(&self.state), to);
        if from != to {
            self.events.emit(EventKind::SessionStateChange { from, to });
        }
    }

    /// Move to `to` only when currently in `from`
    pub fn transition(&self, from: SessionState, to: SessionState) -> bool {
        {
            let mut state = lock(&self.state);
            if *state != from {
                return false;
            }
            *state = to;
        }
        self.events.emit(EventKind::SessionStateChange { from, to });
        true
    }
}

/// Threads and transport of one run
struct Workers {
    transport: Arc<dyn Transport>,
    rx_stop: Arc<AtomicBool>,
    tx_stop: Arc<AtomicBool>,
    rx: JoinHandle<()>,
    tx: JoinHandle<()>,
}

impl Workers {
    /// Stop TX first so nothing is sent after RX stops tracing
    fn shutdown(self, scheduler: &TxScheduler) {
        self.tx_stop.store(true, Ordering::SeqCst);
        if self.tx.join().is_err() {
            log::error!("TX worker panicked");
        }
        scheduler.detach();

        self.rx_stop.store(true, Ordering::SeqCst);
        if self.rx.join().is_err() {
            log::error!("RX worker panicked");
        }
        self.transport.close();
    }
}

/// One CAN interface with its own decoding and transmit state
pub struct CanSession {
    id: Arc<str>,
    config: SessionConfig,
    channel: Arc<str>,
    timebase: Timebase,
    state: Arc<StateCell>,
    events: EventBus,
    router: Arc<MultiDbcRouter>,
    filters: Arc<FilterSet>,
    trace: Arc<TraceBuffer>,
    data: Arc<DataStore>,
    sink: Arc<SinkSlot>,
    queued_sink: Mutex<Option<Arc<QueuedSink>>>,
    pipeline: Arc<RxPipeline>,
    tx: TxScheduler,
    factory: Arc<dyn TransportFactory>,
    /// Also serializes start/stop/close
    workers: Mutex<Option<Workers>>,
}

impl CanSession {
    /// Create a stopped session; the interface is opened by [`start`](Self::start)
    pub fn open(config: SessionConfig, factory: Arc<dyn TransportFactory>) -> Result<Self> {
        config.validate()?;

        let id: Arc<str> = Arc::from(&uuid::Uuid::new_v4().simple().to_string()[..8]);
        let channel: Arc<str> = Arc::from(config.interface.label());
        let timebase = Timebase::new();
        let events = EventBus::new(Arc::clone(&id));

        let router = Arc::new(MultiDbcRouter::new(events.clone()));
        let filters = Arc::new(FilterSet::new(events.clone()));
        let trace = Arc::new(TraceBuffer::new(
            config.trace_capacity,
            config.interface.bitrate,
        ));
        let data = Arc::new(DataStore::new(config.max_points_per_series));
        let sink = Arc::new(SinkSlot::default());

        let pipeline = Arc::new(RxPipeline::new(
            Arc::clone(&id),
            Arc::clone(&channel),
            timebase,
            Arc::clone(&trace),
            Arc::clone(&data),
            Arc::clone(&router),
            Arc::clone(&filters),
            Arc::clone(&sink),
            events.clone(),
        ));
        let tx = TxScheduler::new(Arc::clone(&router), events.clone());

        log::info!(
            "[session {}] Opened '{}' on {}",
            id,
            config.name,
            channel
        );

        Ok(Self {
            id,
            channel,
            timebase,
            state: Arc::new(StateCell::new(events.clone())),
            events,
            router,
            filters,
            trace,
            data,
            sink,
            queued_sink: Mutex::new(None),
            pipeline,
            tx,
            factory,
            workers: Mutex::new(None),
            config,
        })
    }

    /// Open the interface and start both workers
    ///
    /// The trace is cleared; series data and the timebase carry over so
    /// series stay monotonic across restarts.
    pub fn start(&self) -> Result<()> {
        let mut workers = lock(&self.workers);
        let state = self.state.get();
        if state != SessionState::Stopped {
            return Err(AnalyzerError::InvalidState {
                operation: "start",
                state,
            });
        }

        // Workers that ended on a transport failure are still to be joined
        if let Some(previous) = workers.take() {
            previous.shutdown(&self.tx);
        }

        let transport: Arc<dyn Transport> = match self.factory.open(&self.config.interface) {
            Ok(transport) => Arc::from(transport),
            Err(error) => {
                self.events.emit(EventKind::TransportError(error.clone()));
                return Err(error.into());
            }
        };

        self.trace.clear();
        let (echo_tx, echo_rx) = unbounded();
        let rx_stop = Arc::new(AtomicBool::new(false));
        let tx_stop = Arc::new(AtomicBool::new(false));

        // Running before the workers exist so a failing RX can move it back
        self.state.set(SessionState::Running);

        let tx = self.tx.start(TxContext {
            transport: Arc::clone(&transport),
            echo: echo_tx,
            stop: Arc::clone(&tx_stop),
            timebase: self.timebase,
            channel: Arc::clone(&self.channel),
        });
        let tx = match tx {
            Ok(handle) => handle,
            Err(e) => {
                transport.close();
                self.state.set(SessionState::Stopped);
                return Err(e.into());
            }
        };

        let rx = RxWorker {
            pipeline: Arc::clone(&self.pipeline),
            transport: Arc::clone(&transport),
            echo: echo_rx,
            stop: Arc::clone(&rx_stop),
            tx_stop: Arc::clone(&tx_stop),
            state: Arc::clone(&self.state),
            poll: Duration::from_millis(self.config.rx_poll_ms),
        }
        .spawn();
        let rx = match rx {
            Ok(handle) => handle,
            Err(e) => {
                tx_stop.store(true, Ordering::SeqCst);
                if tx.join().is_err() {
                    log::error!("TX worker panicked");
                }
                self.tx.detach();
                transport.close();
                self.state.set(SessionState::Stopped);
                return Err(e.into());
            }
        };

        *workers = Some(Workers {
            transport,
            rx_stop,
            tx_stop,
            rx,
            tx,
        });
        Ok(())
    }

    /// Stop both workers and release the interface
    ///
    /// Returns once both workers have exited. Trace and data are kept.
    /// Stopping a stopped session does nothing.
    pub fn stop(&self) {
        let mut workers = lock(&self.workers);
        if let Some(running) = workers.take() {
            running.shutdown(&self.tx);
        }
        self.state.transition(SessionState::Running, SessionState::Stopped);
    }

    /// Stop the session for good and release its sink
    pub fn close(&self) {
        if self.state.get() == SessionState::Closed {
            return;
        }
        self.stop();
        if let Some(sink) = lock(&self.queued_sink).take() {
            sink.stop();
        }
        self.sink.set(None);
        self.state.set(SessionState::Closed);
    }

    fn ensure_open(&self, operation: &'static str) -> Result<()> {
        match self.state.get() {
            SessionState::Closed => Err(AnalyzerError::InvalidState {
                operation,
                state: SessionState::Closed,
            }),
            _ => Ok(()),
        }
    }

    /// Parse and load a DBC file; the key defaults to the file name
    pub fn load_dbc(&self, path: &Path, key: Option<&str>) -> Result<LoadReport> {
        self.ensure_open("load_dbc")?;
        self.router.load_file(path, key)
    }

    /// Load a catalog built in code
    pub fn load_catalog(&self, catalog: DbcCatalog, key: impl Into<CatalogKey>) -> Result<LoadReport> {
        self.ensure_open("load_catalog")?;
        self.router.load(catalog, key)
    }

    /// Unload a catalog together with its routes and catalog filter
    pub fn unload_dbc(&self, key: &str) -> Result<()> {
        self.ensure_open("unload_dbc")?;
        self.router.unload(key)?;
        self.filters.drop_catalog(key);
        Ok(())
    }

    pub fn send(&self, request: TxRequest) -> Result<()> {
        self.tx.send(request)
    }

    pub fn schedule(&self, request: TxRequest, period_ms: u64) -> Result<JobHandle> {
        self.tx.schedule(request, period_ms)
    }

    pub fn cancel(&self, handle: JobHandle) -> Result<()> {
        self.tx.cancel(handle)
    }

    pub fn cancel_all(&self) {
        self.tx.cancel_all()
    }

    pub fn tx_jobs(&self) -> Vec<JobStatus> {
        self.tx.jobs()
    }

    /// Receive every event this session raises from now on
    pub fn subscribe(&self) -> Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Replace the logging-path sink
    pub fn set_sink(&self, sink: Option<Arc<dyn FrameSink>>) {
        self.sink.set(sink);
    }

    /// Install a [`QueuedSink`] sized from the configuration
    ///
    /// A queued sink installed earlier through this method is drained and
    /// stopped.
    pub fn attach_queued_sink<W>(&self, writer: W) -> Result<Arc<QueuedSink>>
    where
        W: FnMut(&Frame) -> io::Result<()> + Send + 'static,
    {
        self.ensure_open("attach_queued_sink")?;
        let sink = Arc::new(QueuedSink::spawn(
            self.config.sink_queue_capacity,
            RECENT_SINK_LINES,
            writer,
        )?);
        self.sink.set(Some(Arc::clone(&sink) as Arc<dyn FrameSink>));
        if let Some(previous) = lock(&self.queued_sink).replace(Arc::clone(&sink)) {
            previous.stop();
        }
        Ok(sink)
    }

    /// Decode a trace entry on demand
    pub fn expand(&self, seq: u64) -> Result<Expansion> {
        self.trace.expand(seq, &self.router)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn state(&self) -> SessionState {
        self.state.get()
    }

    pub fn timebase(&self) -> &Timebase {
        &self.timebase
    }

    pub fn trace(&self) -> &Arc<TraceBuffer> {
        &self.trace
    }

    pub fn data(&self) -> &Arc<DataStore> {
        &self.data
    }

    pub fn router(&self) -> &Arc<MultiDbcRouter> {
        &self.router
    }

    pub fn filters(&self) -> &Arc<FilterSet> {
        &self.filters
    }

    pub fn rx_stats(&self) -> RxStats {
        self.pipeline.stats()
    }
}

impl Drop for CanSession {
    fn drop(&mut self) {
        self.close();
    }
}
