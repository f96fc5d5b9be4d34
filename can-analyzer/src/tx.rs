//! TX scheduler
//!
//! All transmissions of a session go through one worker thread: one-shot
//! sends are queued to it, periodic jobs live in a min-heap ordered by due
//! time. Periodic jobs are fixed-rate: the k-th send of a job scheduled at
//! `t0` is due at `t0 + k·P` no matter how long earlier sends took. When the
//! worker falls behind by whole periods the missed slots are skipped and
//! counted instead of being sent in a burst.
//!
//! Every frame put on the bus is echoed to the RX worker so it is traced.

use crate::error::{AnalyzerError, Result};
use crate::events::{EventBus, EventKind};
use crate::router::MultiDbcRouter;
use crate::shared::lock;
use crate::transport::Transport;
use crate::types::{CanFrame, CatalogKey, Direction, Frame, MessageKey, SessionState, Timebase};
use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender};
use std::cmp::Ordering as CmpOrdering;
use std::collections::{BTreeMap, BinaryHeap, HashMap};
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Longest the worker sleeps before re-checking its stop flag
const MAX_IDLE: Duration = Duration::from_millis(20);

/// How long `cancel` waits for the worker to acknowledge
const CANCEL_ACK_TIMEOUT: Duration = Duration::from_secs(1);

/// What to transmit
#[derive(Debug, Clone, PartialEq)]
pub enum TxRequest {
    /// A ready-made frame
    Raw(CanFrame),
    /// Physical signal values encoded through a loaded catalog
    Dbc {
        catalog: CatalogKey,
        key: MessageKey,
        signals: HashMap<String, f64>,
    },
}

impl TxRequest {
    pub fn raw(frame: CanFrame) -> Self {
        TxRequest::Raw(frame)
    }

    pub fn dbc(
        catalog: impl Into<CatalogKey>,
        key: MessageKey,
        signals: HashMap<String, f64>,
    ) -> Self {
        TxRequest::Dbc {
            catalog: catalog.into(),
            key,
            signals,
        }
    }
}

/// Identifies a periodic job within its session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JobHandle(pub u64);

impl fmt::Display for JobHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "job #{}", self.0)
    }
}

/// Status of a periodic job
#[derive(Debug, Clone, PartialEq)]
pub struct JobStatus {
    pub handle: JobHandle,
    /// Frame sent on every period
    pub frame: CanFrame,
    pub period: Duration,
    /// False once the session stopped; stopped jobs are not resumed
    pub active: bool,
    pub sent: u64,
    pub failed: u64,
    /// Slots skipped because the worker fell behind
    pub missed: u64,
    pub last_error: Option<String>,
    /// Session timestamp of the last successful send
    pub last_sent_us: Option<u64>,
}

enum TxCommand {
    Send(CanFrame),
    Schedule {
        handle: JobHandle,
        frame: CanFrame,
        period: Duration,
        start: Instant,
    },
    Cancel {
        handle: JobHandle,
        ack: Sender<()>,
    },
    CancelAll {
        ack: Sender<()>,
    },
}

type JobTable = Arc<Mutex<BTreeMap<JobHandle, JobStatus>>>;

/// Per-session transmit front end
pub struct TxScheduler {
    router: Arc<MultiDbcRouter>,
    events: EventBus,
    jobs: JobTable,
    next_handle: AtomicU64,
    /// Command queue and stop flag of the running worker
    commands: Mutex<Option<(Sender<TxCommand>, Arc<AtomicBool>)>>,
}

impl TxScheduler {
    pub fn new(router: Arc<MultiDbcRouter>, events: EventBus) -> Self {
        Self {
            router,
            events,
            jobs: Arc::new(Mutex::new(BTreeMap::new())),
            next_handle: AtomicU64::new(1),
            commands: Mutex::new(None),
        }
    }

    /// Turn a request into a frame, encoding DBC requests
    pub fn prepare(&self, request: &TxRequest) -> Result<CanFrame> {
        self.prepare_for(request, None)
    }

    fn prepare_for(&self, request: &TxRequest, job: Option<JobHandle>) -> Result<CanFrame> {
        let frame = match request {
            TxRequest::Raw(frame) => frame.clone(),
            TxRequest::Dbc {
                catalog,
                key,
                signals,
            } => {
                let data = self.router.encode(catalog, *key, signals).map_err(|error| {
                    self.events.emit(EventKind::EncodeError {
                        job,
                        error: error.clone(),
                    });
                    AnalyzerError::Encode(error)
                })?;
                let is_fd = data.len() > crate::types::MAX_CLASSIC_PAYLOAD;
                CanFrame {
                    can_id: key.id,
                    is_extended: key.extended,
                    is_fd,
                    data,
                }
            }
        };
        frame.validate().map_err(AnalyzerError::InvalidFrame)?;
        Ok(frame)
    }

    /// Command queue of a worker that has not been told to stop
    fn sender(&self, operation: &'static str) -> Result<Sender<TxCommand>> {
        match &*lock(&self.commands) {
            Some((commands, stop)) if !stop.load(Ordering::SeqCst) => Ok(commands.clone()),
            _ => Err(AnalyzerError::InvalidState {
                operation,
                state: SessionState::Stopped,
            }),
        }
    }

    /// Queue a one-shot transmission
    ///
    /// Encode failures are returned; transport failures are reported as
    /// `TxError` events since the frame is sent by the worker.
    pub fn send(&self, request: TxRequest) -> Result<()> {
        let commands = self.sender("send")?;
        let frame = self.prepare(&request)?;
        log::debug!("Queued one-shot 0x{:X}", frame.can_id);
        commands
            .send(TxCommand::Send(frame))
            .map_err(|_| AnalyzerError::InvalidState {
                operation: "send",
                state: SessionState::Stopped,
            })
    }

    /// Start a fixed-rate periodic job; the first send is due one period from now
    pub fn schedule(&self, request: TxRequest, period_ms: u64) -> Result<JobHandle> {
        if period_ms == 0 {
            return Err(AnalyzerError::InvalidConfig(
                "period_ms must be at least 1".to_string(),
            ));
        }
        let commands = self.sender("schedule")?;
        let handle = JobHandle(self.next_handle.fetch_add(1, Ordering::SeqCst));
        let frame = self.prepare_for(&request, Some(handle))?;
        let period = Duration::from_millis(period_ms);

        lock(&self.jobs).insert(
            handle,
            JobStatus {
                handle,
                frame: frame.clone(),
                period,
                active: true,
                sent: 0,
                failed: 0,
                missed: 0,
                last_error: None,
                last_sent_us: None,
            },
        );

        let command = TxCommand::Schedule {
            handle,
            frame,
            period,
            start: Instant::now(),
        };
        if commands.send(command).is_err() {
            lock(&self.jobs).remove(&handle);
            return Err(AnalyzerError::InvalidState {
                operation: "schedule",
                state: SessionState::Stopped,
            });
        }

        log::info!("Scheduled {} every {} ms", handle, period_ms);
        Ok(handle)
    }

    /// Stop and forget a job; no send of it happens after this returns
    pub fn cancel(&self, handle: JobHandle) -> Result<()> {
        if lock(&self.jobs).remove(&handle).is_none() {
            let what = handle.to_string();
            self.events.emit(EventKind::NotFound { what: what.clone() });
            return Err(AnalyzerError::NotFound(what));
        }

        if let Ok(commands) = self.sender("cancel") {
            let (ack, done) = bounded(1);
            if commands.send(TxCommand::Cancel { handle, ack }).is_ok() {
                wait_for_ack(&done);
            }
        }
        log::info!("Cancelled {}", handle);
        Ok(())
    }

    /// Stop and forget every job
    pub fn cancel_all(&self) {
        if let Ok(commands) = self.sender("cancel_all") {
            let (ack, done) = bounded(1);
            if commands.send(TxCommand::CancelAll { ack }).is_ok() {
                wait_for_ack(&done);
            }
        }
        lock(&self.jobs).clear();
    }

    /// Status of every known job, in creation order
    pub fn jobs(&self) -> Vec<JobStatus> {
        lock(&self.jobs).values().cloned().collect()
    }

    pub fn job(&self, handle: JobHandle) -> Option<JobStatus> {
        lock(&self.jobs).get(&handle).cloned()
    }

    pub fn is_running(&self) -> bool {
        self.sender("query").is_ok()
    }

    /// Spawn the worker
    pub(crate) fn start(&self, context: TxContext) -> io::Result<JoinHandle<()>> {
        // Jobs of an earlier run are not resumed
        lock(&self.jobs).retain(|_, job| job.active);

        let (tx, rx) = unbounded();
        let stop = Arc::clone(&context.stop);
        let worker = TxWorker {
            context,
            commands: rx,
            jobs: Arc::clone(&self.jobs),
            events: self.events.clone(),
            heap: BinaryHeap::new(),
            periodic: HashMap::new(),
        };
        let name = format!("tx-{}", self.events.session_id());
        let handle = std::thread::Builder::new()
            .name(name)
            .spawn(move || worker.run())?;

        *lock(&self.commands) = Some((tx, stop));
        Ok(handle)
    }

    /// Forget the worker after it was joined
    pub(crate) fn detach(&self) {
        lock(&self.commands).take();
        for job in lock(&self.jobs).values_mut() {
            job.active = false;
        }
    }
}

fn wait_for_ack(done: &Receiver<()>) {
    if done.recv_timeout(CANCEL_ACK_TIMEOUT).is_err() {
        log::warn!("TX worker did not acknowledge cancellation in time");
    }
}

/// Resources the TX worker needs while a session runs
pub(crate) struct TxContext {
    pub transport: Arc<dyn Transport>,
    pub echo: Sender<Arc<Frame>>,
    pub stop: Arc<AtomicBool>,
    pub timebase: Timebase,
    pub channel: Arc<str>,
}

/// Heap entry, ordered so the earliest due time is popped first
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ScheduledJob {
    due: Instant,
    handle: JobHandle,
}

impl Ord for ScheduledJob {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // Reverse ordering for min-heap behavior (earliest time first)
        other
            .due
            .cmp(&self.due)
            .then_with(|| other.handle.cmp(&self.handle))
    }
}

impl PartialOrd for ScheduledJob {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

struct PeriodicJob {
    frame: CanFrame,
    period: Duration,
    next_due: Instant,
}

struct TxWorker {
    context: TxContext,
    commands: Receiver<TxCommand>,
    jobs: JobTable,
    events: EventBus,
    heap: BinaryHeap<ScheduledJob>,
    periodic: HashMap<JobHandle, PeriodicJob>,
}

impl TxWorker {
    fn run(mut self) {
        let session_id = Arc::clone(self.events.session_id());
        log::debug!("[session {}] TX worker started", session_id);

        loop {
            if self.context.stop.load(Ordering::SeqCst) {
                break;
            }

            let commands: Vec<_> = self.commands.try_iter().collect();
            for command in commands {
                self.handle(command);
            }

            self.fire_due(Instant::now());

            let timeout = self
                .heap
                .peek()
                .map(|next| next.due.saturating_duration_since(Instant::now()))
                .unwrap_or(MAX_IDLE)
                .min(MAX_IDLE);

            match self.commands.recv_timeout(timeout) {
                Ok(command) => self.handle(command),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        // Jobs never outlive their worker, however it was stopped
        for status in lock(&self.jobs).values_mut() {
            status.active = false;
        }

        log::debug!(
            "[session {}] TX worker finished with {} periodic jobs",
            session_id,
            self.periodic.len()
        );
    }

    fn handle(&mut self, command: TxCommand) {
        match command {
            TxCommand::Send(frame) => self.transmit(&frame, None),
            TxCommand::Schedule {
                handle,
                frame,
                period,
                start,
            } => {
                let next_due = start + period;
                self.periodic.insert(
                    handle,
                    PeriodicJob {
                        frame,
                        period,
                        next_due,
                    },
                );
                self.heap.push(ScheduledJob {
                    due: next_due,
                    handle,
                });
            }
            TxCommand::Cancel { handle, ack } => {
                self.periodic.remove(&handle);
                ack.send(()).ok();
            }
            TxCommand::CancelAll { ack } => {
                self.periodic.clear();
                self.heap.clear();
                ack.send(()).ok();
            }
        }
    }

    /// Send every job whose slot has come
    fn fire_due(&mut self, now: Instant) {
        while let Some(next) = self.heap.peek().copied() {
            if next.due > now {
                break;
            }
            self.heap.pop();

            // Cancelled jobs leave stale heap entries behind
            let Some(job) = self.periodic.get_mut(&next.handle) else {
                continue;
            };
            if job.next_due != next.due {
                continue;
            }

            // Whole periods elapsed since the slot are skipped; the send
            // below stands for the latest slot not after `now`
            let frame = job.frame.clone();
            let behind = now.saturating_duration_since(job.next_due);
            let missed = (behind.as_nanos() / job.period.as_nanos()) as u32;
            let next_due = job.next_due + job.period * (missed + 1);
            job.next_due = next_due;
            self.heap.push(ScheduledJob {
                due: next_due,
                handle: next.handle,
            });

            if missed > 0 {
                log::debug!("{} skipped {} slots", next.handle, missed);
                if let Some(status) = lock(&self.jobs).get_mut(&next.handle) {
                    status.missed += missed as u64;
                }
            }
            self.transmit(&frame, Some(next.handle));
        }
    }

    fn transmit(&self, frame: &CanFrame, job: Option<JobHandle>) {
        match self.context.transport.send(frame) {
            Ok(()) => {
                let echoed = Arc::new(Frame::from_can(
                    self.context.timebase.now_us(),
                    Arc::clone(&self.context.channel),
                    Direction::Tx,
                    frame.clone(),
                ));
                let timestamp_us = echoed.timestamp_us;
                self.context.echo.send(echoed).ok();

                if let Some(handle) = job {
                    if let Some(status) = lock(&self.jobs).get_mut(&handle) {
                        status.sent += 1;
                        status.last_sent_us = Some(timestamp_us);
                    }
                }
            }
            Err(error) => {
                if let Some(handle) = job {
                    if let Some(status) = lock(&self.jobs).get_mut(&handle) {
                        status.failed += 1;
                        status.last_error = Some(error.to_string());
                    }
                }
                self.events.emit(EventKind::TxError { job, error });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signals::catalog::{DbcCatalog, MessageDefinition, SignalDefinition};
    use crate::transport::VirtualBus;

    struct Running {
        scheduler: TxScheduler,
        bus: VirtualBus,
        listener: crate::transport::VirtualTransport,
        echo: Receiver<Arc<Frame>>,
        stop: Arc<AtomicBool>,
        worker: JoinHandle<()>,
    }

    impl Running {
        fn shutdown(self) -> TxScheduler {
            self.stop.store(true, Ordering::SeqCst);
            self.worker.join().unwrap();
            self.scheduler.detach();
            self.scheduler
        }
    }

    fn running(events: EventBus) -> Running {
        let router = Arc::new(MultiDbcRouter::new(events.clone()));
        router
            .load(
                DbcCatalog::new().with_message(
                    MessageDefinition::new(MessageKey::extended(0x18FF_0010), "Cmd", 2)
                        .with_signal(SignalDefinition::new("Level", 0, 8).with_range(0.0, 100.0))
                        .with_signal(SignalDefinition::new("Mode", 8, 8).with_default(3.0)),
                ),
                "body.dbc",
            )
            .unwrap();

        let bus = VirtualBus::new();
        let listener = bus.connect("vcan0");
        let (echo_tx, echo) = unbounded();
        let stop = Arc::new(AtomicBool::new(false));
        let scheduler = TxScheduler::new(router, events);
        let worker = scheduler
            .start(TxContext {
                transport: Arc::new(bus.connect("vcan0")),
                echo: echo_tx,
                stop: Arc::clone(&stop),
                timebase: Timebase::new(),
                channel: Arc::from("virtual:vcan0"),
            })
            .unwrap();

        Running {
            scheduler,
            bus,
            listener,
            echo,
            stop,
            worker,
        }
    }

    #[test]
    fn test_one_shot_dbc_send_is_encoded_and_echoed() {
        let r = running(EventBus::new("s1"));
        let values = HashMap::from([("Level".to_string(), 42.0)]);
        r.scheduler
            .send(TxRequest::dbc("body.dbc", MessageKey::extended(0x18FF_0010), values))
            .unwrap();

        let frame = r.listener.recv(Duration::from_secs(1)).unwrap().unwrap();
        assert!(frame.is_extended);
        assert_eq!(frame.data, vec![42, 3]);

        let echoed = r.echo.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(echoed.direction, Direction::Tx);
        r.shutdown();
    }

    #[test]
    fn test_encode_error_is_returned_and_reported() {
        let events = EventBus::new("s1");
        let rx = events.subscribe();
        let r = running(events);

        let values = HashMap::from([("Level".to_string(), 150.0)]);
        let err = r
            .scheduler
            .send(TxRequest::dbc("body.dbc", MessageKey::extended(0x18FF_0010), values))
            .unwrap_err();
        assert!(matches!(err, AnalyzerError::Encode(_)));
        assert!(matches!(rx.try_recv().unwrap().kind, EventKind::EncodeError { .. }));
        r.shutdown();
    }

    #[test]
    fn test_periodic_job_is_fixed_rate() {
        let r = running(EventBus::new("s1"));
        let handle = r
            .scheduler
            .schedule(TxRequest::raw(CanFrame::new(0x100, vec![1])), 10)
            .unwrap();

        std::thread::sleep(Duration::from_millis(105));
        r.scheduler.cancel(handle).unwrap();

        let received: Vec<_> = std::iter::from_fn(|| r.listener.recv(Duration::from_millis(1)).ok().flatten())
            .collect();
        // Ten slots in 105 ms, a couple of ms of jitter either way
        assert!(
            (8..=11).contains(&received.len()),
            "got {} sends",
            received.len()
        );
        assert!(r.scheduler.job(handle).is_none());
        r.shutdown();
    }

    #[test]
    fn test_cancel_unknown_job() {
        let r = running(EventBus::new("s1"));
        assert!(matches!(
            r.scheduler.cancel(JobHandle(99)),
            Err(AnalyzerError::NotFound(_))
        ));
        r.shutdown();
    }

    #[test]
    fn test_busy_transport_fails_job_without_stopping_it() {
        let events = EventBus::new("s1");
        let rx = events.subscribe();
        let r = running(events);
        r.bus.set_busy("vcan0", true);

        let handle = r
            .scheduler
            .schedule(TxRequest::raw(CanFrame::new(0x200, vec![])), 5)
            .unwrap();
        std::thread::sleep(Duration::from_millis(40));
        r.bus.set_busy("vcan0", false);
        std::thread::sleep(Duration::from_millis(40));

        let status = r.scheduler.job(handle).unwrap();
        assert!(status.failed > 0);
        assert!(status.sent > 0);
        assert!(status.last_error.is_some());
        assert!(rx
            .try_iter()
            .any(|e| matches!(e.kind, EventKind::TxError { job: Some(h), .. } if h == handle)));

        let scheduler = r.shutdown();
        assert!(!scheduler.job(handle).unwrap().active);
    }

    #[test]
    fn test_send_requires_running_worker() {
        let scheduler = TxScheduler::new(Arc::new(MultiDbcRouter::default()), EventBus::new("s1"));
        let err = scheduler
            .send(TxRequest::raw(CanFrame::new(0x1, vec![])))
            .unwrap_err();
        assert!(matches!(err, AnalyzerError::InvalidState { .. }));
    }

    fn idle_worker(bus: &VirtualBus) -> (TxWorker, Sender<TxCommand>) {
        let (commands_tx, commands) = unbounded();
        let (echo, _) = unbounded();
        let worker = TxWorker {
            context: TxContext {
                transport: Arc::new(bus.connect("vcan0")),
                echo,
                stop: Arc::new(AtomicBool::new(false)),
                timebase: Timebase::new(),
                channel: Arc::from("virtual:vcan0"),
            },
            commands,
            jobs: Arc::new(Mutex::new(BTreeMap::new())),
            events: EventBus::new("s1"),
            heap: BinaryHeap::new(),
            periodic: HashMap::new(),
        };
        (worker, commands_tx)
    }

    #[test]
    fn test_late_worker_skips_missed_slots() {
        let bus = VirtualBus::new();
        let listener = bus.connect("vcan0");
        let (mut worker, _commands) = idle_worker(&bus);

        let handle = JobHandle(1);
        let frame = CanFrame::new(0x100, vec![1]);
        let period = Duration::from_millis(50);
        lock(&worker.jobs).insert(
            handle,
            JobStatus {
                handle,
                frame: frame.clone(),
                period,
                active: true,
                sent: 0,
                failed: 0,
                missed: 0,
                last_error: None,
                last_sent_us: None,
            },
        );
        let t0 = Instant::now();
        worker.handle(TxCommand::Schedule {
            handle,
            frame,
            period,
            start: t0,
        });
        let at = |ms: u64| t0 + Duration::from_millis(ms);
        let counters = |worker: &TxWorker| {
            let status = lock(&worker.jobs)[&handle].clone();
            (status.sent, status.missed)
        };

        worker.fire_due(at(49));
        assert_eq!(counters(&worker), (0, 0));

        worker.fire_due(at(50));
        assert_eq!(counters(&worker), (1, 0));

        // A send that took 125 ms: slot 100 is skipped, one send covers slot 150
        worker.fire_due(at(175));
        assert_eq!(counters(&worker), (2, 1));
        assert_eq!(worker.heap.peek().unwrap().due, at(200));

        worker.fire_due(at(200));
        assert_eq!(counters(&worker), (3, 1));

        // Slot 250 served at 520: five whole periods late
        worker.fire_due(at(520));
        assert_eq!(counters(&worker), (4, 6));
        assert_eq!(worker.heap.peek().unwrap().due, at(550));
        assert!(worker.heap.peek().unwrap().due > at(520));

        let received = std::iter::from_fn(|| listener.recv(Duration::from_millis(1)).ok().flatten())
            .count();
        assert_eq!(received, 4);
    }

    #[test]
    fn test_worker_exit_deactivates_jobs() {
        let r = running(EventBus::new("s1"));
        let handle = r
            .scheduler
            .schedule(TxRequest::raw(CanFrame::new(0x300, vec![])), 5)
            .unwrap();
        r.stop.store(true, Ordering::SeqCst);
        r.worker.join().unwrap();

        // Inactive before anyone detached the scheduler
        assert!(!r.scheduler.job(handle).unwrap().active);
        assert!(!r.scheduler.is_running());
    }

    #[test]
    fn test_heap_pops_earliest_first() {
        let now = Instant::now();
        let mut heap = BinaryHeap::new();
        heap.push(ScheduledJob {
            due: now + Duration::from_millis(30),
            handle: JobHandle(1),
        });
        heap.push(ScheduledJob {
            due: now + Duration::from_millis(10),
            handle: JobHandle(2),
        });
        assert_eq!(heap.pop().unwrap().handle, JobHandle(2));
    }
}
