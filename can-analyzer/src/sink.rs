//! Logging-path frame sinks
//!
//! The RX worker hands every frame that passes the logging filter to the
//! session's [`FrameSink`]. No file format is implied: [`QueuedSink`] moves
//! frames to a writer thread through a bounded queue and lets the caller
//! decide how each frame is written.

use crate::shared::{lock, read, write};
use crate::types::Frame;
use crossbeam_channel::{bounded, Sender, TrySendError};
use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::JoinHandle;

/// Receiver of logging-path frames
///
/// Called on the RX worker thread, so implementations must not block.
pub trait FrameSink: Send + Sync {
    fn push(&self, frame: &Arc<Frame>);
}

/// Closure adapter for [`FrameSink`]
pub struct SinkFn<F>(pub F);

impl<F> FrameSink for SinkFn<F>
where
    F: Fn(&Arc<Frame>) + Send + Sync,
{
    fn push(&self, frame: &Arc<Frame>) {
        (self.0)(frame)
    }
}

/// Replaceable sink of one session
#[derive(Default)]
pub struct SinkSlot {
    sink: RwLock<Option<Arc<dyn FrameSink>>>,
}

impl SinkSlot {
    pub fn set(&self, sink: Option<Arc<dyn FrameSink>>) {
        *write(&self.sink) = sink;
    }

    pub fn get(&self) -> Option<Arc<dyn FrameSink>> {
        read(&self.sink).clone()
    }
}

/// QueuedSink counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SinkStats {
    pub enqueued: u64,
    pub written: u64,
    /// Frames lost to a full queue or a failed write
    pub dropped: u64,
    pub running: bool,
}

#[derive(Debug, Default)]
struct SinkCounters {
    enqueued: AtomicU64,
    written: AtomicU64,
    dropped: AtomicU64,
    running: AtomicBool,
}

/// Non-blocking sink backed by a writer thread
///
/// `push` never blocks: when the queue is full the frame is dropped and
/// counted. A bounded tail of formatted lines is kept for log viewers.
pub struct QueuedSink {
    sender: Mutex<Option<Sender<Arc<Frame>>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    counters: Arc<SinkCounters>,
    recent: Mutex<VecDeque<String>>,
    recent_max: usize,
}

impl QueuedSink {
    /// Start the writer thread
    ///
    /// `writer` is called once per frame on the writer thread; an error
    /// counts the frame as dropped and logging continues.
    pub fn spawn<W>(capacity: usize, recent_max: usize, mut writer: W) -> io::Result<Self>
    where
        W: FnMut(&Frame) -> io::Result<()> + Send + 'static,
    {
        let (tx, rx) = bounded::<Arc<Frame>>(capacity.max(1));
        let counters = Arc::new(SinkCounters::default());
        counters.running.store(true, Ordering::SeqCst);

        let worker_counters = Arc::clone(&counters);
        let worker = std::thread::Builder::new()
            .name("can-frame-sink".to_string())
            .spawn(move || {
                for frame in rx.iter() {
                    match writer(&frame) {
                        Ok(()) => {
                            worker_counters.written.fetch_add(1, Ordering::Relaxed);
                        }
                        Err(e) => {
                            log::warn!("Frame sink write failed: {}", e);
                            worker_counters.dropped.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                }
                worker_counters.running.store(false, Ordering::SeqCst);
                log::debug!("Frame sink writer finished");
            })?;

        Ok(Self {
            sender: Mutex::new(Some(tx)),
            worker: Mutex::new(Some(worker)),
            counters,
            recent: Mutex::new(VecDeque::new()),
            recent_max,
        })
    }

    /// Start a writer thread writing one formatted line per frame
    pub fn to_writer<T>(capacity: usize, recent_max: usize, mut out: T) -> io::Result<Self>
    where
        T: io::Write + Send + 'static,
    {
        Self::spawn(capacity, recent_max, move |frame| {
            writeln!(out, "{}", frame)?;
            out.flush()
        })
    }

    /// Current counters
    pub fn stats(&self) -> SinkStats {
        SinkStats {
            enqueued: self.counters.enqueued.load(Ordering::Relaxed),
            written: self.counters.written.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
            running: self.counters.running.load(Ordering::SeqCst),
        }
    }

    /// The last `n` accepted frames, formatted, oldest first
    pub fn tail_lines(&self, n: usize) -> Vec<String> {
        let recent = lock(&self.recent);
        let skip = recent.len().saturating_sub(n);
        recent.iter().skip(skip).cloned().collect()
    }

    /// Stop accepting frames, drain the queue and join the writer
    pub fn stop(&self) {
        drop(lock(&self.sender).take());
        if let Some(worker) = lock(&self.worker).take() {
            if worker.join().is_err() {
                log::error!("Frame sink writer panicked");
                self.counters.running.store(false, Ordering::SeqCst);
            }
        }
    }

    fn remember(&self, frame: &Frame) {
        if self.recent_max == 0 {
            return;
        }
        let mut recent = lock(&self.recent);
        recent.push_back(frame.to_string());
        while recent.len() > self.recent_max {
            recent.pop_front();
        }
    }
}

impl FrameSink for QueuedSink {
    fn push(&self, frame: &Arc<Frame>) {
        let sender = lock(&self.sender);
        let Some(sender) = sender.as_ref() else {
            return;
        };

        match sender.try_send(Arc::clone(frame)) {
            Ok(()) => {
                self.counters.enqueued.fetch_add(1, Ordering::Relaxed);
                self.remember(frame);
            }
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

impl Drop for QueuedSink {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CanFrame, Direction};
    use crossbeam_channel::unbounded;
    use std::time::Duration;

    fn frame(id: u32) -> Arc<Frame> {
        Arc::new(Frame::from_can(
            1_000,
            Arc::from("virtual:vcan0"),
            Direction::Rx,
            CanFrame::new(id, vec![0x01, 0x02]),
        ))
    }

    #[test]
    fn test_frames_are_written_in_order() {
        let (tx, rx) = unbounded();
        let sink = QueuedSink::spawn(16, 10, move |frame| {
            tx.send(frame.can_id).ok();
            Ok(())
        })
        .unwrap();

        for id in 1..=5 {
            sink.push(&frame(id));
        }
        sink.stop();

        let written: Vec<u32> = rx.try_iter().collect();
        assert_eq!(written, vec![1, 2, 3, 4, 5]);
        let stats = sink.stats();
        assert_eq!(stats.enqueued, 5);
        assert_eq!(stats.written, 5);
        assert!(!stats.running);
    }

    #[test]
    fn test_full_queue_drops_instead_of_blocking() {
        let (gate_tx, gate_rx) = bounded::<()>(0);
        let sink = QueuedSink::spawn(1, 10, move |_| {
            // Block the writer until the test releases it
            gate_rx.recv_timeout(Duration::from_secs(5)).ok();
            Ok(())
        })
        .unwrap();

        for id in 0..10 {
            sink.push(&frame(id));
        }
        let stats = sink.stats();
        assert!(stats.dropped >= 8);
        assert_eq!(stats.enqueued + stats.dropped, 10);

        drop(gate_tx);
        sink.stop();
    }

    #[test]
    fn test_write_errors_count_as_dropped() {
        let sink = QueuedSink::spawn(4, 10, |_| {
            Err(io::Error::new(io::ErrorKind::Other, "disk full"))
        })
        .unwrap();
        sink.push(&frame(1));
        sink.stop();
        assert_eq!(sink.stats().dropped, 1);
        assert_eq!(sink.stats().written, 0);
    }

    #[test]
    fn test_tail_lines_is_bounded() {
        let sink = QueuedSink::spawn(16, 3, |_| Ok(())).unwrap();
        for id in 0x100..0x105 {
            sink.push(&frame(id));
        }
        let tail = sink.tail_lines(10);
        assert_eq!(tail.len(), 3);
        assert!(tail[2].contains("0x104"));
        assert_eq!(sink.tail_lines(1).len(), 1);
    }

    #[test]
    fn test_push_after_stop_is_ignored() {
        let sink = QueuedSink::spawn(4, 0, |_| Ok(())).unwrap();
        sink.stop();
        sink.push(&frame(1));
        assert_eq!(sink.stats().enqueued, 0);
    }

    #[test]
    fn test_sink_fn() {
        let (tx, rx) = unbounded();
        let sink = SinkFn(move |frame: &Arc<Frame>| {
            tx.send(frame.can_id).ok();
        });
        sink.push(&frame(0x42));
        assert_eq!(rx.try_recv().unwrap(), 0x42);
    }
}
