//! Bounded trace of every frame seen by a session
//!
//! The trace is the filter-independent record of the bus: the RX worker
//! appends every received and transmitted frame, oldest entries are evicted
//! once capacity is reached. Entries are shared as `Arc<TracePoint>`, so
//! readers copy pointers under a short read lock and never see a torn entry.
//! Decoding is deferred: a point is decoded the first time someone expands
//! it and the result is memoized on the point.

use crate::error::{AnalyzerError, DecodeError, Result};
use crate::router::MultiDbcRouter;
use crate::shared::{read, write};
use crate::types::{CatalogKey, DecodedMessage, Frame, MessageKey};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, OnceLock, RwLock};

/// Memoized decode result of a trace point
///
/// `None` means no loaded catalog claimed the id when the point was expanded.
pub type Expansion = Option<std::result::Result<DecodedMessage, DecodeError>>;

/// Fixed frame overhead in bits (stuff bits ignored)
const STANDARD_FRAME_BITS: u64 = 47;
const EXTENDED_FRAME_BITS: u64 = 67;

/// One traced frame
#[derive(Debug)]
pub struct TracePoint {
    /// Sequence number, starting at 1, never reused by a buffer
    pub seq: u64,
    pub frame: Arc<Frame>,
    /// Time since the previous frame with the same id
    pub delta_us: Option<u64>,
    /// Estimated start-of-frame time derived from the bit rate
    pub sof_us: u64,
    /// Catalog the id was routed to when the frame was appended
    pub catalog: Option<CatalogKey>,
    /// Message name from that catalog
    pub message_name: Option<String>,
    decoded: OnceLock<Expansion>,
}

impl TracePoint {
    /// Memoized decode result, if the point was expanded
    pub fn decoded(&self) -> Option<&Expansion> {
        self.decoded.get()
    }

    /// True once a decode result is attached
    pub fn is_expanded(&self) -> bool {
        self.decoded.get().is_some()
    }

    /// Attach a decode result computed elsewhere; `false` if one is present
    pub fn set_decoded(&self, expansion: Expansion) -> bool {
        self.decoded.set(expansion).is_ok()
    }

    /// Decode with `decoder` unless a result is already memoized
    ///
    /// Concurrent callers block until the first one finishes, so `decoder`
    /// runs at most once per point.
    pub fn expand_with(&self, decoder: impl FnOnce(&Frame) -> Expansion) -> &Expansion {
        self.decoded.get_or_init(|| decoder(&self.frame))
    }
}

/// Trace statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TraceStats {
    pub len: usize,
    pub capacity: usize,
    /// Frames appended since the buffer was created
    pub appended: u64,
    /// Frames dropped by capacity eviction
    pub evicted: u64,
    /// Points cleared by `clear()`
    pub cleared: u64,
}

#[derive(Debug, Default)]
struct TraceRing {
    points: VecDeque<Arc<TracePoint>>,
    next_seq: u64,
    last_seen: HashMap<MessageKey, u64>,
    appended: u64,
    evicted: u64,
    cleared: u64,
}

impl TraceRing {
    /// Position of `seq` in the ring; sequence numbers are contiguous
    fn index_of(&self, seq: u64) -> Option<usize> {
        let first = self.points.front()?.seq;
        let index = seq.checked_sub(first)? as usize;
        (index < self.points.len()).then_some(index)
    }
}

/// Bounded FIFO of trace points
#[derive(Debug)]
pub struct TraceBuffer {
    capacity: usize,
    bitrate: u32,
    ring: RwLock<TraceRing>,
}

impl TraceBuffer {
    /// Create a buffer holding at most `capacity` frames
    ///
    /// `bitrate` (bit/s) is used for the start-of-frame estimate.
    pub fn new(capacity: usize, bitrate: u32) -> Self {
        Self {
            capacity: capacity.max(1),
            bitrate: bitrate.max(1),
            ring: RwLock::new(TraceRing {
                next_seq: 1,
                ..TraceRing::default()
            }),
        }
    }

    /// Append a frame, evicting the oldest point when full
    pub fn append(
        &self,
        frame: Arc<Frame>,
        catalog: Option<CatalogKey>,
        message_name: Option<String>,
    ) -> Arc<TracePoint> {
        let sof_us = frame
            .timestamp_us
            .saturating_sub(self.frame_duration_us(&frame));

        let mut ring = write(&self.ring);
        let delta_us = ring
            .last_seen
            .insert(frame.key(), frame.timestamp_us)
            .map(|last| frame.timestamp_us.saturating_sub(last));

        let point = Arc::new(TracePoint {
            seq: ring.next_seq,
            frame,
            delta_us,
            sof_us,
            catalog,
            message_name,
            decoded: OnceLock::new(),
        });

        ring.next_seq += 1;
        ring.appended += 1;
        if ring.points.len() == self.capacity {
            ring.points.pop_front();
            ring.evicted += 1;
        }
        ring.points.push_back(Arc::clone(&point));

        log::trace!("Trace #{}: {}", point.seq, point.frame);
        point
    }

    /// Rough on-wire duration of a frame
    fn frame_duration_us(&self, frame: &Frame) -> u64 {
        let base = if frame.is_extended {
            EXTENDED_FRAME_BITS
        } else {
            STANDARD_FRAME_BITS
        };
        let bits = base + frame.dlc().min(64) as u64 * 8;
        bits * 1_000_000 / self.bitrate as u64
    }

    /// Point with the given sequence number, if still retained
    pub fn get(&self, seq: u64) -> Option<Arc<TracePoint>> {
        let ring = read(&self.ring);
        ring.index_of(seq).map(|i| Arc::clone(&ring.points[i]))
    }

    /// Retained points with `from <= seq <= to`, in order
    pub fn range(&self, from: u64, to: u64) -> Vec<Arc<TracePoint>> {
        let ring = read(&self.ring);
        let Some(first) = ring.points.front().map(|p| p.seq) else {
            return Vec::new();
        };
        if to < from || to < first {
            return Vec::new();
        }
        let start = from.saturating_sub(first) as usize;
        let end = ((to - first) as usize)
            .saturating_add(1)
            .min(ring.points.len());
        if start >= end {
            return Vec::new();
        }
        ring.points.range(start..end).cloned().collect()
    }

    /// The `n` most recent points, oldest first
    pub fn latest(&self, n: usize) -> Vec<Arc<TracePoint>> {
        let ring = read(&self.ring);
        let skip = ring.points.len().saturating_sub(n);
        ring.points.iter().skip(skip).cloned().collect()
    }

    /// Points appended after `last_seq`
    ///
    /// Consumers polling with the last sequence they saw may miss points that
    /// were evicted in between; the gap is visible in the sequence numbers.
    pub fn since(&self, last_seq: u64) -> Vec<Arc<TracePoint>> {
        self.range(last_seq.saturating_add(1), u64::MAX)
    }

    /// Every retained point, oldest first
    pub fn snapshot(&self) -> Vec<Arc<TracePoint>> {
        read(&self.ring).points.iter().cloned().collect()
    }

    /// Decode a point on demand through the router, memoizing the result
    pub fn expand(&self, seq: u64, router: &MultiDbcRouter) -> Result<Expansion> {
        self.expand_with(seq, |frame| router.decode(frame))
    }

    /// Decode a point on demand with a custom decoder, memoizing the result
    pub fn expand_with(
        &self,
        seq: u64,
        decoder: impl FnOnce(&Frame) -> Expansion,
    ) -> Result<Expansion> {
        let point = self
            .get(seq)
            .ok_or_else(|| AnalyzerError::NotFound(format!("trace point #{}", seq)))?;
        Ok(point.expand_with(decoder).clone())
    }

    pub fn len(&self) -> usize {
        read(&self.ring).points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Sequence number of the newest point, 0 if nothing was appended
    pub fn last_seq(&self) -> u64 {
        read(&self.ring).next_seq - 1
    }

    pub fn stats(&self) -> TraceStats {
        let ring = read(&self.ring);
        TraceStats {
            len: ring.points.len(),
            capacity: self.capacity,
            appended: ring.appended,
            evicted: ring.evicted,
            cleared: ring.cleared,
        }
    }

    /// Drop every point; sequence numbers keep increasing
    pub fn clear(&self) {
        let mut ring = write(&self.ring);
        ring.cleared += ring.points.len() as u64;
        ring.points.clear();
        ring.last_seen.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CanFrame, Direction};
    use std::cell::Cell;

    fn frame(ts: u64, id: u32) -> Arc<Frame> {
        Arc::new(Frame::from_can(
            ts,
            Arc::from("virtual:vcan0"),
            Direction::Rx,
            CanFrame::new(id, vec![0; 8]),
        ))
    }

    fn seqs(points: &[Arc<TracePoint>]) -> Vec<u64> {
        points.iter().map(|p| p.seq).collect()
    }

    #[test]
    fn test_capacity_eviction() {
        let trace = TraceBuffer::new(3, 500_000);
        for ts in 1..=4 {
            trace.append(frame(ts * 1000, 0x100), None, None);
        }

        assert_eq!(seqs(&trace.snapshot()), vec![2, 3, 4]);
        let stats = trace.stats();
        assert_eq!(stats.appended, 4);
        assert_eq!(stats.evicted, 1);
        assert!(trace.get(1).is_none());
    }

    #[test]
    fn test_expand_decodes_once() {
        let trace = TraceBuffer::new(3, 500_000);
        for ts in 1..=4 {
            trace.append(frame(ts, 0x100), None, None);
        }

        let calls = Cell::new(0);
        let decoder = |_: &Frame| {
            calls.set(calls.get() + 1);
            None
        };
        assert!(trace.expand_with(4, decoder).unwrap().is_none());
        assert!(trace.expand_with(4, decoder).unwrap().is_none());
        assert_eq!(calls.get(), 1);

        assert!(matches!(
            trace.expand_with(1, decoder),
            Err(AnalyzerError::NotFound(_))
        ));
    }

    #[test]
    fn test_delta_per_id() {
        let trace = TraceBuffer::new(10, 500_000);
        let a = trace.append(frame(1_000, 0x100), None, None);
        let b = trace.append(frame(1_500, 0x200), None, None);
        let c = trace.append(frame(3_000, 0x100), None, None);

        assert_eq!(a.delta_us, None);
        assert_eq!(b.delta_us, None);
        assert_eq!(c.delta_us, Some(2_000));
    }

    #[test]
    fn test_start_of_frame_estimate() {
        // 47 + 64 bits at 500 kbit/s = 222 us
        let trace = TraceBuffer::new(10, 500_000);
        let point = trace.append(frame(10_000, 0x100), None, None);
        assert_eq!(point.sof_us, 10_000 - 222);

        let early = trace.append(frame(5, 0x101), None, None);
        assert_eq!(early.sof_us, 0);
    }

    #[test]
    fn test_range_latest_since() {
        let trace = TraceBuffer::new(5, 500_000);
        for ts in 1..=7 {
            trace.append(frame(ts, 0x100), None, None);
        }
        // Retained: 3..=7
        assert_eq!(seqs(&trace.range(1, 4)), vec![3, 4]);
        assert_eq!(seqs(&trace.range(5, 5)), vec![5]);
        assert!(trace.range(8, 10).is_empty());
        assert!(trace.range(6, 4).is_empty());
        assert_eq!(seqs(&trace.latest(2)), vec![6, 7]);
        assert_eq!(seqs(&trace.latest(10)).len(), 5);
        assert_eq!(seqs(&trace.since(5)), vec![6, 7]);
        assert_eq!(seqs(&trace.since(0)), vec![3, 4, 5, 6, 7]);
        assert_eq!(trace.last_seq(), 7);
    }

    #[test]
    fn test_clear_keeps_sequence() {
        let trace = TraceBuffer::new(5, 500_000);
        trace.append(frame(1, 0x100), None, None);
        trace.append(frame(2, 0x100), None, None);
        trace.clear();
        assert!(trace.is_empty());

        let point = trace.append(frame(3, 0x100), None, None);
        assert_eq!(point.seq, 3);
        assert_eq!(point.delta_us, None);
        assert_eq!(trace.stats().cleared, 2);
    }

    #[test]
    fn test_set_decoded_only_once() {
        let trace = TraceBuffer::new(5, 500_000);
        let point = trace.append(frame(1, 0x100), Some("A".to_string()), Some("Msg".to_string()));
        assert!(!point.is_expanded());
        assert!(point.set_decoded(None));
        assert!(!point.set_decoded(None));
        assert!(point.is_expanded());
    }
}
