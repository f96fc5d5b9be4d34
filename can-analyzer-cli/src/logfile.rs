//! JSON-lines frame log written through a queued sink

use anyhow::{Context, Result};
use can_analyzer::{CanSession, Frame, QueuedSink, Timebase};
use serde::Serialize;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::Arc;

/// One logged frame
#[derive(Debug, Serialize)]
pub struct FrameRecord<'a> {
    pub timestamp_us: u64,
    /// RFC 3339 wall-clock time
    pub time: String,
    pub channel: &'a str,
    pub direction: String,
    pub id: u32,
    pub extended: bool,
    pub fd: bool,
    pub dlc: usize,
    pub data: String,
}

impl<'a> FrameRecord<'a> {
    pub fn new(frame: &'a Frame, timebase: &Timebase) -> Self {
        let data = frame
            .data
            .iter()
            .map(|b| format!("{:02X}", b))
            .collect::<Vec<_>>()
            .join(" ");
        Self {
            timestamp_us: frame.timestamp_us,
            time: timebase.to_wall_clock(frame.timestamp_us).to_rfc3339(),
            channel: &frame.channel,
            direction: frame.direction.to_string(),
            id: frame.can_id,
            extended: frame.is_extended,
            fd: frame.is_fd,
            dlc: frame.dlc(),
            data,
        }
    }
}

/// Attach a sink writing every logging-path frame of `session` to `path`
pub fn attach(session: &CanSession, path: &Path) -> Result<Arc<QueuedSink>> {
    let file = File::create(path).with_context(|| format!("Failed to create log file: {:?}", path))?;
    let mut out = BufWriter::new(file);
    let timebase = *session.timebase();

    let sink = session
        .attach_queued_sink(move |frame| {
            serde_json::to_writer(&mut out, &FrameRecord::new(frame, &timebase))?;
            out.write_all(b"\n")?;
            out.flush()
        })
        .with_context(|| format!("Failed to start frame log for session '{}'", session.name()))?;

    log::info!("Logging frames of '{}' to {:?}", session.name(), path);
    Ok(sink)
}

#[cfg(test)]
mod tests {
    use super::*;
    use can_analyzer::{CanFrame, Direction};

    #[test]
    fn test_frame_record_json() {
        let timebase = Timebase::new();
        let frame = Frame::from_can(
            1_500,
            Arc::from("virtual:vcan0"),
            Direction::Tx,
            CanFrame::extended(0x18FF_0010, vec![0x0A, 0xFF]),
        );
        let json = serde_json::to_value(FrameRecord::new(&frame, &timebase)).unwrap();

        assert_eq!(json["timestamp_us"], 1_500);
        assert_eq!(json["channel"], "virtual:vcan0");
        assert_eq!(json["id"], 0x18FF_0010);
        assert_eq!(json["extended"], true);
        assert_eq!(json["dlc"], 2);
        assert_eq!(json["data"], "0A FF");
    }
}
