//! Per-session summary printed after a run

use can_analyzer::{CanSession, JobStatus, RoutingCollision, SinkStats};
use std::fmt::Write;

/// Everything printed for one session, gathered after it stopped
#[derive(Debug, Clone)]
pub struct SessionReport {
    pub id: String,
    pub name: String,
    pub channel: String,
    /// Wall-clock time of the session's timebase origin
    pub opened_at: String,
    pub traced: u64,
    pub evicted: u64,
    pub received: u64,
    pub decoded: u64,
    pub decode_errors: u64,
    /// (series, points, last value)
    pub series: Vec<(String, usize, Option<f64>)>,
    pub collisions: Vec<RoutingCollision>,
    pub jobs: Vec<JobStatus>,
    pub sink: Option<SinkStats>,
}

impl SessionReport {
    pub fn collect(session: &CanSession, sink: Option<SinkStats>) -> Self {
        let trace = session.trace().stats();
        let rx = session.rx_stats();
        let data = session.data();
        let series = data
            .keys()
            .into_iter()
            .map(|key| {
                let last = data.latest(&key).map(|p| p.value);
                (
                    format!("{} {} {}", key.catalog, key.message, key.signal),
                    data.len(&key),
                    last,
                )
            })
            .collect();

        Self {
            id: session.id().to_string(),
            name: session.name().to_string(),
            channel: session.config().interface.label(),
            opened_at: session
                .timebase()
                .wall_origin()
                .format("%Y-%m-%d %H:%M:%S%.3f UTC")
                .to_string(),
            traced: trace.appended,
            evicted: trace.evicted,
            received: rx.received,
            decoded: rx.decoded,
            decode_errors: rx.decode_errors,
            series,
            collisions: session.router().collisions(),
            jobs: session.tx_jobs(),
            sink,
        }
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        // Writing to a String cannot fail
        let _ = self.render_into(&mut out);
        out
    }

    fn render_into(&self, out: &mut String) -> std::fmt::Result {
        writeln!(out, "═══════════════════════════════════════════════")?;
        writeln!(out, "  Session '{}' [{}] on {}", self.name, self.id, self.channel)?;
        writeln!(out, "═══════════════════════════════════════════════")?;
        writeln!(out, "  Opened: {}", self.opened_at)?;
        writeln!(
            out,
            "  Frames traced: {} ({} evicted)",
            self.traced, self.evicted
        )?;
        writeln!(
            out,
            "  Received: {}  Decoded: {}  Decode errors: {}",
            self.received, self.decoded, self.decode_errors
        )?;

        if !self.series.is_empty() {
            writeln!(out, "\n  Series:")?;
            for (name, points, last) in &self.series {
                match last {
                    Some(value) => writeln!(out, "    {:<40} {:>6} pts  last {}", name, points, value)?,
                    None => writeln!(out, "    {:<40} {:>6} pts", name, points)?,
                }
            }
        }

        if !self.collisions.is_empty() {
            writeln!(out, "\n  Routing collisions:")?;
            for c in &self.collisions {
                writeln!(
                    out,
                    "    {} kept by '{}', ignored in '{}'",
                    c.key, c.existing_key, c.rejected_key
                )?;
            }
        }

        if !self.jobs.is_empty() {
            writeln!(out, "\n  TX jobs:")?;
            for job in &self.jobs {
                write!(
                    out,
                    "    {} 0x{:X} every {} ms: {} sent, {} failed, {} missed",
                    job.handle,
                    job.frame.can_id,
                    job.period.as_millis(),
                    job.sent,
                    job.failed,
                    job.missed
                )?;
                match &job.last_error {
                    Some(error) => writeln!(out, " (last error: {})", error)?,
                    None => writeln!(out)?,
                }
            }
        }

        if let Some(sink) = &self.sink {
            writeln!(
                out,
                "\n  Frame log: {} written, {} dropped",
                sink.written, sink.dropped
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use can_analyzer::{InterfaceConfig, SessionConfig, VirtualBus};
    use std::sync::Arc;

    #[test]
    fn test_report_of_idle_session() {
        let config = SessionConfig::new("Idle", InterfaceConfig::virtual_channel("vcan9"));
        let session = CanSession::open(config, Arc::new(VirtualBus::new())).unwrap();

        let report = SessionReport::collect(&session, None);
        assert_eq!(report.traced, 0);
        assert!(report.series.is_empty());

        let text = report.render();
        assert!(text.contains("Session 'Idle'"));
        assert!(text.contains("virtual:vcan9"));
        assert!(!text.contains("TX jobs"));
    }
}
