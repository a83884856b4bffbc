//! Observation status reporting.
//!
//! The capture loop never formats text: it snapshots its counters by value
//! and hands the snapshot to a background logger thread over a bounded
//! channel. A full channel drops the report rather than stall the hot path,
//! and report ordering across submissions is not guaranteed — log consumers
//! must tolerate that.

use crossbeam_channel::{Receiver, Sender, TrySendError};
use std::thread::JoinHandle;

/// By-value snapshot of one status emission.
#[derive(Debug, Clone, Copy)]
pub struct StatusReport {
    pub port: u16,
    pub current_packet: u64,
    pub start_packet: u64,
    pub end_packet: u64,
    pub interval_expected: u64,
    pub interval_seen: u64,
    pub total_expected: u64,
    pub total_seen: u64,
}

fn pct(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        0.0
    } else {
        100.0 * part as f64 / whole as f64
    }
}

impl StatusReport {
    /// Six tab-delimited lines: observation header, column headings,
    /// interval counts, interval percentages, cumulative counts, cumulative
    /// percentages.
    pub fn render(&self) -> String {
        let complete = pct(
            self.current_packet.saturating_sub(self.start_packet),
            self.end_packet.saturating_sub(self.start_packet),
        );
        let interval_missed = self.interval_expected.saturating_sub(self.interval_seen);
        let total_missed = self.total_expected.saturating_sub(self.total_seen);

        let mut out = String::with_capacity(512);
        out.push_str(&format!(
            "Port {}\tObservation {:.1}% Complete\t\t\tCurrent Packet {}\n",
            self.port, complete, self.current_packet
        ));
        out.push_str("Packets\t\tExpected\t\tSeen\t\t\tMissed\n");
        out.push_str(&format!(
            "N (Current)\t{}\t\t\t{}\t\t\t{}\n",
            self.interval_expected, self.interval_seen, interval_missed
        ));
        out.push_str(&format!(
            "% (Current)\t...\t\t\t{:.1}\t\t\t{:.1}\n",
            pct(self.interval_seen, self.interval_expected),
            pct(interval_missed, self.interval_expected)
        ));
        out.push_str(&format!(
            "N (Total)\t{}\t\t\t{}\t\t\t{}\n",
            self.total_expected, self.total_seen, total_missed
        ));
        out.push_str(&format!(
            "% (Total)\t...\t\t\t{:.1}\t\t\t{:.1}",
            pct(self.total_seen, self.total_expected),
            pct(total_missed, self.total_expected)
        ));
        out
    }
}

/// Background status logger. Reports submitted before drop are flushed; the
/// thread exits once the sender side is gone.
pub struct StatusLogger {
    tx: Option<Sender<StatusReport>>,
    handle: Option<JoinHandle<()>>,
}

impl StatusLogger {
    pub fn spawn() -> Self {
        let (tx, rx): (Sender<StatusReport>, Receiver<StatusReport>) =
            crossbeam_channel::bounded(64);
        let handle = std::thread::Builder::new()
            .name("status-log".into())
            .spawn(move || {
                for report in &rx {
                    tracing::info!("\n{}", report.render());
                }
            })
            .ok();
        Self { tx: Some(tx), handle }
    }

    /// Fire-and-forget submission of a by-value snapshot.
    pub fn submit(&self, report: StatusReport) {
        if let Some(tx) = &self.tx {
            match tx.try_send(report) {
                Ok(()) | Err(TrySendError::Disconnected(_)) => {}
                Err(TrySendError::Full(_)) => {
                    tracing::debug!("status channel full; dropping report");
                }
            }
        }
    }
}

impl Drop for StatusLogger {
    fn drop(&mut self) {
        // Closing the channel lets the thread drain pending reports and exit.
        self.tx.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_shape() {
        let report = StatusReport {
            port: 16130,
            current_packet: 100_128,
            start_packet: 100_000,
            end_packet: 100_256,
            interval_expected: 250,
            interval_seen: 240,
            total_expected: 125,
            total_seen: 120,
        };
        let text = report.render();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 6);
        assert_eq!(
            lines[0],
            "Port 16130\tObservation 50.0% Complete\t\t\tCurrent Packet 100128"
        );
        assert_eq!(lines[1], "Packets\t\tExpected\t\tSeen\t\t\tMissed");
        assert_eq!(lines[2], "N (Current)\t250\t\t\t240\t\t\t10");
        assert_eq!(lines[3], "% (Current)\t...\t\t\t96.0\t\t\t4.0");
        assert_eq!(lines[4], "N (Total)\t125\t\t\t120\t\t\t5");
        assert_eq!(lines[5], "% (Total)\t...\t\t\t96.0\t\t\t4.0");
    }

    #[test]
    fn test_render_empty_denominators() {
        let report = StatusReport {
            port: 1,
            current_packet: 0,
            start_packet: 0,
            end_packet: 0,
            interval_expected: 0,
            interval_seen: 0,
            total_expected: 0,
            total_seen: 0,
        };
        // No division-by-zero artifacts.
        assert!(!report.render().contains("NaN"));
        assert!(!report.render().contains("inf"));
    }

    #[test]
    fn test_logger_flushes_on_drop() {
        let logger = StatusLogger::spawn();
        for _ in 0..8 {
            logger.submit(StatusReport {
                port: 1,
                current_packet: 1,
                start_packet: 0,
                end_packet: 2,
                interval_expected: 1,
                interval_seen: 1,
                total_expected: 1,
                total_seen: 1,
            });
        }
        drop(logger);
    }
}
