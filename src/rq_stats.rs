//! Run statistics: hop-duration accumulation and the background collector
//! that subscribes to the telemetry and activity channels for the duration
//! of a run.
//!
//! The collector reads the channels independently of the ring's own
//! liveness; missed or duplicate records are acceptable, not exceptional.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::warn;

use crate::rq_interface::{ActivityRecord, FanoutListener, RingError, TelemetryRecord};

// ============================================================================
// Accumulated Stats
// ============================================================================

/// Everything observed on the side channels during one run.
#[derive(Debug, Clone, Default)]
pub struct RunStats {
    /// Hop durations, in seconds, one per round-time record.
    pub durations: Vec<f64>,

    /// Number of activity records seen.
    pub events: u64,
}

impl RunStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_duration(&mut self, seconds: f64) {
        self.durations.push(seconds);
    }

    pub fn record_event(&mut self) {
        self.events += 1;
    }

    /// Number of observed hops (round-time records).
    pub fn rounds(&self) -> usize {
        self.durations.len()
    }

    pub fn min_duration(&self) -> Option<f64> {
        self.durations.iter().copied().reduce(f64::min)
    }

    pub fn max_duration(&self) -> Option<f64> {
        self.durations.iter().copied().reduce(f64::max)
    }

    pub fn mean_duration(&self) -> Option<f64> {
        if self.durations.is_empty() {
            return None;
        }
        Some(self.durations.iter().sum::<f64>() / self.durations.len() as f64)
    }
}

// ============================================================================
// Stats Collector
// ============================================================================

/// Poll timeout per channel per iteration; short enough that a stop request
/// is observed promptly.
const COLLECTOR_POLL: Duration = Duration::from_millis(100);

/// Background subscriber draining the telemetry and activity channels into
/// a [`RunStats`].
///
/// `stop` signals the thread, joins it, and returns the accumulated stats;
/// queued records are drained before the thread exits.
pub struct StatsCollector {
    stop: Arc<AtomicBool>,
    handle: JoinHandle<RunStats>,
}

impl StatsCollector {
    pub fn spawn<T, A>(telemetry: T, activity: A) -> Result<Self, RingError>
    where
        T: FanoutListener + 'static,
        A: FanoutListener + 'static,
    {
        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = Arc::clone(&stop);

        let handle = thread::Builder::new()
            .name("stats-collector".to_string())
            .spawn(move || collect(telemetry, activity, thread_stop))?;

        Ok(Self { stop, handle })
    }

    pub fn stop(self) -> RunStats {
        self.stop.store(true, Ordering::Relaxed);
        self.handle.join().unwrap_or_default()
    }
}

fn collect<T, A>(mut telemetry: T, mut activity: A, stop: Arc<AtomicBool>) -> RunStats
where
    T: FanoutListener,
    A: FanoutListener,
{
    let mut stats = RunStats::new();
    let mut telemetry_open = true;
    let mut activity_open = true;

    loop {
        let draining = stop.load(Ordering::Relaxed);
        // when stopping, drain whatever is already queued without waiting
        let timeout = if draining { Duration::ZERO } else { COLLECTOR_POLL };

        let mut idle = true;

        if telemetry_open {
            match telemetry.poll(timeout) {
                Ok(Some(payload)) => {
                    idle = false;
                    match TelemetryRecord::from_wire(&payload) {
                        Ok(TelemetryRecord::RoundTime { duration }) => {
                            stats.record_duration(duration)
                        }
                        Err(e) => warn!("stats: ignoring undecodable telemetry payload: {}", e),
                    }
                }
                Ok(None) => {}
                Err(_) => telemetry_open = false,
            }
        }

        if activity_open {
            match activity.poll(timeout) {
                Ok(Some(payload)) => {
                    idle = false;
                    match ActivityRecord::from_wire(&payload) {
                        Ok(_) => stats.record_event(),
                        Err(e) => warn!("stats: ignoring undecodable activity payload: {}", e),
                    }
                }
                Ok(None) => {}
                Err(_) => activity_open = false,
            }
        }

        if draining && idle {
            break;
        }
        if !telemetry_open && !activity_open {
            break;
        }
    }

    stats
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rq_interface::Fanout;
    use crate::rq_memory::MemoryFanout;

    #[test]
    fn test_empty_stats_have_no_extremes() {
        let stats = RunStats::new();
        assert_eq!(stats.rounds(), 0);
        assert_eq!(stats.events, 0);
        assert!(stats.min_duration().is_none());
        assert!(stats.max_duration().is_none());
        assert!(stats.mean_duration().is_none());
    }

    #[test]
    fn test_min_max_mean_arithmetic() {
        let mut stats = RunStats::new();
        for d in [0.2, 0.1, 0.3] {
            stats.record_duration(d);
        }

        assert_eq!(stats.rounds(), 3);
        assert_eq!(stats.min_duration(), Some(0.1));
        assert_eq!(stats.max_duration(), Some(0.3));
        let mean = stats.mean_duration().unwrap();
        assert!((mean - 0.2).abs() < 1e-12);
    }

    #[test]
    fn test_collector_drains_both_channels() {
        let telemetry = MemoryFanout::new();
        let activity = MemoryFanout::new();

        let collector =
            StatsCollector::spawn(telemetry.listen().unwrap(), activity.listen().unwrap()).unwrap();

        for duration in [0.1, 0.2] {
            telemetry
                .publish(&TelemetryRecord::RoundTime { duration }.to_wire().unwrap())
                .unwrap();
        }
        activity
            .publish(&ActivityRecord { origin: 1, round: 3 }.to_wire().unwrap())
            .unwrap();
        // unrelated traffic on a shared group must not close the channel
        telemetry.publish(b"unrelated payload").unwrap();
        telemetry
            .publish(&TelemetryRecord::RoundTime { duration: 0.3 }.to_wire().unwrap())
            .unwrap();

        let stats = collector.stop();
        assert_eq!(stats.rounds(), 3);
        assert_eq!(stats.events, 1);
        assert_eq!(stats.min_duration(), Some(0.1));
        assert_eq!(stats.max_duration(), Some(0.3));
    }
}
