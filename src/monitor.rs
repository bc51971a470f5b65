use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use crate::error::BackfillError;
use crate::store::{CollectionStats, Store};
use crate::utils::Utils;

/// Write batch size used when the store is not replicated.
pub const STANDALONE_WRITE_BATCH_SIZE: usize = 30_000;

/// Replica members younger than this are treated as still settling.
const MIN_MEMBER_UPTIME_SECS: u64 = 120;

/// Pause applied while any replica member is unhealthy or mid-election.
const UNHEALTHY_WAIT: Duration = Duration::from_secs(240);

/// Shortest pause applied while the replication window is too short.
const MIN_WINDOW_WAIT: Duration = Duration::from_secs(600);

/// Over-wait factor applied to the window deficit.
const WINDOW_WAIT_FACTOR: f64 = 1.15;

/// Cumulative wait after which the no-op estimate is probably wrong for this workload.
const WAIT_WARNING: Duration = Duration::from_secs(1800);

/// Granularity at which a sleeping wait re-checks the interrupt token.
const WAIT_SLICE: Duration = Duration::from_secs(1);

/// How the monitor waits between readiness checks.
pub trait WaitPolicy {
    /// Wait for `duration`, returning early with `BackfillError::Interrupted`
    /// if the interrupt token is raised.
    fn wait(&self, duration: Duration, interrupt_token: &Arc<AtomicBool>)
        -> Result<(), BackfillError>;
}

/// Wall-clock wait that sleeps in short slices so an interrupt is honored promptly.
pub struct SleepWait;

impl WaitPolicy for SleepWait {
    fn wait(
        &self,
        duration: Duration,
        interrupt_token: &Arc<AtomicBool>,
    ) -> Result<(), BackfillError> {
        let deadline = Instant::now() + duration;
        loop {
            if interrupt_token.load(Ordering::Acquire) {
                return Err(BackfillError::Interrupted);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(());
            }
            std::thread::sleep((deadline - now).min(WAIT_SLICE));
        }
    }
}

/// Running total of the time spent waiting within one readiness check.
#[derive(Debug, Default)]
struct WaitTally {
    waited: Duration,
    warned: bool,
}

impl WaitTally {
    /// Add `duration` to the total. Returns true only the first time the
    /// total passes `WAIT_WARNING`.
    fn add(&mut self, duration: Duration) -> bool {
        self.waited += duration;
        if self.waited > WAIT_WARNING && !self.warned {
            self.warned = true;
            return true;
        }
        false
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ThrottleSettings {
    /// Estimated percent of the replication log consumed by no-op entries.
    /// Required whenever the store is replicated.
    pub no_op_percent: Option<f64>,
    /// Replication window that must be retained at all times.
    pub min_window: Duration,
    /// Expected average size of one replication log entry written by this migration.
    pub expected_entry_bytes: u64,
    /// Minimum percent of free space before any write.
    pub min_free_percent: f64,
}

impl Default for ThrottleSettings {
    fn default() -> Self {
        Self {
            no_op_percent: None,
            min_window: Duration::from_secs(8 * 60 * 60),
            expected_entry_bytes: 420,
            min_free_percent: 10.0,
        }
    }
}

/// Gates every write on the store's replication health and free space.
///
/// Any failure to read the store's stats or replication state is fatal: the
/// monitor never retries its own reads.
pub struct CapacityMonitor<'a> {
    store: &'a dyn Store,
    settings: ThrottleSettings,
    wait_policy: Box<dyn WaitPolicy + 'a>,
    interrupt_token: Arc<AtomicBool>,
}

impl<'a> CapacityMonitor<'a> {
    pub fn new(
        store: &'a dyn Store,
        settings: ThrottleSettings,
        wait_policy: Box<dyn WaitPolicy + 'a>,
        interrupt_token: Arc<AtomicBool>,
    ) -> Self {
        Self {
            store,
            settings,
            wait_policy,
            interrupt_token,
        }
    }

    /// Compute how many record updates may go into one bulk write.
    ///
    /// `floor(logCapacityBytes / expectedEntryBytes / minWindowSeconds / (noOpPercent / 7))`
    /// for a replicated store, or `STANDALONE_WRITE_BATCH_SIZE` otherwise.
    pub fn compute_write_batch_size(&self) -> Result<usize, BackfillError> {
        if self.store.replication_status()?.is_none() {
            info!(
                "Store is not replicated; using fixed write batch size of {}",
                STANDALONE_WRITE_BATCH_SIZE
            );
            return Ok(STANDALONE_WRITE_BATCH_SIZE);
        }

        let window = self.store.replication_log_window()?.ok_or_else(|| {
            BackfillError::StoreUnavailable("replicated store reported no replication log".into())
        })?;

        let no_op_percent = self.settings.no_op_percent.ok_or_else(|| {
            BackfillError::ConfigError(
                "no_op_percent must be configured when the store is replicated".into(),
            )
        })?;
        if no_op_percent <= 0.0 {
            return Err(BackfillError::ConfigError(format!(
                "no_op_percent must be positive, got {}",
                no_op_percent
            )));
        }

        let min_window_secs = self.settings.min_window.as_secs().max(1) as f64;
        let entry_bytes = self.settings.expected_entry_bytes.max(1) as f64;

        let batch = window.max_size_bytes as f64 / entry_bytes / min_window_secs / (no_op_percent / 7.0);
        let batch_size = (batch.floor() as usize).max(1);

        info!(
            "Replication log capacity {} bytes, no-op percent {}: write batch size {}",
            window.max_size_bytes, no_op_percent, batch_size
        );

        Ok(batch_size)
    }

    /// Fail unless the store has at least the configured percent of free space.
    /// Returns the observed percent free.
    pub fn check_free_space(&self) -> Result<f64, BackfillError> {
        let CollectionStats {
            total_bytes,
            used_bytes,
        } = self.store.collection_stats()?;

        if total_bytes == 0 {
            return Err(BackfillError::StoreUnavailable(
                "store reported zero total bytes".into(),
            ));
        }

        let percent_free = total_bytes.saturating_sub(used_bytes) as f64 / total_bytes as f64 * 100.0;
        if percent_free < self.settings.min_free_percent {
            return Err(BackfillError::InsufficientSpace {
                percent_free,
                min_percent_free: self.settings.min_free_percent,
            });
        }

        debug!("Free space check passed: {:.2}% free", percent_free);
        Ok(percent_free)
    }

    /// Block until every replica is healthy and the replication window is at
    /// least the configured minimum. Returns the total time spent waiting.
    pub fn block_until_ready(&self) -> Result<Duration, BackfillError> {
        let mut tally = WaitTally::default();

        loop {
            if self.interrupt_token.load(Ordering::Acquire) {
                return Err(BackfillError::Interrupted);
            }

            let status = match self.store.replication_status()? {
                Some(status) => status,
                None => return Ok(tally.waited),
            };

            if let Some(member) = status.members.iter().find(|m| {
                !m.healthy || !m.state.is_settled() || m.uptime_secs < MIN_MEMBER_UPTIME_SECS
            }) {
                info!(
                    "Replica '{}' not ready (healthy: {}, state: {}, uptime: {}s); waiting {}",
                    member.name,
                    member.healthy,
                    member.state,
                    member.uptime_secs,
                    Utils::format_elapsed(UNHEALTHY_WAIT)
                );
                self.pause(UNHEALTHY_WAIT, &mut tally)?;
                continue;
            }

            let window = self.store.replication_log_window()?.ok_or_else(|| {
                BackfillError::StoreUnavailable(
                    "replicated store reported no replication log".into(),
                )
            })?;

            let current_secs = window.span_secs();
            let min_secs = self.settings.min_window.as_secs();
            if current_secs >= min_secs {
                if !tally.waited.is_zero() {
                    info!(
                        "Replication window recovered to {}s after waiting {}",
                        current_secs,
                        Utils::format_elapsed(tally.waited)
                    );
                }
                return Ok(tally.waited);
            }

            let deficit_secs = (min_secs - current_secs) as f64;
            let pause = Duration::from_secs((deficit_secs * WINDOW_WAIT_FACTOR).round() as u64)
                .max(MIN_WINDOW_WAIT);
            info!(
                "Replication window {}s is below minimum {}s; waiting {}",
                current_secs,
                min_secs,
                Utils::format_elapsed(pause)
            );
            self.pause(pause, &mut tally)?;
        }
    }

    fn pause(&self, duration: Duration, tally: &mut WaitTally) -> Result<(), BackfillError> {
        if tally.add(duration) {
            warn!(
                "Waited {} for the store to become writable; the configured no-op percent may not fit this workload",
                Utils::format_elapsed(tally.waited)
            );
        }
        self.wait_policy.wait(duration, &self.interrupt_token)
    }
}

/// Wait policy that records requested waits instead of sleeping.
#[cfg(test)]
pub struct RecordingWait {
    pub waits: std::rc::Rc<std::cell::RefCell<Vec<Duration>>>,
}

#[cfg(test)]
impl RecordingWait {
    pub fn new() -> (Self, std::rc::Rc<std::cell::RefCell<Vec<Duration>>>) {
        let waits = std::rc::Rc::new(std::cell::RefCell::new(Vec::new()));
        (
            Self {
                waits: waits.clone(),
            },
            waits,
        )
    }
}

#[cfg(test)]
impl WaitPolicy for RecordingWait {
    fn wait(
        &self,
        duration: Duration,
        _interrupt_token: &Arc<AtomicBool>,
    ) -> Result<(), BackfillError> {
        self.waits.borrow_mut().push(duration);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;
    use crate::store::{LogWindow, MemberState};

    const GIB: u64 = 1024 * 1024 * 1024;

    fn settings(no_op_percent: Option<f64>) -> ThrottleSettings {
        ThrottleSettings {
            no_op_percent,
            ..ThrottleSettings::default()
        }
    }

    fn window(span_secs: i64, max_size_bytes: u64) -> LogWindow {
        LogWindow {
            oldest_timestamp: 1_700_000_000,
            newest_timestamp: 1_700_000_000 + span_secs,
            max_size_bytes,
        }
    }

    fn monitor<'a>(store: &'a MemoryStore, settings: ThrottleSettings, wait: RecordingWait) -> CapacityMonitor<'a> {
        CapacityMonitor::new(store, settings, Box::new(wait), Arc::new(AtomicBool::new(false)))
    }

    #[test]
    fn test_write_batch_size_standalone() {
        let store = MemoryStore::new();
        let (wait, _) = RecordingWait::new();
        let monitor = monitor(&store, settings(None), wait);
        assert_eq!(monitor.compute_write_batch_size().unwrap(), STANDALONE_WRITE_BATCH_SIZE);
    }

    #[test]
    fn test_write_batch_size_formula() {
        let store = MemoryStore::new();
        store.script_replication(vec![MemoryStore::healthy_set()], vec![window(3600, 50 * GIB)]);
        let (wait, _) = RecordingWait::new();

        let monitor = monitor(&store, settings(Some(0.6)), wait);
        let expected = (50.0 * GIB as f64 / 420.0 / 28_800.0 / (0.6 / 7.0)).floor() as usize;
        assert_eq!(monitor.compute_write_batch_size().unwrap(), expected);
        assert_eq!(expected, 51_781);
    }

    #[test]
    fn test_write_batch_size_idle_no_op_percent() {
        let store = MemoryStore::new();
        store.script_replication(vec![MemoryStore::healthy_set()], vec![window(3600, 50 * GIB)]);
        let (wait, _) = RecordingWait::new();

        let monitor = monitor(&store, settings(Some(100.0)), wait);
        assert_eq!(monitor.compute_write_batch_size().unwrap(), 310);
    }

    #[test]
    fn test_write_batch_size_requires_no_op_percent_when_replicated() {
        let store = MemoryStore::new();
        store.script_replication(vec![MemoryStore::healthy_set()], vec![window(3600, GIB)]);
        let (wait, _) = RecordingWait::new();

        let monitor = monitor(&store, settings(None), wait);
        assert!(matches!(
            monitor.compute_write_batch_size(),
            Err(BackfillError::ConfigError(_))
        ));
    }

    #[test]
    fn test_check_free_space() {
        let store = MemoryStore::new();
        let (wait, _) = RecordingWait::new();
        let monitor = monitor(&store, settings(None), wait);

        store.set_stats(1000, 850);
        let percent_free = monitor.check_free_space().unwrap();
        assert!((percent_free - 15.0).abs() < 1e-9);

        store.set_stats(1000, 950);
        match monitor.check_free_space() {
            Err(BackfillError::InsufficientSpace { percent_free, min_percent_free }) => {
                assert!((percent_free - 5.0).abs() < 1e-9);
                assert_eq!(min_percent_free, 10.0);
            }
            other => panic!("expected InsufficientSpace, got {:?}", other),
        }
    }

    #[test]
    fn test_check_free_space_stats_failure_is_fatal() {
        let store = MemoryStore::new();
        store.fail_stats();
        let (wait, _) = RecordingWait::new();
        let monitor = monitor(&store, settings(None), wait);
        assert!(matches!(
            monitor.check_free_space(),
            Err(BackfillError::StoreUnavailable(_))
        ));
    }

    #[test]
    fn test_block_until_ready_standalone_returns_immediately() {
        let store = MemoryStore::new();
        let (wait, waits) = RecordingWait::new();
        let monitor = monitor(&store, settings(None), wait);
        assert_eq!(monitor.block_until_ready().unwrap(), Duration::ZERO);
        assert!(waits.borrow().is_empty());
    }

    #[test]
    fn test_block_until_ready_waits_for_short_window() {
        let store = MemoryStore::new();
        let min = 8 * 3600;
        store.script_replication(
            vec![MemoryStore::healthy_set()],
            vec![window(min - 1000, GIB), window(min - 100, GIB), window(min, GIB)],
        );
        let (wait, waits) = RecordingWait::new();
        let monitor = monitor(&store, settings(Some(0.6)), wait);

        let waited = monitor.block_until_ready().unwrap();

        // 1000s deficit * 1.15 = 1150s; 100s deficit * 1.15 = 115s, raised to the 600s floor
        assert_eq!(
            *waits.borrow(),
            vec![Duration::from_secs(1150), Duration::from_secs(600)]
        );
        assert_eq!(waited, Duration::from_secs(1750));
    }

    #[test]
    fn test_block_until_ready_waits_for_unhealthy_members() {
        let store = MemoryStore::new();
        let mut electing = MemoryStore::healthy_set();
        electing.members[1].state = MemberState::Startup2;
        let mut young = MemoryStore::healthy_set();
        young.members[0].uptime_secs = 30;
        let mut down = MemoryStore::healthy_set();
        down.members[1].healthy = false;

        store.script_replication(
            vec![electing, young, down, MemoryStore::healthy_set()],
            vec![window(9 * 3600, GIB)],
        );
        let (wait, waits) = RecordingWait::new();
        let monitor = monitor(&store, settings(Some(0.6)), wait);

        let waited = monitor.block_until_ready().unwrap();
        assert_eq!(*waits.borrow(), vec![UNHEALTHY_WAIT; 3]);
        assert_eq!(waited, Duration::from_secs(720));
    }

    #[test]
    fn test_long_wait_warning_fires_once() {
        let mut tally = WaitTally::default();
        let pause = Duration::from_secs(1150);
        assert!(!tally.add(pause));
        assert!(tally.add(pause));
        assert!(!tally.add(pause));
        assert!(!tally.add(pause));
        assert_eq!(tally.waited, Duration::from_secs(4600));
    }

    #[test]
    fn test_block_until_ready_keeps_waiting_past_warning() {
        let store = MemoryStore::new();
        let min = 8 * 3600;
        store.script_replication(
            vec![MemoryStore::healthy_set()],
            vec![
                window(min - 1000, GIB),
                window(min - 1000, GIB),
                window(min - 1000, GIB),
                window(min, GIB),
            ],
        );
        let (wait, waits) = RecordingWait::new();
        let monitor = monitor(&store, settings(Some(0.6)), wait);

        let waited = monitor.block_until_ready().unwrap();

        // The total passes 1800s on the second pause; waiting continues regardless
        assert_eq!(*waits.borrow(), vec![Duration::from_secs(1150); 3]);
        assert_eq!(waited, Duration::from_secs(3450));
    }

    #[test]
    fn test_block_until_ready_honors_interrupt() {
        let store = MemoryStore::new();
        store.script_replication(vec![MemoryStore::healthy_set()], vec![window(10, GIB)]);
        let (wait, _) = RecordingWait::new();
        let token = Arc::new(AtomicBool::new(true));
        let monitor = CapacityMonitor::new(&store, settings(Some(0.6)), Box::new(wait), token);
        assert!(matches!(monitor.block_until_ready(), Err(BackfillError::Interrupted)));
    }

    #[test]
    fn test_sleep_wait_returns_on_interrupt() {
        let token = Arc::new(AtomicBool::new(true));
        let start = Instant::now();
        let result = SleepWait.wait(Duration::from_secs(60), &token);
        assert!(matches!(result, Err(BackfillError::Interrupted)));
        assert!(start.elapsed() < Duration::from_secs(5));
    }
}
