//! Deferred deallocation for the output thread
//!
//! Streams and sound clips are handed to the output thread as
//! `basedrop::Shared<T>`. When the output thread drops the last reference
//! (reaping a drained stream, finishing a sound play) the memory is not
//! freed there: the pointer is queued and a background collector frees it.
//!
//! The collector is process-wide. The first engine to start picks its
//! interval from its period length; later engines share that collector.

use basedrop::{Collector, Handle};
use std::sync::mpsc;
use std::sync::OnceLock;
use std::thread;
use std::time::Duration;

use crate::config::EngineSettings;

/// How the collector thread runs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectorConfig {
    /// Time between collection passes
    pub interval: Duration,
    pub thread_name: String,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(50),
            thread_name: "confluence-gc".to_string(),
        }
    }
}

impl CollectorConfig {
    /// Collect every two periods, between 10ms and 100ms
    pub fn for_settings(settings: &EngineSettings) -> Self {
        let ms = (settings.period_ms() as u64 * 2).clamp(10, 100);
        Self {
            interval: Duration::from_millis(ms),
            ..Self::default()
        }
    }
}

struct RunningCollector {
    handle: Handle,
    config: CollectorConfig,
}

static COLLECTOR: OnceLock<RunningCollector> = OnceLock::new();

fn spawn_collector(config: CollectorConfig) -> RunningCollector {
    let (tx, rx) = mpsc::sync_channel(1);
    let interval = config.interval;

    let spawned = thread::Builder::new()
        .name(config.thread_name.clone())
        .spawn(move || {
            // Collector is !Sync, so it is created and used only here
            let mut collector = Collector::new();
            if tx.send(collector.handle()).is_err() {
                return;
            }

            log::info!("Memory collector started, interval {:?}", interval);

            loop {
                collector.collect();
                thread::sleep(interval);
            }
        });
    if let Err(e) = &spawned {
        log::error!("Failed to spawn memory collector: {}", e);
    }

    let handle = spawned
        .ok()
        .and_then(|_| rx.recv().ok())
        .expect("audio memory collector could not be started");
    RunningCollector { handle, config }
}

/// Start the collector thread if it is not running yet
///
/// Returns the configuration actually in effect, which is the first
/// caller's.
pub fn start_collector(config: CollectorConfig) -> &'static CollectorConfig {
    let running = COLLECTOR.get_or_init(|| spawn_collector(config.clone()));
    if running.config != config {
        log::debug!(
            "Memory collector already running with {:?}, ignoring {:?}",
            running.config,
            config
        );
    }
    &running.config
}

/// Handle for creating `Shared<T>` allocations
pub fn gc_handle() -> Handle {
    COLLECTOR
        .get_or_init(|| spawn_collector(CollectorConfig::default()))
        .handle
        .clone()
}

#[cfg(test)]
mod tests {
    use super::*;
    use basedrop::Shared;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    struct Flagged(Arc<AtomicBool>);

    impl Drop for Flagged {
        fn drop(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_drop_is_deferred_to_collector() {
        let dropped = Arc::new(AtomicBool::new(false));
        let shared = Shared::new(&gc_handle(), Flagged(dropped.clone()));
        let clone = shared.clone();
        drop(shared);
        drop(clone);

        // Freed by the collector thread within a few intervals
        for _ in 0..100 {
            if dropped.load(Ordering::SeqCst) {
                return;
            }
            thread::sleep(Duration::from_millis(50));
        }
        panic!("collector never released the allocation");
    }

    #[test]
    fn test_interval_follows_period() {
        let settings = EngineSettings {
            period_ms: 20,
            ..EngineSettings::default()
        };
        assert_eq!(
            CollectorConfig::for_settings(&settings).interval,
            Duration::from_millis(40)
        );

        let long = EngineSettings {
            period_ms: 200,
            ..EngineSettings::default()
        };
        assert_eq!(
            CollectorConfig::for_settings(&long).interval,
            Duration::from_millis(100)
        );

        let short = EngineSettings {
            period_ms: 5,
            ..EngineSettings::default()
        };
        assert_eq!(
            CollectorConfig::for_settings(&short).interval,
            Duration::from_millis(10)
        );
        assert_eq!(CollectorConfig::for_settings(&short).thread_name, "confluence-gc");
    }

    #[test]
    fn test_first_start_wins() {
        let first = start_collector(CollectorConfig::default()).clone();
        let other = CollectorConfig {
            interval: Duration::from_millis(17),
            thread_name: "other".to_string(),
        };
        assert_eq!(start_collector(other), &first);
        // Handle stays usable after repeated starts
        let _ = Shared::new(&gc_handle(), 1u32);
    }
}
