//! Repeating background timers.

use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Owns the repeating background tasks of a process.
///
/// Every timer is aborted by [RepeatingTimers::shutdown], or when the owner is dropped.
#[derive(Debug, Default)]
pub struct RepeatingTimers {
    handles: Vec<(&'static str, JoinHandle<()>)>,
}

impl RepeatingTimers {
    /// Returns an empty set of timers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `tick` now and then once every `period` until shutdown.
    ///
    /// A tick that overruns the period delays the next one rather than bunching them up.
    pub fn spawn<F, Fut>(&mut self, name: &'static str, period: Duration, mut tick: F)
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                tick().await;
            }
        });
        tracing::debug!(timer = name, ?period, "started repeating timer");
        self.handles.push((name, handle));
    }

    /// Number of running timers.
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Cancel every timer.
    pub fn shutdown(&mut self) {
        for (name, handle) in self.handles.drain(..) {
            handle.abort();
            tracing::debug!(timer = name, "stopped repeating timer");
        }
    }
}

impl Drop for RepeatingTimers {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn ticks_until_shutdown() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let mut timers = RepeatingTimers::new();
        let counter = ticks.clone();
        timers.spawn("test", Duration::from_secs(5), move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });
        assert_eq!(timers.len(), 1);

        // First tick fires immediately, then at 5s and 10s.
        tokio::time::sleep(Duration::from_millis(10_500)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 3);

        timers.shutdown();
        assert!(timers.is_empty());
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn drop_aborts_timers() {
        let ticks = Arc::new(AtomicUsize::new(0));
        {
            let mut timers = RepeatingTimers::new();
            let counter = ticks.clone();
            timers.spawn("test", Duration::from_secs(1), move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                }
            });
            tokio::time::sleep(Duration::from_millis(1_500)).await;
        }
        let seen = ticks.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), seen);
    }
}
