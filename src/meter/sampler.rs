//! Repeating timer driving the level reads
//!
//! A sampler is created suspended. `resume` arms it, `suspend` pauses it
//! without losing its schedule. Dropping the sampler cancels its task.

use std::future::Future;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Duration, Instant, MissedTickBehavior};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SamplerTiming {
    /// Delay before the first tick
    pub warmup: Duration,
    /// Period between ticks
    pub interval: Duration,
}

impl Default for SamplerTiming {
    fn default() -> Self {
        Self {
            warmup: Duration::from_millis(300),
            interval: Duration::from_secs(10),
        }
    }
}

pub struct Sampler {
    armed: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl Sampler {
    /// Spawns the timer task on the current runtime. `on_tick` runs on every
    /// tick while armed; ticks are delivered one at a time, in order.
    pub fn spawn<F, Fut>(timing: SamplerTiming, mut on_tick: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (armed, mut armed_rx) = watch::channel(false);

        let task = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + timing.warmup, timing.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                if !*armed_rx.borrow_and_update() {
                    if armed_rx.changed().await.is_err() {
                        break;
                    }
                    continue;
                }

                tokio::select! {
                    _ = ticker.tick() => {
                        if *armed_rx.borrow() {
                            on_tick().await;
                        }
                    }
                    changed = armed_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
        });

        Self { armed, task }
    }

    pub fn resume(&self) {
        self.armed.send_replace(true);
    }

    pub fn suspend(&self) {
        self.armed.send_replace(false);
    }
}

impl Drop for Sampler {
    fn drop(&mut self) {
        self.task.abort();
    }
}
