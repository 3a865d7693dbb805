// Cancelable timers that post events back to the engine's event loop.
//
// Timers never touch engine state themselves: when they fire they send an
// event into the supervisor's channel, so all mutation stays on one task.

use std::time::Duration;

use rand::rngs::StdRng;
use rand::Rng;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;

/// How a repeating task picks the delay before its next firing.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DelayPolicy {
    Fixed(Duration),
    /// Uniform in `[min, max]`.
    Uniform { min: Duration, max: Duration },
    /// `base` plus uniform in `[0, jitter]`.
    Jittered { base: Duration, jitter: Duration },
}

impl DelayPolicy {
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Duration {
        match *self {
            DelayPolicy::Fixed(d) => d,
            DelayPolicy::Uniform { min, max } => {
                if max <= min {
                    min
                } else {
                    rng.gen_range(min..=max)
                }
            }
            DelayPolicy::Jittered { base, jitter } => {
                if jitter.is_zero() {
                    base
                } else {
                    base + rng.gen_range(Duration::ZERO..=jitter)
                }
            }
        }
    }

    /// Turn the policy into a sampler closure owning its own RNG.
    pub fn sampler(self, mut rng: StdRng) -> impl FnMut() -> Duration + Send + 'static {
        move || self.sample(&mut rng)
    }
}

/// A task that sleeps for a sampled delay, posts an event, and repeats.
///
/// The delay is re-sampled before every sleep, so successive intervals follow
/// the sampler rather than a fixed period. Dropping the task cancels it.
#[derive(Debug, Default)]
pub struct RepeatingTask {
    handle: Option<JoinHandle<()>>,
}

impl RepeatingTask {
    pub fn spawn<T, S, F>(mut next_delay: S, tx: UnboundedSender<T>, mut event: F) -> Self
    where
        T: Send + 'static,
        S: FnMut() -> Duration + Send + 'static,
        F: FnMut() -> T + Send + 'static,
    {
        let handle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(next_delay()).await;
                if tx.send(event()).is_err() {
                    // Event loop is gone
                    break;
                }
            }
        });
        Self {
            handle: Some(handle),
        }
    }

    /// Stop the task. Safe to call on an idle or already-cancelled task.
    pub fn cancel(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }

    pub fn is_armed(&self) -> bool {
        self.handle.is_some()
    }
}

impl Drop for RepeatingTask {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// A one-shot timer that posts a single event after a delay.
#[derive(Debug, Default)]
pub struct DelayedTask {
    handle: Option<JoinHandle<()>>,
}

impl DelayedTask {
    pub fn spawn<T>(delay: Duration, tx: UnboundedSender<T>, event: T) -> Self
    where
        T: Send + 'static,
    {
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(event);
        });
        Self {
            handle: Some(handle),
        }
    }

    pub fn cancel(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }

    pub fn is_armed(&self) -> bool {
        self.handle.is_some()
    }
}

impl Drop for DelayedTask {
    fn drop(&mut self) {
        self.cancel();
    }
}
