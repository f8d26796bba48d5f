use log::warn;
use std::fmt::Display;
use std::time::Duration;

/// Blocking wait between attempts.
pub trait Sleeper {
    fn sleep(&self, duration: Duration);
}

pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// Fixed-delay retry schedule: one attempt, then one more after each delay.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub delays: Vec<Duration>,
}

/// Every attempt failed; `last` is the final error.
#[derive(Debug)]
pub struct Exhausted<E> {
    pub attempts: usize,
    pub last: E,
}

impl RetryPolicy {
    pub fn new(delays: Vec<Duration>) -> Self {
        Self { delays }
    }

    /// 30 s then 60 s, for a store held open by another process.
    pub fn store_contention() -> Self {
        Self::new(vec![Duration::from_secs(30), Duration::from_secs(60)])
    }

    pub fn no_retry() -> Self {
        Self::new(Vec::new())
    }

    pub fn max_attempts(&self) -> usize {
        self.delays.len() + 1
    }

    /// Run `op` until it succeeds or the schedule runs out. `op` receives
    /// the 1-based attempt number.
    pub fn run<T, E, F>(&self, sleeper: &dyn Sleeper, mut op: F) -> Result<T, Exhausted<E>>
    where
        E: Display,
        F: FnMut(usize) -> Result<T, E>,
    {
        let mut attempt = 1;
        loop {
            match op(attempt) {
                Ok(value) => return Ok(value),
                Err(e) => match self.delays.get(attempt - 1) {
                    Some(delay) => {
                        warn!(
                            "Attempt {} failed ({}); waiting {}s before attempt {}",
                            attempt,
                            e,
                            delay.as_secs(),
                            attempt + 1
                        );
                        sleeper.sleep(*delay);
                        attempt += 1;
                    }
                    None => return Err(Exhausted { attempts: attempt, last: e }),
                },
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::store_contention()
    }
}
