use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How long and how often to keep trying to reach a peer.
///
/// `max_attempts = None` retries forever, which is what a benchmark host wants
/// when the other side may start minutes later.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub interval_ms: u64,
    pub connect_timeout_ms: u64,
    pub max_attempts: Option<usize>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            interval_ms: 1000,
            connect_timeout_ms: 1000,
            max_attempts: None,
        }
    }
}

impl RetryPolicy {
    pub fn new(interval_ms: u64, connect_timeout_ms: u64, max_attempts: Option<usize>) -> Self {
        RetryPolicy {
            interval_ms,
            connect_timeout_ms,
            max_attempts,
        }
    }

    #[inline]
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    #[inline]
    pub fn connect_timeout(&self) -> Duration {
        // a zero timeout is rejected by connect_timeout
        Duration::from_millis(self.connect_timeout_ms.max(1))
    }

    /// Call `f` until it succeeds or the attempt ceiling is hit, sleeping
    /// `interval` between attempts. `f` receives the 1-based attempt number.
    pub fn run<T, E, F>(&self, what: &str, mut f: F) -> Result<T>
    where
        E: std::fmt::Display,
        F: FnMut(usize) -> std::result::Result<T, E>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match f(attempt) {
                Ok(v) => return Ok(v),
                Err(e) => {
                    if self.max_attempts.map_or(false, |max| attempt >= max) {
                        return Err(Error::Exhausted {
                            what: what.to_owned(),
                            attempts: attempt,
                            last: e.to_string(),
                        });
                    }
                    log::debug!("{} failed (attempt {}): {}, retrying", what, attempt, e);
                    std::thread::sleep(self.interval());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn succeeds_after_transient_failures() {
        let policy = RetryPolicy::new(0, 10, None);
        let res = policy.run("probe", |attempt| {
            if attempt < 4 {
                Err(Error::InvalidNode("not yet".to_owned()))
            } else {
                Ok(attempt)
            }
        });
        assert_eq!(res.unwrap(), 4);
    }

    #[test]
    fn default_is_unbounded_one_second() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.interval(), Duration::from_secs(1));
        assert_eq!(policy.max_attempts, None);
    }
}
