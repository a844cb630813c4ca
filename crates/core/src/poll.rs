use std::thread;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::LifecycleError;

/// Inter-poll delay and an optional ceiling on how many times a state is
/// checked before the wait is abandoned. `max_attempts: None` waits forever.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct PollPolicy {
    #[serde(with = "millis")]
    pub interval: Duration,
    pub max_attempts: Option<u32>,
}

impl PollPolicy {
    pub const fn new(interval: Duration, max_attempts: Option<u32>) -> Self {
        Self {
            interval,
            max_attempts,
        }
    }

    /// Zero delay, used by tests and dry harnesses.
    pub const fn immediate(max_attempts: u32) -> Self {
        Self::new(Duration::ZERO, Some(max_attempts))
    }
}

pub enum Poll<T> {
    Ready(T),
    Pending,
}

/// Checks until `check` reports `Ready` or fails, sleeping `interval`
/// between checks. Errors from `check` end the wait immediately.
pub fn poll_until<T, F>(
    phase: &'static str,
    policy: &PollPolicy,
    mut check: F,
) -> Result<T, LifecycleError>
where
    F: FnMut(u32) -> Result<Poll<T>, LifecycleError>,
{
    let mut attempt = 0_u32;
    loop {
        attempt = attempt.saturating_add(1);
        if let Poll::Ready(value) = check(attempt)? {
            return Ok(value);
        }
        if policy.max_attempts.is_some_and(|max| attempt >= max) {
            return Err(LifecycleError::Timeout {
                phase,
                attempts: attempt,
            });
        }
        debug!(phase, attempt, "state not settled yet, polling again");
        if !policy.interval.is_zero() {
            thread::sleep(policy.interval);
        }
    }
}

pub(crate) mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis().try_into().unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
