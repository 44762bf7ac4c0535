//! Retry policy for task bodies
//!
//! A task node declares how many times its body may run and how the pauses
//! between attempts grow. The policy never decides *whether* a failure is
//! worth retrying — that classification belongs to the task runtime, which
//! tags each failure recoverable or not (a missing script handler is
//! permanent, a command exiting non-zero may clear up). The policy turns
//! that classification plus the attempt number into a [`RetryDecision`].
//!
//! Delivery attempts count against the same budget: a task job redelivered
//! after a worker crash resumes at the broker's attempt counter, so a
//! crash-looping body cannot retry forever.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// What the task runtime does after a failed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Run the body again after the pause
    Retry { delay: Duration },

    /// Surface the failure as `task-failed`
    GiveUp,
}

/// Per-task retry policy, declared in the workflow file
///
/// ```yaml
/// tasks:
///   - name: fetch
///     body: { kind: command, program: fetch.sh }
///     retry: { max_attempts: 5, base_delay_ms: 500, max_delay_ms: 10000 }
/// ```
///
/// Unset fields take the defaults: 3 attempts, 1s base delay doubling per
/// retry, 60s cap, 10% jitter.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Attempt budget, counting the first run
    pub max_attempts: u32,

    /// Pause before the first retry, in milliseconds
    pub base_delay_ms: u64,

    /// Upper bound on any single pause, in milliseconds
    pub max_delay_ms: u64,

    /// Multiplier applied to the pause per additional retry
    pub factor: f64,

    /// Fractional randomization of each pause (0.0-1.0)
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1_000,
            max_delay_ms: 60_000,
            factor: 2.0,
            jitter: 0.1,
        }
    }
}

impl RetryPolicy {
    /// Policy with the given attempt budget and default backoff
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            ..Default::default()
        }
    }

    /// Single attempt, no retries
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            base_delay_ms: 0,
            max_delay_ms: 0,
            factor: 1.0,
            jitter: 0.0,
        }
    }

    /// Set the pause before the first retry
    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay_ms = delay.as_millis() as u64;
        self
    }

    /// Set the cap on any single pause
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay_ms = delay.as_millis() as u64;
        self
    }

    /// Set the per-retry multiplier (floored at 1.0)
    pub fn with_factor(mut self, factor: f64) -> Self {
        self.factor = factor.max(1.0);
        self
    }

    /// Set the jitter fraction (clamped to 0.0-1.0)
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Decide what happens after attempt number `attempt` (1-based) failed
    ///
    /// `recoverable` is the task runtime's classification of the failure;
    /// an unrecoverable failure gives up immediately regardless of the
    /// remaining budget.
    pub fn decide(&self, attempt: u32, recoverable: bool) -> RetryDecision {
        if !recoverable || attempt >= self.max_attempts {
            return RetryDecision::GiveUp;
        }
        RetryDecision::Retry {
            delay: self.backoff(attempt),
        }
    }

    /// Pause after `failed_attempts` attempts have failed
    fn backoff(&self, failed_attempts: u32) -> Duration {
        let grown = self.base_delay_ms as f64
            * self.factor.powi(failed_attempts.saturating_sub(1) as i32);
        let capped = grown.min(self.max_delay_ms as f64);

        let jittered = if self.jitter > 0.0 && capped > 0.0 {
            let band = capped * self.jitter;
            capped + rand::thread_rng().gen_range(-band..band)
        } else {
            capped
        };

        Duration::from_millis(jittered.max(0.0).round() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unrecoverable_failure_never_retries() {
        // Budget left, but the runtime tagged the failure permanent
        let policy = RetryPolicy::new(5);
        assert_eq!(policy.decide(1, false), RetryDecision::GiveUp);
    }

    #[test]
    fn test_budget_counts_the_first_run() {
        let policy = RetryPolicy::new(3).with_jitter(0.0);

        assert!(matches!(
            policy.decide(1, true),
            RetryDecision::Retry { .. }
        ));
        assert!(matches!(
            policy.decide(2, true),
            RetryDecision::Retry { .. }
        ));
        // Third failed attempt exhausts a 3-attempt budget
        assert_eq!(policy.decide(3, true), RetryDecision::GiveUp);
    }

    #[test]
    fn test_pause_grows_then_caps() {
        let policy = RetryPolicy::new(10)
            .with_base_delay(Duration::from_millis(100))
            .with_max_delay(Duration::from_millis(350))
            .with_jitter(0.0);

        let delays: Vec<Duration> = (1..=4)
            .map(|attempt| match policy.decide(attempt, true) {
                RetryDecision::Retry { delay } => delay,
                RetryDecision::GiveUp => panic!("budget not exhausted at attempt {attempt}"),
            })
            .collect();

        assert_eq!(delays[0], Duration::from_millis(100));
        assert_eq!(delays[1], Duration::from_millis(200));
        // 400ms and 800ms both clip to the cap
        assert_eq!(delays[2], Duration::from_millis(350));
        assert_eq!(delays[3], Duration::from_millis(350));
    }

    #[test]
    fn test_jitter_stays_inside_the_band() {
        let policy = RetryPolicy::new(2)
            .with_base_delay(Duration::from_millis(1_000))
            .with_jitter(0.5);

        for _ in 0..50 {
            let RetryDecision::Retry { delay } = policy.decide(1, true) else {
                panic!("expected a retry");
            };
            assert!(delay >= Duration::from_millis(500), "delay {delay:?}");
            assert!(delay <= Duration::from_millis(1_500), "delay {delay:?}");
        }
    }

    #[test]
    fn test_none_is_a_single_attempt() {
        let policy = RetryPolicy::none();
        assert_eq!(policy.max_attempts, 1);
        assert_eq!(policy.decide(1, true), RetryDecision::GiveUp);
    }

    #[test]
    fn test_redelivered_job_resumes_against_the_budget() {
        // A worker crash redelivers the job with the broker's attempt
        // counter; attempt numbers past the budget never retry
        let policy = RetryPolicy::new(2);
        assert_eq!(policy.decide(7, true), RetryDecision::GiveUp);
    }

    #[test]
    fn test_partial_yaml_fills_defaults() {
        // The shape task nodes carry in workflow files
        let policy: RetryPolicy =
            serde_yaml::from_str("{ max_attempts: 5, base_delay_ms: 250 }").unwrap();

        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.base_delay_ms, 250);
        assert_eq!(policy.max_delay_ms, RetryPolicy::default().max_delay_ms);
        assert_eq!(policy.factor, 2.0);
    }
}
