//! Retry decisions from broker dead-letter history.
//!
//! Retries are not scheduled by the application. A rejected delivery goes to
//! the dead-letter exchange, waits out the retry queue's TTL and is routed
//! back to the primary exchange with its original routing key. The only state
//! is the `x-death` history the broker attaches along the way.

use crate::broker::DeathRecord;

/// Retries already performed: the summed `count` of history entries recorded
/// against the dead-letter exchange. No history means no prior retries.
pub fn prior_attempts(deaths: &[DeathRecord], dead_letter_exchange: &str) -> u64 {
    deaths
        .iter()
        .filter(|death| death.exchange == dead_letter_exchange)
        .map(|death| death.count)
        .sum()
}

/// What to do with a delivery whose handler failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Reject without requeue so the dead-letter cycle redelivers it
    Retry,
    /// Mark the job failed
    GiveUp,
}

impl RetryDecision {
    /// Decide for a delivery with `prior` retries behind it.
    ///
    /// ```
    /// use amqp_queue::RetryDecision;
    ///
    /// assert_eq!(RetryDecision::decide(0, 2, false), RetryDecision::Retry);
    /// assert_eq!(RetryDecision::decide(2, 2, false), RetryDecision::GiveUp);
    /// assert_eq!(RetryDecision::decide(0, 2, true), RetryDecision::GiveUp);
    /// ```
    pub fn decide(prior: u64, limit: u32, no_ack: bool) -> Self {
        if !no_ack && prior < u64::from(limit) {
            RetryDecision::Retry
        } else {
            RetryDecision::GiveUp
        }
    }
}

/// Retry limit for a job: a job-level limit can lower the registered one.
pub(crate) fn effective_limit(registered: u32, requested: Option<u32>) -> u32 {
    requested.map_or(registered, |requested| requested.min(registered))
}
