//! Retry wrapper for fallible chain operations
//!
//! Every external call of the settlement loops goes through [`perform_with_retry`]. Whether a
//! failure is worth another attempt is decided by the error itself, through
//! [`ErrorPolicyProvider`].

use std::{fmt, future::Future, time::Duration};

use strum_macros::Display;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{event, Level};

/// What to do with a failed operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorPolicy {
    /// Wait and invoke the operation again, as long as the `RetryPolicy` allows it
    Retry,
    /// Give up immediately and hand the error to the caller
    Exit,
}

/// Error types implement this to classify their variants as transient or fatal.
pub trait ErrorPolicyProvider {
    fn get_error_policy(&self) -> ErrorPolicy;
}

/// How many times and how often a failed operation is attempted.
///
/// The delay before retry `n` (zero based) is `backoff_unit * backoff_factor^n`, capped at
/// `max_backoff`. A factor of 1 gives a fixed wait.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total number of invocations, including the first one
    pub max_attempts: u32,
    pub backoff_unit: Duration,
    pub backoff_factor: u32,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            backoff_unit: Duration::from_millis(500),
            backoff_factor: 2,
            max_backoff: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Fixed wait between attempts
    pub fn fixed(max_attempts: u32, wait: Duration) -> Self {
        Self {
            max_attempts,
            backoff_unit: wait,
            backoff_factor: 1,
            max_backoff: wait,
        }
    }

    /// Policy used for UTxO chain queries (protocol parameters, tip, UTxOs)
    pub fn chain_polling() -> Self {
        Self::fixed(60, Duration::from_secs(5))
    }
}

pub fn compute_backoff_delay(policy: &RetryPolicy, retry: u32) -> Duration {
    let units = policy.backoff_factor.saturating_pow(retry);
    let backoff = policy.backoff_unit.saturating_mul(units);
    core::cmp::min(backoff, policy.max_backoff)
}

#[derive(Error, Debug)]
pub enum RetryError<E> {
    #[error("Operation cancelled")]
    Cancelled,

    #[error("Gave up after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: E },

    #[error(transparent)]
    Failed(E),
}

impl<E> RetryError<E> {
    /// The error of the last attempt, if any attempt failed
    pub fn into_inner(self) -> Option<E> {
        match self {
            RetryError::Cancelled => None,
            RetryError::Exhausted { last, .. } | RetryError::Failed(last) => Some(last),
        }
    }
}

/// Attempt counter for loops that cannot be expressed as a single closure, e.g. because every
/// attempt needs mutable access to its caller.
#[derive(Debug)]
pub struct RetryBudget<'a> {
    policy: &'a RetryPolicy,
    attempts: u32,
}

impl<'a> RetryBudget<'a> {
    pub fn new(policy: &'a RetryPolicy) -> Self {
        Self {
            policy,
            attempts: 0,
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Account for a failed attempt. Returns `Ok(())` after the backoff delay if the operation
    /// should be attempted again, otherwise the final error.
    pub async fn on_failure<E>(
        &mut self,
        cancel: &CancellationToken,
        err: E,
    ) -> Result<(), RetryError<E>>
    where
        E: ErrorPolicyProvider + fmt::Display,
    {
        self.attempts += 1;

        match err.get_error_policy() {
            ErrorPolicy::Exit => {
                event!(Level::DEBUG, label=%Event::FailureExit, attempt=self.attempts, %err);
                Err(RetryError::Failed(err))
            }
            ErrorPolicy::Retry if self.attempts < self.policy.max_attempts => {
                event!(Level::WARN, label=%Event::FailureRetry, attempt=self.attempts, %err);

                let backoff = compute_backoff_delay(self.policy, self.attempts - 1);
                event!(Level::DEBUG, label=%Event::RetryBackoff, backoff_ms=backoff.as_millis());

                tokio::select! {
                    _ = cancel.cancelled() => Err(RetryError::Cancelled),
                    _ = tokio::time::sleep(backoff) => Ok(()),
                }
            }
            ErrorPolicy::Retry => {
                event!(Level::WARN, label=%Event::RetriesExhausted, attempt=self.attempts, %err);
                Err(RetryError::Exhausted {
                    attempts: self.attempts,
                    last: err,
                })
            }
        }
    }
}

/// Wrap an operation with retry logic.
/// Only errors with `ErrorPolicy::Retry` cause another invocation. Cancellation aborts both the
/// backoff wait and any further attempt.
pub async fn perform_with_retry<T, E, F, Fut>(
    cancel: &CancellationToken,
    policy: &RetryPolicy,
    mut operation: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: ErrorPolicyProvider + fmt::Display,
{
    let mut budget = RetryBudget::new(policy);

    loop {
        if cancel.is_cancelled() {
            return Err(RetryError::Cancelled);
        }

        match operation().await {
            Ok(value) => {
                event!(Level::TRACE, label=%Event::Success, attempt=budget.attempts() + 1);
                return Ok(value);
            }
            Err(err) => budget.on_failure(cancel, err).await?,
        }
    }
}

#[derive(Display)]
enum Event {
    Success,
    FailureExit,
    FailureRetry,
    RetriesExhausted,
    RetryBackoff,
}
