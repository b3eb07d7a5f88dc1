//! Backoff strategies used while waiting on a bucket lock or an in-flight resize.

use crossbeam_utils::Backoff as Snooze;

/// A strategy for waiting before retrying a contended operation.
///
/// A fresh backoff is created with [`Default`] at the start of every operation, and
/// [`backoff`](Backoff::backoff) is called once per failed attempt. Implementations must not
/// block indefinitely; the map relies on every waiter eventually retrying.
pub trait Backoff: Default {
    /// Wait before the next attempt.
    fn backoff(&mut self);
}

/// Retries immediately.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoBackoff;

impl Backoff for NoBackoff {
    #[inline(always)]
    fn backoff(&mut self) {}
}

/// Spins for an exponentially increasing number of iterations, then yields to the scheduler.
#[derive(Debug, Default)]
pub struct ExponentialBackoff {
    snooze: Snooze,
}

impl ExponentialBackoff {
    /// Returns `true` once the backoff schedule is exhausted, after which every attempt
    /// only yields to the scheduler.
    pub fn is_completed(&self) -> bool {
        self.snooze.is_completed()
    }
}

impl Backoff for ExponentialBackoff {
    #[inline]
    fn backoff(&mut self) {
        self.snooze.snooze();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exponential_completes() {
        let mut backoff = ExponentialBackoff::default();
        assert!(!backoff.is_completed());

        let mut attempts = 0;
        while !backoff.is_completed() {
            backoff.backoff();
            attempts += 1;
            assert!(attempts < 64);
        }

        // Stays completed once the schedule is exhausted.
        backoff.backoff();
        assert!(backoff.is_completed());
    }
}
