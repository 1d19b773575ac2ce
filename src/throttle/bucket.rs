//! Process-local token bucket
//!
//! Counted semaphore. Kernel launches take one token each and block while the
//! bucket is empty; the refill thread adds tokens every cycle.

use crate::error::ThrottleError;

use std::sync::{Condvar, Mutex};

/// Counted token semaphore
#[derive(Debug)]
pub struct TokenBucket {
    tokens: Mutex<u64>,
    available: Condvar,
}

impl TokenBucket {
    /// Create a bucket holding `initial` tokens
    pub fn new(initial: u64) -> Self {
        Self {
            tokens: Mutex::new(initial),
            available: Condvar::new(),
        }
    }

    /// Take one token, blocking until one is available
    pub fn acquire(&self) -> Result<(), ThrottleError> {
        let mut tokens = self.tokens.lock().map_err(|_| ThrottleError::Poisoned)?;
        while *tokens == 0 {
            tokens = self
                .available
                .wait(tokens)
                .map_err(|_| ThrottleError::Poisoned)?;
        }
        *tokens -= 1;
        Ok(())
    }

    /// Take one token if one is available
    pub fn try_acquire(&self) -> Result<bool, ThrottleError> {
        let mut tokens = self.tokens.lock().map_err(|_| ThrottleError::Poisoned)?;
        if *tokens == 0 {
            return Ok(false);
        }
        *tokens -= 1;
        Ok(true)
    }

    /// Post tokens, waking waiters; returns the new count
    pub fn add(&self, count: u64) -> Result<u64, ThrottleError> {
        let mut tokens = self.tokens.lock().map_err(|_| ThrottleError::Poisoned)?;
        *tokens = tokens.saturating_add(count);
        let now = *tokens;
        drop(tokens);

        if now == 1 {
            self.available.notify_one();
        } else if now > 1 {
            self.available.notify_all();
        }
        Ok(now)
    }

    /// Tokens currently available
    pub fn available(&self) -> Result<u64, ThrottleError> {
        self.tokens
            .lock()
            .map(|t| *t)
            .map_err(|_| ThrottleError::Poisoned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_acquire_drains() {
        let bucket = TokenBucket::new(2);
        assert!(bucket.try_acquire().unwrap());
        bucket.acquire().unwrap();
        assert!(!bucket.try_acquire().unwrap());
    }

    #[test]
    fn test_unused_tokens_accumulate() {
        let bucket = TokenBucket::new(5);
        assert_eq!(bucket.add(3).unwrap(), 8);
        assert_eq!(bucket.add(10).unwrap(), 18);

        for _ in 0..18 {
            assert!(bucket.try_acquire().unwrap());
        }
        assert!(!bucket.try_acquire().unwrap());
    }

    #[test]
    fn test_blocked_acquire_wakes_on_add() {
        let bucket = Arc::new(TokenBucket::new(0));
        let waiter = {
            let bucket = Arc::clone(&bucket);
            std::thread::spawn(move || bucket.acquire())
        };

        std::thread::sleep(Duration::from_millis(20));
        assert!(!waiter.is_finished());

        bucket.add(1).unwrap();
        waiter.join().unwrap().unwrap();
        assert_eq!(bucket.available().unwrap(), 0);
    }

    #[test]
    fn test_poisoned_bucket_reports_error() {
        let bucket = Arc::new(TokenBucket::new(1));
        let poisoner = Arc::clone(&bucket);
        let _ = std::thread::spawn(move || {
            let _guard = poisoner.tokens.lock().unwrap();
            panic!("poison the token lock");
        })
        .join();

        assert_eq!(bucket.acquire(), Err(ThrottleError::Poisoned));
    }
}
