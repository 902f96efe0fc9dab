// Error classification and retry policy
//
// A reusable policy object shared by the scheduler, the recovery pass, and
// file/network operations. Failures are bucketed by keyword match on their
// message; each bucket carries its own backoff tuple. A streak of five
// failures of one class from one source opens a 30-minute cooldown during
// which should_retry answers false regardless of the attempt number.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use rand::Rng;

use crate::constants::{ERROR_COOLDOWN_SECONDS, ERROR_STREAK_COOLDOWN_THRESHOLD};
use crate::error::{PackCamError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    Network,
    Auth,
    Database,
    FileOp,
    Quota,
    Recoverable,
}

#[derive(Debug, Clone, Copy)]
pub struct RetryParams {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    pub jitter: bool,
}

impl ErrorClass {
    /// Bucket a failure by its message. First matching class wins.
    pub fn classify(message: &str) -> ErrorClass {
        let msg = message.to_lowercase();

        const QUOTA: &[&str] = &["quota", "rate limit", "too many requests", "429"];
        const AUTH: &[&str] = &["oauth", "unauthorized", "token", "credential", "401", "auth"];
        const DATABASE: &[&str] = &["database", "sqlite", "locked", "constraint"];
        const NETWORK: &[&str] = &["network", "connection", "unreachable", "dns", "timed out", "timeout"];
        const FILE_OP: &[&str] = &["no such file", "permission denied", "directory", "disk", "file"];

        for (keywords, class) in [
            (QUOTA, ErrorClass::Quota),
            (AUTH, ErrorClass::Auth),
            (DATABASE, ErrorClass::Database),
            (NETWORK, ErrorClass::Network),
            (FILE_OP, ErrorClass::FileOp),
        ] {
            if keywords.iter().any(|k| msg.contains(k)) {
                return class;
            }
        }
        ErrorClass::Recoverable
    }

    pub fn params(self) -> RetryParams {
        match self {
            ErrorClass::Network => RetryParams {
                max_retries: 3,
                base_delay: Duration::from_secs(2),
                max_delay: Duration::from_secs(60),
                multiplier: 2.0,
                jitter: true,
            },
            ErrorClass::Auth => RetryParams {
                max_retries: 2,
                base_delay: Duration::from_secs(10),
                max_delay: Duration::from_secs(120),
                multiplier: 2.0,
                jitter: true,
            },
            ErrorClass::Database => RetryParams {
                max_retries: 5,
                base_delay: Duration::from_secs(1),
                max_delay: Duration::from_secs(30),
                multiplier: 2.0,
                jitter: true,
            },
            ErrorClass::FileOp => RetryParams {
                max_retries: 3,
                base_delay: Duration::from_secs(1),
                max_delay: Duration::from_secs(30),
                multiplier: 2.0,
                jitter: true,
            },
            ErrorClass::Quota => RetryParams {
                max_retries: 2,
                base_delay: Duration::from_secs(60),
                max_delay: Duration::from_secs(600),
                multiplier: 2.0,
                jitter: true,
            },
            ErrorClass::Recoverable => RetryParams {
                max_retries: 3,
                base_delay: Duration::from_secs(5),
                max_delay: Duration::from_secs(60),
                multiplier: 2.0,
                jitter: true,
            },
        }
    }
}

#[derive(Debug, Default)]
struct Streak {
    consecutive_failures: u32,
    cooldown_until: Option<Instant>,
}

pub struct RetryPolicy {
    streaks: Mutex<HashMap<(ErrorClass, String), Streak>>,
}

impl RetryPolicy {
    pub fn new() -> Self {
        Self { streaks: Mutex::new(HashMap::new()) }
    }

    /// False once the attempt budget for the class is spent, or while the
    /// (class, source) pair sits in an active cooldown.
    pub fn should_retry(&self, class: ErrorClass, source: &str, attempt: u32) -> bool {
        if attempt >= class.params().max_retries {
            return false;
        }

        let streaks = self.streaks.lock().unwrap();
        if let Some(streak) = streaks.get(&(class, source.to_string())) {
            if let Some(until) = streak.cooldown_until {
                if Instant::now() < until {
                    return false;
                }
            }
        }
        true
    }

    /// min(base * multiplier^attempt, max), scaled by a uniform [0.5, 1.0]
    /// factor when the class uses jitter.
    pub fn next_delay(&self, class: ErrorClass, attempt: u32) -> Duration {
        let params = class.params();
        let raw = params.base_delay.as_secs_f64() * params.multiplier.powi(attempt as i32);
        let capped = raw.min(params.max_delay.as_secs_f64());

        let scaled = if params.jitter {
            capped * rand::thread_rng().gen_range(0.5..=1.0)
        } else {
            capped
        };
        Duration::from_secs_f64(scaled)
    }

    /// Bump the failure streak; the fifth consecutive failure opens a
    /// 30-minute cooldown.
    pub fn record_failure(&self, class: ErrorClass, source: &str) {
        let mut streaks = self.streaks.lock().unwrap();
        let streak = streaks.entry((class, source.to_string())).or_default();
        streak.consecutive_failures += 1;

        if streak.consecutive_failures >= ERROR_STREAK_COOLDOWN_THRESHOLD
            && streak.cooldown_until.is_none()
        {
            streak.cooldown_until =
                Some(Instant::now() + Duration::from_secs(ERROR_COOLDOWN_SECONDS));
            log::warn!(
                "{:?} failures from {} reached {}; cooling down for {}min",
                class,
                source,
                streak.consecutive_failures,
                ERROR_COOLDOWN_SECONDS / 60
            );
        }
    }

    /// The first success wipes the source's streaks (and any cooldown).
    pub fn record_success(&self, source: &str) {
        let mut streaks = self.streaks.lock().unwrap();
        streaks.retain(|(_, s), _| s != source);
    }

    /// Run `op` under this policy: classify each failure, back off between
    /// attempts, re-raise the last error once retries are exhausted.
    pub fn with_retry<T, F>(&self, source: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Result<T>,
    {
        let mut attempt: u32 = 0;
        loop {
            match op() {
                Ok(value) => {
                    self.record_success(source);
                    return Ok(value);
                }
                Err(e) => {
                    let class = ErrorClass::classify(&e.to_string());
                    self.record_failure(class, source);

                    if !self.should_retry(class, source, attempt) {
                        return Err(e);
                    }

                    let delay = self.next_delay(class, attempt);
                    log::debug!(
                        "{}: attempt {} failed as {:?} ({}); retrying in {:.1}s",
                        source,
                        attempt,
                        class,
                        e,
                        delay.as_secs_f64()
                    );
                    std::thread::sleep(delay);
                    attempt += 1;
                }
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_keywords() {
        assert_eq!(ErrorClass::classify("database is locked"), ErrorClass::Database);
        assert_eq!(ErrorClass::classify("Connection refused"), ErrorClass::Network);
        assert_eq!(ErrorClass::classify("OAuth token expired"), ErrorClass::Auth);
        assert_eq!(ErrorClass::classify("quota exceeded for project"), ErrorClass::Quota);
        assert_eq!(ErrorClass::classify("No such file or directory"), ErrorClass::FileOp);
        assert_eq!(ErrorClass::classify("something odd happened"), ErrorClass::Recoverable);
    }

    #[test]
    fn test_attempt_budget_per_class() {
        let policy = RetryPolicy::new();
        assert!(policy.should_retry(ErrorClass::Database, "db", 4));
        assert!(!policy.should_retry(ErrorClass::Database, "db", 5));
        assert!(policy.should_retry(ErrorClass::Auth, "api", 1));
        assert!(!policy.should_retry(ErrorClass::Auth, "api", 2));
    }

    #[test]
    fn test_delay_is_capped_exponential() {
        let policy = RetryPolicy::new();
        // Database: base 1s, x2, cap 30s. Jitter scales into [0.5, 1.0].
        for (attempt, expected) in [(0u32, 1.0f64), (2, 4.0), (10, 30.0)] {
            let delay = policy.next_delay(ErrorClass::Database, attempt).as_secs_f64();
            assert!(
                delay >= expected * 0.5 - 1e-9 && delay <= expected + 1e-9,
                "attempt {}: {} outside [{}, {}]",
                attempt,
                delay,
                expected * 0.5,
                expected
            );
        }
    }

    #[test]
    fn test_streak_of_five_opens_cooldown() {
        let policy = RetryPolicy::new();
        for _ in 0..5 {
            policy.record_failure(ErrorClass::Network, "camera-7");
        }
        // Cooled down even on attempt 0
        assert!(!policy.should_retry(ErrorClass::Network, "camera-7", 0));
        // Other sources unaffected
        assert!(policy.should_retry(ErrorClass::Network, "camera-8", 0));
    }

    #[test]
    fn test_success_resets_streak() {
        let policy = RetryPolicy::new();
        for _ in 0..4 {
            policy.record_failure(ErrorClass::Network, "camera-7");
        }
        policy.record_success("camera-7");
        policy.record_failure(ErrorClass::Network, "camera-7");
        // 1 failure since the success: no cooldown
        assert!(policy.should_retry(ErrorClass::Network, "camera-7", 0));
    }

    #[test]
    fn test_with_retry_returns_first_success() {
        let policy = RetryPolicy::new();
        let mut calls = 0;
        let result: Result<i32> = policy.with_retry("op", || {
            calls += 1;
            Ok(42)
        });
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls, 1);
    }

    #[test]
    fn test_with_retry_cooldown_short_circuits() {
        let policy = RetryPolicy::new();
        // Pre-existing streak puts the source in cooldown
        for _ in 0..5 {
            policy.record_failure(ErrorClass::Database, "op");
        }

        let mut calls = 0;
        let result: Result<i32> = policy.with_retry("op", || {
            calls += 1;
            Err(PackCamError::Other("database is locked".to_string()))
        });
        // One attempt, no sleeping: cooldown answered false immediately
        assert!(result.is_err());
        assert_eq!(calls, 1);
    }
}
