use std::collections::HashMap;
use std::time::{Duration, Instant};

struct StudentRecord {
    failures: u32,
    window_start: Instant,
    locked_until: Option<Instant>,
}

/// Per-student rate limiter for verification attempts.
///
/// After `max_failures` failed verifications within the sliding window the
/// student is locked out for the lockout duration. Engine errors and quality
/// rejections are not counted — only identity and spoofing failures
/// increment the counter.
pub struct RateLimiter {
    max_failures: u32,
    window: Duration,
    lockout: Duration,
    records: HashMap<String, StudentRecord>,
}

impl RateLimiter {
    pub fn new(max_failures: u32, window: Duration, lockout: Duration) -> Self {
        Self {
            max_failures,
            window,
            lockout,
            records: HashMap::new(),
        }
    }

    /// Return `Ok(())` if the student may attempt verification, or
    /// `Err(message)` when currently locked out.
    pub fn check(&mut self, student_id: &str) -> Result<(), String> {
        let now = Instant::now();
        let record = self
            .records
            .entry(student_id.to_string())
            .or_insert(StudentRecord {
                failures: 0,
                window_start: now,
                locked_until: None,
            });

        if let Some(locked_until) = record.locked_until {
            if now < locked_until {
                let remaining = locked_until.duration_since(now).as_secs();
                return Err(format!(
                    "too many failed attempts; try again in {remaining}s"
                ));
            }
            // Lockout expired — reset
            *record = StudentRecord {
                failures: 0,
                window_start: now,
                locked_until: None,
            };
        } else if now.duration_since(record.window_start) >= self.window {
            // Sliding window expired — reset failure counter
            record.failures = 0;
            record.window_start = now;
        }

        Ok(())
    }

    /// Record a failed verification attempt. May trigger a lockout.
    pub fn record_failure(&mut self, student_id: &str) {
        let now = Instant::now();
        let record = self
            .records
            .entry(student_id.to_string())
            .or_insert(StudentRecord {
                failures: 0,
                window_start: now,
                locked_until: None,
            });

        if now.duration_since(record.window_start) >= self.window {
            record.failures = 0;
            record.window_start = now;
        }

        record.failures += 1;
        if record.failures >= self.max_failures {
            record.locked_until = Some(now + self.lockout);
            tracing::warn!(
                student_id,
                failures = record.failures,
                lockout_secs = self.lockout.as_secs(),
                "rate limit triggered — locking student"
            );
        } else {
            tracing::debug!(
                student_id,
                failures = record.failures,
                max = self.max_failures,
                "verification failed — incrementing failure counter"
            );
        }
    }

    /// Record a successful verification — clears the failure counter.
    pub fn record_success(&mut self, student_id: &str) {
        self.records.remove(student_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter() -> RateLimiter {
        RateLimiter::new(5, Duration::from_secs(60), Duration::from_secs(300))
    }

    #[test]
    fn test_allows_under_limit() {
        let mut rl = limiter();
        for _ in 0..4 {
            assert!(rl.check("s-1").is_ok());
            rl.record_failure("s-1");
        }
        assert!(rl.check("s-1").is_ok());
    }

    #[test]
    fn test_locks_after_max_failures() {
        let mut rl = limiter();
        for _ in 0..5 {
            rl.record_failure("s-1");
        }
        assert!(rl.check("s-1").is_err());
    }

    #[test]
    fn test_success_clears_counter() {
        let mut rl = limiter();
        for _ in 0..4 {
            rl.record_failure("s-1");
        }
        rl.record_success("s-1");
        assert!(rl.check("s-1").is_ok());
    }

    #[test]
    fn test_independent_per_student() {
        let mut rl = limiter();
        for _ in 0..5 {
            rl.record_failure("s-1");
        }
        assert!(rl.check("s-2").is_ok());
        assert!(rl.check("s-1").is_err());
    }

    #[test]
    fn test_configurable_threshold() {
        let mut rl = RateLimiter::new(2, Duration::from_secs(60), Duration::from_secs(300));
        rl.record_failure("s-1");
        assert!(rl.check("s-1").is_ok());
        rl.record_failure("s-1");
        assert!(rl.check("s-1").is_err());
    }
}
