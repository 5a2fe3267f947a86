use log::debug;
use std::time::Duration;

/// How many times to try an operation, and how long to wait between tries.
#[derive(Copy, Clone, Debug)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub delay: Duration,
}

/// Why [retry] gave up.
#[derive(Debug)]
pub enum RetryError<E> {
    /// Every attempt failed with a retryable error. Holds the last one.
    Exhausted { attempts: u32, last: E },
    /// An attempt failed with an error that retrying can't fix.
    Fatal(E),
}

/// Run `op` until it succeeds, fails with an error `is_retryable` rejects, or `policy.attempts`
/// tries have been made. `op` is passed the 1-based attempt number. `sleep` is called between
/// attempts, never after the last one.
pub fn retry<T, E: std::fmt::Display>(
    policy: RetryPolicy,
    mut sleep: impl FnMut(Duration),
    is_retryable: impl Fn(&E) -> bool,
    mut op: impl FnMut(u32) -> Result<T, E>,
) -> Result<T, RetryError<E>> {
    let mut attempt = 1;
    loop {
        match op(attempt) {
            Ok(v) => return Ok(v),
            Err(e) if !is_retryable(&e) => return Err(RetryError::Fatal(e)),
            Err(e) if attempt >= policy.attempts => {
                return Err(RetryError::Exhausted {
                    attempts: attempt,
                    last: e,
                });
            }
            Err(e) => {
                debug!(
                    "Attempt {attempt}/{} failed ({e}); retrying in {:?}",
                    policy.attempts, policy.delay
                );
                sleep(policy.delay);
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const POLICY: RetryPolicy = RetryPolicy {
        attempts: 3,
        delay: Duration::from_millis(5),
    };

    #[test]
    fn succeeds_after_retryable_failures() {
        let mut sleeps = vec![];
        let result = retry(
            POLICY,
            |d| sleeps.push(d),
            |_: &String| true,
            |n| if n < 3 { Err(format!("try {n}")) } else { Ok(n) },
        );
        assert_eq!(result.unwrap(), 3);
        assert_eq!(sleeps, vec![POLICY.delay; 2]);
    }

    #[test]
    fn exhausts_without_sleeping_after_last_attempt() {
        let mut sleeps = 0;
        let result: Result<(), _> = retry(
            POLICY,
            |_| sleeps += 1,
            |_: &String| true,
            |n| Err(format!("try {n}")),
        );
        match result {
            Err(RetryError::Exhausted { attempts, last }) => {
                assert_eq!(attempts, 3);
                assert_eq!(last, "try 3");
            }
            other => panic!("unexpected result {other:?}"),
        }
        assert_eq!(sleeps, 2);
    }

    #[test]
    fn fatal_error_stops_immediately() {
        let mut calls = 0;
        let result: Result<(), _> = retry(
            POLICY,
            |_| panic!("should not sleep"),
            |e: &String| e != "fatal",
            |_| {
                calls += 1;
                Err("fatal".to_string())
            },
        );
        assert!(matches!(result, Err(RetryError::Fatal(e)) if e == "fatal"));
        assert_eq!(calls, 1);
    }
}
