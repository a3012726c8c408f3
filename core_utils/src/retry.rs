use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;

/// Calls `attempt` up to `max_attempts` times, sleeping `delay` between failures.
/// Returns the last error if every attempt failed.
pub async fn bounded_retry<T, E, F, Fut>(
    max_attempts: u32,
    delay: Duration,
    mut attempt: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut last_err = None;
    for remaining in (0..max_attempts).rev() {
        match attempt().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                last_err = Some(err);
                if remaining > 0 {
                    sleep(delay).await;
                }
            }
        }
    }
    Err(last_err.expect("max_attempts must be > 0"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn test_succeeds_on_third_attempt() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, &str> = bounded_retry(5, Duration::from_millis(1), || async {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            if n < 3 {
                Err("not yet")
            } else {
                Ok(n)
            }
        })
        .await;
        assert_eq!(result, Ok(3));
    }

    #[tokio::test]
    async fn test_exhausts_attempts() {
        let result: Result<u32, &str> =
            bounded_retry(3, Duration::from_millis(1), || async { Err("never") }).await;
        assert_eq!(result, Err("never"));
    }
}
