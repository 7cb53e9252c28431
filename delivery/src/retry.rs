use crate::errors::SendError;
use reqwest::StatusCode;
use std::future::Future;

/// A provider response that exposes its HTTP status to the retry loop.
pub trait StatusCoded {
    fn status(&self) -> StatusCode;
}

/// Runs `attempt` until it yields a non-retriable result or `max_attempts` calls were made.
///
/// Only timeouts, 500 and 503 are retried. Any other status, including 4xx, is returned to
/// the caller for classification. `max_attempts <= 0` is treated as a single attempt.
pub async fn send_with_retry<T, F, Fut>(max_attempts: i32, mut attempt: F) -> Result<T, SendError>
where
    T: StatusCoded,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, SendError>>,
{
    let max_attempts = max_attempts.max(1);
    let mut iteration = 0;

    loop {
        let has_more_attempts = iteration < max_attempts - 1;
        iteration += 1;

        match attempt().await {
            Err(err) if has_more_attempts && err.is_timeout() => {
                tracing::debug!(iteration, "provider call timed out, retrying");
            }
            Err(err) => return Err(err),
            Ok(response) => match response.status() {
                StatusCode::INTERNAL_SERVER_ERROR if has_more_attempts => {
                    tracing::debug!(iteration, "provider returned 500, retrying");
                }
                StatusCode::INTERNAL_SERVER_ERROR => return Err(SendError::InternalServerError),
                StatusCode::SERVICE_UNAVAILABLE if has_more_attempts => {
                    tracing::debug!(iteration, "provider returned 503, retrying");
                }
                StatusCode::SERVICE_UNAVAILABLE => return Err(SendError::ServiceUnavailable),
                _ => return Ok(response),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    #[derive(Debug)]
    struct Status(StatusCode);

    impl StatusCoded for Status {
        fn status(&self) -> StatusCode {
            self.0
        }
    }

    /// Replays `script` and counts how many calls were made.
    async fn run(
        max_attempts: i32,
        script: Vec<Result<u16, SendError>>,
    ) -> (Result<Status, SendError>, usize) {
        let script = Mutex::new(VecDeque::from(script));
        let calls = Mutex::new(0usize);
        let result = send_with_retry(max_attempts, || {
            *calls.lock().unwrap() += 1;
            let next = script
                .lock()
                .unwrap()
                .pop_front()
                .expect("attempted more calls than scripted");
            async move { next.map(|code| Status(StatusCode::from_u16(code).unwrap())) }
        })
        .await;
        let calls = *calls.lock().unwrap();
        (result, calls)
    }

    #[tokio::test]
    async fn test_success_never_retries() {
        for n in 0..=3 {
            let (result, calls) = run(n, vec![Ok(200)]).await;
            assert_eq!(result.unwrap().0, StatusCode::OK);
            assert_eq!(calls, 1);
        }
    }

    #[tokio::test]
    async fn test_client_errors_are_not_retried() {
        let (result, calls) = run(3, vec![Ok(400)]).await;
        assert_eq!(result.unwrap().0, StatusCode::BAD_REQUEST);
        assert_eq!(calls, 1);
    }

    #[tokio::test]
    async fn test_terminal_server_errors() {
        for n in 0..=3 {
            let attempts = n.max(1) as usize;

            let (result, calls) = run(n, (0..attempts).map(|_| Ok(500)).collect()).await;
            assert!(matches!(result, Err(SendError::InternalServerError)));
            assert_eq!(calls, attempts);

            let (result, calls) = run(n, (0..attempts).map(|_| Ok(503)).collect()).await;
            assert!(matches!(result, Err(SendError::ServiceUnavailable)));
            assert_eq!(calls, attempts);
        }
    }

    #[tokio::test]
    async fn test_recovers_after_server_error() {
        let (result, calls) = run(3, vec![Ok(503), Ok(500), Ok(200)]).await;
        assert_eq!(result.unwrap().0, StatusCode::OK);
        assert_eq!(calls, 3);
    }

    #[tokio::test]
    async fn test_timeouts() {
        for n in 0..=3 {
            let attempts = n.max(1) as usize;
            let mut script: Vec<Result<u16, SendError>> =
                (1..attempts).map(|_| Err(SendError::Timeout)).collect();
            script.push(Ok(200));
            let (result, calls) = run(n, script).await;
            assert_eq!(result.unwrap().0, StatusCode::OK);
            assert_eq!(calls, attempts);

            let script = (0..attempts).map(|_| Err(SendError::Timeout)).collect();
            let (result, calls) = run(n, script).await;
            assert!(matches!(result, Err(SendError::Timeout)));
            assert_eq!(calls, attempts);
        }
    }

    #[tokio::test]
    async fn test_other_errors_are_not_retried() {
        let (result, calls) = run(3, vec![Err(SendError::Auth("denied".into()))]).await;
        assert!(matches!(result, Err(SendError::Auth(_))));
        assert_eq!(calls, 1);
    }
}
