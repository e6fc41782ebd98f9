//! Task supervision
//!
//! Every job future runs under [`supervise`] so a panic inside it becomes
//! an ordinary [`JobError::Panic`] instead of unwinding through the
//! runtime with the job left half-finished.

use futures::FutureExt;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use tracing::error;

use crate::error::JobError;

pub async fn supervise<T, F>(job_id: &str, fut: F) -> Result<T, JobError>
where
    F: Future<Output = Result<T, JobError>>,
{
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(result) => result,
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            error!("Job {} panicked: {}", job_id, message);
            Err(JobError::Panic(message))
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_passes_results_through() {
        assert_eq!(supervise("j", async { Ok::<_, JobError>(7) }).await.unwrap(), 7);
        assert!(matches!(
            supervise("j", async { Err::<(), _>(JobError::ShutdownAbort) }).await,
            Err(JobError::ShutdownAbort)
        ));
    }

    #[tokio::test]
    async fn test_panic_becomes_error() {
        let result: Result<(), JobError> = supervise("j", async {
            let devices: Vec<&str> = Vec::new();
            if devices.is_empty() {
                panic!("device list vanished");
            }
            Ok(())
        })
        .await;
        match result {
            Err(JobError::Panic(message)) => assert_eq!(message, "device list vanished"),
            other => panic!("unexpected: {:?}", other),
        }

        fn fail_step(step: u32) -> Result<(), JobError> {
            panic!("step {} failed", step)
        }
        let formatted = supervise("j", async { fail_step(3) }).await;
        assert!(matches!(formatted, Err(JobError::Panic(m)) if m == "step 3 failed"));
    }
}
