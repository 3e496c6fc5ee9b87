//! Multi-store writes with best-effort compensation.
//!
//! There is no transaction spanning the content store, the text index and
//! the metadata store. A [`WriteProtocol`] records a compensating action for
//! every step that completed; if a later step fails, [`WriteProtocol::unwind`]
//! runs them newest first and reports every compensation that failed.

use futures::future::{BoxFuture, FutureExt};
use std::future::Future;
use tracing::{debug, warn};

use crate::error::{Error, Result, Step};

type Compensation = Box<dyn FnOnce() -> BoxFuture<'static, Result<()>> + Send>;

#[derive(Default)]
pub struct WriteProtocol {
    completed: Vec<(Step, Compensation)>,
}

impl WriteProtocol {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `step` completed and how to undo it.
    pub fn completed<F, Fut>(&mut self, step: Step, undo: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.completed.push((step, Box::new(move || undo().boxed())));
    }

    /// Undo every completed step in reverse order.
    ///
    /// Returns `cause` unchanged when every compensation succeeded, otherwise
    /// an [`Error::Compensation`] carrying `cause` and the failures.
    pub async fn unwind(mut self, cause: Error) -> Error {
        let mut failures = Vec::new();
        while let Some((step, undo)) = self.completed.pop() {
            match undo().await {
                Ok(()) => debug!(%step, "compensated"),
                Err(e) => {
                    warn!(%step, error = %e, cause = %cause, "compensation failed");
                    failures.push(e);
                }
            }
        }

        if failures.is_empty() {
            cause
        } else {
            Error::Compensation {
                source: Box::new(cause),
                failures,
            }
        }
    }

    /// Every step succeeded; drop the compensations.
    pub fn finish(self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    fn failure(step: Step, msg: &'static str) -> Error {
        Error::backend(step, anyhow::anyhow!(msg))
    }

    #[tokio::test]
    async fn unwinds_in_reverse_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut protocol = WriteProtocol::new();
        for step in [Step::WriteContent, Step::IndexText] {
            let log = log.clone();
            protocol.completed(step, move || async move {
                log.lock().push(step);
                Ok(())
            });
        }

        let err = protocol
            .unwind(failure(Step::CommitMetadata, "commit refused"))
            .await;

        assert!(matches!(err, Error::Backend { step: Step::CommitMetadata, .. }));
        assert_eq!(*log.lock(), vec![Step::IndexText, Step::WriteContent]);
    }

    #[tokio::test]
    async fn collects_every_compensation_failure() {
        let mut protocol = WriteProtocol::new();
        protocol.completed(Step::WriteContent, || async {
            Err(failure(Step::RemoveContent, "bucket gone"))
        });
        protocol.completed(Step::IndexText, || async {
            Err(failure(Step::IndexText, "index locked"))
        });

        let err = protocol
            .unwind(failure(Step::CommitMetadata, "commit refused"))
            .await;

        match err {
            Error::Compensation { source, failures } => {
                assert_eq!(source.step(), Some(Step::CommitMetadata));
                assert_eq!(failures.len(), 2);
                assert_eq!(failures[0].step(), Some(Step::IndexText));
            }
            other => panic!("expected compensation error, got {other}"),
        }
    }

    #[tokio::test]
    async fn finish_runs_nothing() {
        let ran = Arc::new(Mutex::new(false));
        let mut protocol = WriteProtocol::new();
        let flag = ran.clone();
        protocol.completed(Step::WriteContent, move || async move {
            *flag.lock() = true;
            Ok(())
        });
        protocol.finish();
        assert!(!*ran.lock());
    }
}
