//! Per-fetch context: a cancellation token plus a deadline
//!
//! Every I/O operation a fetch performs (multiplexer call, HTTP request,
//! subprocess) runs through [`FetchContext::run`], so a canceled or expired
//! fetch always resolves to `NtmError::Canceled` or `NtmError::Timeout`.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::errors::{NtmError, Result};

#[derive(Debug, Clone)]
pub struct FetchContext {
    cancel: CancellationToken,
    timeout: Duration,
}

impl FetchContext {
    pub fn new(timeout: Duration) -> Self {
        Self {
            cancel: CancellationToken::new(),
            timeout,
        }
    }

    pub fn with_token(cancel: CancellationToken, timeout: Duration) -> Self {
        Self { cancel, timeout }
    }

    /// Child context that is canceled with its parent and never outlives its deadline
    pub fn child(&self, timeout: Duration) -> Self {
        Self {
            cancel: self.cancel.child_token(),
            timeout: timeout.min(self.timeout),
        }
    }

    pub fn token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Run `fut` under this context
    ///
    /// Cancellation wins over completion when both are ready.
    pub async fn run<T, F>(&self, op: &str, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        if self.cancel.is_cancelled() {
            return Err(NtmError::Canceled);
        }
        tokio::select! {
            biased;
            () = self.cancel.cancelled() => Err(NtmError::Canceled),
            res = tokio::time::timeout(self.timeout, fut) => match res {
                Ok(inner) => inner,
                Err(_) => Err(NtmError::Timeout {
                    op: op.to_string(),
                    after: self.timeout,
                }),
            },
        }
    }
}
