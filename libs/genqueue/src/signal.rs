//! Cancellation-signal canonicalisation.
//!
//! Callers can hand in a signal under two option fields (`abort_signal`
//! or the legacy `signal`); `normalize` merges them so everything past
//! the façade sees exactly one. `AbortSignal` adapts whatever the
//! caller has (a raw `CancellationToken`, nothing, an already-fired
//! signal) behind the two operations the validator relies on:
//! `aborted()` and a one-shot `on_abort()`.

use tokio_util::sync::CancellationToken;

use crate::validate::EnqueueOptions;

/// Caller-side cancellation signal.
#[derive(Debug, Clone)]
pub struct AbortSignal {
    token: CancellationToken,
}

impl AbortSignal {
    /// A signal that never fires.
    pub fn never() -> Self {
        Self {
            token: CancellationToken::new(),
        }
    }

    /// A signal that is already aborted.
    pub fn already_aborted() -> Self {
        let token = CancellationToken::new();
        token.cancel();
        Self { token }
    }

    /// Adapt an existing token. The token stays owned by the caller;
    /// aborting it aborts the task.
    pub fn from_token(token: CancellationToken) -> Self {
        Self { token }
    }

    /// Whether the signal has fired.
    pub fn aborted(&self) -> bool {
        self.token.is_cancelled()
    }

    /// One-shot subscription: completes when the signal fires.
    pub async fn on_abort(&self) {
        self.token.cancelled().await;
    }

    pub(crate) fn token(&self) -> &CancellationToken {
        &self.token
    }
}

impl Default for AbortSignal {
    fn default() -> Self {
        Self::never()
    }
}

impl From<CancellationToken> for AbortSignal {
    fn from(token: CancellationToken) -> Self {
        Self::from_token(token)
    }
}

/// The only writer of `opts.abort_signal`.
///
/// Post-condition: `opts.signal` is `None` and at most one canonical
/// signal remains. When both fields are set, `abort_signal` wins.
pub fn normalize(opts: &mut EnqueueOptions) {
    if let Some(legacy) = opts.signal.take() {
        if opts.abort_signal.is_none() {
            opts.abort_signal = Some(legacy);
        }
    }
}
