//! Cancellation detector.
//!
//! Pure predicate over a task error deciding whether the failure is a
//! cancellation. Classification is deterministic over closed sets: the
//! `EnqueueCancel` sentinel, tagged names/codes, an explicit cancelled
//! flag, a fixed list of message fragments, and the whole cause chain
//! of each of those. Keeping the sets closed is what guarantees a task
//! never emits two terminal events across error-shape variants.

use crate::error::{EnqueueCancel, TaggedError};

/// Error type names recognised as cancellations.
const CANCEL_NAMES: &[&str] = &[
    "AbortError",
    "CancelError",
    "CancelledError",
    "CancellationError",
    "AbortedError",
    "UserCancelledError",
    "RequestCancelledError",
    "CanceledError",
];

/// Error codes recognised as cancellations.
const CANCEL_CODES: &[&str] = &[
    "ABORT_ERR",
    "ABORTED",
    "ABORT_ERROR",
    "CANCELLED",
    "CANCELED",
    "USER_CANCELLED",
    "REQUEST_CANCELLED",
    "OPERATION_CANCELLED",
    "ERR_CANCELED",
];

/// Canonicalised message fragments recognised as cancellations.
/// Matched case-insensitively against each cause's display form.
const CANCEL_FRAGMENTS: &[&str] = &[
    "operation was aborted",
    "operation aborted",
    "operation was canceled",
    "request was cancelled",
    "request cancelled",
    "request aborted",
    "cancelled by user",
    "canceled by user",
    "user cancelled",
    "task was cancelled",
    "cancellation requested",
];

/// True iff `err` (or anything in its cause chain) is a cancellation.
pub fn is_cancellation(err: &anyhow::Error) -> bool {
    err.chain().any(cause_is_cancellation)
}

fn cause_is_cancellation(cause: &(dyn std::error::Error + 'static)) -> bool {
    if cause.downcast_ref::<EnqueueCancel>().is_some() {
        return true;
    }

    if let Some(tagged) = cause.downcast_ref::<TaggedError>() {
        if tagged.is_cancelled() {
            return true;
        }
        if tagged.name().is_some_and(|n| CANCEL_NAMES.contains(&n)) {
            return true;
        }
        if tagged.code().is_some_and(|c| CANCEL_CODES.contains(&c)) {
            return true;
        }
    }

    matches_fragment(&cause.to_string())
}

fn matches_fragment(msg: &str) -> bool {
    let msg = msg.to_ascii_lowercase();
    CANCEL_FRAGMENTS.iter().any(|f| msg.contains(f))
}
