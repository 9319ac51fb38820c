//! Task-local correlation IDs
//!
//! Every logical operation (a poll cycle, one record's processing) runs
//! inside a correlation scope. The ID is ambient: log statements and
//! record construction read it without threading a value through every
//! call. Scopes nest; leaving a scope restores the enclosing ID.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use uuid::Uuid;

tokio::task_local! {
    static CURRENT: String;
}

static ISSUED: AtomicU64 = AtomicU64::new(0);

/// Generate a fresh random 128-bit correlation ID in hex.
#[must_use]
pub fn new_id() -> String {
    ISSUED.fetch_add(1, Ordering::Relaxed);
    Uuid::new_v4().simple().to_string()
}

/// The correlation ID of the current scope, if any.
#[must_use]
pub fn current() -> Option<String> {
    CURRENT.try_with(Clone::clone).ok()
}

/// The current ID, or an empty string outside any scope.
#[must_use]
pub fn current_or_empty() -> String {
    current().unwrap_or_default()
}

/// Run a future inside a correlation scope.
pub async fn scope<F>(id: String, fut: F) -> F::Output
where
    F: Future,
{
    CURRENT.scope(id, fut).await
}

/// How many IDs this process has issued; reported by `/status`.
#[must_use]
pub fn issued() -> u64 {
    ISSUED.load(Ordering::Relaxed)
}
