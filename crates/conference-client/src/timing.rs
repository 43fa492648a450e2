//! Timer helpers shared by the actor loops.

use std::time::Duration;
use tokio::time::Instant;

/// Sleep until `deadline`, or forever when no deadline is armed.
///
/// Meant for a `tokio::select!` branch whose timer is optional.
pub(crate) async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending::<()>().await,
    }
}

/// Stand-in for "never" when a delay runs past the clock's range.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// `now + delay`, clamped to a far-future instant instead of overflowing.
pub(crate) fn deadline_after(now: Instant, delay: Duration) -> Instant {
    now.checked_add(delay)
        .or_else(|| now.checked_add(FAR_FUTURE))
        .unwrap_or(now)
}
