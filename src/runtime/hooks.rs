use anyhow::Result;
use std::future::Future;
use tokio_util::sync::CancellationToken;

/// Outcome of a step that can be interrupted by shutdown signals.
pub(crate) enum HookDecision<T> {
    Finished(Result<T>),
    Cancelled,
}

/// Races `step` against `token`; cancellation drops the step future.
pub(crate) async fn run_cancellable<T, F>(token: &CancellationToken, step: F) -> HookDecision<T>
where
    F: Future<Output = Result<T>>,
{
    if token.is_cancelled() {
        return HookDecision::Cancelled;
    }

    tokio::select! {
        biased;
        _ = token.cancelled() => HookDecision::Cancelled,
        result = step => HookDecision::Finished(result),
    }
}
