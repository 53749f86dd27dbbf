//! Background tasks tied to one `System::run` call.

use crate::runtime::telemetry::{self, Telemetry};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Upper bound on how long shutdown waits for a running verification.
pub(crate) const VERIFICATION_JOIN_TIMEOUT: Duration = Duration::from_secs(10);

pub(crate) struct LifecycleHandles {
    pub run_token: CancellationToken,
    metrics_handle: Option<JoinHandle<()>>,
}

impl LifecycleHandles {
    pub(crate) fn spawn(
        shutdown_root: &CancellationToken,
        telemetry: Arc<Telemetry>,
        metrics_interval: Duration,
    ) -> Self {
        let run_token = shutdown_root.child_token();
        let metrics_handle =
            telemetry::spawn_metrics_reporter(telemetry, run_token.clone(), metrics_interval);

        Self {
            run_token,
            metrics_handle: Some(metrics_handle),
        }
    }

    pub(crate) async fn shutdown(mut self) {
        self.run_token.cancel();

        if let Some(handle) = self.metrics_handle.take() {
            if let Err(err) = handle.await {
                tracing::warn!(error = %err, "metrics reporter task panicked");
            }
        }
    }
}

/// Waits for a detached verification task, giving up after
/// [`VERIFICATION_JOIN_TIMEOUT`].
pub(crate) async fn join_verification(handle: JoinHandle<()>) {
    match tokio::time::timeout(VERIFICATION_JOIN_TIMEOUT, handle).await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => tracing::warn!(error = %err, "state verification task panicked"),
        Err(_) => tracing::warn!(
            timeout_secs = VERIFICATION_JOIN_TIMEOUT.as_secs(),
            "state verification did not finish before shutdown"
        ),
    }
}
