use crate::ingest::System;
use crate::runtime::progress::ProgressTracker;
use anyhow::Result;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;

/// Owns a live [`System`] and handles OS signals for graceful shutdowns.
pub struct Runner {
    system: System,
    shutdown: CancellationToken,
}

impl Runner {
    /// Wires a root [`CancellationToken`] into the system so that cancelling
    /// it stops the state machine, the metrics reporter and any running
    /// verification.
    pub fn new(system: System) -> Self {
        let shutdown = CancellationToken::new();
        let system = system.with_cancellation_token(shutdown.clone());
        Self { system, shutdown }
    }

    /// Returns a clone of the root shutdown token so external callers can integrate
    /// with their own signal handlers or cancellation strategies.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn system(&self) -> &System {
        &self.system
    }

    pub fn progress(&self) -> Arc<ProgressTracker> {
        self.system.progress()
    }

    /// Runs live ingestion until a Ctrl-C (SIGINT) is received, the shutdown
    /// token is cancelled elsewhere, or ingestion fails.
    pub async fn run_until_ctrl_c(&mut self) -> Result<()> {
        tracing::info!("runner started; waiting for Ctrl-C (SIGINT) to initiate shutdown");
        let shutdown = self.shutdown.clone();
        let run = self.system.run();
        tokio::pin!(run);

        let result = tokio::select! {
            result = &mut run => result,
            _ = signal::ctrl_c() => {
                tracing::info!("Ctrl-C received; shutting down runner");
                shutdown.cancel();
                run.await
            }
        };

        if let Err(err) = &result {
            tracing::error!(error = %format!("{err:#}"), "ingestion stopped with an error");
        }
        result
    }
}
