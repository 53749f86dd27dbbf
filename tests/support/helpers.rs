use std::future::Future;
use std::time::{Duration, Instant};

use anyhow::{bail, Result};
use ledger_ingest::IngestConfig;
use once_cell::sync::Lazy;
use tokio::time::sleep;
use tracing_subscriber::EnvFilter;

use super::chain::CHECKPOINT_FREQUENCY;

static TRACING_SUBSCRIBER: Lazy<()> = Lazy::new(|| {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
});

pub fn init_tracing() {
    Lazy::force(&TRACING_SUBSCRIBER);
}

/// Fast-polling configuration over the fixture chain's checkpoint schedule.
/// Background verification is off so tests control when state is compared.
pub fn test_config() -> IngestConfig {
    IngestConfig::builder()
        .checkpoint_frequency(CHECKPOINT_FREQUENCY)
        .disable_state_verification(true)
        .ledger_wait_initial_backoff(Duration::from_millis(5))
        .ledger_wait_backoff_step(Duration::from_millis(5))
        .ledger_wait_timeout(Duration::from_secs(10))
        .reingest_retry_backoff(Duration::from_millis(1))
        .metrics_interval(Duration::from_millis(50))
        .build()
        .expect("test config is valid")
}

pub async fn wait_until<F>(what: &str, timeout: Duration, mut condition: F) -> Result<()>
where
    F: FnMut() -> bool,
{
    let start = Instant::now();
    loop {
        if condition() {
            return Ok(());
        }
        if start.elapsed() > timeout {
            bail!("timed out after {timeout:?} waiting for {what}");
        }
        sleep(Duration::from_millis(5)).await;
    }
}

/// Awaits `future`, failing the test instead of hanging it.
pub async fn within<T>(timeout: Duration, future: impl Future<Output = T>) -> Result<T> {
    match tokio::time::timeout(timeout, future).await {
        Ok(value) => Ok(value),
        Err(_) => bail!("operation did not finish within {timeout:?}"),
    }
}
