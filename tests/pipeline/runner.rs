use std::time::Duration;

use crate::support::{
    chain::Chain,
    helpers::{init_tracing, test_config, wait_until, within},
};
use anyhow::Result;
use ledger_ingest::{Runner, StateName};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn runner_stops_cleanly_when_its_token_is_cancelled() -> Result<()> {
    init_tracing();
    let chain = Chain::new(6);
    let mut runner = Runner::new(chain.system(test_config()));
    let token = runner.cancellation_token();
    let progress = runner.progress();

    let handle = tokio::spawn(async move { runner.run_until_ctrl_c().await });

    // An empty database is built from the archive's latest checkpoint.
    wait_until("runner to reach ledger 6", Duration::from_secs(10), || {
        chain.store.last_ledger_ingest() == 6 && progress.current().state == StateName::Resume
    })
    .await?;
    token.cancel();
    within(Duration::from_secs(10), handle).await???;

    assert_eq!(progress.current().state, StateName::Stop);
    assert_eq!(progress.current().last_ingested_ledger, 6);
    Ok(())
}

#[tokio::test]
async fn runner_surfaces_ingestion_errors() -> Result<()> {
    init_tracing();
    // No checkpoint in the archive: building an empty database fails.
    let chain = Chain::new(1);
    let mut runner = Runner::new(chain.system(test_config()));

    let err = within(Duration::from_secs(10), runner.run_until_ctrl_c())
        .await?
        .expect_err("nothing to build from");
    assert!(format!("{err:#}").contains("latest checkpoint"));
    assert_eq!(runner.system().current_state().state, StateName::Stop);
    Ok(())
}
