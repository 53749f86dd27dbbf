#[path = "../support/mod.rs"]
mod support;

mod live_pipeline;
mod reingest_pipeline;
mod runner;
mod verify_pipeline;
