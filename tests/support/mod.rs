pub mod chain;
pub mod helpers;
