pub mod adapters;
pub mod app;
pub mod call;
pub mod cli;
pub mod config;
pub mod error;
pub mod presence;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
