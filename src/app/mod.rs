pub mod adb;
pub mod capture;
pub mod config;
pub mod device;
pub mod engine;
pub mod error;
pub mod events;
pub mod jobs;
pub mod logging;
pub mod models;
pub mod progress;
pub mod scheduler;
pub mod session;
pub mod transfer;

#[cfg(test)]
pub(crate) mod test_support;
