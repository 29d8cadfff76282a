//! Asynchronous device-operation engine for an adb-style command-line transport.
//!
//! [`app::engine::Engine`] is the entry point: it resolves devices, runs shell
//! commands, transfers, and interactive sessions as tracked jobs, and reports
//! their progress over an event channel.

pub mod app;
