//! `jobgate-runner`: run an external command under the single-execution
//! coordinator (cron, queue consumer, CI step).

pub mod app;
pub mod cli;
pub mod command;
