//! End-to-end runs against real child processes.

#[cfg(unix)]
mod scenarios;
