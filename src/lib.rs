//! Marche is a small daemon that controls the lifecycle of services on a
//! host. Each configured job adapts one mechanism (systemd units, a legacy
//! init script, or a farm of device servers) to a uniform interface for
//! listing, starting, stopping and inspecting services, with every
//! long-running command executed in the background.

/// CLI interface.
pub mod cli;

/// Configuration management.
pub mod config;

/// Job registry and request dispatch.
pub mod daemon;

/// Error handling.
pub mod error;

/// Job backends.
pub mod jobs;

/// Log extraction.
pub mod logs;

/// Process bootstrap: daemonization, privilege drop, PID file.
pub mod privilege;

/// Background command execution.
pub mod runner;

/// Service status model.
pub mod status;

/// Configuration file transfer.
pub mod transfer;
