//! rtkhdcp - HDCP 1.4 / 2.2 source-side protocol engine.
//!
//! This crate provides:
//! - A DDC/SCDC transport abstraction with unplug-aware error classification.
//! - Secure back-end capability interfaces for HDCP 1.4 and HDCP 2.2, plus
//!   adapters speaking a TEE-style `invoke` protocol.
//! - The authentication state machine with link maintenance, CED gating and
//!   cancellation.
//! - A single-threaded worker that owns an engine and serializes requests.
//!
//! Feature flags:
//! - `tracing`: route internal logging to `tracing` (default).
//! - `log`: route internal logging to the `log` facade.
//! - `sim`: simulated sink and in-memory crypto back-ends. Enabled by `cli`.
//! - `cli`: enable the CLI binary.
#![allow(clippy::result_large_err)]

#[macro_use]
mod macros;

/// DDC/SCDC link transport.
pub mod ddc;
/// Protocol engine: state machine, work items and status attributes.
pub mod engine;
/// Common error types and Result alias.
pub mod error;
/// HDCP 1.4 authentication flow.
pub mod hdcp1;
/// HDCP 1.4 secure back-end interface and TEE adapter.
pub mod hdcp1_tee;
/// HDCP 2.2 authentication flow.
pub mod hdcp2;
/// HDCP 2.2 message layouts and mailbox access.
pub mod hdcp2_msg;
/// HDCP 2.2 secure back-end interface and TEE adapter.
pub mod hdcp2_tee;
/// Per-connector session state.
pub mod session;
/// Generic TEE client session handling.
pub mod tee;
/// Shared helper utilities.
pub mod utils;
/// Actor thread owning an engine.
pub mod worker;

/// Simulated sink and back-ends (feature: `sim`).
#[cfg(any(test, feature = "sim"))]
pub mod sim;

pub use engine::{Engine, EngineConfig, HdcpListener, StateEvent, Timings};
pub use error::{Error, Result};
pub use session::{ContentProtection, HdcpState, Mcap, SinkVersion};
pub use utils::RevocationList;
