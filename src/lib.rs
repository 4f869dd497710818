//! Network overlay acceleration core.
//!
//! Game clients and servers exchange UDP packets either directly or through a
//! chain of relays chosen by a central backend. This crate implements the two
//! runtimes at either end of that overlay: [`client::Client`] negotiates an
//! upgraded session and steers payloads onto backend-supplied routes, and
//! [`server::Server`] accepts upgrades, validates relay route requests, and
//! reports per-session telemetry back to the backend. Applications that never
//! touch the overlay still work: payloads fall back to plain UDP passthrough.

pub mod address;
pub mod client;
pub mod config;
pub mod constants;
pub mod crypto;
pub mod magic;
pub mod protocol;
pub mod replay;
pub mod resolve;
pub mod server;
pub mod stats;
pub mod utils;

pub use address::Address;
pub use client::{Client, ClientNotify, ClientStatsSnapshot};
pub use config::{ClientConfig, ServerConfig, init_logging};
pub use server::{Server, ServerNotify, SessionStatsSnapshot};
