// src/client/mod.rs

mod client;
pub mod relay_manager;
pub mod route_manager;

pub use client::{
    CLIENT_COUNTER_FALLBACK_TO_DIRECT, CLIENT_COUNTER_PACKETS_SENT_DIRECT,
    CLIENT_COUNTER_PACKETS_SENT_NEXT, CLIENT_COUNTER_PACKETS_SENT_PASSTHROUGH,
    CLIENT_COUNTER_UPGRADED, Client, ClientError, ClientNotify, ClientStatsSnapshot,
};
