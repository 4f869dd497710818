// src/config.rs

//! Runtime configuration. Everything can be set explicitly; `from_env`
//! overlays the `NEXT_*` environment on top of the compiled-in defaults the
//! way operators usually deploy this.

use crate::address::Address;
use crate::crypto::{self, CryptoError, CustomerPrivateKey, CustomerPublicKey};
use thiserror::Error;
use tracing::level_filters::LevelFilter;

pub const DEFAULT_BACKEND_HOSTNAME: &str = "server.virtualgo.net";
pub const DEFAULT_BACKEND_PORT: u16 = 40000;
pub const DEFAULT_BACKEND_PUBLIC_KEY: &str = "Uycn3KibCfXJo1uM+NNWgCySRzM2Ti3bhvom9XBkxfE=";
pub const DEFAULT_ROUTER_PUBLIC_KEY: &str = "unH/Yxm0C6JCZ1dTGZH2BTBOFhGMcYsOEDURd9qY72w=";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("environment variable {0} has an invalid value")]
    BadValue(&'static str),

    #[error("customer public and private keys belong to different customers")]
    CustomerIdMismatch,

    #[error("bad key in {var}: {source}")]
    BadKey {
        var: &'static str,
        #[source]
        source: CryptoError,
    },
}

fn env_string(name: &'static str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn env_positive(name: &'static str) -> Result<Option<u64>, ConfigError> {
    match env_string(name) {
        None => Ok(None),
        Some(value) => value.trim().parse::<u64>().map(Some).map_err(|_| ConfigError::BadValue(name)),
    }
}

fn env_flag(name: &'static str) -> Result<bool, ConfigError> {
    Ok(env_positive(name)?.is_some_and(|v| v > 0))
}

/// Map `NEXT_LOG_LEVEL` onto a tracing subscriber. 0 = off through
/// 5 = spam (trace). Safe to call more than once.
pub fn init_logging() {
    let level = env_string("NEXT_LOG_LEVEL")
        .and_then(|v| v.trim().parse::<u8>().ok())
        .unwrap_or(3);
    let filter = match level {
        0 => LevelFilter::OFF,
        1 => LevelFilter::ERROR,
        2 => LevelFilter::WARN,
        3 => LevelFilter::INFO,
        4 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    };
    let _ = tracing_subscriber::fmt().with_max_level(filter).try_init();
}

#[derive(Clone)]
pub struct ClientConfig {
    /// Needed to verify signed upgrade packets. Without it the client only
    /// ever does passthrough.
    pub customer_public_key: Option<CustomerPublicKey>,
    /// Used to open the client's slot in backend route token arrays.
    pub router_public_key: x25519_dalek::PublicKey,
    pub disable_network_next: bool,
    pub socket_send_buffer_size: Option<usize>,
    pub socket_receive_buffer_size: Option<usize>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        let router_key = crypto::parse_key_32(DEFAULT_ROUTER_PUBLIC_KEY)
            .expect("default router key is valid base64");
        Self {
            customer_public_key: None,
            router_public_key: x25519_dalek::PublicKey::from(router_key),
            disable_network_next: false,
            socket_send_buffer_size: None,
            socket_receive_buffer_size: None,
        }
    }
}

impl ClientConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Some(value) = env_string("NEXT_CUSTOMER_PUBLIC_KEY") {
            config.customer_public_key = Some(
                CustomerPublicKey::parse(&value)
                    .map_err(|source| ConfigError::BadKey { var: "NEXT_CUSTOMER_PUBLIC_KEY", source })?,
            );
        }
        if let Some(value) = env_string("NEXT_ROUTER_PUBLIC_KEY") {
            let key = crypto::parse_key_32(&value)
                .map_err(|source| ConfigError::BadKey { var: "NEXT_ROUTER_PUBLIC_KEY", source })?;
            config.router_public_key = x25519_dalek::PublicKey::from(key);
        }
        config.disable_network_next = env_flag("NEXT_DISABLE_NETWORK_NEXT")?;
        config.socket_send_buffer_size =
            env_positive("NEXT_SOCKET_SEND_BUFFER_SIZE")?.map(|v| v as usize);
        config.socket_receive_buffer_size =
            env_positive("NEXT_SOCKET_RECEIVE_BUFFER_SIZE")?.map(|v| v as usize);
        Ok(config)
    }
}

#[derive(Clone)]
pub struct ServerConfig {
    /// Needed to sign upgrade packets and backend requests. Without it the
    /// server serves passthrough and direct traffic only.
    pub customer_private_key: Option<CustomerPrivateKey>,
    pub backend_hostname: String,
    pub backend_port: u16,
    pub backend_public_key: ed25519_dalek::VerifyingKey,
    pub router_public_key: x25519_dalek::PublicKey,
    pub datacenter_name: String,
    /// Public address of this server as clients reach it.
    pub server_address: Option<Address>,
    pub disable_network_next: bool,
    pub socket_send_buffer_size: Option<usize>,
    pub socket_receive_buffer_size: Option<usize>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        let backend_key = crypto::parse_key_32(DEFAULT_BACKEND_PUBLIC_KEY)
            .expect("default backend key is valid base64");
        let router_key = crypto::parse_key_32(DEFAULT_ROUTER_PUBLIC_KEY)
            .expect("default router key is valid base64");
        Self {
            customer_private_key: None,
            backend_hostname: DEFAULT_BACKEND_HOSTNAME.to_string(),
            backend_port: DEFAULT_BACKEND_PORT,
            backend_public_key: ed25519_dalek::VerifyingKey::from_bytes(&backend_key)
                .expect("default backend key is a valid point"),
            router_public_key: x25519_dalek::PublicKey::from(router_key),
            datacenter_name: String::new(),
            server_address: None,
            disable_network_next: false,
            socket_send_buffer_size: None,
            socket_receive_buffer_size: None,
        }
    }
}

impl ServerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(value) = env_string("NEXT_CUSTOMER_PRIVATE_KEY") {
            let private = CustomerPrivateKey::parse(&value)
                .map_err(|source| ConfigError::BadKey { var: "NEXT_CUSTOMER_PRIVATE_KEY", source })?;
            // If the public key is also present, the ids must agree.
            if let Some(public_value) = env_string("NEXT_CUSTOMER_PUBLIC_KEY") {
                let public = CustomerPublicKey::parse(&public_value).map_err(|source| {
                    ConfigError::BadKey { var: "NEXT_CUSTOMER_PUBLIC_KEY", source }
                })?;
                if public.customer_id != private.customer_id {
                    return Err(ConfigError::CustomerIdMismatch);
                }
            }
            config.customer_private_key = Some(private);
        }

        if let Some(hostname) = env_string("NEXT_SERVER_BACKEND_HOSTNAME") {
            config.backend_hostname = hostname;
        }
        if let Some(port) = env_positive("NEXT_SERVER_BACKEND_PORT")? {
            config.backend_port =
                u16::try_from(port).map_err(|_| ConfigError::BadValue("NEXT_SERVER_BACKEND_PORT"))?;
        }
        if let Some(value) = env_string("NEXT_SERVER_BACKEND_PUBLIC_KEY") {
            let key = crypto::parse_key_32(&value).map_err(|source| ConfigError::BadKey {
                var: "NEXT_SERVER_BACKEND_PUBLIC_KEY",
                source,
            })?;
            config.backend_public_key =
                ed25519_dalek::VerifyingKey::from_bytes(&key).map_err(|_| ConfigError::BadKey {
                    var: "NEXT_SERVER_BACKEND_PUBLIC_KEY",
                    source: CryptoError::InvalidKey,
                })?;
        }
        if let Some(value) = env_string("NEXT_ROUTER_PUBLIC_KEY") {
            let key = crypto::parse_key_32(&value)
                .map_err(|source| ConfigError::BadKey { var: "NEXT_ROUTER_PUBLIC_KEY", source })?;
            config.router_public_key = x25519_dalek::PublicKey::from(key);
        }
        if let Some(name) = env_string("NEXT_DATACENTER") {
            config.datacenter_name = name;
        }
        if let Some(value) = env_string("NEXT_SERVER_ADDRESS") {
            config.server_address =
                Some(value.parse().map_err(|_| ConfigError::BadValue("NEXT_SERVER_ADDRESS"))?);
        }
        config.disable_network_next = env_flag("NEXT_DISABLE_NETWORK_NEXT")?;
        config.socket_send_buffer_size =
            env_positive("NEXT_SOCKET_SEND_BUFFER_SIZE")?.map(|v| v as usize);
        config.socket_receive_buffer_size =
            env_positive("NEXT_SOCKET_RECEIVE_BUFFER_SIZE")?.map(|v| v as usize);
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_server_config_parses_builtin_keys() {
        let config = ServerConfig::default();
        assert_eq!(config.backend_hostname, DEFAULT_BACKEND_HOSTNAME);
        assert_eq!(config.backend_port, DEFAULT_BACKEND_PORT);
        assert!(config.customer_private_key.is_none());
    }

    #[test]
    fn test_default_client_config() {
        let config = ClientConfig::default();
        assert!(config.customer_public_key.is_none());
        assert!(!config.disable_network_next);
    }
}
