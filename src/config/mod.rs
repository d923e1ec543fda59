//! Manages application configuration loaded from environment variables.
//!
//! This module defines the `Config` struct which holds all runtime settings
//! and provides the `from_env` function to populate this struct. It supports
//! loading variables from a `.env` file via the `dotenv` crate and provides
//! default values for optional settings.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

/// Holds the application's runtime configuration settings.
///
/// These settings are typically loaded from environment variables via `from_env`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// IP address the SMTP server listens on. (`MAILSERVER_SMTP_BIND_ADDRESS`, default "0.0.0.0")
    pub smtp_bind_address: String,
    /// Port the SMTP server listens on for plaintext/STARTTLS connections. (`MAILSERVER_SMTP_PORT`, default 2525)
    pub smtp_port: u16,

    /// IP address the POP3 server listens on. (`MAILSERVER_POP3_BIND_ADDRESS`, default "0.0.0.0")
    pub pop3_bind_address: String,
    /// Port the POP3 server listens on. (`MAILSERVER_POP3_PORT`, default 1100)
    pub pop3_port: u16,

    /// Path to a PEM certificate chain used for STARTTLS/STLS upgrades.
    /// (`MAILSERVER_TLS_CERT_PATH`, optional — TLS upgrade commands are not advertised without it)
    pub tls_cert_path: Option<String>,
    /// Path to the PEM private key matching `tls_cert_path`. (`MAILSERVER_TLS_KEY_PATH`)
    pub tls_key_path: Option<String>,

    /// SASL mechanisms advertised by the server, in preference order.
    /// (`MAILSERVER_SASL_MECHANISMS`, comma-separated, default "PLAIN,LOGIN")
    pub sasl_mechanisms: Vec<String>,

    /// Upstream DNS servers tried in order. (`MAILSERVER_DNS_SERVERS`, comma-separated `host:port`, default "1.1.1.1:53,8.8.8.8:53")
    pub dns_servers: Vec<String>,
    /// Per-query timeout before falling over to the next configured server. (`MAILSERVER_DNS_QUERY_TIMEOUT_MS`, default 2000)
    pub dns_query_timeout: Duration,
    /// Maximum number of entries retained in the resolver's positive/negative cache. (`MAILSERVER_DNS_CACHE_CAPACITY`, default 4096)
    pub dns_cache_capacity: usize,
    /// Path to a hosts file consulted before any network lookup. (`MAILSERVER_HOSTS_FILE`, default "/etc/hosts")
    pub hosts_file_path: String,

    /// Maximum accepted size, in bytes, of a single message body. (`MAILSERVER_MAX_MESSAGE_SIZE`, default 10485760)
    pub max_message_size: u64,
}

impl Config {
    /// Loads configuration settings from environment variables.
    ///
    /// Reads variables prefixed with `MAILSERVER_`. Supports loading from a `.env` file
    /// if present. Provides default values for all optional settings and logs the
    /// resolved configuration.
    pub fn from_env() -> Result<Self> {
        let _ = dotenv::dotenv();

        let smtp_bind_address = env_or_default("MAILSERVER_SMTP_BIND_ADDRESS", "0.0.0.0");
        let smtp_port = env_parse_or_default("MAILSERVER_SMTP_PORT", 2525u16)?;

        let pop3_bind_address = env_or_default("MAILSERVER_POP3_BIND_ADDRESS", "0.0.0.0");
        let pop3_port = env_parse_or_default("MAILSERVER_POP3_PORT", 1100u16)?;

        let tls_cert_path = env::var("MAILSERVER_TLS_CERT_PATH").ok();
        let tls_key_path = env::var("MAILSERVER_TLS_KEY_PATH").ok();

        let sasl_mechanisms = env_csv_or_default("MAILSERVER_SASL_MECHANISMS", &["PLAIN", "LOGIN"]);
        let dns_servers = env_csv_or_default("MAILSERVER_DNS_SERVERS", &["1.1.1.1:53", "8.8.8.8:53"]);

        let dns_query_timeout_ms: u64 = env_parse_or_default("MAILSERVER_DNS_QUERY_TIMEOUT_MS", 2000u64)?;
        let dns_query_timeout = Duration::from_millis(dns_query_timeout_ms);

        let dns_cache_capacity: usize = env_parse_or_default("MAILSERVER_DNS_CACHE_CAPACITY", 4096usize)?;
        let hosts_file_path = env_or_default("MAILSERVER_HOSTS_FILE", "/etc/hosts");
        let max_message_size: u64 = env_parse_or_default("MAILSERVER_MAX_MESSAGE_SIZE", 10 * 1024 * 1024u64)?;

        let config = Config {
            smtp_bind_address,
            smtp_port,
            pop3_bind_address,
            pop3_port,
            tls_cert_path,
            tls_key_path,
            sasl_mechanisms,
            dns_servers,
            dns_query_timeout,
            dns_cache_capacity,
            hosts_file_path,
            max_message_size,
        };

        log::info!("Config: smtp={}:{}", config.smtp_bind_address, config.smtp_port);
        log::info!("Config: pop3={}:{}", config.pop3_bind_address, config.pop3_port);
        log::info!("Config: sasl_mechanisms={:?}", config.sasl_mechanisms);
        log::info!("Config: dns_servers={:?} timeout={:?}", config.dns_servers, config.dns_query_timeout);
        log::info!("Config: tls_configured={}", config.tls_cert_path.is_some());

        Ok(config)
    }
}

fn env_or_default(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse_or_default<T>(key: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(val) => val
            .parse::<T>()
            .map_err(|e| anyhow!("{key} ('{val}') is invalid: {e}")),
        Err(_) => Ok(default),
    }
}

fn env_csv_or_default(key: &str, default: &[&str]) -> Vec<String> {
    env::var(key)
        .map(|val| {
            val.split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect()
        })
        .unwrap_or_else(|_| default.iter().map(|s| s.to_string()).collect())
}

mod tests;
