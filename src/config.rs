//! Bridge configuration and broker address parsing.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

pub const DEFAULT_FQ_PORT: u16 = 8765;
pub const DEFAULT_PROGRAM: &str = "prefix:\"scribe.zipkin.\"";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid broker address {addr:?}: {reason}")]
    InvalidBrokerAddr { addr: String, reason: String },
}

/// A broker endpoint, parsed from `HOST` or `HOST:PORT`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerAddr {
    pub host: String,
    pub port: u16,
}

impl FromStr for BrokerAddr {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = match s.split_once(':') {
            Some((host, port)) => {
                let port = port
                    .parse()
                    .map_err(|_| ConfigError::InvalidBrokerAddr {
                        addr: s.to_owned(),
                        reason: format!("bad port {port:?}"),
                    })?;
                (host, port)
            }
            None => (s, DEFAULT_FQ_PORT),
        };
        if host.is_empty() {
            return Err(ConfigError::InvalidBrokerAddr {
                addr: s.to_owned(),
                reason: "empty host".into(),
            });
        }
        Ok(BrokerAddr {
            host: host.to_owned(),
            port,
        })
    }
}

impl fmt::Display for BrokerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Fully resolved runtime configuration.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub brokers: Vec<BrokerAddr>,
    pub exchange: String,
    pub source: String,
    pub password: String,
    pub program: String,
    pub category: String,
    pub scribe_host: String,
    pub scribe_port: u16,
}
