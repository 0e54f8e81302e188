use std::{env, net::SocketAddr};

use thiserror::Error;

use crate::transport::TransportKind;

pub const DEFAULT_SERVER_NAME: &str = "Demo Server";
pub const DEFAULT_TRANSPORTS: [TransportKind; 2] =
    [TransportKind::PushStream, TransportKind::BidirectionalStream];

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: String,
    pub bind_port: u16,
    pub transports: Vec<TransportKind>,
    pub server_name: String,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("BIND_PORT must be a valid u16")]
    InvalidPort,
    #[error("invalid bind address or port")]
    InvalidSocket,
    #[error("unknown transport `{0}`, expected one of: pipe, push-stream, bidirectional-stream")]
    InvalidTransport(String),
    #[error("at least one transport must be enabled")]
    NoTransports,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let bind_addr = env::var("BIND_ADDR").unwrap_or_else(|_| "127.0.0.1".to_string());
        let bind_port = env::var("BIND_PORT")
            .ok()
            .map(|value| value.trim().parse::<u16>().map_err(|_| ConfigError::InvalidPort))
            .transpose()?
            .unwrap_or(8000);
        let transports = match env::var("MCP_TRANSPORTS") {
            Ok(value) => parse_transports(&value)?,
            Err(_) => DEFAULT_TRANSPORTS.to_vec(),
        };
        let server_name = env::var("MCP_SERVER_NAME")
            .ok()
            .map(|name| name.trim().to_string())
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| DEFAULT_SERVER_NAME.to_string());

        let config = Self {
            bind_addr,
            bind_port,
            transports,
            server_name,
        };

        let _ = config.bind_socket()?;
        Ok(config)
    }

    pub fn bind_socket(&self) -> Result<SocketAddr, ConfigError> {
        format!("{}:{}", self.bind_addr, self.bind_port)
            .parse::<SocketAddr>()
            .map_err(|_| ConfigError::InvalidSocket)
    }

    /// Replaces the enabled transports, e.g. with the ones named on the command line.
    pub fn with_transports(mut self, transports: Vec<TransportKind>) -> Result<Self, ConfigError> {
        if transports.is_empty() {
            return Err(ConfigError::NoTransports);
        }
        self.transports = dedup(transports);
        Ok(self)
    }
}

/// Parses a comma-separated transport list, ignoring blanks and repeats.
pub fn parse_transports(value: &str) -> Result<Vec<TransportKind>, ConfigError> {
    let transports = value
        .split(',')
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(str::parse::<TransportKind>)
        .collect::<Result<Vec<_>, _>>()?;

    if transports.is_empty() {
        return Err(ConfigError::NoTransports);
    }
    Ok(dedup(transports))
}

fn dedup(transports: Vec<TransportKind>) -> Vec<TransportKind> {
    let mut unique = Vec::with_capacity(transports.len());
    for transport in transports {
        if !unique.contains(&transport) {
            unique.push(transport);
        }
    }
    unique
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    // The environment is process-wide; tests that touch it take turns.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    fn clear_env() {
        env::remove_var("BIND_ADDR");
        env::remove_var("BIND_PORT");
        env::remove_var("MCP_TRANSPORTS");
        env::remove_var("MCP_SERVER_NAME");
    }

    #[test]
    fn parse_defaults() {
        let _env = ENV_LOCK.lock().unwrap_or_else(|err| err.into_inner());
        clear_env();

        let config = Config::from_env().expect("config should parse");
        assert_eq!(config.bind_addr, "127.0.0.1");
        assert_eq!(config.bind_port, 8000);
        assert_eq!(config.transports, DEFAULT_TRANSPORTS.to_vec());
        assert_eq!(config.server_name, DEFAULT_SERVER_NAME);
    }

    #[test]
    fn transports_and_name_come_from_env() {
        let _env = ENV_LOCK.lock().unwrap_or_else(|err| err.into_inner());
        clear_env();
        env::set_var("MCP_TRANSPORTS", "stdio, ws,ws");
        env::set_var("MCP_SERVER_NAME", "MCP Multi-Transport Server");

        let config = Config::from_env().expect("config should parse");
        assert_eq!(
            config.transports,
            vec![TransportKind::Pipe, TransportKind::BidirectionalStream]
        );
        assert_eq!(config.server_name, "MCP Multi-Transport Server");
        clear_env();
    }

    #[test]
    fn invalid_port_fails() {
        let _env = ENV_LOCK.lock().unwrap_or_else(|err| err.into_inner());
        clear_env();
        env::set_var("BIND_PORT", "99999");

        let err = Config::from_env().expect_err("expected invalid port error");
        assert_eq!(err, ConfigError::InvalidPort);
        clear_env();
    }

    #[test]
    fn invalid_bind_addr_fails() {
        let _env = ENV_LOCK.lock().unwrap_or_else(|err| err.into_inner());
        clear_env();
        env::set_var("BIND_ADDR", "not an address");

        let err = Config::from_env().expect_err("expected invalid socket error");
        assert_eq!(err, ConfigError::InvalidSocket);
        clear_env();
    }

    #[test]
    fn transport_lists_are_validated() {
        assert!(matches!(
            parse_transports("sse,carrier-pigeon"),
            Err(ConfigError::InvalidTransport(name)) if name == "carrier-pigeon"
        ));
        assert_eq!(parse_transports(" , "), Err(ConfigError::NoTransports));
    }
}
