use std::net::SocketAddr;
use std::time::Duration;

use clap::{Parser, ValueEnum};

use crate::errors::RelayError;
use crate::relay::{RelayOptions, DEFAULT_SNAPSHOT_LIMIT};

#[derive(Parser, Debug, Clone, PartialEq)]
#[command(
    name = "tabsnap-relay",
    version,
    about = "Relay that lets several browser contexts share one agent session"
)]
pub struct RelayArgs {
    /// Address contexts connect to over WebSocket
    #[arg(long, env = "WS_ADDR", default_value = "127.0.0.1:8845")]
    pub ws_addr: String,

    /// Host for the HTTP API
    #[arg(long, env = "HTTP_HOST", default_value = "127.0.0.1")]
    pub host: String,

    /// Port for the HTTP API
    #[arg(short, long, env = "PORT", default_value_t = 8846)]
    pub port: u16,

    /// How long a forwarded command waits for its result
    #[arg(long, env = "INVOCATION_TIMEOUT_MS", default_value_t = 10_000)]
    pub invocation_timeout_ms: u64,

    /// Snapshot characters embedded in the page instructions
    #[arg(long, env = "SNAPSHOT_LIMIT", default_value_t = DEFAULT_SNAPSHOT_LIMIT)]
    pub snapshot_limit: usize,

    /// Log level for the relay's own events; `RUST_LOG` overrides it
    #[arg(long, env = "LOG_LEVEL", value_enum, ignore_case = true, default_value_t = LogLevel::Info)]
    pub log_level: LogLevel,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Error => "error",
            Self::Warn => "warn",
            Self::Info => "info",
            Self::Debug => "debug",
            Self::Trace => "trace",
        }
    }
}

impl RelayArgs {
    pub fn relay_options(&self) -> RelayOptions {
        RelayOptions {
            invocation_timeout: Duration::from_millis(self.invocation_timeout_ms),
            snapshot_limit: self.snapshot_limit,
        }
    }

    pub fn http_addr(&self) -> Result<SocketAddr, RelayError> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .map_err(|e| RelayError::InvalidAddress(format!("{}:{}: {e}", self.host, self.port)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_override_defaults() {
        let args = RelayArgs::parse_from([
            "tabsnap-relay",
            "--port",
            "9000",
            "--invocation-timeout-ms",
            "250",
        ]);
        assert_eq!(args.port, 9000);
        assert_eq!(args.relay_options().invocation_timeout, Duration::from_millis(250));
        assert_eq!(args.http_addr().unwrap().port(), 9000);
    }

    #[test]
    fn log_level_is_case_insensitive() {
        let args = RelayArgs::parse_from(["tabsnap-relay", "--log-level", "TRACE"]);
        assert_eq!(args.log_level, LogLevel::Trace);
        assert!(RelayArgs::try_parse_from(["tabsnap-relay", "--log-level", "loud"]).is_err());
    }

    #[test]
    fn bad_host_is_rejected() {
        let args = RelayArgs::parse_from(["tabsnap-relay", "--host", "not a host"]);
        assert!(matches!(args.http_addr(), Err(RelayError::InvalidAddress(_))));
    }
}
