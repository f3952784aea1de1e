use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use riptide::config::{
    CONNECT_TIMEOUT_ENV, DEFAULT_ENDPOINT, ENDPOINT_ENV, PROXY_ENV, REQUEST_TIMEOUT_ENV,
};
use riptide::{ClientConfig, ProxyDescriptor};
use serde_json::Value;

use crate::logging::{LogConfig, LogLevel};

#[derive(Parser, Debug)]
#[command(name = "riptide-probe", version, about = "Probe a JSON-RPC WebSocket endpoint")]
pub struct Cli {
    #[command(flatten)]
    pub connection: ConnectionArgs,

    #[command(flatten)]
    pub logging: LoggingArgs,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Args, Debug, Clone)]
pub struct ConnectionArgs {
    #[arg(
        long,
        global = true,
        env = ENDPOINT_ENV,
        default_value = DEFAULT_ENDPOINT,
        help = "WebSocket endpoint (http(s) URLs are rewritten to ws(s))"
    )]
    pub endpoint: String,

    #[arg(
        long,
        global = true,
        env = PROXY_ENV,
        value_name = "URL",
        help = "Tunnel through a proxy, e.g. socks5://127.0.0.1:9050 or http://proxy:3128"
    )]
    pub proxy: Option<ProxyDescriptor>,

    #[arg(
        long = "connect-timeout",
        global = true,
        env = CONNECT_TIMEOUT_ENV,
        value_name = "SECS",
        default_value_t = 10
    )]
    pub connect_timeout: u64,

    #[arg(
        long = "request-timeout",
        global = true,
        env = REQUEST_TIMEOUT_ENV,
        value_name = "SECS",
        default_value_t = 10
    )]
    pub request_timeout: u64,

    #[arg(
        long = "transport-option",
        short = 'o',
        global = true,
        value_name = "KEY=VALUE",
        value_parser = parse_key_value,
        help = "Transport override such as max_message_size=1048576 or header.X-Api-Key=..."
    )]
    pub transport_options: Vec<(String, String)>,
}

impl ConnectionArgs {
    pub fn to_config(&self) -> Result<ClientConfig> {
        let mut config = ClientConfig::new(&self.endpoint)
            .with_context(|| format!("invalid endpoint {}", self.endpoint))?
            .with_connect_timeout(Duration::from_secs(self.connect_timeout))?
            .with_request_timeout(Duration::from_secs(self.request_timeout))?;
        if let Some(proxy) = &self.proxy {
            config = config.with_proxy(proxy.clone());
        }
        for (key, value) in &self.transport_options {
            config = config.with_transport_option(key, value)?;
        }
        Ok(config)
    }
}

#[derive(Args, Debug, Clone)]
pub struct LoggingArgs {
    #[arg(
        long = "log-level",
        value_enum,
        global = true,
        env = "RIPTIDE_LOG_LEVEL",
        default_value_t = LogLevel::Warn,
        help = "Minimum log level (error, warn, info, debug, trace)"
    )]
    pub level: LogLevel,

    #[arg(
        long = "log-file",
        value_name = "PATH",
        global = true,
        env = "RIPTIDE_LOG_FILE",
        help = "Write logs to the specified file instead of stderr"
    )]
    pub file: Option<PathBuf>,
}

impl LoggingArgs {
    pub fn to_config(&self) -> LogConfig {
        LogConfig {
            level: self.level,
            file: self.file.clone(),
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Check that the endpoint answers web3_clientVersion
    Ping,
    /// Send one request and print the reply
    Call(CallArgs),
    /// Subscribe and print pushes as they arrive
    Subscribe(SubscribeArgs),
}

#[derive(Args, Debug)]
pub struct CallArgs {
    pub method: String,

    #[arg(value_name = "PARAMS_JSON", default_value = "[]", value_parser = parse_json)]
    pub params: Value,

    #[arg(long, help = "Print only the result and fail on server errors")]
    pub strict: bool,
}

#[derive(Args, Debug)]
pub struct SubscribeArgs {
    #[arg(value_name = "PARAMS_JSON", value_parser = parse_json, help = "e.g. '[\"newHeads\"]'")]
    pub params: Value,

    #[arg(long, short = 'n', value_name = "N", help = "Stop after N pushes")]
    pub count: Option<usize>,
}

fn parse_json(raw: &str) -> Result<Value> {
    serde_json::from_str(raw).with_context(|| format!("not valid JSON: {raw}"))
}

fn parse_key_value(raw: &str) -> Result<(String, String)> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| anyhow!("expected KEY=VALUE, got '{raw}'"))?;
    if key.is_empty() {
        return Err(anyhow!("empty key in '{raw}'"));
    }
    Ok((key.to_string(), value.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use riptide::ProxyKind;
    use serde_json::json;

    #[test]
    fn parses_call_with_connection_flags() {
        let cli = Cli::try_parse_from([
            "riptide-probe",
            "--endpoint",
            "wss://node.example/ws",
            "--proxy",
            "socks5://127.0.0.1:9050",
            "-o",
            "header.X-Api-Key=abc",
            "call",
            "eth_getBalance",
            r#"["0xabc","latest"]"#,
        ])
        .expect("parse");

        match &cli.command {
            Command::Call(args) => {
                assert_eq!(args.method, "eth_getBalance");
                assert_eq!(args.params, json!(["0xabc", "latest"]));
                assert!(!args.strict);
            }
            other => panic!("unexpected command {other:?}"),
        }
        let config = cli.connection.to_config().expect("config");
        assert_eq!(config.endpoint().as_str(), "wss://node.example/ws");
        assert_eq!(config.proxy().map(|proxy| proxy.kind), Some(ProxyKind::Socks5));
        assert_eq!(
            config.transport_options().headers,
            vec![("x-api-key".to_string(), "abc".to_string())]
        );
    }

    #[test]
    fn call_params_default_to_empty_list() {
        let cli = Cli::try_parse_from(["riptide-probe", "call", "net_version"]).expect("parse");
        match cli.command {
            Command::Call(args) => assert_eq!(args.params, json!([])),
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn rejects_malformed_input() {
        assert!(Cli::try_parse_from(["riptide-probe", "subscribe", "[newHeads"]).is_err());
        assert!(Cli::try_parse_from(["riptide-probe", "-o", "novalue", "ping"]).is_err());
        assert!(Cli::try_parse_from(["riptide-probe", "--proxy", "ftp://x", "ping"]).is_err());
    }

    #[test]
    fn reserved_transport_options_fail_config() {
        let cli = Cli::try_parse_from(["riptide-probe", "-o", "sock=1", "ping"]).expect("parse");
        assert!(cli.connection.to_config().is_err());
    }
}
