use std::env;
use std::time::Duration;

use riptide_tunnel::ProxyDescriptor;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use url::Url;

use crate::error::{RpcError, RpcResult};

pub const DEFAULT_ENDPOINT: &str = "ws://127.0.0.1:8546";
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Transport option names the client fills in itself.
pub const RESERVED_TRANSPORT_OPTIONS: &[&str] = &["uri", "sock", "server_hostname", "loop"];

const HEADER_PREFIX: &str = "header.";
/// Handshake headers owned by the WebSocket upgrade.
const RESERVED_HEADERS: &[&str] = &["host", "connection", "upgrade"];

pub const ENDPOINT_ENV: &str = "WEB3_WS_PROVIDER_URI";
pub const PROXY_ENV: &str = "RIPTIDE_PROXY";
pub const CONNECT_TIMEOUT_ENV: &str = "RIPTIDE_CONNECT_TIMEOUT_SECS";
pub const REQUEST_TIMEOUT_ENV: &str = "RIPTIDE_REQUEST_TIMEOUT_SECS";

/// Everything a [`StreamClient`](crate::StreamClient) needs to reach its
/// endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    endpoint: Url,
    proxy: Option<ProxyDescriptor>,
    connect_timeout: Duration,
    request_timeout: Duration,
    transport_options: TransportOptions,
}

impl ClientConfig {
    /// Accepts `ws://` and `wss://` endpoints; `http(s)://` is rewritten to
    /// the matching WebSocket scheme.
    pub fn new(endpoint: &str) -> RpcResult<Self> {
        Ok(Self {
            endpoint: normalize_endpoint(endpoint)?,
            proxy: None,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            transport_options: TransportOptions::default(),
        })
    }

    pub fn from_env() -> RpcResult<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub(crate) fn from_lookup<F>(lookup: F) -> RpcResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        let endpoint = var(ENDPOINT_ENV).unwrap_or_else(|| DEFAULT_ENDPOINT.to_string());
        let mut config = Self::new(endpoint.trim())?;
        if let Some(proxy) = var(PROXY_ENV) {
            let proxy = ProxyDescriptor::parse(proxy.trim())
                .map_err(|err| RpcError::Validation(format!("{PROXY_ENV}: {err}")))?;
            config = config.with_proxy(proxy);
        }
        if let Some(secs) = var(CONNECT_TIMEOUT_ENV) {
            config = config.with_connect_timeout(parse_secs(CONNECT_TIMEOUT_ENV, &secs)?)?;
        }
        if let Some(secs) = var(REQUEST_TIMEOUT_ENV) {
            config = config.with_request_timeout(parse_secs(REQUEST_TIMEOUT_ENV, &secs)?)?;
        }
        Ok(config)
    }

    pub fn with_proxy(mut self, proxy: ProxyDescriptor) -> Self {
        self.proxy = Some(proxy);
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> RpcResult<Self> {
        self.connect_timeout = non_zero("connect_timeout", timeout)?;
        Ok(self)
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> RpcResult<Self> {
        self.request_timeout = non_zero("request_timeout", timeout)?;
        Ok(self)
    }

    pub fn with_transport_option(mut self, key: &str, value: &str) -> RpcResult<Self> {
        self.transport_options.set(key, value)?;
        Ok(self)
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    pub fn proxy(&self) -> Option<&ProxyDescriptor> {
        self.proxy.as_ref()
    }

    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    pub fn transport_options(&self) -> &TransportOptions {
        &self.transport_options
    }

    /// Host and port the proxy is asked to tunnel to: the endpoint's explicit
    /// port, otherwise 443 for `wss` and 80 for `ws`.
    pub fn proxy_target(&self) -> RpcResult<(String, u16)> {
        let host = self
            .endpoint
            .host_str()
            .ok_or_else(|| RpcError::Validation(format!("{} has no host", self.endpoint)))?;
        let port = self
            .endpoint
            .port_or_known_default()
            .ok_or_else(|| RpcError::Validation(format!("{} has no port", self.endpoint)))?;
        Ok((host.to_string(), port))
    }
}

/// Named overrides applied to the WebSocket transport.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransportOptions {
    pub max_message_size: Option<usize>,
    pub max_frame_size: Option<usize>,
    pub write_buffer_size: Option<usize>,
    pub max_write_buffer_size: Option<usize>,
    pub headers: Vec<(String, String)>,
}

impl TransportOptions {
    pub fn set(&mut self, key: &str, value: &str) -> RpcResult<()> {
        if RESERVED_TRANSPORT_OPTIONS.contains(&key) {
            return Err(RpcError::Validation(format!(
                "transport option '{key}' is managed by the client and cannot be overridden"
            )));
        }
        if let Some(name) = key.strip_prefix(HEADER_PREFIX) {
            return self.set_header(name, value);
        }
        let slot = match key {
            "max_message_size" => &mut self.max_message_size,
            "max_frame_size" => &mut self.max_frame_size,
            "write_buffer_size" => &mut self.write_buffer_size,
            "max_write_buffer_size" => &mut self.max_write_buffer_size,
            other => {
                return Err(RpcError::Validation(format!(
                    "unknown transport option '{other}'"
                )))
            }
        };
        let size = value.trim().parse::<usize>().map_err(|err| {
            RpcError::Validation(format!("transport option '{key}' = '{value}': {err}"))
        })?;
        *slot = Some(size);
        Ok(())
    }

    fn set_header(&mut self, name: &str, value: &str) -> RpcResult<()> {
        let header = HeaderName::from_bytes(name.as_bytes())
            .map_err(|err| RpcError::Validation(format!("header name '{name}': {err}")))?;
        let lowered = header.as_str();
        if RESERVED_HEADERS.contains(&lowered) || lowered.starts_with("sec-websocket-") {
            return Err(RpcError::Validation(format!(
                "header '{name}' is set by the WebSocket handshake"
            )));
        }
        HeaderValue::from_str(value)
            .map_err(|err| RpcError::Validation(format!("header '{name}' value: {err}")))?;
        self.headers.retain(|(existing, _)| existing != lowered);
        self.headers.push((lowered.to_string(), value.to_string()));
        Ok(())
    }
}

fn normalize_endpoint(endpoint: &str) -> RpcResult<Url> {
    let mut url = Url::parse(endpoint)
        .map_err(|err| RpcError::Validation(format!("endpoint '{endpoint}': {err}")))?;
    let scheme = match url.scheme() {
        "ws" | "wss" => None,
        "http" => Some("ws"),
        "https" => Some("wss"),
        other => {
            return Err(RpcError::Validation(format!(
                "endpoint '{endpoint}': unsupported scheme '{other}'"
            )))
        }
    };
    if let Some(scheme) = scheme {
        url.set_scheme(scheme).map_err(|()| {
            RpcError::Validation(format!("endpoint '{endpoint}': cannot switch to {scheme}"))
        })?;
    }
    if url.host_str().map_or(true, str::is_empty) {
        return Err(RpcError::Validation(format!("endpoint '{endpoint}' has no host")));
    }
    Ok(url)
}

fn parse_secs(key: &str, value: &str) -> RpcResult<Duration> {
    value
        .trim()
        .parse::<u64>()
        .map(Duration::from_secs)
        .map_err(|err| RpcError::Validation(format!("{key}='{value}': {err}")))
}

fn non_zero(name: &str, timeout: Duration) -> RpcResult<Duration> {
    if timeout.is_zero() {
        Err(RpcError::Validation(format!("{name} must be greater than zero")))
    } else {
        Ok(timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use riptide_tunnel::ProxyKind;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn defaults_without_env() {
        let config = ClientConfig::from_lookup(lookup(&[])).expect("config");
        assert_eq!(config.endpoint().as_str(), "ws://127.0.0.1:8546/");
        assert!(config.proxy().is_none());
        assert_eq!(config.connect_timeout(), DEFAULT_CONNECT_TIMEOUT);
        assert_eq!(config.request_timeout(), DEFAULT_REQUEST_TIMEOUT);
    }

    #[test]
    fn reads_overrides_from_env() {
        let config = ClientConfig::from_lookup(lookup(&[
            (ENDPOINT_ENV, "wss://mainnet.example/ws"),
            (PROXY_ENV, "socks5://127.0.0.1:9050"),
            (CONNECT_TIMEOUT_ENV, "3"),
            (REQUEST_TIMEOUT_ENV, " 30 "),
        ]))
        .expect("config");
        assert_eq!(config.endpoint().as_str(), "wss://mainnet.example/ws");
        assert_eq!(
            config.proxy(),
            Some(&ProxyDescriptor::new(ProxyKind::Socks5, "127.0.0.1", 9050))
        );
        assert_eq!(config.connect_timeout(), Duration::from_secs(3));
        assert_eq!(config.request_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn invalid_env_values_are_validation_errors() {
        let err = ClientConfig::from_lookup(lookup(&[(REQUEST_TIMEOUT_ENV, "soon")]))
            .expect_err("bad timeout");
        assert!(matches!(err, RpcError::Validation(_)));

        let err = ClientConfig::from_lookup(lookup(&[(CONNECT_TIMEOUT_ENV, "0")]))
            .expect_err("zero timeout");
        assert!(matches!(err, RpcError::Validation(_)));

        let err = ClientConfig::from_lookup(lookup(&[(PROXY_ENV, "ftp://proxy")]))
            .expect_err("bad proxy");
        assert!(matches!(err, RpcError::Validation(_)));
    }

    #[test]
    fn http_endpoints_become_websocket_endpoints() {
        let plain = ClientConfig::new("http://node.local:8546").expect("http");
        assert_eq!(plain.endpoint().scheme(), "ws");
        let tls = ClientConfig::new("https://node.example/rpc").expect("https");
        assert_eq!(tls.endpoint().as_str(), "wss://node.example/rpc");

        assert!(matches!(
            ClientConfig::new("ipc:///tmp/geth.ipc"),
            Err(RpcError::Validation(_))
        ));
        assert!(ClientConfig::new("not an endpoint").is_err());
    }

    #[test]
    fn proxy_target_follows_endpoint_port() {
        let explicit = ClientConfig::new("wss://node.example:8443/ws").expect("config");
        assert_eq!(explicit.proxy_target().expect("target"), ("node.example".into(), 8443));

        let tls = ClientConfig::new("wss://node.example/ws").expect("config");
        assert_eq!(tls.proxy_target().expect("target").1, 443);

        let plain = ClientConfig::new("ws://node.example").expect("config");
        assert_eq!(plain.proxy_target().expect("target").1, 80);
    }

    #[test]
    fn transport_options_reject_reserved_and_unknown_names() {
        let mut options = TransportOptions::default();
        for reserved in RESERVED_TRANSPORT_OPTIONS {
            assert!(matches!(
                options.set(reserved, "x"),
                Err(RpcError::Validation(_))
            ));
        }
        assert!(matches!(
            options.set("compression", "deflate"),
            Err(RpcError::Validation(_))
        ));
        assert!(matches!(
            options.set("max_message_size", "lots"),
            Err(RpcError::Validation(_))
        ));
        assert!(matches!(
            options.set("header.Sec-WebSocket-Key", "abc"),
            Err(RpcError::Validation(_))
        ));
        assert_eq!(options, TransportOptions::default());
    }

    #[test]
    fn transport_options_record_sizes_and_headers() {
        let config = ClientConfig::new("ws://node.local")
            .expect("config")
            .with_transport_option("max_message_size", "1048576")
            .expect("size")
            .with_transport_option("header.X-Api-Key", "first")
            .expect("header")
            .with_transport_option("header.x-api-key", "second")
            .expect("header override");
        let options = config.transport_options();
        assert_eq!(options.max_message_size, Some(1 << 20));
        assert_eq!(options.headers, vec![("x-api-key".to_string(), "second".to_string())]);
    }
}
