use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{client_async_tls_with_config, connect_async_with_config, WebSocketStream};
use tracing::{debug, trace};

use super::{Connector, FrameSink, FrameStream, Transport, TransportError};
use crate::config::{ClientConfig, TransportOptions};
use crate::error::{RpcError, RpcResult};

/// Connects with tokio-tungstenite, through the configured proxy when there
/// is one. TLS for `wss` endpoints runs over the tunnel with the endpoint
/// host as SNI.
#[derive(Debug, Default, Clone, Copy)]
pub struct WsConnector;

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, config: &ClientConfig) -> RpcResult<Transport> {
        let limit = config.connect_timeout();
        match tokio::time::timeout(limit, handshake(config)).await {
            Ok(result) => result,
            Err(_) => Err(RpcError::Connection(format!(
                "timed out after {limit:?} connecting to {}",
                config.endpoint()
            ))),
        }
    }
}

async fn handshake(config: &ClientConfig) -> RpcResult<Transport> {
    let request = build_request(config)?;
    let ws_config = Some(websocket_config(config.transport_options()));

    match config.proxy() {
        None => {
            let (stream, response) = connect_async_with_config(request, ws_config, true)
                .await
                .map_err(|err| handshake_error(config, err))?;
            debug!(
                target: "riptide::connection",
                endpoint = %config.endpoint(),
                status = %response.status(),
                "websocket handshake complete"
            );
            Ok(split(stream))
        }
        Some(proxy) => {
            let (host, port) = config.proxy_target()?;
            let socket = riptide_tunnel::build(proxy, &host, port).await?;
            let (stream, response) = client_async_tls_with_config(request, socket, ws_config, None)
                .await
                .map_err(|err| handshake_error(config, err))?;
            debug!(
                target: "riptide::connection",
                endpoint = %config.endpoint(),
                proxy = %proxy,
                status = %response.status(),
                "websocket handshake complete through proxy"
            );
            Ok(split(stream))
        }
    }
}

fn build_request(config: &ClientConfig) -> RpcResult<Request> {
    let mut request = config
        .endpoint()
        .as_str()
        .into_client_request()
        .map_err(|err| RpcError::Validation(format!("{}: {err}", config.endpoint())))?;
    for (name, value) in &config.transport_options().headers {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|err| RpcError::Validation(format!("header name '{name}': {err}")))?;
        let value = HeaderValue::from_str(value)
            .map_err(|err| RpcError::Validation(format!("header '{name}' value: {err}")))?;
        request.headers_mut().insert(name, value);
    }
    Ok(request)
}

fn websocket_config(options: &TransportOptions) -> WebSocketConfig {
    let mut config = WebSocketConfig::default();
    if let Some(size) = options.max_message_size {
        config.max_message_size = Some(size);
    }
    if let Some(size) = options.max_frame_size {
        config.max_frame_size = Some(size);
    }
    if let Some(size) = options.write_buffer_size {
        config.write_buffer_size = size;
    }
    if let Some(size) = options.max_write_buffer_size {
        config.max_write_buffer_size = size;
    }
    config
}

fn handshake_error(config: &ClientConfig, err: tokio_tungstenite::tungstenite::Error) -> RpcError {
    RpcError::Connection(format!("{}: {err}", config.endpoint()))
}

fn split<S>(stream: WebSocketStream<S>) -> Transport
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (sink, stream) = stream.split();
    (Box::new(WsSink { inner: sink }), Box::new(WsStream { inner: stream }))
}

struct WsSink<S> {
    inner: SplitSink<WebSocketStream<S>, Message>,
}

#[async_trait]
impl<S> FrameSink for WsSink<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn send(&mut self, frame: String) -> Result<(), TransportError> {
        self.inner.send(Message::Text(frame)).await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.inner.close().await?;
        Ok(())
    }
}

struct WsStream<S> {
    inner: SplitStream<WebSocketStream<S>>,
}

#[async_trait]
impl<S> FrameStream for WsStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn recv(&mut self) -> Option<Result<Vec<u8>, TransportError>> {
        loop {
            match self.inner.next().await? {
                Ok(Message::Text(text)) => return Some(Ok(text.into_bytes())),
                Ok(Message::Binary(bytes)) => return Some(Ok(bytes)),
                Ok(Message::Close(frame)) => {
                    debug!(target: "riptide::connection", ?frame, "peer sent close frame");
                    return None;
                }
                Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_)) => {
                    trace!(target: "riptide::connection", "skipping control frame");
                }
                Err(err) => return Some(Err(err.into())),
            }
        }
    }
}
