use std::net::SocketAddr;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use riptide::{
    ClientConfig, ConnectionState, ProxyDescriptor, ProxyKind, RpcError, StreamClient,
    SubscriptionHandler,
};
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;

const SUBSCRIPTION_ID: &str = "0xc0ffee";
const PUSHES: u64 = 3;

/// Minimal JSON-RPC node: answers `web3_clientVersion`, echoes params for
/// anything else and pushes a few heads after `eth_subscribe`.
async fn spawn_node() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind node");
    let addr = listener.local_addr().expect("node addr");
    tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            tokio::spawn(serve_node(socket));
        }
    });
    addr
}

async fn serve_node(socket: TcpStream) {
    let mut ws = tokio_tungstenite::accept_async(socket).await.expect("accept websocket");
    while let Some(message) = ws.next().await {
        let text = match message {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => continue,
        };
        let request: Value = serde_json::from_str(&text).expect("request json");
        let id = request["id"].clone();
        let result = match request["method"].as_str().unwrap_or_default() {
            "web3_clientVersion" => json!("riptide-node/0.1"),
            "eth_subscribe" => json!(SUBSCRIPTION_ID),
            "eth_unsubscribe" => json!(true),
            _ => request["params"].clone(),
        };
        let reply = json!({"jsonrpc": "2.0", "id": id, "result": result});
        if ws.send(Message::Text(reply.to_string())).await.is_err() {
            break;
        }
        if request["method"] == "eth_subscribe" {
            for number in 0..PUSHES {
                let push = json!({
                    "jsonrpc": "2.0",
                    "method": "eth_subscription",
                    "params": {"subscription": SUBSCRIPTION_ID, "result": {"number": number}},
                });
                if ws.send(Message::Text(push.to_string())).await.is_err() {
                    return;
                }
            }
        }
    }
}

/// SOCKS5 proxy that accepts one client and relays it to whatever it asks for.
async fn spawn_socks5_proxy() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind proxy");
    let addr = listener.local_addr().expect("proxy addr");
    tokio::spawn(async move {
        let (mut client, _) = listener.accept().await.expect("accept");
        let mut greeting = [0u8; 3];
        client.read_exact(&mut greeting).await.expect("greeting");
        assert_eq!(greeting, [5, 1, 0]);
        client.write_all(&[5, 0]).await.expect("method");

        let mut head = [0u8; 4];
        client.read_exact(&mut head).await.expect("request head");
        assert_eq!(head[..3], [5, 1, 0]);
        assert_eq!(head[3], 1, "expected an IPv4 target");
        let mut ip = [0u8; 4];
        client.read_exact(&mut ip).await.expect("ip");
        let port = client.read_u16().await.expect("port");

        let mut upstream = TcpStream::connect((std::net::Ipv4Addr::from(ip), port))
            .await
            .expect("upstream");
        client
            .write_all(&[5, 0, 0, 1, 0, 0, 0, 0, 0, 0])
            .await
            .expect("reply");
        let _ = tokio::io::copy_bidirectional(&mut client, &mut upstream).await;
    });
    addr
}

async fn exercise(client: &StreamClient) {
    assert!(client.is_connected().await);
    assert_eq!(client.state(), ConnectionState::Open);

    let reply = client
        .call("eth_getBalance", json!(["0xabc", "latest"]))
        .await
        .expect("call")
        .expect("envelope");
    assert_eq!(reply["result"], json!(["0xabc", "latest"]));

    let (handler, mut events) = SubscriptionHandler::channel();
    let subscription = client
        .subscribe(json!(["newHeads"]), handler)
        .await
        .expect("subscribe");
    assert_eq!(subscription, SUBSCRIPTION_ID);
    for number in 0..PUSHES {
        let event = events.recv().await.expect("push");
        assert_eq!(event.result, json!({"number": number}));
    }
    assert!(client.unsubscribe(&subscription).await.expect("unsubscribe"));

    client.stop().await;
    assert_eq!(client.state(), ConnectionState::Closed);
    assert!(matches!(
        client.call("net_version", json!([])).await,
        Err(RpcError::ConnectionClosed)
    ));
}

#[test_timeout::tokio_timeout_test(10)]
async fn talks_to_a_websocket_node() {
    let node = spawn_node().await;
    let config = ClientConfig::new(&format!("ws://{node}")).expect("config");
    exercise(&StreamClient::new(config)).await;
}

#[test_timeout::tokio_timeout_test(secs = 10, flavor = "multi_thread", workers = 2)]
async fn talks_to_a_websocket_node_through_socks5() {
    let node = spawn_node().await;
    let proxy = spawn_socks5_proxy().await;
    let config = ClientConfig::new(&format!("ws://{node}"))
        .expect("config")
        .with_proxy(ProxyDescriptor::new(
            ProxyKind::Socks5,
            proxy.ip().to_string(),
            proxy.port(),
        ));
    exercise(&StreamClient::new(config)).await;
}

#[test_timeout::tokio_timeout_test(10)]
async fn refused_endpoint_is_not_connected() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    drop(listener);

    let client = StreamClient::new(ClientConfig::new(&format!("ws://{addr}")).expect("config"));
    assert!(!client.is_connected().await);
    assert_eq!(client.state(), ConnectionState::Failed);
}

#[test_timeout::tokio_timeout_test(10)]
async fn silent_proxy_hits_connect_timeout() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let proxy = listener.local_addr().expect("addr");
    let hold = tokio::spawn(async move {
        let (socket, _) = listener.accept().await.expect("accept");
        tokio::time::sleep(Duration::from_secs(5)).await;
        drop(socket);
    });

    let config = ClientConfig::new("wss://node.invalid/ws")
        .expect("config")
        .with_proxy(ProxyDescriptor::new(ProxyKind::Http, proxy.ip().to_string(), proxy.port()))
        .with_connect_timeout(Duration::from_millis(200))
        .expect("timeout");
    let client = StreamClient::new(config);

    match client.start().await {
        Err(RpcError::Connection(reason)) => assert!(reason.contains("timed out"), "{reason}"),
        other => panic!("unexpected outcome {other:?}"),
    }
    assert_eq!(client.state(), ConnectionState::Failed);
    hold.abort();
}

#[test_timeout::tokio_timeout_test(10)]
async fn rejecting_proxy_surfaces_proxy_error() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let proxy = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.expect("accept");
        let mut buf = [0u8; 512];
        let _ = socket.read(&mut buf).await;
        let _ = socket
            .write_all(b"HTTP/1.1 403 Forbidden\r\nContent-Length: 0\r\n\r\n")
            .await;
    });

    let config = ClientConfig::new("wss://node.invalid/ws")
        .expect("config")
        .with_proxy(ProxyDescriptor::new(ProxyKind::Http, proxy.ip().to_string(), proxy.port()));
    let client = StreamClient::new(config);
    assert!(matches!(
        client.start().await,
        Err(RpcError::ProxyConnect(riptide_tunnel::TunnelError::Rejected { .. }))
    ));
}
