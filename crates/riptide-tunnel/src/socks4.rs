use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::{ProxyKind, TargetAddr, TunnelError, TunnelResult};

pub(crate) const VERSION: u8 = 0x04;
const CMD_CONNECT: u8 = 0x01;
const REPLY_VERSION: u8 = 0x00;
const GRANTED: u8 = 0x5a;
/// SOCKS4a marker address: 0.0.0.x with x != 0 means "hostname follows".
const SOCKS4A_MARKER: [u8; 4] = [0, 0, 0, 1];

pub(crate) async fn handshake<S>(stream: &mut S, target: &TargetAddr, port: u16) -> TunnelResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut request = Vec::with_capacity(16);
    request.extend_from_slice(&[VERSION, CMD_CONNECT]);
    request.extend_from_slice(&port.to_be_bytes());
    match target {
        TargetAddr::V4(ip) => {
            request.extend_from_slice(&ip.octets());
            // empty user id
            request.push(0);
        }
        TargetAddr::Domain(name) => {
            request.extend_from_slice(&SOCKS4A_MARKER);
            request.push(0);
            request.extend_from_slice(name.as_bytes());
            request.push(0);
        }
        TargetAddr::V6(ip) => {
            return Err(TunnelError::Unsupported(format!(
                "socks4 cannot address IPv6 target {ip}"
            )));
        }
    }
    stream.write_all(&request).await?;
    stream.flush().await?;

    let mut reply = [0u8; 8];
    stream.read_exact(&mut reply).await?;
    if reply[0] != REPLY_VERSION {
        return Err(TunnelError::Protocol {
            kind: ProxyKind::Socks4,
            detail: format!("unexpected reply version {:#04x}", reply[0]),
        });
    }
    match reply[1] {
        GRANTED => Ok(()),
        code => Err(TunnelError::Rejected {
            kind: ProxyKind::Socks4,
            reason: reason(code).to_string(),
        }),
    }
}

fn reason(code: u8) -> &'static str {
    match code {
        0x5b => "request rejected or failed",
        0x5c => "request rejected: proxy could not reach identd on the client",
        0x5d => "request rejected: identd reported a different user id",
        _ => "unknown reply code",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use tokio::io::duplex;

    #[tokio::test]
    async fn writes_socks4a_request_for_hostnames() {
        let (mut client, mut proxy) = duplex(256);
        let server = tokio::spawn(async move {
            let mut head = [0u8; 9];
            proxy.read_exact(&mut head).await.expect("head");
            let mut name = Vec::new();
            loop {
                let byte = proxy.read_u8().await.expect("name byte");
                if byte == 0 {
                    break;
                }
                name.push(byte);
            }
            proxy
                .write_all(&[0, GRANTED, 0, 0, 0, 0, 0, 0])
                .await
                .expect("reply");
            (head, name)
        });

        let target = TargetAddr::Domain("node.example".into());
        handshake(&mut client, &target, 8546).await.expect("handshake");

        let (head, name) = server.await.expect("server");
        assert_eq!(&head[..4], &[VERSION, CMD_CONNECT, 0x21, 0x62]);
        assert_eq!(&head[4..8], &SOCKS4A_MARKER);
        assert_eq!(head[8], 0);
        assert_eq!(name, b"node.example");
    }

    #[tokio::test]
    async fn maps_reply_codes_to_rejections() {
        let (mut client, mut proxy) = duplex(256);
        tokio::spawn(async move {
            let mut head = [0u8; 9];
            proxy.read_exact(&mut head).await.expect("head");
            proxy
                .write_all(&[0, 0x5d, 0, 0, 0, 0, 0, 0])
                .await
                .expect("reply");
        });

        let target = TargetAddr::V4(Ipv4Addr::new(127, 0, 0, 1));
        let err = handshake(&mut client, &target, 80).await.expect_err("rejected");
        match err {
            TunnelError::Rejected { kind, reason } => {
                assert_eq!(kind, ProxyKind::Socks4);
                assert!(reason.contains("identd"));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }
}
