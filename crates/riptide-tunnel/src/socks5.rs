use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::{ProxyKind, TargetAddr, TunnelError, TunnelResult};

pub(crate) const VERSION: u8 = 0x05;
const METHOD_NO_AUTH: u8 = 0x00;
const METHOD_NONE_ACCEPTABLE: u8 = 0xff;
const CMD_CONNECT: u8 = 0x01;
const RESERVED: u8 = 0x00;
const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;
const REPLY_SUCCEEDED: u8 = 0x00;

pub(crate) async fn handshake<S>(stream: &mut S, target: &TargetAddr, port: u16) -> TunnelResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    negotiate_method(stream).await?;

    let mut request = vec![VERSION, CMD_CONNECT, RESERVED];
    match target {
        TargetAddr::V4(ip) => {
            request.push(ATYP_IPV4);
            request.extend_from_slice(&ip.octets());
        }
        TargetAddr::V6(ip) => {
            request.push(ATYP_IPV6);
            request.extend_from_slice(&ip.octets());
        }
        TargetAddr::Domain(name) => {
            let len = u8::try_from(name.len()).map_err(|_| {
                TunnelError::Unsupported(format!("hostname {name} exceeds 255 bytes"))
            })?;
            request.push(ATYP_DOMAIN);
            request.push(len);
            request.extend_from_slice(name.as_bytes());
        }
    }
    request.extend_from_slice(&port.to_be_bytes());
    stream.write_all(&request).await?;
    stream.flush().await?;

    let mut head = [0u8; 4];
    stream.read_exact(&mut head).await?;
    if head[0] != VERSION {
        return Err(protocol(format!("unexpected reply version {:#04x}", head[0])));
    }
    if head[1] != REPLY_SUCCEEDED {
        return Err(TunnelError::Rejected {
            kind: ProxyKind::Socks5,
            reason: reason(head[1]).to_string(),
        });
    }

    // The bound address is of no use to us, but it has to be drained before
    // the stream carries tunneled bytes.
    let addr_len = match head[3] {
        ATYP_IPV4 => 4,
        ATYP_IPV6 => 16,
        ATYP_DOMAIN => usize::from(stream.read_u8().await?),
        other => return Err(protocol(format!("unknown bound address type {other:#04x}"))),
    };
    let mut bound = vec![0u8; addr_len + 2];
    stream.read_exact(&mut bound).await?;
    Ok(())
}

async fn negotiate_method<S>(stream: &mut S) -> TunnelResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream.write_all(&[VERSION, 1, METHOD_NO_AUTH]).await?;
    stream.flush().await?;

    let mut choice = [0u8; 2];
    stream.read_exact(&mut choice).await?;
    if choice[0] != VERSION {
        return Err(protocol(format!(
            "unexpected method selection version {:#04x}",
            choice[0]
        )));
    }
    match choice[1] {
        METHOD_NO_AUTH => Ok(()),
        METHOD_NONE_ACCEPTABLE => Err(TunnelError::Rejected {
            kind: ProxyKind::Socks5,
            reason: "no acceptable authentication method".into(),
        }),
        other => Err(protocol(format!(
            "proxy selected authentication method {other:#04x} that was not offered"
        ))),
    }
}

fn protocol(detail: String) -> TunnelError {
    TunnelError::Protocol {
        kind: ProxyKind::Socks5,
        detail,
    }
}

fn reason(code: u8) -> &'static str {
    match code {
        0x01 => "general SOCKS server failure",
        0x02 => "connection not allowed by ruleset",
        0x03 => "network unreachable",
        0x04 => "host unreachable",
        0x05 => "connection refused",
        0x06 => "TTL expired",
        0x07 => "command not supported",
        0x08 => "address type not supported",
        _ => "unknown reply code",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv6Addr;
    use tokio::io::duplex;

    #[tokio::test]
    async fn drains_domain_bound_address() {
        let (mut client, mut proxy) = duplex(512);
        let server = tokio::spawn(async move {
            let mut greeting = [0u8; 3];
            proxy.read_exact(&mut greeting).await.expect("greeting");
            proxy.write_all(&[VERSION, METHOD_NO_AUTH]).await.expect("choice");

            let mut request = [0u8; 4 + 16 + 2];
            proxy.read_exact(&mut request).await.expect("request");

            let mut reply = vec![VERSION, REPLY_SUCCEEDED, RESERVED, ATYP_DOMAIN, 5];
            reply.extend_from_slice(b"relay");
            reply.extend_from_slice(&443u16.to_be_bytes());
            reply.extend_from_slice(b"tunneled");
            proxy.write_all(&reply).await.expect("reply");
            request
        });

        let target = TargetAddr::V6(Ipv6Addr::LOCALHOST);
        handshake(&mut client, &target, 443).await.expect("handshake");

        let mut rest = [0u8; 8];
        client.read_exact(&mut rest).await.expect("tunneled bytes");
        assert_eq!(&rest, b"tunneled");

        let request = server.await.expect("server");
        assert_eq!(&request[..4], &[VERSION, CMD_CONNECT, RESERVED, ATYP_IPV6]);
        assert_eq!(&request[4..20], &Ipv6Addr::LOCALHOST.octets());
        assert_eq!(&request[20..], &443u16.to_be_bytes());
    }

    #[tokio::test]
    async fn refuses_unoffered_auth_method() {
        let (mut client, mut proxy) = duplex(64);
        tokio::spawn(async move {
            let mut greeting = [0u8; 3];
            proxy.read_exact(&mut greeting).await.expect("greeting");
            proxy.write_all(&[VERSION, 0x02]).await.expect("choice");
        });

        let target = TargetAddr::Domain("node".into());
        let err = handshake(&mut client, &target, 8546).await.expect_err("protocol");
        assert!(matches!(err, TunnelError::Protocol { kind: ProxyKind::Socks5, .. }));
    }
}
