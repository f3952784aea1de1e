use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::{ProxyKind, TargetAddr, TunnelError, TunnelResult};

const MAX_RESPONSE_HEAD: usize = 8 * 1024;
const HEAD_TERMINATOR: &[u8] = b"\r\n\r\n";

pub(crate) async fn handshake<S>(stream: &mut S, target: &TargetAddr, port: u16) -> TunnelResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let authority = target.authority(port);
    let request = format!("CONNECT {authority} HTTP/1.1\r\nHost: {authority}\r\n\r\n");
    stream.write_all(request.as_bytes()).await?;
    stream.flush().await?;

    let head = read_response_head(stream).await?;
    let status_line = head.lines().next().unwrap_or_default().trim().to_string();
    let status = parse_status(&status_line)?;
    if (200..300).contains(&status) {
        Ok(())
    } else {
        Err(TunnelError::Rejected {
            kind: ProxyKind::Http,
            reason: status_line,
        })
    }
}

/// Reads one byte at a time so nothing past the blank line is consumed.
async fn read_response_head<S>(stream: &mut S) -> TunnelResult<String>
where
    S: AsyncRead + Unpin,
{
    let mut head = Vec::with_capacity(128);
    let mut byte = [0u8; 1];
    while !head.ends_with(HEAD_TERMINATOR) {
        if head.len() >= MAX_RESPONSE_HEAD {
            return Err(protocol(format!(
                "response head exceeds {MAX_RESPONSE_HEAD} bytes"
            )));
        }
        if stream.read(&mut byte).await? == 0 {
            return Err(protocol("proxy closed the connection before answering CONNECT".into()));
        }
        head.push(byte[0]);
    }
    String::from_utf8(head).map_err(|_| protocol("response head is not valid UTF-8".into()))
}

fn parse_status(status_line: &str) -> TunnelResult<u16> {
    let mut parts = status_line.split_whitespace();
    let version = parts.next().unwrap_or_default();
    if !version.starts_with("HTTP/1.") {
        return Err(protocol(format!("unexpected status line {status_line:?}")));
    }
    parts
        .next()
        .and_then(|code| code.parse::<u16>().ok())
        .ok_or_else(|| protocol(format!("missing status code in {status_line:?}")))
}

fn protocol(detail: String) -> TunnelError {
    TunnelError::Protocol {
        kind: ProxyKind::Http,
        detail,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_status_codes() {
        assert_eq!(parse_status("HTTP/1.1 200 Connection established").expect("200"), 200);
        assert_eq!(parse_status("HTTP/1.0 407 Proxy Authentication Required").expect("407"), 407);
        assert!(parse_status("SSH-2.0-OpenSSH").is_err());
        assert!(parse_status("HTTP/1.1").is_err());
    }

    #[tokio::test]
    async fn rejects_oversized_heads() {
        let (mut client, mut proxy) = tokio::io::duplex(MAX_RESPONSE_HEAD * 2);
        let writer = tokio::spawn(async move {
            let mut buf = [0u8; 256];
            let _ = proxy.read(&mut buf).await;
            let junk = vec![b'a'; MAX_RESPONSE_HEAD + 16];
            let _ = proxy.write_all(&junk).await;
            proxy
        });

        let target = TargetAddr::Domain("node".into());
        let err = handshake(&mut client, &target, 443).await.expect_err("too large");
        assert!(matches!(err, TunnelError::Protocol { kind: ProxyKind::Http, .. }));
        drop(writer);
    }
}
