//! SOCKS5 (RFC 1928) support for the Port Forwarding Manager.
//!
//! Two directions:
//!  - "Dialing": acting as a SOCKS5/HTTP CONNECT *client* to reach the SSH
//!    server itself through a user-configured proxy (`ProxyConfig::Socks5`/
//!    `Http` on [`crate::transport::ConnectConfig`]).
//!  - "Accepting": acting as a SOCKS5 *server* for DYNAMIC port-forward rules,
//!    where a local tool (a browser, `curl --socks5`, ...) dials us and tells
//!    us, via the CONNECT request, what it actually wants to reach.
//!
//! No authentication is offered in either role: method 0x00 only, CONNECT
//! only. BIND and UDP ASSOCIATE are rejected with command-not-supported.

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

const SOCKS5_VERSION: u8 = 0x05;
const METHOD_NO_AUTH: u8 = 0x00;
const CMD_CONNECT: u8 = 0x01;
const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

const REPLY_SUCCESS: [u8; 10] = [0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0];
const REPLY_COMMAND_NOT_SUPPORTED: [u8; 10] = [0x05, 0x07, 0x00, 0x01, 0, 0, 0, 0, 0, 0];
const REPLY_ADDRESS_TYPE_NOT_SUPPORTED: [u8; 10] = [0x05, 0x08, 0x00, 0x01, 0, 0, 0, 0, 0, 0];
const REPLY_HOST_UNREACHABLE: [u8; 10] = [0x05, 0x04, 0x00, 0x01, 0, 0, 0, 0, 0, 0];
const REPLY_GENERAL_FAILURE: [u8; 10] = [0x05, 0x01, 0x00, 0x01, 0, 0, 0, 0, 0, 0];

fn protocol_err(msg: impl Into<String>) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::InvalidData, msg.into())
}

/// Dials `proxy_host:proxy_port` and asks it, via a SOCKS5 CONNECT request, to
/// relay to `dest_host:dest_port`. Used when the Transport itself is
/// configured to reach the SSH server through a SOCKS5 proxy.
pub async fn dial_via_socks5(
    proxy_host: &str,
    proxy_port: u16,
    dest_host: &str,
    dest_port: u16,
) -> std::io::Result<TcpStream> {
    let mut stream = TcpStream::connect((proxy_host, proxy_port)).await?;

    stream
        .write_all(&[SOCKS5_VERSION, 1, METHOD_NO_AUTH])
        .await?;
    let mut method_reply = [0u8; 2];
    stream.read_exact(&mut method_reply).await?;
    if method_reply[0] != SOCKS5_VERSION || method_reply[1] != METHOD_NO_AUTH {
        return Err(protocol_err("SOCKS5 proxy did not accept no-auth method"));
    }

    let mut request = vec![SOCKS5_VERSION, CMD_CONNECT, 0x00, ATYP_DOMAIN];
    let host_bytes = dest_host.as_bytes();
    if host_bytes.len() > u8::MAX as usize {
        return Err(protocol_err("destination host name too long for SOCKS5"));
    }
    request.push(host_bytes.len() as u8);
    request.extend_from_slice(host_bytes);
    request.extend_from_slice(&dest_port.to_be_bytes());
    stream.write_all(&request).await?;

    read_connect_reply(&mut stream).await?;
    Ok(stream)
}

/// Dials `proxy_host:proxy_port` and issues an HTTP `CONNECT` to tunnel to
/// `dest_host:dest_port`, for users whose proxy only speaks HTTP CONNECT.
pub async fn dial_via_http_connect(
    proxy_host: &str,
    proxy_port: u16,
    dest_host: &str,
    dest_port: u16,
) -> std::io::Result<TcpStream> {
    let mut stream = TcpStream::connect((proxy_host, proxy_port)).await?;

    let request = format!(
        "CONNECT {dest_host}:{dest_port} HTTP/1.1\r\nHost: {dest_host}:{dest_port}\r\n\r\n"
    );
    stream.write_all(request.as_bytes()).await?;

    let mut response = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        stream.read_exact(&mut byte).await?;
        response.push(byte[0]);
        if response.ends_with(b"\r\n\r\n") {
            break;
        }
        if response.len() > 8192 {
            return Err(protocol_err("HTTP CONNECT response too large"));
        }
    }

    let status_line = response
        .split(|&b| b == b'\n')
        .next()
        .ok_or_else(|| protocol_err("empty HTTP CONNECT response"))?;
    let status_line = String::from_utf8_lossy(status_line);
    if !status_line.contains("200") {
        return Err(protocol_err(format!(
            "HTTP CONNECT proxy refused tunnel: {}",
            status_line.trim()
        )));
    }

    Ok(stream)
}

async fn read_connect_reply(stream: &mut TcpStream) -> std::io::Result<()> {
    let mut header = [0u8; 4];
    stream.read_exact(&mut header).await?;
    if header[0] != SOCKS5_VERSION {
        return Err(protocol_err("malformed SOCKS5 CONNECT reply"));
    }
    let addr_len = match header[3] {
        ATYP_IPV4 => 4,
        ATYP_IPV6 => 16,
        ATYP_DOMAIN => {
            let mut len_buf = [0u8; 1];
            stream.read_exact(&mut len_buf).await?;
            len_buf[0] as usize
        }
        other => return Err(protocol_err(format!("unsupported SOCKS5 address type {other:#04x}"))),
    };
    let mut rest = vec![0u8; addr_len + 2];
    stream.read_exact(&mut rest).await?;

    if header[1] != 0x00 {
        return Err(protocol_err(format!(
            "SOCKS5 proxy rejected CONNECT (reply code {:#04x})",
            header[1]
        )));
    }
    Ok(())
}

/// A CONNECT request as read off a DYNAMIC rule's listener, before the
/// SSH-side direct-tcpip channel has been opened.
pub struct ConnectRequest {
    pub host: String,
    pub port: u16,
}

/// Performs the server side of the SOCKS5 handshake on a freshly accepted
/// connection: method negotiation (no-auth only) followed by the CONNECT
/// request. Does not send the final CONNECT reply — callers open the
/// direct-tcpip channel first and then call [`send_success`] or
/// [`send_failure`] depending on whether that succeeded, per RFC 1928's
/// two-phase handshake.
pub async fn accept_connect(stream: &mut TcpStream) -> std::io::Result<ConnectRequest> {
    let mut greeting = [0u8; 2];
    stream.read_exact(&mut greeting).await?;
    if greeting[0] != SOCKS5_VERSION {
        return Err(protocol_err(format!(
            "unsupported SOCKS version {:#04x}",
            greeting[0]
        )));
    }
    let nmethods = greeting[1] as usize;
    let mut methods = vec![0u8; nmethods];
    stream.read_exact(&mut methods).await?;

    stream.write_all(&[SOCKS5_VERSION, METHOD_NO_AUTH]).await?;

    let mut header = [0u8; 4];
    stream.read_exact(&mut header).await?;
    if header[0] != SOCKS5_VERSION {
        return Err(protocol_err(format!(
            "unsupported SOCKS5 request version {:#04x}",
            header[0]
        )));
    }
    if header[1] != CMD_CONNECT {
        stream.write_all(&REPLY_COMMAND_NOT_SUPPORTED).await?;
        return Err(protocol_err(format!(
            "unsupported SOCKS5 command {:#04x} (only CONNECT is supported)",
            header[1]
        )));
    }

    let (host, port) = match header[3] {
        ATYP_IPV4 => {
            let mut addr = [0u8; 4];
            stream.read_exact(&mut addr).await?;
            let mut port_buf = [0u8; 2];
            stream.read_exact(&mut port_buf).await?;
            (
                format!("{}.{}.{}.{}", addr[0], addr[1], addr[2], addr[3]),
                u16::from_be_bytes(port_buf),
            )
        }
        ATYP_IPV6 => {
            let mut addr = [0u8; 16];
            stream.read_exact(&mut addr).await?;
            let mut port_buf = [0u8; 2];
            stream.read_exact(&mut port_buf).await?;
            let segments: Vec<String> = addr
                .chunks(2)
                .map(|c| format!("{:x}", u16::from_be_bytes([c[0], c[1]])))
                .collect();
            (segments.join(":"), u16::from_be_bytes(port_buf))
        }
        ATYP_DOMAIN => {
            let mut len_buf = [0u8; 1];
            stream.read_exact(&mut len_buf).await?;
            let mut domain = vec![0u8; len_buf[0] as usize];
            stream.read_exact(&mut domain).await?;
            let mut port_buf = [0u8; 2];
            stream.read_exact(&mut port_buf).await?;
            let host = String::from_utf8(domain)
                .map_err(|_| protocol_err("invalid UTF-8 in SOCKS5 domain name"))?;
            (host, u16::from_be_bytes(port_buf))
        }
        other => {
            stream.write_all(&REPLY_ADDRESS_TYPE_NOT_SUPPORTED).await?;
            return Err(protocol_err(format!(
                "unsupported SOCKS5 address type {other:#04x}"
            )));
        }
    };

    Ok(ConnectRequest { host, port })
}

pub async fn send_success(stream: &mut TcpStream) -> std::io::Result<()> {
    stream.write_all(&REPLY_SUCCESS).await
}

pub async fn send_host_unreachable(stream: &mut TcpStream) -> std::io::Result<()> {
    stream.write_all(&REPLY_HOST_UNREACHABLE).await
}

pub async fn send_general_failure(stream: &mut TcpStream) -> std::io::Result<()> {
    stream.write_all(&REPLY_GENERAL_FAILURE).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt as _;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn accepts_no_auth_method_and_parses_domain_connect() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let client = tokio::spawn(async move {
            let mut stream = TcpStream::connect(addr).await.unwrap();
            stream.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
            let mut method_reply = [0u8; 2];
            stream.read_exact(&mut method_reply).await.unwrap();
            assert_eq!(method_reply, [0x05, 0x00]);

            let mut req = vec![0x05, 0x01, 0x00, 0x03];
            req.push(b"example.com".len() as u8);
            req.extend_from_slice(b"example.com");
            req.extend_from_slice(&80u16.to_be_bytes());
            stream.write_all(&req).await.unwrap();
            stream
        });

        let (mut server_stream, _) = listener.accept().await.unwrap();
        let request = accept_connect(&mut server_stream).await.unwrap();
        assert_eq!(request.host, "example.com");
        assert_eq!(request.port, 80);

        client.await.unwrap();
    }

    #[tokio::test]
    async fn rejects_bind_command_with_command_not_supported() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let client = tokio::spawn(async move {
            let mut stream = TcpStream::connect(addr).await.unwrap();
            stream.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
            let mut method_reply = [0u8; 2];
            stream.read_exact(&mut method_reply).await.unwrap();

            // BIND command (0x02), IPv4 address.
            stream
                .write_all(&[0x05, 0x02, 0x00, 0x01, 127, 0, 0, 1, 0, 80])
                .await
                .unwrap();

            let mut reply = [0u8; 10];
            stream.read_exact(&mut reply).await.unwrap();
            reply
        });

        let (mut server_stream, _) = listener.accept().await.unwrap();
        let err = accept_connect(&mut server_stream).await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);

        let reply = client.await.unwrap();
        assert_eq!(reply, REPLY_COMMAND_NOT_SUPPORTED);
    }
}
