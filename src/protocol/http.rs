//! HTTP CONNECT handshake and reply lines

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tracing::{debug, trace};

use crate::common::{Address, Destination, Hop, Result, Stream};
use crate::error::Error;

use super::{Handshaken, PeerHandshake};

/// Upper bound on a request or response head
pub const MAX_HEAD_SIZE: usize = 64 * 1024;

const CONNECTION_ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection established\r\n\r\n";

/// The acknowledgement line owed to a CONNECT client once a path is committed
pub fn connection_established() -> &'static [u8] {
    CONNECTION_ESTABLISHED
}

/// Terminal error reply for a client that has not received any byte yet
pub fn error_response(error: &Error) -> Vec<u8> {
    let status = error.http_status();
    let reason = match status {
        502 => "Bad Gateway",
        504 => "Gateway Timeout",
        _ => "Service Unavailable",
    };
    status_response(status, reason, &format!("{}\n", error))
}

/// Reply to a client that asked for anything but a tunnel
pub fn method_not_allowed(method: &str) -> Vec<u8> {
    status_response(
        405,
        "Method Not Allowed",
        &format!("{} is not supported, use CONNECT\n", method),
    )
}

/// Reply to a CONNECT whose authority does not parse
pub fn bad_request(error: &Error) -> Vec<u8> {
    status_response(400, "Bad Request", &format!("{}\n", error))
}

fn status_response(status: u16, reason: &str, body: &str) -> Vec<u8> {
    format!(
        "HTTP/1.1 {} {}\r\n\
         Content-Type: text/plain; charset=utf-8\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\
         \r\n\
         {}",
        status,
        reason,
        body.len(),
        body
    )
    .into_bytes()
}

/// Read until the end of an HTTP head.
///
/// Returns the head (including the blank line) and whatever followed it.
async fn read_head<S>(stream: &mut S, max: usize) -> Result<(BytesMut, Bytes)>
where
    S: AsyncRead + Unpin + ?Sized,
{
    let mut buf = BytesMut::with_capacity(1024);
    let mut scanned: usize = 0;

    loop {
        let from = scanned.saturating_sub(3);
        if let Some(pos) = find_head_end(&buf[from..]) {
            let mut head = buf;
            let rest = head.split_off(from + pos + 4);
            return Ok((head, rest.freeze()));
        }
        scanned = buf.len();

        if buf.len() >= max {
            return Err(Error::Protocol(format!("HTTP head exceeds {} bytes", max)));
        }

        let n = stream.read_buf(&mut buf).await?;
        if n == 0 {
            return Err(Error::ConnectionClosed);
        }
    }
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

/// A parsed client request head
#[derive(Debug, Clone)]
pub struct ConnectRequest {
    pub method: String,
    pub authority: String,
    /// Bytes the client sent after its head
    pub leftover: Bytes,
}

impl ConnectRequest {
    pub fn is_connect(&self) -> bool {
        self.method.eq_ignore_ascii_case("CONNECT")
    }

    pub fn target(&self) -> Result<Address> {
        Address::parse(&self.authority)
    }
}

/// Read the client's request head
pub async fn read_connect_request(stream: &mut Stream) -> Result<ConnectRequest> {
    let (head, leftover) = read_head(stream, MAX_HEAD_SIZE).await?;
    let head = std::str::from_utf8(&head)
        .map_err(|_| Error::Protocol("Request head is not valid UTF-8".into()))?;

    let request_line = head.lines().next().unwrap_or_default();
    let parts: Vec<&str> = request_line.split_whitespace().collect();
    if parts.len() < 3 {
        return Err(Error::Protocol("Invalid HTTP request line".into()));
    }

    Ok(ConnectRequest {
        method: parts[0].to_string(),
        authority: parts[1].to_string(),
        leftover,
    })
}

/// HTTP CONNECT handshake against a relaying peer
pub struct HttpConnectHandshake;

impl HttpConnectHandshake {
    pub fn new() -> Self {
        Self
    }

    fn build_request(destination: &Destination, target: &Address) -> String {
        let target = target.to_string();
        let mut request = format!("CONNECT {} HTTP/1.1\r\nHost: {}\r\n", target, target);

        if let Hop::Peer {
            login: Some(login), ..
        } = &destination.hop
        {
            let auth = format!("{}:{}", login.username, login.password);
            request.push_str(&format!("Proxy-Authorization: Basic {}\r\n", BASE64.encode(auth)));
        }

        request.push_str("\r\n");
        request
    }
}

impl Default for HttpConnectHandshake {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PeerHandshake for HttpConnectHandshake {
    async fn handshake(
        &self,
        mut stream: Stream,
        destination: &Destination,
        target: &Address,
    ) -> Result<Handshaken> {
        let request = Self::build_request(destination, target);
        trace!("CONNECT {} via {}", target, destination);

        stream.write_all(request.as_bytes()).await?;
        stream.flush().await?;

        let (head, leftover) = match read_head(&mut stream, MAX_HEAD_SIZE).await {
            Ok(parts) => parts,
            Err(Error::ConnectionClosed) => {
                return Err(Error::Protocol(format!(
                    "{} closed the connection before answering CONNECT",
                    destination
                )))
            }
            Err(e) => return Err(e),
        };

        let head = String::from_utf8_lossy(&head);
        let status_line = head.lines().next().unwrap_or_default().trim();
        let mut parts = status_line.splitn(3, ' ');
        let version = parts.next().unwrap_or_default();
        if !version.starts_with("HTTP/") {
            return Err(Error::Protocol(format!("Invalid HTTP response: {}", status_line)));
        }
        let status: u16 = parts
            .next()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| Error::Protocol("Invalid status code".into()))?;
        let reason = parts.next().unwrap_or_default().to_string();

        if !(200..300).contains(&status) {
            return Err(Error::PeerRefused { status, reason });
        }

        debug!(
            "CONNECT {} via {} accepted ({}, {} leftover bytes)",
            target,
            destination,
            status,
            leftover.len()
        );

        Ok(Handshaken {
            stream,
            leftover,
            status,
        })
    }
}
