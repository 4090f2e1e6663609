// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! The HTTP/1.1 opening handshake that upgrades a stream socket to the
//! WebSocket protocol.

use crate::{collections::bytes::Bytes, fail::Fail, socket::StreamSocket};

use rand::{rngs::SmallRng, RngCore, SeedableRng};
use sha1::{Digest, Sha1};

use std::collections::HashMap;

//==============================================================================
// Constants & Structures
//==============================================================================

const MAX_HEADERS: usize = 256;
const MAX_LINE: usize = 4096;
const WEBSOCKETS_GUID: &[u8] = b"258EAFA5-E914-47DA-95CA-C5AB0DC85B11";
const AGENT: &str = concat!("eddy/", env!("CARGO_PKG_VERSION"));

/// Header map with lower-cased names (header names are case-insensitive).
pub type Headers = HashMap<String, String>;

//==============================================================================
// Associate Functions
//==============================================================================

/// Computes the `Sec-WebSocket-Accept` value for a client key.
pub fn accept_key(key: &str) -> String {
    let mut sha = Sha1::new();
    sha.update(key.as_bytes());
    sha.update(WEBSOCKETS_GUID);
    base64::encode(sha.finalize())
}

fn generate_key() -> String {
    let mut rng = SmallRng::from_entropy();
    let mut nonce = [0u8; 16];
    rng.fill_bytes(&mut nonce);
    base64::encode(&nonce)
}

fn parse_header_line(line: &str) -> Result<(String, String), Fail> {
    let trimmed = line.trim_end_matches("\r\n");
    let index = match trimmed.find(": ") {
        Some(index) => index,
        None => {
            return Err(Fail::Malformed {
                details: "malformed header line",
            })
        }
    };
    Ok((
        trimmed[..index].to_ascii_lowercase(),
        trimmed[index + 2..].to_string(),
    ))
}

async fn read_header_line(socket: &StreamSocket) -> Result<String, Fail> {
    let line = socket.recv_line().await?;
    if line.len() > MAX_LINE {
        return Err(Fail::Malformed {
            details: "header line too long",
        });
    }
    String::from_utf8(line[..].to_vec()).map_err(|_| Fail::Encoding {})
}

/// Reads an HTTP message (start line plus headers) from the stream. The
/// message is assumed not to carry a body.
async fn read_message(socket: &StreamSocket) -> Result<(String, Headers), Fail> {
    let start_line = read_header_line(socket).await?;
    let mut headers = HashMap::new();
    for _ in 0..MAX_HEADERS {
        let line = read_header_line(socket).await?;
        if line == "\r\n" {
            return Ok((start_line, headers));
        }
        let (name, value) = parse_header_line(&line)?;
        headers.insert(name, value);
    }
    Err(Fail::Malformed {
        details: "too many headers",
    })
}

/// Checks a handshake request received from a client and returns the
/// client's key.
fn check_request(headers: &Headers) -> Result<String, Fail> {
    match headers.get("upgrade") {
        Some(value) if value.eq_ignore_ascii_case("websocket") => (),
        _ => {
            return Err(Fail::Handshake {
                details: "missing websocket upgrade",
            })
        }
    }
    match headers.get("connection") {
        Some(value)
            if value
                .split(',')
                .any(|token| token.trim().eq_ignore_ascii_case("upgrade")) => {}
        _ => {
            return Err(Fail::Handshake {
                details: "missing connection upgrade",
            })
        }
    }
    let key = match headers.get("sec-websocket-key") {
        Some(key) => key.clone(),
        None => {
            return Err(Fail::Handshake {
                details: "missing websocket key",
            })
        }
    };
    match base64::decode(&key) {
        Ok(raw) if raw.len() == 16 => (),
        _ => {
            return Err(Fail::Handshake {
                details: "malformed websocket key",
            })
        }
    }
    match headers.get("sec-websocket-version") {
        Some(version) if version == "13" => Ok(key),
        _ => Err(Fail::Handshake {
            details: "unsupported websocket version",
        }),
    }
}

/// Checks a handshake response received from the server against the key the
/// request carried.
fn check_response(headers: &Headers, key: &str) -> Result<(), Fail> {
    match headers.get("upgrade") {
        Some(value) if value.eq_ignore_ascii_case("websocket") => (),
        _ => {
            return Err(Fail::Handshake {
                details: "missing websocket upgrade",
            })
        }
    }
    match headers.get("connection") {
        Some(value)
            if value
                .split(',')
                .any(|token| token.trim().eq_ignore_ascii_case("upgrade")) => {}
        _ => {
            return Err(Fail::Handshake {
                details: "missing connection upgrade",
            })
        }
    }
    match headers.get("sec-websocket-accept") {
        Some(accept) if *accept == accept_key(key) => Ok(()),
        _ => Err(Fail::Handshake {
            details: "wrong accept hash",
        }),
    }
}

/// Picks the first client-offered subprotocol the server also supports.
fn select_subprotocol(offered: &str, supported: &[&str]) -> Option<String> {
    offered
        .split(',')
        .map(|protocol| protocol.trim())
        .find(|protocol| supported.contains(protocol))
        .map(|protocol| protocol.to_string())
}

/// Performs the client side of the opening handshake and returns the
/// negotiated subprotocol, if any.
pub async fn client_handshake(
    socket: &StreamSocket,
    host: &str,
    resource: &str,
    origin: Option<&str>,
    subprotocols: Option<&[&str]>,
) -> Result<Option<String>, Fail> {
    trace!("client_handshake(): host={:?} resource={:?}", host, resource);
    let key = generate_key();

    let mut request = vec![format!("GET {} HTTP/1.1", resource)];
    request.push(format!("Host: {}", host));
    if let Some(origin) = origin {
        request.push(format!("Origin: {}", origin));
    }
    if let Some(subprotocols) = subprotocols {
        request.push(format!(
            "Sec-WebSocket-Protocol: {}",
            subprotocols.join(", ")
        ));
    }
    request.push(format!("User-Agent: {}", AGENT));
    request.push("Upgrade: WebSocket".to_string());
    request.push("Connection: Upgrade".to_string());
    request.push(format!("Sec-WebSocket-Key: {}", key));
    request.push("Sec-WebSocket-Version: 13".to_string());
    request.push("\r\n".to_string());

    socket.send(Bytes::from_vec(request.join("\r\n").into_bytes())).await?;

    let (status_line, headers) = read_message(socket).await?;
    let mut parts = status_line.trim_end().splitn(3, ' ');
    let version = parts.next().unwrap_or("");
    let status = parts.next().unwrap_or("");
    if version != "HTTP/1.1" {
        return Err(Fail::Handshake {
            details: "unsupported HTTP version",
        });
    }
    if status != "101" {
        return Err(Fail::Handshake {
            details: "bad status code",
        });
    }
    check_response(&headers, &key)?;

    match headers.get("sec-websocket-protocol") {
        None => Ok(None),
        Some(protocol) => match subprotocols {
            Some(supported) if supported.contains(&protocol.as_str()) => {
                Ok(Some(protocol.clone()))
            }
            _ => Err(Fail::Handshake {
                details: "unknown subprotocol",
            }),
        },
    }
}

/// Performs the server side of the opening handshake. Returns the requested
/// resource path and the negotiated subprotocol, if any.
pub async fn server_handshake(
    socket: &StreamSocket,
    origins: Option<&[&str]>,
    subprotocols: Option<&[&str]>,
) -> Result<(String, Option<String>), Fail> {
    trace!("server_handshake()");
    let (request_line, headers) = read_message(socket).await?;
    let mut parts = request_line.trim_end().splitn(3, ' ');
    let method = parts.next().unwrap_or("");
    let path = parts.next().unwrap_or("").to_string();
    let version = parts.next().unwrap_or("");
    if method != "GET" {
        return Err(Fail::Handshake {
            details: "unsupported method",
        });
    }
    if version != "HTTP/1.1" {
        return Err(Fail::Handshake {
            details: "unsupported HTTP version",
        });
    }

    let key = check_request(&headers)?;

    if let Some(origins) = origins {
        let origin = headers.get("origin").map(String::as_str).unwrap_or("");
        let allowed = if origin.is_empty() {
            origins.contains(&"")
        } else {
            origin.split_whitespace().all(|o| origins.contains(&o))
        };
        if !allowed {
            return Err(Fail::Handshake {
                details: "bad origin",
            });
        }
    }

    let subprotocol = match (headers.get("sec-websocket-protocol"), subprotocols) {
        (Some(offered), Some(supported)) => select_subprotocol(offered, supported),
        _ => None,
    };

    let mut response = vec![
        "HTTP/1.1 101 Switching Protocols".to_string(),
        format!("Server: {}", AGENT),
    ];
    if let Some(subprotocol) = &subprotocol {
        response.push(format!("Sec-WebSocket-Protocol: {}", subprotocol));
    }
    response.push("Upgrade: WebSocket".to_string());
    response.push("Connection: Upgrade".to_string());
    response.push(format!("Sec-WebSocket-Accept: {}", accept_key(&key)));
    response.push("\r\n".to_string());

    socket
        .send(Bytes::from_vec(response.join("\r\n").into_bytes()))
        .await?;

    Ok((path, subprotocol))
}

//==============================================================================
// Unit Tests
//==============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    /// The accept-hash vector from RFC 6455 §1.3.
    #[test]
    fn accept_key_vector() {
        assert_eq!(
            accept_key("dGhlIHNhbXBsZSBub25jZQ=="),
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
    }

    /// Header lines parse into lower-cased names and verbatim values.
    #[test]
    fn header_line_parsing() {
        let (name, value) = parse_header_line("Sec-WebSocket-Key: abc==\r\n").unwrap();
        assert_eq!(name, "sec-websocket-key");
        assert_eq!(value, "abc==");
        assert!(parse_header_line("no colon here\r\n").is_err());
    }

    /// A well-formed upgrade request passes the checks and yields the key.
    #[test]
    fn request_checks() {
        let mut headers = Headers::new();
        headers.insert("upgrade".to_string(), "websocket".to_string());
        headers.insert("connection".to_string(), "keep-alive, Upgrade".to_string());
        headers.insert(
            "sec-websocket-key".to_string(),
            "dGhlIHNhbXBsZSBub25jZQ==".to_string(),
        );
        headers.insert("sec-websocket-version".to_string(), "13".to_string());
        assert_eq!(check_request(&headers).unwrap(), "dGhlIHNhbXBsZSBub25jZQ==");

        headers.remove("sec-websocket-version");
        assert!(check_request(&headers).is_err());
    }

    /// Subprotocol selection follows the client's preference order.
    #[test]
    fn subprotocol_selection() {
        assert_eq!(
            select_subprotocol("chat, superchat", &["superchat", "chat"]),
            Some("chat".to_string())
        );
        assert_eq!(select_subprotocol("graphql-ws", &["chat"]), None);
    }
}
