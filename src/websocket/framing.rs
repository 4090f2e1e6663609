// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

use super::CloseReason;
use crate::{collections::bytes::Bytes, fail::Fail, socket::StreamSocket};

use byteorder::{BigEndian, ByteOrder};
use num_derive::FromPrimitive;
use num_traits::FromPrimitive;

//==============================================================================
// Constants & Structures
//==============================================================================

const HEAD_FIN_BIT: u16 = 0b1000_0000_0000_0000;
const HEAD_RES_BITS: u16 = 0b0111_0000_0000_0000;
const HEAD_OP_BITS: u16 = 0b0000_1111_0000_0000;
const HEAD_MASK_BIT: u16 = 0b0000_0000_1000_0000;
const HEAD_LEN_BITS: u16 = 0b0000_0000_0111_1111;

/// Largest payload a control frame may carry.
const MAX_CONTROL_PAYLOAD: usize = 125;

/// Frame opcodes from RFC 6455.
#[derive(Clone, Copy, Debug, Eq, FromPrimitive, PartialEq)]
pub enum Opcode {
    Continuation = 0x0,
    Text = 0x1,
    Binary = 0x2,
    Close = 0x8,
    Ping = 0x9,
    Pong = 0xa,
}

//==============================================================================
// Associate Functions
//==============================================================================

/// Associate functions for [Opcode].
impl Opcode {
    /// Returns `true` for close, ping, and pong frames.
    pub fn is_control(&self) -> bool {
        matches!(self, Opcode::Close | Opcode::Ping | Opcode::Pong)
    }
}

/// XORs `data` with the 4-byte masking key.
pub fn apply_mask(key: [u8; 4], data: &[u8]) -> Bytes {
    let masked: Vec<u8> = data
        .iter()
        .enumerate()
        .map(|(i, byte)| byte ^ key[i & 3])
        .collect();
    Bytes::from_vec(masked)
}

/// Reads one frame from the socket.
///
/// `expect_mask` states whether incoming payloads must be masked (true on the
/// server side of a connection). Payloads longer than `max_size` are refused
/// before they are read.
pub async fn read_fragment(
    socket: &StreamSocket,
    expect_mask: bool,
    max_size: usize,
) -> Result<(Opcode, Bytes, bool), Fail> {
    let header = socket.recv(2).await?;
    let head = BigEndian::read_u16(&header);

    let final_fragment = head & HEAD_FIN_BIT != 0;
    if head & HEAD_RES_BITS != 0 {
        return Err(Fail::Protocol {
            details: "reserved bits must be zero",
        });
    }
    if (head & HEAD_MASK_BIT != 0) != expect_mask {
        return Err(Fail::Protocol {
            details: "incorrect masking",
        });
    }

    let mut length = (head & HEAD_LEN_BITS) as usize;
    if length == 126 {
        let extended = socket.recv(2).await?;
        length = BigEndian::read_u16(&extended) as usize;
    } else if length == 127 {
        let extended = socket.recv(8).await?;
        length = BigEndian::read_u64(&extended) as usize;
    }
    if length > max_size {
        return Err(Fail::PayloadTooBig {});
    }

    let key = if expect_mask {
        let raw = socket.recv(4).await?;
        Some([raw[0], raw[1], raw[2], raw[3]])
    } else {
        None
    };

    let data = socket.recv(length).await?;
    let data = match key {
        Some(key) => apply_mask(key, &data),
        None => data,
    };

    let opcode = match Opcode::from_u8(((head & HEAD_OP_BITS) >> 8) as u8) {
        Some(opcode) => opcode,
        None => {
            return Err(Fail::Protocol {
                details: "invalid opcode",
            })
        }
    };
    if opcode.is_control() {
        if data.len() > MAX_CONTROL_PAYLOAD {
            return Err(Fail::Protocol {
                details: "control frame too long",
            });
        }
        if !final_fragment {
            return Err(Fail::Protocol {
                details: "fragmented control frame",
            });
        }
    }

    Ok((opcode, data, final_fragment))
}

/// Serializes one frame. Masked frames get a fresh random 32-bit key.
pub fn encode_fragment(
    mask_key: Option<[u8; 4]>,
    opcode: Opcode,
    data: &[u8],
    final_fragment: bool,
) -> Vec<u8> {
    let length = data.len();
    let mut frame = Vec::with_capacity(length + 14);

    let head1 = if final_fragment { 0x80 } else { 0 } | opcode as u8;
    let head2 = if mask_key.is_some() { 0x80u8 } else { 0 };
    frame.push(head1);
    if length < 126 {
        frame.push(head2 | length as u8);
    } else if length < 0x1_0000 {
        frame.push(head2 | 126);
        let mut extended = [0u8; 2];
        BigEndian::write_u16(&mut extended, length as u16);
        frame.extend_from_slice(&extended);
    } else {
        frame.push(head2 | 127);
        let mut extended = [0u8; 8];
        BigEndian::write_u64(&mut extended, length as u64);
        frame.extend_from_slice(&extended);
    }

    match mask_key {
        Some(key) => {
            frame.extend_from_slice(&key);
            frame.extend_from_slice(&apply_mask(key, data));
        }
        None => frame.extend_from_slice(data),
    }
    frame
}

/// Writes one frame to the socket.
pub async fn write_fragment(
    socket: &StreamSocket,
    mask: bool,
    opcode: Opcode,
    data: &[u8],
    final_fragment: bool,
) -> Result<usize, Fail> {
    let key = if mask {
        Some(rand::random::<[u8; 4]>())
    } else {
        None
    };
    let frame = encode_fragment(key, opcode, data, final_fragment);
    socket.send(Bytes::from_vec(frame)).await
}

/// Whether `code` may appear in a close frame on the wire.
fn close_code_valid(code: u16) -> bool {
    matches!(code, 1000..=1003 | 1007..=1011) || (3000..5000).contains(&code)
}

/// Parses a close frame's payload into `(code, reason)`.
///
/// An empty payload stands for "no status received" (code 1005); a one-byte
/// payload is malformed.
pub fn parse_close_data(data: &Bytes) -> Result<CloseReason, Fail> {
    match data.len() {
        0 => Ok(CloseReason {
            code: 1005,
            reason: String::new(),
        }),
        1 => Err(Fail::Protocol {
            details: "close frame too short",
        }),
        _ => {
            let code = BigEndian::read_u16(&data[..2]);
            if !close_code_valid(code) {
                return Err(Fail::Protocol {
                    details: "invalid close status code",
                });
            }
            let reason = String::from_utf8(data[2..].to_vec()).map_err(|_| Fail::Encoding {})?;
            Ok(CloseReason { code, reason })
        }
    }
}

//==============================================================================
// Unit Tests
//==============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    /// The single-frame unmasked text message "Hello" from RFC 6455 §5.7.
    #[test]
    fn encode_unmasked_hello() {
        let frame = encode_fragment(None, Opcode::Text, b"Hello", true);
        assert_eq!(frame, vec![0x81, 0x05, 0x48, 0x65, 0x6c, 0x6c, 0x6f]);
    }

    /// The single-frame masked text message "Hello" from RFC 6455 §5.7.
    #[test]
    fn encode_masked_hello() {
        let frame = encode_fragment(Some([0x37, 0xfa, 0x21, 0x3d]), Opcode::Text, b"Hello", true);
        assert_eq!(
            frame,
            vec![0x81, 0x85, 0x37, 0xfa, 0x21, 0x3d, 0x7f, 0x9f, 0x4d, 0x51, 0x58]
        );
    }

    /// Masking is an involution.
    #[test]
    fn mask_round_trip() {
        let key = [0x12, 0x34, 0x56, 0x78];
        let data = b"some plaintext of odd length!";
        let masked = apply_mask(key, data);
        assert_eq!(apply_mask(key, &masked), data[..]);
    }

    /// Medium payloads use the 126 + u16 extended length form.
    #[test]
    fn encode_extended_length() {
        let payload = vec![0u8; 300];
        let frame = encode_fragment(None, Opcode::Binary, &payload, false);
        assert_eq!(frame[0], 0x02);
        assert_eq!(frame[1], 126);
        assert_eq!(BigEndian::read_u16(&frame[2..4]), 300);
        assert_eq!(frame.len(), 4 + 300);
    }

    /// Huge payloads use the 127 + u64 extended length form.
    #[test]
    fn encode_huge_length() {
        let payload = vec![0u8; 0x1_0000];
        let frame = encode_fragment(None, Opcode::Binary, &payload, true);
        assert_eq!(frame[1], 127);
        assert_eq!(BigEndian::read_u64(&frame[2..10]), 0x1_0000);
    }

    /// Close payload parsing: empty, truncated, bad code, and a valid one.
    #[test]
    fn close_payloads() {
        assert_eq!(
            parse_close_data(&Bytes::empty()).unwrap(),
            CloseReason {
                code: 1005,
                reason: String::new()
            }
        );
        assert!(parse_close_data(&Bytes::from(&[0x03][..])).is_err());
        assert!(parse_close_data(&Bytes::from(&[0x03, 0xeb][..])).is_ok());
        // 3000-4999 are application-defined; 1005 is reserved for internal use.
        assert!(parse_close_data(&Bytes::from(&[0x0f, 0xa0][..])).is_ok());
        assert!(parse_close_data(&Bytes::from(&[0x03, 0xed][..])).is_err());

        let payload = Bytes::from(&[0x03, 0xe8, b'O', b'K'][..]);
        assert_eq!(
            parse_close_data(&payload).unwrap(),
            CloseReason {
                code: 1000,
                reason: "OK".to_string()
            }
        );
    }
}
