//! Frame codec.
//!
//! Text frames carry `name: value` header lines joined by CRLF, a blank line,
//! then the body. Binary frames carry a big-endian `u16` header length, the
//! header block (one byte per character, each line CRLF-terminated) and the
//! raw body up to the end of the frame.
//!
//! ```text
//! text:    Path: audio\r\nX-RequestId: ...\r\n\r\n{body}
//! binary:  [len_hi len_lo][header bytes ...][body bytes ...]
//! ```

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

use super::message::{Headers, MessageBody, WireMessage};

const CRLF: &str = "\r\n";
const HEADER_BODY_SEPARATOR: &str = "\r\n\r\n";
const BINARY_LENGTH_PREFIX: usize = 2;

/// Errors raised while framing or unframing a message.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FramingError {
    #[error("frame truncated: expected at least {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },

    #[error("header block of {0} bytes does not fit the binary length prefix")]
    HeaderTooLong(usize),

    #[error("header '{0}' contains a character that cannot be framed")]
    InvalidHeaderCharacter(String),

    #[error("required header '{0}' is missing")]
    MissingHeader(&'static str),

    #[error("invalid '{path}' payload: {reason}")]
    InvalidPayload { path: String, reason: String },
}

/// Raw transport frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawFrame {
    Text(String),
    Binary(Bytes),
}

impl RawFrame {
    pub fn len(&self) -> usize {
        match self {
            RawFrame::Text(text) => text.len(),
            RawFrame::Binary(data) => data.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Stateless converter between [`WireMessage`] and [`RawFrame`].
pub struct FrameCodec;

impl FrameCodec {
    pub fn encode(message: &WireMessage) -> Result<RawFrame, FramingError> {
        match message.body() {
            MessageBody::Text(body) => {
                let lines = header_lines(message.headers())?;
                let header_len = lines.iter().map(|l| l.len() + 2).sum::<usize>();
                let mut frame = String::with_capacity(header_len + body.len() + 4);
                frame.push_str(&lines.join(CRLF));
                frame.push_str(HEADER_BODY_SEPARATOR);
                frame.push_str(body);
                Ok(RawFrame::Text(frame))
            }
            MessageBody::Binary(body) => {
                let header_bytes = binary_header_block(message.headers())?;
                let header_len = u16::try_from(header_bytes.len())
                    .map_err(|_| FramingError::HeaderTooLong(header_bytes.len()))?;

                let mut frame =
                    BytesMut::with_capacity(BINARY_LENGTH_PREFIX + header_bytes.len() + body.len());
                frame.put_u16(header_len);
                frame.put_slice(&header_bytes);
                frame.put_slice(body);
                Ok(RawFrame::Binary(frame.freeze()))
            }
        }
    }

    pub fn decode(frame: RawFrame) -> Result<WireMessage, FramingError> {
        match frame {
            RawFrame::Text(text) => {
                let (header_text, body) = match text.find(HEADER_BODY_SEPARATOR) {
                    Some(index) => (
                        &text[..index],
                        &text[index + HEADER_BODY_SEPARATOR.len()..],
                    ),
                    None => (text.as_str(), ""),
                };
                Ok(WireMessage::text(parse_headers(header_text), body))
            }
            RawFrame::Binary(data) => {
                if data.len() < BINARY_LENGTH_PREFIX {
                    return Err(FramingError::Truncated {
                        expected: BINARY_LENGTH_PREFIX,
                        actual: data.len(),
                    });
                }
                let header_len = u16::from_be_bytes([data[0], data[1]]) as usize;
                let body_start = BINARY_LENGTH_PREFIX + header_len;
                if data.len() < body_start {
                    return Err(FramingError::Truncated {
                        expected: body_start,
                        actual: data.len(),
                    });
                }

                // One byte per character.
                let header_text: String = data[BINARY_LENGTH_PREFIX..body_start]
                    .iter()
                    .map(|&b| b as char)
                    .collect();
                let body = data.slice(body_start..);
                Ok(WireMessage::binary(parse_headers(&header_text), body))
            }
        }
    }
}

/// Decoding trims names and values, so surrounding whitespace cannot be
/// framed either.
fn header_lines(headers: &Headers) -> Result<Vec<String>, FramingError> {
    headers
        .iter()
        .map(|(name, value)| {
            if name.is_empty()
                || name.contains(['\r', '\n', ':'])
                || value.contains(['\r', '\n'])
                || name.trim() != name
                || value.trim() != value
            {
                return Err(FramingError::InvalidHeaderCharacter(name.to_string()));
            }
            Ok(format!("{name}: {value}"))
        })
        .collect()
}

fn binary_header_block(headers: &Headers) -> Result<Vec<u8>, FramingError> {
    let mut block = Vec::new();
    for (line, (name, _)) in header_lines(headers)?.into_iter().zip(headers.iter()) {
        for ch in line.chars().chain(CRLF.chars()) {
            let byte = u8::try_from(u32::from(ch))
                .map_err(|_| FramingError::InvalidHeaderCharacter(name.to_string()))?;
            block.push(byte);
        }
    }
    Ok(block)
}

/// Parse a CRLF-separated header block. Each line is split on its first
/// colon with both sides trimmed; a line without a colon becomes a header
/// with an empty value.
fn parse_headers(text: &str) -> Headers {
    let mut headers = Headers::new();
    for line in text.split(CRLF).filter(|line| !line.is_empty()) {
        match line.find(':') {
            Some(index) if index > 0 => {
                headers.insert(line[..index].trim(), line[index + 1..].trim());
            }
            _ => headers.insert(line.trim(), ""),
        }
    }
    headers
}
