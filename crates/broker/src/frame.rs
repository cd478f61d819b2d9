//! STOMP 1.1 frames and the [`StompCodec`] used to read and write them.
//!
//! A frame is a command line, `name:value` header lines, a blank line, the
//! body, and a NUL terminator. Bare EOLs between frames are heart-beats and
//! are skipped.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::BrokerError;

/// Upper bound on a single frame (headers plus body).
pub const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Connect,
    Stomp,
    Connected,
    Send,
    Subscribe,
    Unsubscribe,
    Ack,
    Nack,
    Disconnect,
    Message,
    Receipt,
    Error,
}

impl Command {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connect => "CONNECT",
            Self::Stomp => "STOMP",
            Self::Connected => "CONNECTED",
            Self::Send => "SEND",
            Self::Subscribe => "SUBSCRIBE",
            Self::Unsubscribe => "UNSUBSCRIBE",
            Self::Ack => "ACK",
            Self::Nack => "NACK",
            Self::Disconnect => "DISCONNECT",
            Self::Message => "MESSAGE",
            Self::Receipt => "RECEIPT",
            Self::Error => "ERROR",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        let command = match raw {
            "CONNECT" => Self::Connect,
            "STOMP" => Self::Stomp,
            "CONNECTED" => Self::Connected,
            "SEND" => Self::Send,
            "SUBSCRIBE" => Self::Subscribe,
            "UNSUBSCRIBE" => Self::Unsubscribe,
            "ACK" => Self::Ack,
            "NACK" => Self::Nack,
            "DISCONNECT" => Self::Disconnect,
            "MESSAGE" => Self::Message,
            "RECEIPT" => Self::Receipt,
            "ERROR" => Self::Error,
            _ => return None,
        };
        Some(command)
    }

    /// Header values of the handshake frames are sent verbatim.
    fn escapes_headers(&self) -> bool {
        !matches!(self, Self::Connect | Self::Stomp | Self::Connected)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub command: Command,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl Frame {
    pub fn new(command: Command) -> Self {
        Self {
            command,
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    /// First value of header `name`. Repeated headers keep the first value.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Tokio codec for STOMP frames.
#[derive(Debug, Clone)]
pub struct StompCodec {
    max_frame_bytes: usize,
}

impl StompCodec {
    pub fn new() -> Self {
        Self {
            max_frame_bytes: MAX_FRAME_BYTES,
        }
    }

    pub fn with_max_frame_bytes(max_frame_bytes: usize) -> Self {
        Self { max_frame_bytes }
    }
}

impl Default for StompCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for StompCodec {
    type Item = Frame;
    type Error = BrokerError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, BrokerError> {
        skip_heartbeats(src);
        if src.is_empty() {
            return Ok(None);
        }

        // Command and header lines, up to the blank line.
        let mut pos = 0;
        let mut lines: Vec<&[u8]> = Vec::new();
        loop {
            let Some(nl) = src[pos..].iter().position(|&b| b == b'\n') else {
                return self.incomplete(src.len());
            };
            let mut line = &src[pos..pos + nl];
            if let Some(stripped) = line.strip_suffix(b"\r") {
                line = stripped;
            }
            pos += nl + 1;
            if line.is_empty() {
                break;
            }
            lines.push(line);
        }

        let (command_line, header_lines) = lines
            .split_first()
            .ok_or_else(|| BrokerError::Protocol("frame without command".into()))?;
        let command_text = std::str::from_utf8(command_line)
            .map_err(|_| BrokerError::Protocol("command is not UTF-8".into()))?;
        let command = Command::parse(command_text)
            .ok_or_else(|| BrokerError::Protocol(format!("unknown command {command_text:?}")))?;

        let mut headers = Vec::with_capacity(header_lines.len());
        for line in header_lines {
            let text = std::str::from_utf8(line)
                .map_err(|_| BrokerError::Protocol("header is not UTF-8".into()))?;
            let (name, value) = text
                .split_once(':')
                .ok_or_else(|| BrokerError::Protocol(format!("malformed header {text:?}")))?;
            if command.escapes_headers() {
                headers.push((unescape(name)?, unescape(value)?));
            } else {
                headers.push((name.to_string(), value.to_string()));
            }
        }

        let content_length = headers
            .iter()
            .find(|(k, _)| k == "content-length")
            .map(|(_, v)| {
                v.trim()
                    .parse::<usize>()
                    .map_err(|_| BrokerError::Protocol(format!("invalid content-length {v:?}")))
            })
            .transpose()?;

        let body_end = match content_length {
            Some(len) => {
                let frame_end = pos
                    .checked_add(len)
                    .and_then(|n| n.checked_add(1))
                    .ok_or_else(|| BrokerError::Protocol(format!("content-length {len} out of range")))?;
                if src.len() < frame_end {
                    return self.incomplete(frame_end);
                }
                if src[pos + len] != 0 {
                    return Err(BrokerError::Protocol(
                        "frame body not NUL-terminated after content-length".into(),
                    ));
                }
                pos + len
            }
            None => match src[pos..].iter().position(|&b| b == 0) {
                Some(offset) => pos + offset,
                None => return self.incomplete(src.len()),
            },
        };

        let body = src[pos..body_end].to_vec();
        src.advance(body_end + 1);

        Ok(Some(Frame {
            command,
            headers,
            body,
        }))
    }
}

impl StompCodec {
    fn incomplete(&self, needed: usize) -> Result<Option<Frame>, BrokerError> {
        if needed > self.max_frame_bytes {
            return Err(BrokerError::Protocol(format!(
                "frame exceeds {} bytes",
                self.max_frame_bytes
            )));
        }
        Ok(None)
    }
}

impl Encoder<Frame> for StompCodec {
    type Error = BrokerError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), BrokerError> {
        dst.reserve(frame.body.len() + 64);
        dst.put_slice(frame.command.as_str().as_bytes());
        dst.put_u8(b'\n');

        for (name, value) in &frame.headers {
            if frame.command.escapes_headers() {
                dst.put_slice(escape(name).as_bytes());
                dst.put_u8(b':');
                dst.put_slice(escape(value).as_bytes());
            } else {
                dst.put_slice(name.as_bytes());
                dst.put_u8(b':');
                dst.put_slice(value.as_bytes());
            }
            dst.put_u8(b'\n');
        }

        if !frame.body.is_empty() && frame.get("content-length").is_none() {
            dst.put_slice(format!("content-length:{}\n", frame.body.len()).as_bytes());
        }

        dst.put_u8(b'\n');
        dst.put_slice(&frame.body);
        dst.put_u8(0);
        Ok(())
    }
}

fn skip_heartbeats(src: &mut BytesMut) {
    loop {
        if src.first() == Some(&b'\n') {
            src.advance(1);
        } else if src.starts_with(b"\r\n") {
            src.advance(2);
        } else {
            return;
        }
    }
}

fn escape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            ':' => out.push_str("\\c"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            other => out.push(other),
        }
    }
    out
}

fn unescape(raw: &str) -> Result<String, BrokerError> {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('\\') => out.push('\\'),
            Some('c') => out.push(':'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            other => {
                return Err(BrokerError::Protocol(format!(
                    "invalid header escape \\{}",
                    other.map(String::from).unwrap_or_default()
                )))
            }
        }
    }
    Ok(out)
}
