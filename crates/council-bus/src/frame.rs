//! STOMP 1.2 frame codec.
//!
//! A frame is a command line, `name:value` header lines, a blank line,
//! the body, and a NUL octet. Bare EOLs between frames are heart-beats.

use std::fmt;
use std::str::FromStr;

use bytes::Bytes;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Connect,
    Stomp,
    Connected,
    Send,
    Subscribe,
    Unsubscribe,
    Message,
    Receipt,
    Error,
    Disconnect,
}

impl Command {
    pub fn as_str(&self) -> &'static str {
        match self {
            Command::Connect => "CONNECT",
            Command::Stomp => "STOMP",
            Command::Connected => "CONNECTED",
            Command::Send => "SEND",
            Command::Subscribe => "SUBSCRIBE",
            Command::Unsubscribe => "UNSUBSCRIBE",
            Command::Message => "MESSAGE",
            Command::Receipt => "RECEIPT",
            Command::Error => "ERROR",
            Command::Disconnect => "DISCONNECT",
        }
    }

    // CONNECT and CONNECTED headers are sent verbatim.
    fn escapes_headers(&self) -> bool {
        !matches!(self, Command::Connect | Command::Connected)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Command {
    type Err = FrameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "CONNECT" => Command::Connect,
            "STOMP" => Command::Stomp,
            "CONNECTED" => Command::Connected,
            "SEND" => Command::Send,
            "SUBSCRIBE" => Command::Subscribe,
            "UNSUBSCRIBE" => Command::Unsubscribe,
            "MESSAGE" => Command::Message,
            "RECEIPT" => Command::Receipt,
            "ERROR" => Command::Error,
            "DISCONNECT" => Command::Disconnect,
            other => return Err(FrameError::UnknownCommand(other.to_string())),
        })
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("unknown command {0:?}")]
    UnknownCommand(String),
    #[error("malformed header line {0:?}")]
    MalformedHeader(String),
    #[error("invalid escape sequence in header {0:?}")]
    InvalidEscape(String),
    #[error("invalid content-length {0:?}")]
    InvalidContentLength(String),
    #[error("frame is not terminated by NUL")]
    MissingNul,
    #[error("frame head is not valid utf-8")]
    InvalidUtf8,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub command: Command,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl Frame {
    pub fn new(command: Command) -> Self {
        Self {
            command,
            headers: Vec::new(),
            body: Bytes::new(),
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// First occurrence wins, as STOMP 1.2 requires for repeated headers.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    pub fn encode(&self) -> Vec<u8> {
        let escape = self.command.escapes_headers();
        let mut out = Vec::with_capacity(64 + self.body.len());
        out.extend_from_slice(self.command.as_str().as_bytes());
        out.push(b'\n');
        for (name, value) in &self.headers {
            if name == "content-length" {
                continue;
            }
            push_header_part(&mut out, name, escape);
            out.push(b':');
            push_header_part(&mut out, value, escape);
            out.push(b'\n');
        }
        if !self.body.is_empty() {
            out.extend_from_slice(format!("content-length:{}\n", self.body.len()).as_bytes());
        }
        out.push(b'\n');
        out.extend_from_slice(&self.body);
        out.push(0);
        out
    }
}

fn push_header_part(out: &mut Vec<u8>, raw: &str, escape: bool) {
    if !escape {
        out.extend_from_slice(raw.as_bytes());
        return;
    }
    for ch in raw.chars() {
        match ch {
            '\\' => out.extend_from_slice(b"\\\\"),
            '\n' => out.extend_from_slice(b"\\n"),
            '\r' => out.extend_from_slice(b"\\r"),
            ':' => out.extend_from_slice(b"\\c"),
            other => {
                let mut buf = [0u8; 4];
                out.extend_from_slice(other.encode_utf8(&mut buf).as_bytes());
            }
        }
    }
}

fn unescape(raw: &str) -> Result<String, FrameError> {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(ch) = chars.next() {
        if ch != '\\' {
            out.push(ch);
            continue;
        }
        match chars.next() {
            Some('\\') => out.push('\\'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('c') => out.push(':'),
            _ => return Err(FrameError::InvalidEscape(raw.to_string())),
        }
    }
    Ok(out)
}

/// Parses every frame in `data`, skipping heart-beat EOLs.
///
/// WebSocket brokers deliver one frame per message, but nothing stops a
/// broker from batching, so trailing frames are parsed too.
pub fn parse_frames(data: &[u8]) -> Result<Vec<Frame>, FrameError> {
    let mut frames = Vec::new();
    let mut rest = data;
    loop {
        rest = skip_eols(rest);
        if rest.is_empty() {
            return Ok(frames);
        }
        let (frame, remaining) = parse_one(rest)?;
        frames.push(frame);
        rest = remaining;
    }
}

fn skip_eols(mut data: &[u8]) -> &[u8] {
    while let Some((&first, tail)) = data.split_first() {
        if first == b'\n' || first == b'\r' {
            data = tail;
        } else {
            break;
        }
    }
    data
}

fn next_line(data: &[u8]) -> Option<(&[u8], &[u8])> {
    let idx = data.iter().position(|b| *b == b'\n')?;
    let line = &data[..idx];
    let line = line.strip_suffix(b"\r").unwrap_or(line);
    Some((line, &data[idx + 1..]))
}

fn parse_one(data: &[u8]) -> Result<(Frame, &[u8]), FrameError> {
    let (command_line, mut rest) = next_line(data).ok_or(FrameError::MissingNul)?;
    let command_line = std::str::from_utf8(command_line).map_err(|_| FrameError::InvalidUtf8)?;
    let command: Command = command_line.parse()?;
    let escape = command.escapes_headers();

    let mut headers = Vec::new();
    loop {
        let (line, tail) = next_line(rest).ok_or(FrameError::MissingNul)?;
        rest = tail;
        if line.is_empty() {
            break;
        }
        let line = std::str::from_utf8(line).map_err(|_| FrameError::InvalidUtf8)?;
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| FrameError::MalformedHeader(line.to_string()))?;
        if escape {
            headers.push((unescape(name)?, unescape(value)?));
        } else {
            headers.push((name.to_string(), value.to_string()));
        }
    }

    let content_length = headers
        .iter()
        .find(|(name, _)| name == "content-length")
        .map(|(_, value)| {
            value
                .trim()
                .parse::<usize>()
                .map_err(|_| FrameError::InvalidContentLength(value.clone()))
        })
        .transpose()?;

    let body_len = match content_length {
        Some(len) => {
            if rest.len() <= len || rest[len] != 0 {
                return Err(FrameError::MissingNul);
            }
            len
        }
        None => rest
            .iter()
            .position(|b| *b == 0)
            .ok_or(FrameError::MissingNul)?,
    };

    let frame = Frame {
        command,
        headers,
        body: Bytes::copy_from_slice(&rest[..body_len]),
    };
    Ok((frame, &rest[body_len + 1..]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_send_frame_with_content_length() {
        let frame = Frame::new(Command::Send)
            .header("destination", "/app/vote/12")
            .with_body(Bytes::from_static(b"42"));
        let encoded = frame.encode();
        assert_eq!(
            encoded,
            b"SEND\ndestination:/app/vote/12\ncontent-length:2\n\n42\0".to_vec()
        );
    }

    #[test]
    fn parses_message_frame() {
        let raw = b"MESSAGE\nsubscription:sub-0\ndestination:/topic/presenters/3\ncontent-length:1\n\n9\0";
        let frames = parse_frames(raw).unwrap();
        assert_eq!(frames.len(), 1);
        let frame = &frames[0];
        assert_eq!(frame.command, Command::Message);
        assert_eq!(frame.get("subscription"), Some("sub-0"));
        assert_eq!(frame.body, Bytes::from_static(b"9"));
    }

    #[test]
    fn heartbeats_yield_no_frames() {
        assert!(parse_frames(b"\n").unwrap().is_empty());
        assert!(parse_frames(b"\r\n\n").unwrap().is_empty());
    }

    #[test]
    fn parses_batched_frames_and_crlf_lines() {
        let raw = b"CONNECTED\r\nversion:1.2\r\nheart-beat:0,0\r\n\r\n\0\nRECEIPT\nreceipt-id:7\n\n\0";
        let frames = parse_frames(raw).unwrap();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].command, Command::Connected);
        assert_eq!(frames[0].get("heart-beat"), Some("0,0"));
        assert_eq!(frames[1].get("receipt-id"), Some("7"));
    }

    #[test]
    fn body_without_content_length_runs_to_nul() {
        let raw = b"MESSAGE\ndestination:/topic/newTopics/1\n\nNEW_TOPIC\0";
        let frames = parse_frames(raw).unwrap();
        assert_eq!(frames[0].body, Bytes::from_static(b"NEW_TOPIC"));
    }

    #[test]
    fn escaped_headers_are_decoded_except_on_connected() {
        let raw = b"MESSAGE\nx-note:a\\cb\\nc\n\n\0";
        let frames = parse_frames(raw).unwrap();
        assert_eq!(frames[0].get("x-note"), Some("a:b\nc"));

        let raw = b"CONNECTED\nserver:x\\cy\n\n\0";
        let frames = parse_frames(raw).unwrap();
        assert_eq!(frames[0].get("server"), Some("x\\cy"));
    }

    #[test]
    fn header_values_are_escaped_on_encode() {
        let frame = Frame::new(Command::Send).header("x-note", "a:b");
        let encoded = frame.encode();
        assert!(encoded.starts_with(b"SEND\nx-note:a\\cb\n"));
    }

    #[test]
    fn rejects_malformed_frames() {
        assert_eq!(
            parse_frames(b"BOGUS\n\n\0"),
            Err(FrameError::UnknownCommand("BOGUS".into()))
        );
        assert_eq!(
            parse_frames(b"MESSAGE\nno-colon\n\n\0"),
            Err(FrameError::MalformedHeader("no-colon".into()))
        );
        assert_eq!(parse_frames(b"MESSAGE\n\nbody"), Err(FrameError::MissingNul));
        assert_eq!(
            parse_frames(b"MESSAGE\ncontent-length:9\n\nabc\0"),
            Err(FrameError::MissingNul)
        );
    }
}
