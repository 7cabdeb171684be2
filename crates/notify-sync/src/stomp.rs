//! STOMP 1.2 frame codec.
//!
//! Frames travel as WebSocket text messages. A single message may carry
//! several frames or bare end-of-line heart-beats, so decoding works on a
//! buffer and yields a sequence of [`Incoming`] items.

use std::fmt;
use std::time::Duration;

use crate::error::{Result, SyncError};

/// STOMP frame commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StompCommand {
    // Client frames
    Connect,
    Stomp,
    Send,
    Subscribe,
    Unsubscribe,
    Ack,
    Nack,
    Begin,
    Commit,
    Abort,
    Disconnect,
    // Server frames
    Connected,
    Message,
    Receipt,
    Error,
}

impl StompCommand {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connect => "CONNECT",
            Self::Stomp => "STOMP",
            Self::Send => "SEND",
            Self::Subscribe => "SUBSCRIBE",
            Self::Unsubscribe => "UNSUBSCRIBE",
            Self::Ack => "ACK",
            Self::Nack => "NACK",
            Self::Begin => "BEGIN",
            Self::Commit => "COMMIT",
            Self::Abort => "ABORT",
            Self::Disconnect => "DISCONNECT",
            Self::Connected => "CONNECTED",
            Self::Message => "MESSAGE",
            Self::Receipt => "RECEIPT",
            Self::Error => "ERROR",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "CONNECT" => Self::Connect,
            "STOMP" => Self::Stomp,
            "SEND" => Self::Send,
            "SUBSCRIBE" => Self::Subscribe,
            "UNSUBSCRIBE" => Self::Unsubscribe,
            "ACK" => Self::Ack,
            "NACK" => Self::Nack,
            "BEGIN" => Self::Begin,
            "COMMIT" => Self::Commit,
            "ABORT" => Self::Abort,
            "DISCONNECT" => Self::Disconnect,
            "CONNECTED" => Self::Connected,
            "MESSAGE" => Self::Message,
            "RECEIPT" => Self::Receipt,
            "ERROR" => Self::Error,
            _ => return None,
        })
    }

    /// CONNECT/CONNECTED headers are sent verbatim, all others are escaped.
    fn escapes_headers(&self) -> bool {
        !matches!(self, Self::Connect | Self::Connected)
    }
}

impl fmt::Display for StompCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single STOMP frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub command: StompCommand,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

/// One item decoded from the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Incoming {
    Heartbeat,
    Frame(Frame),
}

impl Frame {
    pub fn new(command: StompCommand) -> Self {
        Self {
            command,
            headers: Vec::new(),
            body: String::new(),
        }
    }

    /// Append a header.
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Set the frame body.
    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    /// Look up a header. Repeated headers resolve to the first occurrence.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    /// Encode the frame, including the trailing NUL.
    pub fn encode(&self) -> String {
        let escape = self.command.escapes_headers();
        let mut out = String::with_capacity(64 + self.body.len());
        out.push_str(self.command.as_str());
        out.push('\n');
        for (name, value) in &self.headers {
            if escape {
                out.push_str(&escape_header(name));
                out.push(':');
                out.push_str(&escape_header(value));
            } else {
                out.push_str(name);
                out.push(':');
                out.push_str(value);
            }
            out.push('\n');
        }
        if !self.body.is_empty() && self.get("content-length").is_none() {
            out.push_str(&format!("content-length:{}\n", self.body.len()));
        }
        out.push('\n');
        out.push_str(&self.body);
        out.push('\0');
        out
    }

    /// Decode exactly one frame at the start of `input`.
    ///
    /// Returns the frame and the number of bytes consumed, including the NUL
    /// terminator and any trailing end-of-line characters.
    pub fn decode_one(input: &str) -> Result<(Frame, usize)> {
        let (command_line, mut pos) = read_line(input, 0)
            .ok_or_else(|| SyncError::protocol("truncated frame: missing command line"))?;
        let command = StompCommand::parse(command_line)
            .ok_or_else(|| SyncError::protocol(format!("unknown STOMP command: {command_line}")))?;

        let unescape = command.escapes_headers();
        let mut headers = Vec::new();
        loop {
            let (line, next) = read_line(input, pos)
                .ok_or_else(|| SyncError::protocol("truncated frame: unterminated headers"))?;
            pos = next;
            if line.is_empty() {
                break;
            }
            let (name, value) = line
                .split_once(':')
                .ok_or_else(|| SyncError::protocol(format!("malformed header line: {line}")))?;
            if unescape {
                headers.push((unescape_header(name)?, unescape_header(value)?));
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
                    .map_err(|_| SyncError::protocol(format!("invalid content-length: {v}")))
            })
            .transpose()?;

        let rest = &input[pos..];
        let (body, consumed_body) = match content_length {
            Some(len) => {
                let body = rest
                    .get(..len)
                    .ok_or_else(|| SyncError::protocol("truncated frame: body shorter than content-length"))?;
                if rest.as_bytes().get(len) != Some(&0) {
                    return Err(SyncError::protocol("frame body not NUL-terminated"));
                }
                (body, len + 1)
            }
            None => {
                let end = rest
                    .find('\0')
                    .ok_or_else(|| SyncError::protocol("truncated frame: missing NUL terminator"))?;
                (&rest[..end], end + 1)
            }
        };
        pos += consumed_body;

        // Trailing EOLs after the NUL belong to this frame.
        while let Some(next) = skip_eol(input, pos) {
            pos = next;
        }

        Ok((
            Frame {
                command,
                headers,
                body: body.to_string(),
            },
            pos,
        ))
    }
}

/// Decode every frame and heart-beat contained in one wire message.
pub fn decode_all(input: &str) -> Result<Vec<Incoming>> {
    let mut items = Vec::new();
    let mut pos = 0;
    while pos < input.len() {
        if let Some(next) = skip_eol(input, pos) {
            items.push(Incoming::Heartbeat);
            pos = next;
            continue;
        }
        let (frame, consumed) = Frame::decode_one(&input[pos..])?;
        items.push(Incoming::Frame(frame));
        pos += consumed;
    }
    Ok(items)
}

/// Negotiate the outgoing heart-beat interval.
///
/// `client` is what the CONNECT frame offered as `(cx, cy)` in milliseconds;
/// `server` is the raw `heart-beat` header of the CONNECTED frame.
pub fn negotiate_heartbeat(client: (u64, u64), server: Option<&str>) -> Option<Duration> {
    let (cx, _) = client;
    let sy = server
        .and_then(|h| h.split_once(','))
        .and_then(|(_, sy)| sy.trim().parse::<u64>().ok())
        .unwrap_or(0);
    if cx == 0 || sy == 0 {
        return None;
    }
    Some(Duration::from_millis(cx.max(sy)))
}

fn read_line(input: &str, start: usize) -> Option<(&str, usize)> {
    let rest = input.get(start..)?;
    let end = rest.find('\n')?;
    let line = rest[..end].strip_suffix('\r').unwrap_or(&rest[..end]);
    Some((line, start + end + 1))
}

fn skip_eol(input: &str, pos: usize) -> Option<usize> {
    let rest = input.get(pos..)?;
    if rest.starts_with("\r\n") {
        Some(pos + 2)
    } else if rest.starts_with('\n') {
        Some(pos + 1)
    } else {
        None
    }
}

fn escape_header(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            ':' => out.push_str("\\c"),
            other => out.push(other),
        }
    }
    out
}

fn unescape_header(value: &str) -> Result<String> {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('\\') => out.push('\\'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('c') => out.push(':'),
            other => {
                return Err(SyncError::protocol(format!(
                    "invalid header escape sequence: \\{}",
                    other.map(String::from).unwrap_or_default()
                )));
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("plain", "plain")]
    #[case("a:b", "a\\cb")]
    #[case("line\nbreak", "line\\nbreak")]
    #[case("back\\slash", "back\\\\slash")]
    #[case("cr\rhere", "cr\\rhere")]
    fn test_header_escaping(#[case] raw: &str, #[case] escaped: &str) {
        assert_eq!(escape_header(raw), escaped);
        assert_eq!(unescape_header(escaped).unwrap(), raw);
    }

    #[test]
    fn test_invalid_escape_rejected() {
        assert!(unescape_header("bad\\t").is_err());
    }

    #[test]
    fn test_encode_send_frame() {
        let frame = Frame::new(StompCommand::Send)
            .header("destination", "/app/notification/markRead")
            .with_body(r#"{"notificationId":1}"#);
        assert_eq!(
            frame.encode(),
            "SEND\ndestination:/app/notification/markRead\ncontent-length:20\n\n{\"notificationId\":1}\0"
        );
    }

    #[test]
    fn test_connect_headers_not_escaped() {
        let frame = Frame::new(StompCommand::Connect).header("host", "example.com:8080");
        assert!(frame.encode().contains("host:example.com:8080\n"));
    }

    #[test]
    fn test_decode_message_frame() {
        let wire = "MESSAGE\ndestination:/user/queue/notifications\nsubscription:sub-0\nmessage-id:1\n\n{\"type\":\"CONNECT_ACK\"}\0\n";
        let (frame, consumed) = Frame::decode_one(wire).unwrap();
        assert_eq!(consumed, wire.len());
        assert_eq!(frame.command, StompCommand::Message);
        assert_eq!(frame.get("destination"), Some("/user/queue/notifications"));
        assert_eq!(frame.body, "{\"type\":\"CONNECT_ACK\"}");
    }

    #[test]
    fn test_decode_respects_content_length_with_nul_in_body() {
        let wire = "MESSAGE\ncontent-length:3\n\na\0b\0";
        let (frame, _) = Frame::decode_one(wire).unwrap();
        assert_eq!(frame.body, "a\0b");
    }

    #[test]
    fn test_decode_all_mixed_heartbeats_and_frames() {
        let wire = "\nCONNECTED\nversion:1.2\nheart-beat:0,10000\n\n\0\r\nMESSAGE\nmessage-id:2\n\nhi\0";
        let items = decode_all(wire).unwrap();
        assert_eq!(items.len(), 3);
        assert_eq!(items[0], Incoming::Heartbeat);
        match &items[1] {
            Incoming::Frame(f) => {
                assert_eq!(f.command, StompCommand::Connected);
                assert_eq!(f.get("heart-beat"), Some("0,10000"));
            }
            other => panic!("unexpected item: {other:?}"),
        }
        match &items[2] {
            Incoming::Frame(f) => assert_eq!(f.body, "hi"),
            other => panic!("unexpected item: {other:?}"),
        }
    }

    #[test]
    fn test_decode_rejects_truncated_frame() {
        assert!(Frame::decode_one("MESSAGE\ndestination:/x\n\nbody").is_err());
        assert!(Frame::decode_one("BOGUS\n\n\0").is_err());
    }

    #[test]
    fn test_first_header_wins() {
        let (frame, _) = Frame::decode_one("MESSAGE\nfoo:1\nfoo:2\n\n\0").unwrap();
        assert_eq!(frame.get("foo"), Some("1"));
    }

    #[rstest]
    #[case((10_000, 10_000), Some("0,5000"), Some(10_000))]
    #[case((10_000, 10_000), Some("0,20000"), Some(20_000))]
    #[case((10_000, 10_000), Some("5000,0"), None)]
    #[case((0, 10_000), Some("0,5000"), None)]
    #[case((10_000, 10_000), None, None)]
    fn test_negotiate_heartbeat(
        #[case] client: (u64, u64),
        #[case] server: Option<&str>,
        #[case] expected_ms: Option<u64>,
    ) {
        assert_eq!(
            negotiate_heartbeat(client, server),
            expected_ms.map(Duration::from_millis)
        );
    }
}
