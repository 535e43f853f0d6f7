//! Wire codec (§4.1): line-oriented text frames over the WebSocket transport.
//!
//! A frame is either a published [`Message`], a `#status` notification, or a
//! `!error` frame. See `SPEC_FULL.md` §4.1 for the exact grammar.

use serde_json::Value;

use crate::error::{Error, Result};
use crate::message::{Filters, Message, Path};

#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Message(Message),
    Status {
        name: String,
        text: String,
        data: Option<Value>,
    },
    Error {
        name: String,
        text: String,
        data: Option<Value>,
    },
}

/// Splits `raw` into (metadata_line, header_line, body) per the grammar in
/// `SPEC_FULL.md` §4.1: metadata alone, or `metadata\nheader\nbody` where an
/// absent header is represented by an empty header line.
pub(crate) fn split_message_frame(raw: &[u8]) -> (&[u8], &[u8], &[u8]) {
    let Some(first_nl) = raw.iter().position(|&b| b == b'\n') else {
        return (raw, b"", b"");
    };
    let metadata = &raw[..first_nl];
    let rest = &raw[first_nl + 1..];
    let Some(second_nl) = rest.iter().position(|&b| b == b'\n') else {
        return (metadata, rest, b"");
    };
    (metadata, &rest[..second_nl], &rest[second_nl + 1..])
}

fn parse_filters(raw: &str) -> Result<Filters> {
    if raw.is_empty() {
        return Ok(Filters::new());
    }
    let value: Value =
        serde_json::from_str(raw).map_err(|_| Error::MalformedFrame("filters not valid json"))?;
    let Value::Object(map) = value else {
        return Err(Error::MalformedFrame("filters must be a json object"));
    };
    let mut filters = Filters::new();
    for (key, value) in map {
        let value = match value {
            Value::String(s) => s,
            other => other.to_string(),
        };
        filters.insert(key, value);
    }
    Ok(filters)
}

fn encode_filters(filters: &Filters) -> String {
    if filters.is_empty() {
        return String::new();
    }
    let map: serde_json::Map<String, Value> = filters
        .iter()
        .map(|(k, v)| (k.clone(), Value::String(v.clone())))
        .collect();
    Value::Object(map).to_string()
}

fn decode_message(raw: &[u8]) -> Result<Message> {
    let (metadata, header, body) = split_message_frame(raw);
    let metadata =
        std::str::from_utf8(metadata).map_err(|_| Error::MalformedFrame("metadata not utf8"))?;

    let mut front = metadata.splitn(5, ',');
    let path = front.next().ok_or(Error::MalformedFrame("missing path"))?;
    let id = front.next().ok_or(Error::MalformedFrame("missing id"))?;
    let user_id = front.next().ok_or(Error::MalformedFrame("missing userId"))?;
    let application_id = front
        .next()
        .ok_or(Error::MalformedFrame("missing applicationId"))?;
    let tail = front
        .next()
        .ok_or(Error::MalformedFrame("fewer than 8 metadata fields"))?;

    let mut back: Vec<&str> = tail.rsplitn(4, ',').collect();
    if back.len() != 4 {
        return Err(Error::MalformedFrame("fewer than 8 metadata fields"));
    }
    back.reverse();
    let filters_json = back[0];
    let expires = back[1];
    let time = back[2];
    let node_id = back[3];

    if path.is_empty() {
        return Err(Error::MalformedFrame("empty path"));
    }

    let id: u64 = id
        .parse()
        .map_err(|_| Error::MalformedFrame("id not numeric"))?;
    let expires: u64 = expires
        .parse()
        .map_err(|_| Error::MalformedFrame("expires not numeric"))?;
    let time: u64 = time
        .parse()
        .map_err(|_| Error::MalformedFrame("time not numeric"))?;
    let node_id: u8 = node_id
        .parse()
        .map_err(|_| Error::MalformedFrame("nodeId not numeric"))?;
    let filters = parse_filters(filters_json)?;

    Ok(Message {
        id,
        path: Path::new(path),
        user_id: user_id.to_string(),
        application_id: application_id.to_string(),
        filters,
        expires,
        time,
        node_id,
        header_json: header.to_vec(),
        body: body.to_vec(),
    })
}

fn encode_message(message: &Message) -> Vec<u8> {
    let metadata = format!(
        "{},{},{},{},{},{},{},{}",
        message.path,
        message.id,
        message.user_id,
        message.application_id,
        encode_filters(&message.filters),
        message.expires,
        message.time,
        message.node_id,
    );
    let mut out = metadata.into_bytes();
    if message.header_json.is_empty() && message.body.is_empty() {
        return out;
    }
    out.push(b'\n');
    out.extend_from_slice(&message.header_json);
    out.push(b'\n');
    out.extend_from_slice(&message.body);
    out
}

fn decode_notification(raw: &[u8], prefix: u8) -> Result<(String, String, Option<Value>)> {
    let raw = std::str::from_utf8(raw).map_err(|_| Error::MalformedFrame("notification not utf8"))?;
    let body = &raw[1..];
    let (first_line, rest) = match body.split_once('\n') {
        Some((a, b)) => (a, Some(b)),
        None => (body, None),
    };
    let (name, text) = match first_line.split_once(' ') {
        Some((name, text)) => (name, text),
        None => (first_line, ""),
    };
    if name.is_empty() {
        let kind = if prefix == b'!' { "error" } else { "status" };
        return Err(Error::MalformedFrame(match kind {
            "error" => "error frame missing name",
            _ => "status frame missing name",
        }));
    }
    let data = match rest {
        Some(json) if !json.is_empty() => Some(
            serde_json::from_str(json).map_err(|_| Error::MalformedFrame("notification data not json"))?,
        ),
        _ => None,
    };
    Ok((name.to_string(), text.to_string(), data))
}

/// Decodes one wire frame.
pub fn decode(raw: &[u8]) -> Result<Frame> {
    match raw.first() {
        Some(b'#') => {
            let (name, text, data) = decode_notification(raw, b'#')?;
            Ok(Frame::Status { name, text, data })
        }
        Some(b'!') => {
            let (name, text, data) = decode_notification(raw, b'!')?;
            Ok(Frame::Error { name, text, data })
        }
        _ => decode_message(raw).map(Frame::Message),
    }
}

/// Encodes one wire frame.
pub fn encode(frame: &Frame) -> Vec<u8> {
    match frame {
        Frame::Message(message) => encode_message(message),
        Frame::Status { name, text, data } => encode_notification(b'#', name, text, data),
        Frame::Error { name, text, data } => encode_notification(b'!', name, text, data),
    }
}

fn encode_notification(prefix: u8, name: &str, text: &str, data: &Option<Value>) -> Vec<u8> {
    let mut out = vec![prefix];
    out.extend_from_slice(name.as_bytes());
    if !text.is_empty() {
        out.push(b' ');
        out.extend_from_slice(text.as_bytes());
    }
    if let Some(data) = data {
        out.push(b'\n');
        out.extend_from_slice(data.to_string().as_bytes());
    }
    out
}

/// Builds an error frame for the wire-visible form of an [`Error`].
pub fn error_frame(err: &Error, topic: Option<&Path>) -> Frame {
    let text = match topic {
        Some(path) => format!("{} {}", err, path),
        None => err.to_string(),
    };
    Frame::Error {
        name: err.wire_name().to_string(),
        text,
        data: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_message() -> Message {
        let mut filters = Filters::new();
        filters.insert("user".to_string(), "user01".to_string());
        Message {
            id: 42,
            path: Path::new("/foo/bar"),
            user_id: "user01".to_string(),
            application_id: "phone01".to_string(),
            filters,
            expires: 1420110000,
            time: 1420110000,
            node_id: 1,
            header_json: br#"{"Content-Type": "text/plain"}"#.to_vec(),
            body: b"Hello World".to_vec(),
        }
    }

    #[test]
    fn round_trip_full_message() {
        let message = sample_message();
        let encoded = encode(&Frame::Message(message.clone()));
        let decoded = decode(&encoded).unwrap();
        assert_eq!(decoded, Frame::Message(message));
    }

    #[test]
    fn minimal_frame_has_no_trailing_newline() {
        let message = Message {
            id: 42,
            path: Path::new("/"),
            user_id: String::new(),
            application_id: String::new(),
            filters: Filters::new(),
            expires: 0,
            time: 1420110000,
            node_id: 0,
            header_json: Vec::new(),
            body: Vec::new(),
        };
        let encoded = encode(&Frame::Message(message));
        assert_eq!(encoded, b"/,42,,,,0,1420110000,0");
    }

    #[test]
    fn minimal_frame_with_body() {
        let message = Message {
            id: 42,
            path: Path::new("/"),
            user_id: String::new(),
            application_id: String::new(),
            filters: Filters::new(),
            expires: 0,
            time: 1420110000,
            node_id: 0,
            header_json: Vec::new(),
            body: b"Hello World".to_vec(),
        };
        let encoded = encode(&Frame::Message(message.clone()));
        assert_eq!(encoded, b"/,42,,,,0,1420110000,0\n\nHello World");
        assert_eq!(decode(&encoded).unwrap(), Frame::Message(message));
    }

    #[test]
    fn decode_rejects_short_metadata() {
        let err = decode(b"/foo,42,user,app").unwrap_err();
        assert!(matches!(err, Error::MalformedFrame(_)));
    }

    #[test]
    fn decode_rejects_non_numeric_id() {
        let err = decode(b"/foo,abc,,,,0,1,0").unwrap_err();
        assert!(matches!(err, Error::MalformedFrame(_)));
    }

    #[test]
    fn decode_rejects_empty_path() {
        let err = decode(b",42,,,,0,1,0").unwrap_err();
        assert!(matches!(err, Error::MalformedFrame(_)));
    }

    #[test]
    fn status_and_error_frames() {
        let status = decode(b"#status\n{\"maxId\":5}").unwrap();
        assert_eq!(
            status,
            Frame::Status {
                name: "status".to_string(),
                text: String::new(),
                data: Some(serde_json::json!({"maxId": 5})),
            }
        );

        let err = decode(b"!bad-request malformed frame").unwrap();
        assert_eq!(
            err,
            Frame::Error {
                name: "bad-request".to_string(),
                text: "malformed frame".to_string(),
                data: None,
            }
        );
    }

    #[test]
    fn error_frame_without_name_fails() {
        let err = decode(b"!").unwrap_err();
        assert!(matches!(err, Error::MalformedFrame(_)));
    }

    #[test]
    fn filters_with_embedded_commas_round_trip() {
        let mut filters = Filters::new();
        filters.insert("a".to_string(), "1".to_string());
        filters.insert("b".to_string(), "2".to_string());
        let message = Message {
            id: 7,
            path: Path::new("/x"),
            user_id: "u".to_string(),
            application_id: "a".to_string(),
            filters,
            expires: 0,
            time: 10,
            node_id: 0,
            header_json: Vec::new(),
            body: Vec::new(),
        };
        let encoded = encode(&Frame::Message(message.clone()));
        assert_eq!(decode(&encoded).unwrap(), Frame::Message(message));
    }
}
