//! Client command parsing (§4.6): `+`, `-`, `send`, and `status` frames.
//!
//! Distinct from [`crate::codec`]'s message/status/error frame grammar —
//! these are the textual commands a client sends, not the frames the server
//! sends back. Shares the codec's metadata/header/body line-splitting rule
//! since `send` reuses that exact grammar for its header and body.

use crate::codec::split_message_frame;
use crate::error::{Error, Result};
use crate::message::Path;
use crate::partition::StartPoint;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Subscribe {
        path: Path,
        start: Option<StartPoint>,
    },
    Unsubscribe {
        path: Path,
    },
    Send {
        path: Path,
        header: Vec<u8>,
        body: Vec<u8>,
    },
    Status {
        topic: String,
    },
}

fn parse_start(token: &str) -> Result<StartPoint> {
    let value: i64 = token
        .parse()
        .map_err(|_| Error::MalformedFrame("start id not numeric"))?;
    if value < 0 {
        Ok(StartPoint::LastN((-value) as usize))
    } else {
        Ok(StartPoint::Id(value as u64))
    }
}

pub fn parse(raw: &[u8]) -> Result<Command> {
    let (first_line, header, body) = split_message_frame(raw);
    let first_line = std::str::from_utf8(first_line)
        .map_err(|_| Error::MalformedFrame("command line not utf8"))?;
    let mut tokens = first_line.split_whitespace();
    let keyword = tokens.next().ok_or(Error::MalformedFrame("empty command"))?;

    match keyword {
        "+" => {
            let path = tokens.next().ok_or(Error::MalformedFrame("subscribe missing path"))?;
            let start = match tokens.next() {
                Some(token) => Some(parse_start(token)?),
                None => None,
            };
            Ok(Command::Subscribe {
                path: Path::new(path),
                start,
            })
        }
        "-" => {
            let path = tokens
                .next()
                .ok_or(Error::MalformedFrame("unsubscribe missing path"))?;
            Ok(Command::Unsubscribe {
                path: Path::new(path),
            })
        }
        "send" => {
            let path = tokens.next().ok_or(Error::MalformedFrame("send missing path"))?;
            Ok(Command::Send {
                path: Path::new(path),
                header: header.to_vec(),
                body: body.to_vec(),
            })
        }
        "status" => {
            let topic = tokens.next().unwrap_or("").to_string();
            Ok(Command::Status { topic })
        }
        _ => Err(Error::MalformedFrame("unrecognized command")),
    }
}
