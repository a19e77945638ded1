//! Text/admin framing: `\n`-terminated lines, first whitespace-delimited
//! token is the command, the rest are its arguments. Shares the TCP port
//! with the binary protocol; `Codec` in `wire::mod` decides which framing
//! applies to an incoming command by peeking its first byte.

use bytes::{Buf, BytesMut};
use tokio_util::codec;

/// A parsed text-protocol admin command.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum TextCommand {
    Workers,
    Status,
    /// `maxqueue <fn> [n [n [n]]]`: a single parameter applies to all three
    /// priorities, matching the admin protocol's documented shorthand.
    MaxQueue { function: Vec<u8>, sizes: [Option<i64>; 3] },
    Shutdown { graceful: bool },
    Verbose,
    Version,
    GetPid,
    CreateFunction { name: Vec<u8> },
    DropFunction { name: Vec<u8> },
    Unknown { line: Vec<u8> },
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum TextResponse {
    Ok,
    Err { code: &'static str, message: String },
    Raw(String),
}

#[derive(Debug, Default)]
pub struct Decoder;

impl codec::Decoder for Decoder {
    type Item = TextCommand;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let Some(idx) = src.iter().position(|&b| b == b'\n') else {
            return Ok(None);
        };

        let mut line = src.split_to(idx);
        src.advance(1);
        if line.last() == Some(&b'\r') {
            line.truncate(line.len() - 1);
        }

        Ok(Some(parse_line(&line)))
    }
}

fn parse_line(line: &[u8]) -> TextCommand {
    let mut tokens = line.split(|&b| b == b' ').filter(|t| !t.is_empty());

    let Some(cmd) = tokens.next() else {
        return TextCommand::Unknown { line: line.to_vec() };
    };

    let args: Vec<&[u8]> = tokens.collect();

    match cmd.to_ascii_lowercase().as_slice() {
        b"workers" => TextCommand::Workers,
        b"status" => TextCommand::Status,
        b"verbose" => TextCommand::Verbose,
        b"version" => TextCommand::Version,
        b"getpid" => TextCommand::GetPid,
        b"shutdown" => TextCommand::Shutdown {
            graceful: args.first().map(|a| a.eq_ignore_ascii_case(b"graceful")).unwrap_or(false),
        },
        b"create" if args.len() == 2 && args[0].eq_ignore_ascii_case(b"function") => {
            TextCommand::CreateFunction { name: args[1].to_vec() }
        },
        b"drop" if args.len() == 2 && args[0].eq_ignore_ascii_case(b"function") => {
            TextCommand::DropFunction { name: args[1].to_vec() }
        },
        b"maxqueue" if !args.is_empty() => {
            let mut sizes = [None; 3];
            for (i, slot) in sizes.iter_mut().enumerate() {
                let arg_idx = if args.len() <= 2 { 1 } else { i + 1 };
                if let Some(raw) = args.get(arg_idx) {
                    *slot = std::str::from_utf8(raw).ok().and_then(|s| s.parse().ok());
                }
            }
            TextCommand::MaxQueue { function: args[0].to_vec(), sizes }
        },
        _ => TextCommand::Unknown { line: line.to_vec() },
    }
}

#[derive(Debug, Default)]
pub struct Encoder;

impl codec::Encoder<TextResponse> for Encoder {
    type Error = std::io::Error;

    fn encode(&mut self, item: TextResponse, dst: &mut BytesMut) -> Result<(), Self::Error> {
        use bytes::BufMut;

        match item {
            TextResponse::Ok => dst.put_slice(b"OK\r\n"),
            TextResponse::Err { code, message } => {
                dst.put_slice(b"ERR ");
                dst.put_slice(code.as_bytes());
                dst.put_slice(b" ");
                dst.put_slice(urlencode(&message).as_bytes());
                dst.put_slice(b"\r\n");
            },
            TextResponse::Raw(s) => {
                dst.put_slice(s.as_bytes());
                dst.put_slice(b"\r\n");
            },
        }

        Ok(())
    }
}

/// Minimal space-to-`+` urlencoding, matching the admin protocol's
/// `ERR <code> <urlencoded-msg>` convention.
fn urlencode(s: &str) -> String {
    s.chars()
        .map(|c| if c == ' ' { '+' } else { c })
        .collect()
}
