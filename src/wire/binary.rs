//! Binary framing: 12-byte header (4-byte magic, 4-byte BE command, 4-byte BE
//! size) followed by a NUL-delimited body.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec;

use super::protocol::{Command, Magic, RawPacket, Response};

const HEADER_LEN: usize = 12;

#[derive(Debug, Default)]
pub enum Decoder {
    #[default]
    Header,
    Body {
        magic: Magic,
        command: u32,
        remaining: usize,
    },
}

impl codec::Decoder for Decoder {
    type Item = Command;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            match *self {
                Decoder::Header => {
                    if src.len() < HEADER_LEN {
                        return Ok(None);
                    }

                    let magic_bytes: [u8; 4] = src[0..4].try_into().unwrap();
                    let Some(magic) = Magic::from_bytes(&magic_bytes) else {
                        src.advance(HEADER_LEN.min(src.len()));
                        return Err(Response::Error {
                            code: "bad_magic",
                            message: "unrecognised packet magic".into(),
                        }
                        .into());
                    };
                    let command = u32::from_be_bytes(src[4..8].try_into().unwrap());
                    let size = u32::from_be_bytes(src[8..12].try_into().unwrap()) as usize;

                    src.advance(HEADER_LEN);
                    src.reserve(size.min(65_536));
                    *self = Decoder::Body { magic, command, remaining: size };
                },
                Decoder::Body { magic, command, remaining } => {
                    if src.len() < remaining {
                        return Ok(None);
                    }

                    let body = src.split_to(remaining).freeze();
                    *self = Decoder::Header;

                    let Some(n) = super::protocol::request_arg_count(command) else {
                        return Err(Response::Error {
                            code: "unexpected_command",
                            message: format!("command {command} not recognised"),
                        }
                        .into());
                    };

                    let args: Vec<Bytes> = if n == 0 {
                        Vec::new()
                    } else {
                        split_args(body, n)
                    };

                    let raw = RawPacket { magic, command, args };
                    return match Command::try_from(raw) {
                        Ok(cmd) => Ok(Some(cmd)),
                        Err(e) => Err(Response::from(e).into()),
                    };
                },
            }
        }
    }
}

/// Splits `body` into exactly `n` pieces on single NUL bytes; the last piece
/// runs to the end of the body (and is never split further, so it may
/// contain embedded NULs — this is how job payloads are carried).
fn split_args(body: Bytes, n: usize) -> Vec<Bytes> {
    let mut out = Vec::with_capacity(n);
    let mut rest = body;
    for _ in 0..n - 1 {
        match rest.iter().position(|&b| b == 0) {
            Some(idx) => {
                let arg = rest.split_to(idx);
                rest.advance(1);
                out.push(arg);
            },
            None => {
                out.push(rest.clone());
                rest = Bytes::new();
            },
        }
    }
    out.push(rest);
    out
}

#[derive(Debug, Default)]
pub struct Encoder;

impl codec::Encoder<Response> for Encoder {
    type Error = Error;

    fn encode(&mut self, item: Response, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let (command, args) = item.to_wire();
        let body_len: usize = args.iter().map(|a| a.len()).sum::<usize>() + args.len().saturating_sub(1);

        dst.reserve(HEADER_LEN + body_len);
        dst.put_slice(&Magic::Res.bytes());
        dst.put_u32(command);
        dst.put_u32(body_len as u32);

        for (i, arg) in args.iter().enumerate() {
            if i > 0 {
                dst.put_u8(0);
            }
            dst.put_slice(arg);
        }

        Ok(())
    }
}

#[derive(Debug)]
pub enum Error {
    Client(Response),
    Io(std::io::Error),
}

impl std::error::Error for Error {}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

impl From<Response> for Error {
    fn from(value: Response) -> Self {
        Error::Client(value)
    }
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Error::Io(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::protocol::Priority;
    use tokio_stream::StreamExt;
    use tokio_util::codec::{FramedRead, FramedWrite};

    fn header(command: u32, size: u32) -> Vec<u8> {
        let mut v = Magic::Req.bytes().to_vec();
        v.extend(command.to_be_bytes());
        v.extend(size.to_be_bytes());
        v
    }

    #[tokio::test]
    async fn test_decode_submit_job() {
        let mut body = header(super::super::protocol::code::SUBMIT_JOB, 0);
        let payload = b"reverse\0u1\0hello".to_vec();
        body[8..12].copy_from_slice(&(payload.len() as u32).to_be_bytes());
        body.extend(payload);

        let decoder = Decoder::default();
        let mut framed = FramedRead::new(body.as_slice(), decoder);

        let got = framed.next().await.unwrap().unwrap();
        assert_eq!(
            got,
            Command::SubmitJob {
                function: Bytes::from_static(b"reverse"),
                unique: Bytes::from_static(b"u1"),
                payload: Bytes::from_static(b"hello"),
                priority: Priority::Normal,
                background: false,
                epoch: None,
            }
        );
    }

    #[tokio::test]
    async fn test_roundtrip_echo() {
        let resp = Response::EchoRes { payload: Bytes::from_static(b"hello") };

        let mut buf = Vec::new();
        {
            let mut framed = FramedWrite::new(&mut buf, Encoder);
            use futures::SinkExt;
            framed.send(resp.clone()).await.unwrap();
        }

        assert_eq!(&buf[0..4], b"\0RES");
        let command = u32::from_be_bytes(buf[4..8].try_into().unwrap());
        assert_eq!(command, super::super::protocol::code::ECHO_RES);
        let size = u32::from_be_bytes(buf[8..12].try_into().unwrap()) as usize;
        assert_eq!(&buf[12..12 + size], b"hello");
    }

    #[tokio::test]
    async fn test_bad_magic() {
        let mut body = b"\0BAD".to_vec();
        body.extend(1u32.to_be_bytes());
        body.extend(0u32.to_be_bytes());

        let decoder = Decoder::default();
        let mut framed = FramedRead::new(body.as_slice(), decoder);

        assert!(matches!(
            framed.next().await.unwrap().unwrap_err(),
            Error::Client(Response::Error { code: "bad_magic", .. })
        ));
    }
}
