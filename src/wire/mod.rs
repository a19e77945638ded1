//! Wire protocol plumbing: the `Codec` multiplexes between the binary and
//! text framings on a single TCP port, picking one per command by peeking
//! its leading byte (`\0` selects binary, per the protocol).

pub mod binary;
pub mod protocol;
pub mod text;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{self, Framed};

use protocol::{Command, Response};
use text::{TextCommand, TextResponse};

/// A decoded unit of client input, binary or text.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Event {
    Request(Command),
    Text(TextCommand),
}

/// A unit of server output, binary or text.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outgoing {
    Response(Response),
    Text(TextResponse),
}

impl From<Response> for Outgoing {
    fn from(r: Response) -> Self {
        Outgoing::Response(r)
    }
}

impl From<TextResponse> for Outgoing {
    fn from(r: TextResponse) -> Self {
        Outgoing::Text(r)
    }
}

#[derive(Debug, Default)]
enum State {
    #[default]
    Idle,
    Binary(binary::Decoder),
    Text,
}

#[derive(Debug, Default)]
pub struct Codec {
    state: State,
    text_decoder: text::Decoder,
    binary_encoder: binary::Encoder,
    text_encoder: text::Encoder,
}

impl codec::Decoder for Codec {
    type Item = Event;
    type Error = Error;

    fn decode(&mut self, src: &mut bytes::BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            match &mut self.state {
                State::Idle => {
                    match src.first() {
                        None => return Ok(None),
                        Some(0) => self.state = State::Binary(binary::Decoder::default()),
                        Some(_) => self.state = State::Text,
                    }
                },
                State::Binary(dec) => {
                    return match dec.decode(src) {
                        Ok(Some(cmd)) => {
                            self.state = State::Idle;
                            Ok(Some(Event::Request(cmd)))
                        },
                        Ok(None) => Ok(None),
                        Err(e) => {
                            self.state = State::Idle;
                            Err(e.into())
                        },
                    };
                },
                State::Text => {
                    use codec::Decoder as _;
                    return match self.text_decoder.decode(src) {
                        Ok(Some(cmd)) => {
                            self.state = State::Idle;
                            Ok(Some(Event::Text(cmd)))
                        },
                        Ok(None) => Ok(None),
                        Err(e) => {
                            self.state = State::Idle;
                            Err(e.into())
                        },
                    };
                },
            }
        }
    }
}

impl codec::Encoder<Outgoing> for Codec {
    type Error = Error;

    fn encode(&mut self, item: Outgoing, dst: &mut bytes::BytesMut) -> Result<(), Self::Error> {
        use codec::Encoder as _;
        match item {
            Outgoing::Response(r) => self.binary_encoder.encode(r, dst)?,
            Outgoing::Text(r) => self.text_encoder.encode(r, dst)?,
        }
        Ok(())
    }
}

#[derive(Debug)]
pub enum Error {
    Binary(binary::Error),
    Io(std::io::Error),
}

impl std::error::Error for Error {}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

impl From<binary::Error> for Error {
    fn from(value: binary::Error) -> Self {
        Error::Binary(value)
    }
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Error::Io(value)
    }
}

pub fn framed<T: AsyncRead + AsyncWrite>(stream: T) -> Framed<T, Codec> {
    Framed::new(stream, Codec::default())
}
