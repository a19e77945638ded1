//! Binary wire protocol: packet framing, command identifiers, and the
//! decoded `Command`/`Response` types dispatch operates on.
//!
//! Command identifiers are fixed by the Gearman wire protocol and must not
//! be renumbered; existing Gearman clients and workers depend on them.

use bytes::Bytes;

/// Numeric command identifiers, as carried in the 12-byte packet header.
#[allow(dead_code)]
pub mod code {
    pub const TEXT: u32 = 0;
    pub const CAN_DO: u32 = 1;
    pub const CANT_DO: u32 = 2;
    pub const RESET_ABILITIES: u32 = 3;
    pub const PRE_SLEEP: u32 = 4;
    pub const NOOP: u32 = 6;
    pub const SUBMIT_JOB: u32 = 7;
    pub const JOB_CREATED: u32 = 8;
    pub const GRAB_JOB: u32 = 9;
    pub const NO_JOB: u32 = 10;
    pub const JOB_ASSIGN: u32 = 11;
    pub const WORK_STATUS: u32 = 12;
    pub const WORK_COMPLETE: u32 = 13;
    pub const WORK_FAIL: u32 = 14;
    pub const GET_STATUS: u32 = 15;
    pub const ECHO_REQ: u32 = 16;
    pub const ECHO_RES: u32 = 17;
    pub const SUBMIT_JOB_BG: u32 = 18;
    pub const ERROR: u32 = 19;
    pub const STATUS_RES: u32 = 20;
    pub const SUBMIT_JOB_HIGH: u32 = 21;
    pub const SET_CLIENT_ID: u32 = 22;
    pub const CAN_DO_TIMEOUT: u32 = 23;
    pub const ALL_YOURS: u32 = 24;
    pub const WORK_EXCEPTION: u32 = 25;
    pub const OPTION_REQ: u32 = 26;
    pub const OPTION_RES: u32 = 27;
    pub const WORK_DATA: u32 = 28;
    pub const WORK_WARNING: u32 = 29;
    pub const GRAB_JOB_UNIQ: u32 = 30;
    pub const JOB_ASSIGN_UNIQ: u32 = 31;
    pub const SUBMIT_JOB_HIGH_BG: u32 = 32;
    pub const SUBMIT_JOB_LOW: u32 = 33;
    pub const SUBMIT_JOB_LOW_BG: u32 = 34;
    pub const SUBMIT_JOB_SCHED: u32 = 35;
    pub const SUBMIT_JOB_EPOCH: u32 = 36;
    pub const SUBMIT_REDUCE_JOB: u32 = 37;
    pub const SUBMIT_REDUCE_JOB_BACKGROUND: u32 = 38;
    pub const GRAB_JOB_ALL: u32 = 39;
    pub const JOB_ASSIGN_ALL: u32 = 40;
    pub const GET_STATUS_UNIQUE: u32 = 41;
    pub const STATUS_RES_UNIQUE: u32 = 42;
}

/// Packet magic, identifying which side originated it.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Magic {
    Req,
    Res,
}

impl Magic {
    pub const fn bytes(self) -> [u8; 4] {
        match self {
            Magic::Req => *b"\0REQ",
            Magic::Res => *b"\0RES",
        }
    }

    pub fn from_bytes(b: &[u8; 4]) -> Option<Self> {
        match b {
            b"\0REQ" => Some(Magic::Req),
            b"\0RES" => Some(Magic::Res),
            _ => None,
        }
    }
}

/// A fully decoded binary packet before it has been interpreted as a
/// specific [`Command`]. `args` is the body split on single NUL bytes; the
/// last element is the payload and may itself contain NUL bytes, since it is
/// never split further.
#[derive(Debug, Clone)]
pub struct RawPacket {
    pub magic: Magic,
    pub command: u32,
    pub args: Vec<Bytes>,
}

/// Job priority. Ordering matches scheduling precedence: High is served
/// before Normal before Low.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub enum Priority {
    High,
    Normal,
    Low,
}

impl Priority {
    pub const ALL: [Priority; 3] = [Priority::High, Priority::Normal, Priority::Low];

    pub fn index(self) -> usize {
        match self {
            Priority::High => 0,
            Priority::Normal => 1,
            Priority::Low => 2,
        }
    }
}

/// A request understood by the command dispatcher. Produced by the binary
/// decoder from a [`RawPacket`] whose magic is [`Magic::Req`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    CanDo { function: Bytes },
    CanDoTimeout { function: Bytes, timeout: u32 },
    CantDo { function: Bytes },
    ResetAbilities,
    PreSleep,
    SubmitJob {
        function: Bytes,
        unique: Bytes,
        payload: Bytes,
        priority: Priority,
        background: bool,
        epoch: Option<u64>,
    },
    GetStatus { handle: Bytes },
    EchoReq { payload: Bytes },
    OptionReq { name: Bytes },
    GrabJob { uniq: bool },
    WorkData { handle: Bytes, payload: Bytes },
    WorkWarning { handle: Bytes, payload: Bytes },
    WorkStatus { handle: Bytes, numerator: Bytes, denominator: Bytes },
    WorkComplete { handle: Bytes, payload: Bytes },
    WorkException { handle: Bytes, payload: Bytes },
    WorkFail { handle: Bytes },
    SetClientId { id: Bytes },
}

/// A response or server-initiated packet understood by the binary encoder.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Response {
    Noop,
    JobCreated { handle: Bytes },
    JobAssign { handle: Bytes, function: Bytes, payload: Bytes },
    JobAssignUniq { handle: Bytes, function: Bytes, unique: Bytes, payload: Bytes },
    NoJob,
    WorkData { handle: Bytes, payload: Bytes },
    WorkWarning { handle: Bytes, payload: Bytes },
    WorkStatus { handle: Bytes, numerator: Bytes, denominator: Bytes },
    WorkComplete { handle: Bytes, payload: Bytes },
    WorkException { handle: Bytes, payload: Bytes },
    WorkFail { handle: Bytes },
    GetStatusRes {
        handle: Bytes,
        known: bool,
        running: bool,
        numerator: Bytes,
        denominator: Bytes,
    },
    EchoRes { payload: Bytes },
    OptionRes { name: Bytes },
    Error { code: &'static str, message: String },
}

/// Number of NUL-delimited arguments (including a trailing payload, if any)
/// a request command carries. `None` for commands this server doesn't
/// interpret (still routed to an `unexpected_command` error, never silently
/// dropped).
pub(crate) fn request_arg_count(command: u32) -> Option<usize> {
    use code::*;
    Some(match command {
        CAN_DO => 1,
        CAN_DO_TIMEOUT => 2,
        CANT_DO => 1,
        RESET_ABILITIES => 0,
        PRE_SLEEP => 0,
        SUBMIT_JOB | SUBMIT_JOB_HIGH | SUBMIT_JOB_LOW | SUBMIT_JOB_BG | SUBMIT_JOB_HIGH_BG
        | SUBMIT_JOB_LOW_BG => 3,
        SUBMIT_JOB_EPOCH => 4,
        GET_STATUS => 1,
        ECHO_REQ => 1,
        OPTION_REQ => 1,
        GRAB_JOB | GRAB_JOB_UNIQ => 0,
        WORK_DATA | WORK_WARNING | WORK_COMPLETE | WORK_EXCEPTION => 2,
        WORK_STATUS => 3,
        WORK_FAIL => 1,
        SET_CLIENT_ID => 1,
        _ => return None,
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolError {
    pub code: &'static str,
    pub message: String,
}

impl ProtocolError {
    fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self { code, message: message.into() }
    }
}

fn parse_u32(bytes: &[u8], what: &str) -> Result<u32, ProtocolError> {
    std::str::from_utf8(bytes)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| ProtocolError::new("bad_argument", format!("invalid {what}")))
}

fn parse_u64(bytes: &[u8], what: &str) -> Result<u64, ProtocolError> {
    std::str::from_utf8(bytes)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| ProtocolError::new("bad_argument", format!("invalid {what}")))
}

impl TryFrom<RawPacket> for Command {
    type Error = ProtocolError;

    fn try_from(pkt: RawPacket) -> Result<Self, Self::Error> {
        use code::*;

        if pkt.magic != Magic::Req {
            return Err(ProtocolError::new("bad_magic", "expected REQ magic"));
        }

        let Some(n) = request_arg_count(pkt.command) else {
            return Err(ProtocolError::new(
                "unexpected_command",
                format!("command {} not recognised", pkt.command),
            ));
        };
        if pkt.args.len() != n {
            return Err(ProtocolError::new(
                "bad_argument",
                format!("command {} expected {n} arguments, got {}", pkt.command, pkt.args.len()),
            ));
        }

        Ok(match pkt.command {
            CAN_DO => Command::CanDo { function: pkt.args[0].clone() },
            CAN_DO_TIMEOUT => Command::CanDoTimeout {
                function: pkt.args[0].clone(),
                timeout: parse_u32(&pkt.args[1], "timeout")?,
            },
            CANT_DO => Command::CantDo { function: pkt.args[0].clone() },
            RESET_ABILITIES => Command::ResetAbilities,
            PRE_SLEEP => Command::PreSleep,
            SUBMIT_JOB | SUBMIT_JOB_HIGH | SUBMIT_JOB_LOW | SUBMIT_JOB_BG | SUBMIT_JOB_HIGH_BG
            | SUBMIT_JOB_LOW_BG => {
                let priority = match pkt.command {
                    SUBMIT_JOB_HIGH | SUBMIT_JOB_HIGH_BG => Priority::High,
                    SUBMIT_JOB_LOW | SUBMIT_JOB_LOW_BG => Priority::Low,
                    _ => Priority::Normal,
                };
                let background = matches!(
                    pkt.command,
                    SUBMIT_JOB_BG | SUBMIT_JOB_HIGH_BG | SUBMIT_JOB_LOW_BG
                );
                Command::SubmitJob {
                    function: pkt.args[0].clone(),
                    unique: pkt.args[1].clone(),
                    payload: pkt.args[2].clone(),
                    priority,
                    background,
                    epoch: None,
                }
            },
            SUBMIT_JOB_EPOCH => Command::SubmitJob {
                function: pkt.args[0].clone(),
                unique: pkt.args[1].clone(),
                payload: pkt.args[3].clone(),
                priority: Priority::Normal,
                background: true,
                epoch: Some(parse_u64(&pkt.args[2], "epoch")?),
            },
            GET_STATUS => Command::GetStatus { handle: pkt.args[0].clone() },
            ECHO_REQ => Command::EchoReq { payload: pkt.args[0].clone() },
            OPTION_REQ => Command::OptionReq { name: pkt.args[0].clone() },
            GRAB_JOB => Command::GrabJob { uniq: false },
            GRAB_JOB_UNIQ => Command::GrabJob { uniq: true },
            WORK_DATA => Command::WorkData { handle: pkt.args[0].clone(), payload: pkt.args[1].clone() },
            WORK_WARNING => {
                Command::WorkWarning { handle: pkt.args[0].clone(), payload: pkt.args[1].clone() }
            },
            WORK_STATUS => Command::WorkStatus {
                handle: pkt.args[0].clone(),
                numerator: pkt.args[1].clone(),
                denominator: pkt.args[2].clone(),
            },
            WORK_COMPLETE => {
                Command::WorkComplete { handle: pkt.args[0].clone(), payload: pkt.args[1].clone() }
            },
            WORK_EXCEPTION => {
                Command::WorkException { handle: pkt.args[0].clone(), payload: pkt.args[1].clone() }
            },
            WORK_FAIL => Command::WorkFail { handle: pkt.args[0].clone() },
            SET_CLIENT_ID => Command::SetClientId { id: pkt.args[0].clone() },
            other => {
                return Err(ProtocolError::new(
                    "unexpected_command",
                    format!("command {other} not recognised"),
                ))
            },
        })
    }
}

impl Response {
    /// Flattens this response into a wire command id plus NUL-joined args,
    /// ready for the binary encoder.
    pub fn to_wire(&self) -> (u32, Vec<Bytes>) {
        use code::*;
        match self {
            Response::Noop => (NOOP, vec![]),
            Response::JobCreated { handle } => (JOB_CREATED, vec![handle.clone()]),
            Response::JobAssign { handle, function, payload } => {
                (JOB_ASSIGN, vec![handle.clone(), function.clone(), payload.clone()])
            },
            Response::JobAssignUniq { handle, function, unique, payload } => (
                JOB_ASSIGN_UNIQ,
                vec![handle.clone(), function.clone(), unique.clone(), payload.clone()],
            ),
            Response::NoJob => (NO_JOB, vec![]),
            Response::WorkData { handle, payload } => {
                (WORK_DATA, vec![handle.clone(), payload.clone()])
            },
            Response::WorkWarning { handle, payload } => {
                (WORK_WARNING, vec![handle.clone(), payload.clone()])
            },
            Response::WorkStatus { handle, numerator, denominator } => {
                (WORK_STATUS, vec![handle.clone(), numerator.clone(), denominator.clone()])
            },
            Response::WorkComplete { handle, payload } => {
                (WORK_COMPLETE, vec![handle.clone(), payload.clone()])
            },
            Response::WorkException { handle, payload } => {
                (WORK_EXCEPTION, vec![handle.clone(), payload.clone()])
            },
            Response::WorkFail { handle } => (WORK_FAIL, vec![handle.clone()]),
            Response::GetStatusRes { handle, known, running, numerator, denominator } => (
                STATUS_RES,
                vec![
                    handle.clone(),
                    Bytes::from(if *known { "1" } else { "0" }),
                    Bytes::from(if *running { "1" } else { "0" }),
                    numerator.clone(),
                    denominator.clone(),
                ],
            ),
            Response::EchoRes { payload } => (ECHO_RES, vec![payload.clone()]),
            Response::OptionRes { name } => (OPTION_RES, vec![name.clone()]),
            Response::Error { code, message } => {
                (ERROR, vec![Bytes::from(*code), Bytes::from(message.clone())])
            },
        }
    }
}

impl From<ProtocolError> for Response {
    fn from(e: ProtocolError) -> Self {
        Response::Error { code: e.code, message: e.message }
    }
}
