use std::io;

use thiserror::Error;

/// Coarse classification of [DmsgError]s, deciding how callers react to them
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ErrorCategory {
    /// fatal for the session / stream attempt, never retried automatically
    Handshake,
    /// the peer broke the protocol - the connection must be torn down
    Protocol,
    /// local and recoverable, e.g. by picking another port or slowing down
    Resource,
    /// network layer
    Transport,
    /// operation on an entity that was closed
    Closed,
}

#[derive(Debug, Error, Clone, Eq, PartialEq)]
pub enum DmsgError {
    #[error("request has invalid signature")]
    ReqInvalidSig,
    #[error("request has invalid timestamp (not greater than last)")]
    ReqInvalidTimestamp,
    #[error("request has invalid source public key")]
    ReqInvalidSrcPk,
    #[error("request has invalid destination public key")]
    ReqInvalidDstPk,
    #[error("request has invalid source port")]
    ReqInvalidSrcPort,
    #[error("request has invalid destination port")]
    ReqInvalidDstPort,
    #[error("response has invalid signature")]
    RespInvalidSig,
    #[error("response has invalid hash of associated request")]
    RespInvalidHash,
    #[error("no listener on destination port")]
    ReqNoListener,
    #[error("relay server has no session to destination")]
    ReqNoSession,
    #[error("listener accept buffer is full")]
    AcceptBufferFull,
    #[error("request rejected with unknown error code {0}")]
    UnknownErrorCode(u8),

    #[error("handshake payload version mismatch: expected {expected}, got {actual}")]
    HandshakeVersionMismatch { expected: u8, actual: u8 },
    #[error("noise handshake failed to verify: {0}")]
    HandshakeVerify(String),
    #[error("noise handshake config error: {0}")]
    HandshakeConfig(String),
    #[error("handshake timed out")]
    HandshakeTimeout,
    #[error("session handshake left extra bytes in the read buffer")]
    SessionHandshakeExtraBytes,
    #[error("failed to decrypt message")]
    Decrypt,

    #[error("remote is not respecting the advertised window size")]
    WindowExceeded,
    #[error("unknown frame type {0}")]
    UnknownFrameType(u8),
    #[error("frame exceeds maximum size: {0} bytes")]
    FrameTooLarge(usize),

    #[error("port {0} is already occupied")]
    PortOccupied(u16),
    #[error("no free ephemeral port")]
    NoEphemeralPort,
    #[error("server has reached its maximum number of sessions")]
    SessionLimitReached,

    #[error("client entry has no delegated servers")]
    NoDelegatedServers,
    #[error("cannot connect to any delegated server")]
    CannotConnectToDelegated,
    #[error("discovery entry not found")]
    DiscEntryNotFound,
    #[error("discovery entry is invalid: {0}")]
    DiscEntryInvalid(String),

    #[error("entity is closed")]
    EntityClosed,
    #[error("session is closed")]
    SessionClosed,
    #[error("stream is closed")]
    StreamClosed,
    #[error("listener is closed")]
    ListenerClosed,
}

impl DmsgError {
    pub fn category(&self) -> ErrorCategory {
        use DmsgError::*;

        match self {
            ReqInvalidSig | ReqInvalidTimestamp | ReqInvalidSrcPk | ReqInvalidDstPk
            | ReqInvalidSrcPort | ReqInvalidDstPort | ReqNoListener | ReqNoSession
            | UnknownErrorCode(_) | HandshakeVersionMismatch { .. } | HandshakeVerify(_)
            | HandshakeConfig(_) | HandshakeTimeout | SessionHandshakeExtraBytes
            | NoDelegatedServers | CannotConnectToDelegated => ErrorCategory::Handshake,
            RespInvalidSig | RespInvalidHash | Decrypt | WindowExceeded | UnknownFrameType(_)
            | FrameTooLarge(_) | DiscEntryInvalid(_) => ErrorCategory::Protocol,
            AcceptBufferFull | PortOccupied(_) | NoEphemeralPort | SessionLimitReached
            | DiscEntryNotFound => ErrorCategory::Resource,
            EntityClosed | SessionClosed | StreamClosed | ListenerClosed => ErrorCategory::Closed,
        }
    }

    /// The code a responder puts into a rejection response. Only request / response level errors
    ///  have codes, everything else is reported as 'unknown'.
    pub fn code(&self) -> u8 {
        use DmsgError::*;

        match self {
            ReqInvalidSig => 50,
            ReqInvalidTimestamp => 51,
            ReqInvalidSrcPk => 52,
            ReqInvalidDstPk => 53,
            ReqInvalidSrcPort => 54,
            ReqInvalidDstPort => 55,
            RespInvalidSig => 56,
            RespInvalidHash => 57,
            ReqNoListener => 58,
            ReqNoSession => 59,
            AcceptBufferFull => 60,
            HandshakeVerify(_) => 62,
            _ => 0,
        }
    }

    pub fn from_code(code: u8) -> DmsgError {
        use DmsgError::*;

        match code {
            50 => ReqInvalidSig,
            51 => ReqInvalidTimestamp,
            52 => ReqInvalidSrcPk,
            53 => ReqInvalidDstPk,
            54 => ReqInvalidSrcPort,
            55 => ReqInvalidDstPort,
            56 => RespInvalidSig,
            57 => RespInvalidHash,
            58 => ReqNoListener,
            59 => ReqNoSession,
            60 => AcceptBufferFull,
            62 => HandshakeVerify("rejected by remote".to_string()),
            code => UnknownErrorCode(code),
        }
    }

    /// The [DmsgError] wrapped in an [anyhow::Error], if any
    pub fn of(err: &anyhow::Error) -> Option<&DmsgError> {
        err.downcast_ref::<DmsgError>()
    }

    pub fn is(err: &anyhow::Error, expected: &DmsgError) -> bool {
        Self::of(err) == Some(expected)
    }
}

pub fn category_of(err: &anyhow::Error) -> Option<ErrorCategory> {
    if let Some(e) = DmsgError::of(err) {
        return Some(e.category());
    }
    if err.downcast_ref::<io::Error>().is_some() || err.downcast_ref::<tokio::time::error::Elapsed>().is_some() {
        return Some(ErrorCategory::Transport);
    }
    None
}

/// Transport errors that may go away when retried
pub fn is_temporary(err: &anyhow::Error) -> bool {
    if let Some(e) = DmsgError::of(err) {
        return matches!(e, DmsgError::HandshakeTimeout | DmsgError::SessionLimitReached | DmsgError::AcceptBufferFull);
    }
    if err.downcast_ref::<tokio::time::error::Elapsed>().is_some() {
        return true;
    }
    match err.downcast_ref::<io::Error>() {
        Some(e) => is_temporary_io(e),
        None => false,
    }
}

pub fn is_temporary_io(err: &io::Error) -> bool {
    use io::ErrorKind::*;

    matches!(err.kind(), TimedOut | WouldBlock | Interrupted | ConnectionRefused | ConnectionReset | ConnectionAborted)
}
