// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{io, time::Duration};

use thiserror::Error;

/// Where in the input a decode failure was detected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind} at byte {at_offset}")]
pub struct DecodeError {
    pub kind: DecodeKind,
    pub at_offset: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DecodeKind {
    #[error("malformed frame: {0}")]
    Malformed(&'static str),
    #[error("stream ended inside a frame")]
    UnexpectedEof,
    #[error("frame type not valid for the negotiated protocol version")]
    ProtocolMismatch,
}

impl DecodeError {
    pub fn malformed(what: &'static str, at_offset: usize) -> Self {
        Self {
            kind: DecodeKind::Malformed(what),
            at_offset,
        }
    }
}

/// An error line sent by the server (`-PREFIX message\r\n`).
///
/// The prefix is the first whitespace-delimited token and doubles as
/// the error kind; well-known prefixes get a structured [`ErrorKind`]
/// so middleware can branch without string matching.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{prefix} {message}")]
pub struct ServerError {
    pub prefix: String,
    pub message: String,
}

/// Structured view of the well-known error prefixes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    /// `MOVED <slot> <host:port>` — the slot now lives elsewhere.
    Moved { slot: u16, addr: String },
    /// `ASK <slot> <host:port>` — one-shot redirect during migration.
    Ask { slot: u16, addr: String },
    Loading,
    Busy,
    NoScript,
    ReadOnly,
    ClusterDown,
    MasterDown,
    WrongType,
    NoAuth,
    NoProto,
    Other,
}

impl ServerError {
    /// Splits an error line into prefix and message.
    pub fn parse(line: &str) -> Self {
        match line.split_once(' ') {
            Some((prefix, message)) => Self {
                prefix: prefix.to_string(),
                message: message.to_string(),
            },
            None => Self {
                prefix: line.to_string(),
                message: String::new(),
            },
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self.prefix.as_str() {
            "MOVED" => self
                .redirect_target()
                .map(|(slot, addr)| ErrorKind::Moved { slot, addr })
                .unwrap_or(ErrorKind::Other),
            "ASK" => self
                .redirect_target()
                .map(|(slot, addr)| ErrorKind::Ask { slot, addr })
                .unwrap_or(ErrorKind::Other),
            "LOADING" => ErrorKind::Loading,
            "BUSY" => ErrorKind::Busy,
            "NOSCRIPT" => ErrorKind::NoScript,
            "READONLY" => ErrorKind::ReadOnly,
            "CLUSTERDOWN" => ErrorKind::ClusterDown,
            "MASTERDOWN" => ErrorKind::MasterDown,
            "WRONGTYPE" => ErrorKind::WrongType,
            "NOAUTH" => ErrorKind::NoAuth,
            "NOPROTO" => ErrorKind::NoProto,
            _ => ErrorKind::Other,
        }
    }

    /// `<slot> <host:port>` tail of a MOVED/ASK error.
    fn redirect_target(&self) -> Option<(u16, String)> {
        let (slot, addr) = self.message.split_once(' ')?;
        let slot: u16 = slot.parse().ok()?;
        Some((slot, addr.to_string()))
    }

    /// Transient server states that retry middleware may wait out.
    pub fn is_transient(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Loading
                | ErrorKind::Busy
                | ErrorKind::Moved { .. }
                | ErrorKind::Ask { .. }
        )
    }
}

/// Everything the client can fail with, split into the transport,
/// server and middleware layers the reliability code branches on.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("connect to {addr}: {reason}")]
    Connect { addr: String, reason: String },
    #[error("handshake: {0}")]
    Handshake(String),
    #[error("{0} timed out")]
    Timeout(&'static str),
    #[error("connection closed by peer")]
    ClosedByPeer,
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error("i/o: {0}")]
    Io(#[from] io::Error),

    #[error(transparent)]
    Server(#[from] ServerError),

    #[error("pool exhausted: {size} connections busy after {waited:?}")]
    PoolExhausted { size: usize, waited: Duration },
    #[error("pool is shut down")]
    PoolClosed,
    #[error("circuit breaker is open")]
    CircuitOpen,
    #[error("retries exhausted after {attempts} attempts")]
    RetryExhausted {
        attempts: u32,
        #[source]
        last: Box<ClientError>,
    },
    #[error("lock '{name}' not acquired before the deadline")]
    LockAcquire { name: String },
    #[error("lock is not held by this token")]
    LockNotOwned,
    #[error("transaction aborted: a watched key changed")]
    TransactionAborted,

    #[error("unexpected reply: {0}")]
    UnexpectedReply(String),
    #[error("connection is closed")]
    ConnectionClosed,
    #[error("only subscription commands are permitted while subscribed")]
    SubscribedMode,
    #[error("configuration: {0}")]
    Config(String),
    #[error("operation cancelled")]
    Cancelled,
}

impl ClientError {
    /// The designated transient set: connection errors, I/O timeouts,
    /// and the server-side `LOADING`/`BUSY`/`MOVED`/`ASK` states.
    /// Protocol, authentication and application errors are permanent.
    pub fn is_transient(&self) -> bool {
        match self {
            ClientError::Connect { .. }
            | ClientError::Timeout(_)
            | ClientError::ClosedByPeer
            | ClientError::Io(_) => true,
            ClientError::Server(e) => e.is_transient(),
            _ => false,
        }
    }

    pub fn server_kind(&self) -> Option<ErrorKind> {
        match self {
            ClientError::Server(e) => Some(e.kind()),
            _ => None,
        }
    }
}
