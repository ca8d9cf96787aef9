// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{collections::HashSet, time::Duration};

use bytes::Bytes;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{
    cfg::enums::SubscriptionKind,
    client::connection::Connection,
    models::{
        command::Command,
        error::ClientError,
        value::Value,
    },
};

/// What an out-of-band frame turned out to be.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushKind {
    Message,
    PMessage,
    SMessage,
    Subscribe,
    Unsubscribe,
    PSubscribe,
    PUnsubscribe,
    SSubscribe,
    SUnsubscribe,
    Invalidate,
    Other(String),
}

impl PushKind {
    fn parse(token: &[u8]) -> Self {
        match token {
            b"message" => PushKind::Message,
            b"pmessage" => PushKind::PMessage,
            b"smessage" => PushKind::SMessage,
            b"subscribe" => PushKind::Subscribe,
            b"unsubscribe" => PushKind::Unsubscribe,
            b"psubscribe" => PushKind::PSubscribe,
            b"punsubscribe" => PushKind::PUnsubscribe,
            b"ssubscribe" => PushKind::SSubscribe,
            b"sunsubscribe" => PushKind::SUnsubscribe,
            b"invalidate" => PushKind::Invalidate,
            other => PushKind::Other(String::from_utf8_lossy(other).into_owned()),
        }
    }

    fn is_confirmation(&self) -> bool {
        matches!(
            self,
            PushKind::Subscribe
                | PushKind::Unsubscribe
                | PushKind::PSubscribe
                | PushKind::PUnsubscribe
                | PushKind::SSubscribe
                | PushKind::SUnsubscribe
        )
    }
}

/// A classified push frame.
#[derive(Debug, Clone, PartialEq)]
pub struct PushMessage {
    pub kind: PushKind,
    /// Delivery channel, or the channel a confirmation refers to.
    pub channel: Option<Bytes>,
    /// Matching pattern for `pmessage` deliveries.
    pub pattern: Option<Bytes>,
    pub payload: Option<Bytes>,
    /// Remaining subscription count carried by confirmations.
    pub subscriptions: Option<i64>,
    /// Keys named by an `invalidate` frame.
    pub invalidated: Vec<Bytes>,
}

/// Splits a raw push frame by its leading kind token.
pub fn parse_push(items: Vec<Value>) -> Result<PushMessage, ClientError> {
    let mut items = items.into_iter();
    let kind = items
        .next()
        .as_ref()
        .and_then(Value::as_bytes)
        .map(PushKind::parse)
        .ok_or_else(|| {
            ClientError::UnexpectedReply("push frame without a kind token".into())
        })?;

    let mut msg = PushMessage {
        kind,
        channel: None,
        pattern: None,
        payload: None,
        subscriptions: None,
        invalidated: Vec::new(),
    };

    match msg.kind {
        PushKind::Message | PushKind::SMessage => {
            msg.channel = items.next().and_then(into_bytes);
            msg.payload = items.next().and_then(into_bytes);
        },
        PushKind::PMessage => {
            msg.pattern = items.next().and_then(into_bytes);
            msg.channel = items.next().and_then(into_bytes);
            msg.payload = items.next().and_then(into_bytes);
        },
        PushKind::Invalidate => {
            // One frame may carry many keys; a flat bulk is the
            // single-key shorthand some servers emit.
            match items.next() {
                Some(Value::Array(keys)) | Some(Value::Push(keys)) => {
                    msg.invalidated = keys.into_iter().filter_map(into_bytes).collect();
                },
                Some(Value::Bulk(key)) => msg.invalidated = vec![key],
                _ => {},
            }
        },
        _ => {
            msg.channel = items.next().and_then(into_bytes);
            msg.subscriptions = items.next().as_ref().and_then(Value::as_int);
        },
    }
    Ok(msg)
}

fn into_bytes(v: Value) -> Option<Bytes> {
    match v {
        Value::Bulk(b) => Some(b),
        Value::Simple(s) => Some(Bytes::from(s.into_bytes())),
        _ => None,
    }
}

/// A connection driven in subscription mode.
///
/// Owning the connection makes the restricted mode structural: while a
/// `Subscriber` exists, the only commands that can reach the wire are
/// the subscription family and `PING`. Getting the connection back
/// requires draining every subscription first.
#[derive(Debug)]
pub struct Subscriber {
    conn: Connection,
    channels: HashSet<Bytes>,
    patterns: HashSet<Bytes>,
    shard: HashSet<Bytes>,
}

impl Subscriber {
    pub fn new(conn: Connection) -> Self {
        Self {
            conn,
            channels: HashSet::new(),
            patterns: HashSet::new(),
            shard: HashSet::new(),
        }
    }

    /// Enters (or widens) a subscription. Confirmations arrive as
    /// push frames through [`Subscriber::next_message`].
    pub async fn subscribe(
        &mut self,
        kind: SubscriptionKind,
        channels: &[Bytes],
    ) -> Result<(), ClientError> {
        if channels.is_empty() {
            return Ok(());
        }
        self.conn.subscribed = true;
        let deadline = self.conn.cfg.timeout;
        self.conn.wbuf.push_command(&Command::subscribe(kind, channels));
        self.conn.flush(deadline).await?;
        self.tracked_set(kind).extend(channels.iter().cloned());
        Ok(())
    }

    /// Narrows a subscription; no channels means "all of this kind".
    pub async fn unsubscribe(
        &mut self,
        kind: SubscriptionKind,
        channels: &[Bytes],
    ) -> Result<(), ClientError> {
        let deadline = self.conn.cfg.timeout;
        self.conn
            .wbuf
            .push_command(&Command::unsubscribe(kind, channels));
        self.conn.flush(deadline).await?;
        let tracked = self.tracked_set(kind);
        if channels.is_empty() {
            tracked.clear();
        } else {
            for ch in channels {
                tracked.remove(ch);
            }
        }
        Ok(())
    }

    /// Subscription-mode keepalive.
    pub async fn ping(&mut self) -> Result<(), ClientError> {
        let deadline = self.conn.cfg.timeout;
        self.conn.wbuf.push_command(&Command::ping());
        self.conn.flush(deadline).await
    }

    /// Next push frame, classified. Confirmations update the local
    /// subscription accounting; a timeout is benign and retryable.
    pub async fn next_message(
        &mut self,
        deadline: Duration,
    ) -> Result<PushMessage, ClientError> {
        loop {
            let push = self.conn.read_push(deadline).await?;
            // Version-2 servers answer in-subscription PINGs with a
            // bare +PONG that read_push already filters; under v3 the
            // pong may arrive as a push-shaped pair.
            if push
                .first()
                .and_then(Value::as_bytes)
                .is_some_and(|t| t.eq_ignore_ascii_case(b"pong"))
            {
                continue;
            }
            let msg = parse_push(push)?;
            if msg.kind.is_confirmation()
                && msg.subscriptions == Some(0)
                && self.is_drained()
            {
                self.conn.subscribed = false;
            }
            return Ok(msg);
        }
    }

    /// Dispatch loop: hands every frame to `handler` until the stop
    /// token fires. The token is observed between frames.
    pub async fn run<F>(
        &mut self,
        mut handler: F,
        cancel: CancellationToken,
    ) -> Result<(), ClientError>
    where
        F: FnMut(PushMessage) + Send,
    {
        const POLL: Duration = Duration::from_millis(250);
        loop {
            if cancel.is_cancelled() {
                debug!("subscription loop stopped");
                return Ok(());
            }
            match self.next_message(POLL).await {
                Ok(msg) => handler(msg),
                Err(ClientError::Timeout(_)) => {},
                Err(e) => return Err(e),
            }
        }
    }

    /// No subscriptions of any kind remain.
    pub fn is_drained(&self) -> bool {
        self.channels.is_empty() && self.patterns.is_empty() && self.shard.is_empty()
    }

    /// Leaves subscription mode and returns the connection for normal
    /// use. Refused until every channel, pattern and shard channel is
    /// unsubscribed.
    pub async fn into_connection(mut self) -> Result<Connection, ClientError> {
        if !self.is_drained() {
            return Err(ClientError::SubscribedMode);
        }
        self.conn.subscribed = false;
        Ok(self.conn)
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    fn tracked_set(&mut self, kind: SubscriptionKind) -> &mut HashSet<Bytes> {
        match kind {
            SubscriptionKind::Channel => &mut self.channels,
            SubscriptionKind::Pattern => &mut self.patterns,
            SubscriptionKind::Shard => &mut self.shard,
        }
    }
}
