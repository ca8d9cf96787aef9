// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::time::Duration;

use once_cell::sync::OnceCell;
use tokio::time::{Instant, sleep};
use tracing::debug;

use crate::{
    client::connection::Connection,
    models::{
        command::Command,
        error::{ClientError, ErrorKind},
        value::Value,
    },
    utils::generate_token,
};

/// Compare-token-then-delete. 1 = deleted by us, -1 = key already
/// gone, 0 = held by someone else.
const RELEASE_SCRIPT: &str = "\
if redis.call('get', KEYS[1]) == ARGV[1] then
  return redis.call('del', KEYS[1])
elseif redis.call('exists', KEYS[1]) == 0 then
  return -1
else
  return 0
end";

/// Compare-token-then-reset-TTL; ARGV[3] selects additive extension.
const EXTEND_SCRIPT: &str = "\
if redis.call('get', KEYS[1]) ~= ARGV[1] then
  return 0
end
if ARGV[3] == '1' then
  local ttl = redis.call('pttl', KEYS[1])
  if ttl < 0 then ttl = 0 end
  return redis.call('pexpire', KEYS[1], ttl + tonumber(ARGV[2]))
end
return redis.call('pexpire', KEYS[1], tonumber(ARGV[2]))";

/// A server-side script addressed by its SHA once loaded.
struct Script {
    source: &'static str,
    sha: OnceCell<String>,
}

impl Script {
    const fn new(source: &'static str) -> Self {
        Self {
            source,
            sha: OnceCell::new(),
        }
    }

    async fn load(&self, conn: &mut Connection) -> Result<String, ClientError> {
        let reply = conn.call(&Command::script_load(self.source)).await?;
        let sha = reply.as_text().ok_or_else(|| {
            ClientError::UnexpectedReply(format!("SCRIPT LOAD answered {reply}"))
        })?;
        let _ = self.sha.set(sha.clone());
        Ok(sha)
    }

    /// EVALSHA with one reload-and-retry when the server restarted and
    /// lost its script table.
    async fn run(
        &self,
        conn: &mut Connection,
        keys: &[&[u8]],
        args: &[&[u8]],
    ) -> Result<Value, ClientError> {
        let sha = match self.sha.get() {
            Some(sha) => sha.clone(),
            None => self.load(conn).await?,
        };
        match conn.call(&Command::evalsha(&sha, keys, args)).await {
            Err(ClientError::Server(e)) if e.kind() == ErrorKind::NoScript => {
                debug!("script cache miss on server; reloading");
                let sha = self.load(conn).await?;
                conn.call(&Command::evalsha(&sha, keys, args)).await
            },
            other => other,
        }
    }
}

static RELEASE: Script = Script::new(RELEASE_SCRIPT);
static EXTEND: Script = Script::new(EXTEND_SCRIPT);

/// How a release attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    /// We held it and deleted it.
    Released,
    /// The key expired before we released.
    AlreadyExpired,
    /// Someone else holds it now; nothing was deleted.
    NotOwned,
}

/// Single-instance distributed lock over atomic set-if-absent.
///
/// Every acquisition carries a fresh random token; release and extend
/// run token-compared scripts on the server, so this client can never
/// delete or prolong a lock another client holds.
#[derive(Debug, Clone)]
pub struct DistributedLock {
    name: String,
    token: String,
    ttl: Duration,
    poll_interval: Duration,
}

impl DistributedLock {
    pub fn new(name: impl Into<String>, ttl: Duration) -> Self {
        Self {
            name: name.into(),
            token: generate_token(),
            ttl,
            poll_interval: Duration::from_millis(100),
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The token bound to this acquisition attempt.
    pub fn token(&self) -> &str {
        &self.token
    }

    /// One `SET name token NX PX ttl` attempt.
    pub async fn try_acquire(&self, conn: &mut Connection) -> Result<bool, ClientError> {
        let cmd = Command::set_nx_px(
            self.name.as_bytes(),
            self.token.as_bytes(),
            self.ttl.as_millis() as u64,
        );
        match conn.call(&cmd).await? {
            Value::Simple(s) if s == "OK" => Ok(true),
            Value::NullBulk | Value::Null | Value::NullArray => Ok(false),
            other => Err(ClientError::UnexpectedReply(format!(
                "SET NX answered {other}"
            ))),
        }
    }

    /// Polls until acquired or the caller's deadline passes.
    pub async fn acquire(
        &self,
        conn: &mut Connection,
        deadline: Duration,
    ) -> Result<(), ClientError> {
        let give_up = Instant::now() + deadline;
        loop {
            if self.try_acquire(conn).await? {
                return Ok(());
            }
            if Instant::now() + self.poll_interval > give_up {
                return Err(ClientError::LockAcquire {
                    name: self.name.clone(),
                });
            }
            sleep(self.poll_interval).await;
        }
    }

    /// Token-checked release.
    pub async fn release(
        &self,
        conn: &mut Connection,
    ) -> Result<ReleaseOutcome, ClientError> {
        let reply = RELEASE
            .run(
                conn,
                &[self.name.as_bytes()],
                &[self.token.as_bytes()],
            )
            .await?;
        match reply.as_int() {
            Some(1) => Ok(ReleaseOutcome::Released),
            Some(-1) => Ok(ReleaseOutcome::AlreadyExpired),
            Some(0) => Ok(ReleaseOutcome::NotOwned),
            _ => Err(ClientError::UnexpectedReply(format!(
                "release script answered {reply}"
            ))),
        }
    }

    /// Token-checked TTL update: `additive` adds to the remaining TTL,
    /// otherwise the TTL is replaced.
    pub async fn extend(
        &self,
        conn: &mut Connection,
        ttl: Duration,
        additive: bool,
    ) -> Result<(), ClientError> {
        let ttl_arg = (ttl.as_millis() as u64).to_string();
        let additive_arg: &[u8] = if additive { b"1" } else { b"0" };
        let reply = EXTEND
            .run(
                conn,
                &[self.name.as_bytes()],
                &[self.token.as_bytes(), ttl_arg.as_bytes(), additive_arg],
            )
            .await?;
        match reply.as_int() {
            Some(1) => Ok(()),
            Some(_) => Err(ClientError::LockNotOwned),
            None => Err(ClientError::UnexpectedReply(format!(
                "extend script answered {reply}"
            ))),
        }
    }
}
