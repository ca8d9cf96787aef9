// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use bytes::Bytes;

use crate::cfg::enums::{ProtocolVersion, SubscriptionKind, TrackingMode};

/// An outbound command: an ordered sequence of opaque byte arguments.
///
/// The first argument is the ASCII-uppercase command token. Arguments
/// are never inspected or re-encoded by the codec; anything that can
/// be viewed as bytes is a valid argument.
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    args: Vec<Bytes>,
}

impl Command {
    pub fn new(name: &'static str) -> Self {
        Self {
            args: vec![Bytes::from_static(name.as_bytes())],
        }
    }

    pub fn arg(mut self, arg: impl Into<Bytes>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Copying append for borrowed byte slices.
    pub fn arg_slice(mut self, arg: &[u8]) -> Self {
        self.args.push(Bytes::copy_from_slice(arg));
        self
    }

    pub fn arg_str(self, arg: &str) -> Self {
        self.arg_slice(arg.as_bytes())
    }

    pub fn arg_int(mut self, arg: i64) -> Self {
        let mut buf = itoa::Buffer::new();
        self.args
            .push(Bytes::copy_from_slice(buf.format(arg).as_bytes()));
        self
    }

    pub fn args(&self) -> &[Bytes] {
        &self.args
    }

    pub fn len(&self) -> usize {
        self.args.len()
    }

    pub fn is_empty(&self) -> bool {
        self.args.is_empty()
    }

    /// Command token, for logging and the subscription-mode allowlist.
    pub fn name(&self) -> &[u8] {
        self.args.first().map(Bytes::as_ref).unwrap_or_default()
    }
}

// ── commands the core itself issues ─────────────────────────────────

impl Command {
    pub fn ping() -> Self {
        Command::new("PING")
    }

    pub fn hello(version: ProtocolVersion, auth: Option<(&str, &str)>) -> Self {
        let mut cmd = Command::new("HELLO").arg_int(i64::from(version.as_u8()));
        if let Some((user, pass)) = auth {
            cmd = cmd.arg_str("AUTH").arg_str(user).arg_str(pass);
        }
        cmd
    }

    /// Legacy auth for version-2 servers. With no username the server
    /// expects the single-argument form.
    pub fn auth(username: Option<&str>, password: &str) -> Self {
        match username {
            Some(user) => Command::new("AUTH").arg_str(user).arg_str(password),
            None => Command::new("AUTH").arg_str(password),
        }
    }

    pub fn select(database: u32) -> Self {
        Command::new("SELECT").arg_int(i64::from(database))
    }

    pub fn client_setname(name: &str) -> Self {
        Command::new("CLIENT").arg_str("SETNAME").arg_str(name)
    }

    pub fn client_tracking(mode: TrackingMode, prefixes: &[String]) -> Self {
        let mut cmd = Command::new("CLIENT").arg_str("TRACKING").arg_str("ON");
        match mode {
            TrackingMode::Default => {},
            TrackingMode::OptIn => cmd = cmd.arg_str("OPTIN"),
            TrackingMode::OptOut => cmd = cmd.arg_str("OPTOUT"),
            TrackingMode::Broadcast => {
                cmd = cmd.arg_str("BCAST");
                for prefix in prefixes {
                    cmd = cmd.arg_str("PREFIX").arg_str(prefix);
                }
            },
        }
        cmd
    }

    pub fn subscribe(kind: SubscriptionKind, channels: &[Bytes]) -> Self {
        let name = match kind {
            SubscriptionKind::Channel => "SUBSCRIBE",
            SubscriptionKind::Pattern => "PSUBSCRIBE",
            SubscriptionKind::Shard => "SSUBSCRIBE",
        };
        channels
            .iter()
            .fold(Command::new(name), |cmd, ch| cmd.arg(ch.clone()))
    }

    /// With no channels the server unsubscribes from everything of
    /// that kind.
    pub fn unsubscribe(kind: SubscriptionKind, channels: &[Bytes]) -> Self {
        let name = match kind {
            SubscriptionKind::Channel => "UNSUBSCRIBE",
            SubscriptionKind::Pattern => "PUNSUBSCRIBE",
            SubscriptionKind::Shard => "SUNSUBSCRIBE",
        };
        channels
            .iter()
            .fold(Command::new(name), |cmd, ch| cmd.arg(ch.clone()))
    }

    pub fn multi() -> Self {
        Command::new("MULTI")
    }

    pub fn exec() -> Self {
        Command::new("EXEC")
    }

    pub fn discard() -> Self {
        Command::new("DISCARD")
    }

    pub fn watch(keys: &[Bytes]) -> Self {
        keys.iter()
            .fold(Command::new("WATCH"), |cmd, key| cmd.arg(key.clone()))
    }

    pub fn unwatch() -> Self {
        Command::new("UNWATCH")
    }

    pub fn get(key: &[u8]) -> Self {
        Command::new("GET").arg_slice(key)
    }

    pub fn set(key: &[u8], value: &[u8]) -> Self {
        Command::new("SET").arg_slice(key).arg_slice(value)
    }

    /// Atomic set-if-absent with a millisecond TTL; the lock
    /// acquisition primitive.
    pub fn set_nx_px(key: &[u8], value: &[u8], ttl_ms: u64) -> Self {
        Command::new("SET")
            .arg_slice(key)
            .arg_slice(value)
            .arg_str("NX")
            .arg_str("PX")
            .arg_int(ttl_ms as i64)
    }

    pub fn script_load(source: &str) -> Self {
        Command::new("SCRIPT").arg_str("LOAD").arg_str(source)
    }

    pub fn evalsha(sha: &str, keys: &[&[u8]], args: &[&[u8]]) -> Self {
        let mut cmd = Command::new("EVALSHA")
            .arg_str(sha)
            .arg_int(keys.len() as i64);
        for key in keys {
            cmd = cmd.arg_slice(key);
        }
        for arg in args {
            cmd = cmd.arg_slice(arg);
        }
        cmd
    }

    pub fn role() -> Self {
        Command::new("ROLE")
    }

    pub fn info(section: Option<&str>) -> Self {
        match section {
            Some(s) => Command::new("INFO").arg_str(s),
            None => Command::new("INFO"),
        }
    }

    pub fn cluster_slots() -> Self {
        Command::new("CLUSTER").arg_str("SLOTS")
    }

    pub fn asking() -> Self {
        Command::new("ASKING")
    }

    pub fn sentinel_get_master_addr(service: &str) -> Self {
        Command::new("SENTINEL")
            .arg_str("get-master-addr-by-name")
            .arg_str(service)
    }

    pub fn sentinel_masters() -> Self {
        Command::new("SENTINEL").arg_str("masters")
    }

    pub fn sentinel_replicas(service: &str) -> Self {
        Command::new("SENTINEL").arg_str("replicas").arg_str(service)
    }
}
