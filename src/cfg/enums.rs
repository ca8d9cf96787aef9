// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use core::fmt;

use serde::{Deserialize, Serialize};

/// Wire protocol revision negotiated during the handshake.
///
/// Version 3 is the default and a superset of version 2; the client
/// falls back to 2 when the server does not understand `HELLO`.
#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolVersion {
    #[serde(rename = "2", alias = "resp2", alias = "RESP2")]
    Resp2,
    #[serde(rename = "3", alias = "resp3", alias = "RESP3")]
    Resp3,
}

impl ProtocolVersion {
    pub fn as_u8(self) -> u8 {
        match self {
            ProtocolVersion::Resp2 => 2,
            ProtocolVersion::Resp3 => 3,
        }
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_u8())
    }
}

/// Server-assisted invalidation modes for the tracking cache.
#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum TrackingMode {
    /// Server tracks every key this client reads.
    #[default]
    Default,
    /// Only reads explicitly marked for caching are tracked.
    OptIn,
    /// Every read is tracked except those explicitly excluded.
    OptOut,
    /// Server broadcasts invalidations for the configured prefixes.
    Broadcast,
}

/// The three subscription families of the pub/sub surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubscriptionKind {
    Channel,
    Pattern,
    Shard,
}

/// Which role Sentinel discovery should resolve to.
#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum SentinelRole {
    #[default]
    Master,
    Replica,
}

/// How multi-address DNS answers are walked.
#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum DnsStrategy {
    #[default]
    RoundRobin,
    Random,
}

/// How the health orchestrator folds probe results into one signal.
#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum AggregationPolicy {
    /// Every probe must pass.
    #[default]
    All,
    /// One passing probe suffices.
    Any,
    /// More than half must pass.
    Majority,
}

/// What to do with an event when the async dispatch queue is full.
#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum QueueFullPolicy {
    #[default]
    DropOldest,
    DropNew,
    /// Wait for queue space up to the given deadline, then drop.
    BlockMs(u64),
}

/// What a failing event handler does to the publishing path.
#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ErrorStrategy {
    /// Swallow the error.
    Ignore,
    /// Record it and keep dispatching.
    #[default]
    Log,
    /// Propagate to the publisher.
    Raise,
}
