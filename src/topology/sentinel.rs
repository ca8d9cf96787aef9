// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::sync::Arc;

use rand::seq::IndexedRandom;
use tracing::{debug, info, warn};

use crate::{
    cfg::{
        config::{Config, SentinelConfig, ServerAddr},
        enums::SentinelRole,
    },
    client::connection::Connection,
    events::{DisconnectReason, EventBus},
    models::{command::Command, error::ClientError, value::Value},
};

/// Master (or replica) discovery through a list of sentinels.
///
/// Each sentinel is asked in order for the current master address; the
/// answer is cross-checked against `SENTINEL masters` (flagged-down
/// masters and answers with too few agreeing peers are rejected), and
/// the data connection must confirm the expected `ROLE` before it is
/// handed out. A `READONLY` reply later means the master was demoted
/// under us; discard the connection and discover again.
#[derive(Debug)]
pub struct SentinelDiscovery {
    cfg: Arc<Config>,
    events: EventBus,
}

impl SentinelDiscovery {
    pub fn new(cfg: Arc<Config>, events: EventBus) -> Result<Self, ClientError> {
        if cfg.sentinel.is_none() {
            return Err(ClientError::Config(
                "sentinel discovery requires a sentinel section".into(),
            ));
        }
        Ok(Self { cfg, events })
    }

    /// Discovers the configured role and returns a verified data
    /// connection to it.
    pub async fn connect(&self) -> Result<Connection, ClientError> {
        let scfg = self
            .cfg
            .sentinel
            .clone()
            .ok_or_else(|| ClientError::Config("missing sentinel section".into()))?;

        let mut last: Option<ClientError> = None;
        for endpoint in &scfg.endpoints {
            match self.try_endpoint(endpoint, &scfg).await {
                Ok(conn) => return Ok(conn),
                Err(e) => {
                    warn!("sentinel {endpoint} did not yield a usable {:?}: {e}", scfg.role);
                    last = Some(e);
                },
            }
        }
        Err(last.unwrap_or_else(|| ClientError::Connect {
            addr: scfg.service_name.clone(),
            reason: "no sentinel endpoint answered".into(),
        }))
    }

    /// Address of the current master according to the first sentinel
    /// that answers and validates.
    pub async fn current_master(&self) -> Result<ServerAddr, ClientError> {
        let scfg = self
            .cfg
            .sentinel
            .clone()
            .ok_or_else(|| ClientError::Config("missing sentinel section".into()))?;
        let mut last: Option<ClientError> = None;
        for endpoint in &scfg.endpoints {
            match self.master_from(endpoint, &scfg).await {
                Ok(addr) => return Ok(addr),
                Err(e) => last = Some(e),
            }
        }
        Err(last.unwrap_or_else(|| ClientError::Connect {
            addr: scfg.service_name.clone(),
            reason: "no sentinel endpoint answered".into(),
        }))
    }

    async fn try_endpoint(
        &self,
        endpoint: &ServerAddr,
        scfg: &SentinelConfig,
    ) -> Result<Connection, ClientError> {
        let addr = match scfg.role {
            SentinelRole::Master => self.master_from(endpoint, scfg).await?,
            SentinelRole::Replica => self.replica_from(endpoint, scfg).await?,
        };

        let mut data_cfg = (*self.cfg).clone();
        data_cfg.address = vec![addr.clone()];
        data_cfg.sentinel = None;
        let mut conn =
            Connection::connect_to(Arc::new(data_cfg), &addr, self.events.clone())
                .await?;

        let role = conn.call(&Command::role()).await?;
        let announced = role
            .into_elements()
            .and_then(|items| items.into_iter().next())
            .and_then(|v| v.as_text());
        let expected = match scfg.role {
            SentinelRole::Master => "master",
            SentinelRole::Replica => "slave",
        };
        if announced.as_deref() != Some(expected) {
            // Stale sentinel answer (failover race); reject so the
            // caller retries discovery.
            conn.close(DisconnectReason::Error).await;
            return Err(ClientError::Connect {
                addr: addr.to_string(),
                reason: format!(
                    "ROLE announced {:?}, expected {expected}",
                    announced.as_deref().unwrap_or("nothing")
                ),
            });
        }
        info!("sentinel discovery resolved {} to {addr}", scfg.service_name);
        Ok(conn)
    }

    async fn master_from(
        &self,
        endpoint: &ServerAddr,
        scfg: &SentinelConfig,
    ) -> Result<ServerAddr, ClientError> {
        let mut conn = self.sentinel_conn(endpoint).await?;

        let reply = conn
            .call(&Command::sentinel_get_master_addr(&scfg.service_name))
            .await?;
        let Some(addr) = addr_pair(&reply) else {
            conn.close(DisconnectReason::Normal).await;
            return Err(ClientError::UnexpectedReply(format!(
                "get-master-addr-by-name answered {reply}"
            )));
        };

        // Validate against the sentinel's own master table.
        let masters = conn.call(&Command::sentinel_masters()).await?;
        let verdict = validate_master(&masters, &scfg.service_name, scfg.min_other_sentinels);
        conn.close(DisconnectReason::Normal).await;
        match verdict {
            Ok(()) => Ok(addr),
            Err(reason) => Err(ClientError::Connect {
                addr: addr.to_string(),
                reason,
            }),
        }
    }

    async fn replica_from(
        &self,
        endpoint: &ServerAddr,
        scfg: &SentinelConfig,
    ) -> Result<ServerAddr, ClientError> {
        let mut conn = self.sentinel_conn(endpoint).await?;
        let reply = conn
            .call(&Command::sentinel_replicas(&scfg.service_name))
            .await?;
        conn.close(DisconnectReason::Normal).await;

        let Value::Array(entries) = reply else {
            return Err(ClientError::UnexpectedReply(format!(
                "SENTINEL replicas answered {reply}"
            )));
        };
        let healthy: Vec<ServerAddr> = entries
            .iter()
            .filter(|entry| !flagged_down(entry))
            .filter_map(entry_addr)
            .collect();
        healthy
            .choose(&mut rand::rng())
            .cloned()
            .ok_or_else(|| ClientError::Connect {
                addr: scfg.service_name.clone(),
                reason: "no healthy replica reported".into(),
            })
    }

    /// Sentinels speak the same wire protocol but hold no databases;
    /// strip the data-plane parts of the config before dialing one.
    async fn sentinel_conn(
        &self,
        endpoint: &ServerAddr,
    ) -> Result<Connection, ClientError> {
        let mut cfg = (*self.cfg).clone();
        cfg.address = vec![endpoint.clone()];
        cfg.database_index = 0;
        cfg.tracking = None;
        cfg.sentinel = None;
        debug!("querying sentinel {endpoint}");
        Connection::connect_to(Arc::new(cfg), endpoint, self.events.clone()).await
    }
}

/// `[host, port]` reply shape of get-master-addr-by-name.
fn addr_pair(reply: &Value) -> Option<ServerAddr> {
    let items = match reply {
        Value::Array(items) => items,
        _ => return None,
    };
    let host = items.first().and_then(Value::as_text)?;
    let port: u16 = items.get(1).and_then(Value::as_text)?.parse().ok()?;
    Some(ServerAddr::tcp(host, port))
}

fn validate_master(
    masters: &Value,
    service: &str,
    min_other_sentinels: u32,
) -> Result<(), String> {
    let Value::Array(entries) = masters else {
        return Err(format!("SENTINEL masters answered {masters}"));
    };
    let entry = entries.iter().find(|entry| {
        entry
            .lookup(b"name")
            .and_then(Value::as_bytes)
            .is_some_and(|name| name == service.as_bytes())
    });
    let Some(entry) = entry else {
        return Err(format!("sentinel does not monitor {service:?}"));
    };

    if flagged_down(entry) {
        return Err(format!("master {service:?} is flagged down"));
    }
    let peers = entry
        .lookup(b"num-other-sentinels")
        .and_then(Value::as_bytes)
        .and_then(|b| std::str::from_utf8(b).ok())
        .and_then(|s| s.parse::<u32>().ok())
        .unwrap_or(0);
    if peers < min_other_sentinels {
        return Err(format!(
            "only {peers} peer sentinels agree, {min_other_sentinels} required"
        ));
    }
    Ok(())
}

/// `flags` carrying s_down/o_down mark an instance unusable.
fn flagged_down(entry: &Value) -> bool {
    entry
        .lookup(b"flags")
        .and_then(Value::as_text)
        .is_some_and(|flags| flags.contains("s_down") || flags.contains("o_down"))
}

/// `[ip, port]` entries inside SENTINEL replicas answers.
fn entry_addr(entry: &Value) -> Option<ServerAddr> {
    let host = entry.lookup(b"ip").and_then(Value::as_text)?;
    let port: u16 = entry
        .lookup(b"port")
        .and_then(Value::as_text)?
        .parse()
        .ok()?;
    Some(ServerAddr::tcp(host, port))
}
