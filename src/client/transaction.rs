// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use bytes::Bytes;

use crate::{
    client::connection::Connection,
    models::{command::Command, error::ClientError, value::Value},
};

/// An optimistic transaction: `WATCH keys...`, `MULTI`, queued
/// commands, `EXEC`.
///
/// The exchange borrows the connection mutably for its whole lifetime,
/// so watch state can never leak across a pool checkout. If any
/// watched key changes before `EXEC`, the server answers with a null
/// array and [`Transaction::exec`] reports `TransactionAborted`.
#[derive(Debug)]
pub struct Transaction<'c> {
    conn: &'c mut Connection,
    queued: usize,
}

impl<'c> Transaction<'c> {
    /// Issues `WATCH` (when keys are given) and `MULTI`.
    pub async fn begin(
        conn: &'c mut Connection,
        watch_keys: &[Bytes],
    ) -> Result<Transaction<'c>, ClientError> {
        let deadline = conn.cfg.timeout;
        if !watch_keys.is_empty() {
            let reply = conn
                .call_with_timeout(&Command::watch(watch_keys), deadline)
                .await?;
            expect_status(&reply, "OK")?;
        }
        let reply = conn.call_with_timeout(&Command::multi(), deadline).await?;
        expect_status(&reply, "OK")?;
        Ok(Transaction { conn, queued: 0 })
    }

    /// Queues one command. The server's inline reply must be the
    /// `QUEUED` status; the real result arrives with `EXEC`.
    pub async fn queue(&mut self, cmd: Command) -> Result<(), ClientError> {
        let deadline = self.conn.cfg.timeout;
        match self.conn.call_raw(&cmd, deadline).await? {
            Value::Simple(s) if s == "QUEUED" => {
                self.queued += 1;
                Ok(())
            },
            Value::Error(e) => {
                // The server refused to queue (bad arity, ...); the
                // transaction is poisoned and must be discarded.
                self.discard_inner().await;
                Err(ClientError::Server(e))
            },
            other => {
                self.discard_inner().await;
                Err(ClientError::UnexpectedReply(format!(
                    "MULTI queue answered {other}"
                )))
            },
        }
    }

    pub fn queued(&self) -> usize {
        self.queued
    }

    /// Runs `EXEC` and returns the per-command results. A null reply
    /// means a watched key changed and nothing ran.
    pub async fn exec(self) -> Result<Vec<Value>, ClientError> {
        let deadline = self.conn.cfg.timeout;
        match self.conn.call_with_timeout(&Command::exec(), deadline).await? {
            Value::NullArray | Value::Null => Err(ClientError::TransactionAborted),
            Value::Array(results) => Ok(results),
            other => Err(ClientError::UnexpectedReply(format!(
                "EXEC answered {other}"
            ))),
        }
    }

    /// Abandons the transaction and releases the watched keys.
    pub async fn discard(self) -> Result<(), ClientError> {
        let deadline = self.conn.cfg.timeout;
        let reply = self
            .conn
            .call_with_timeout(&Command::discard(), deadline)
            .await?;
        expect_status(&reply, "OK")
    }

    async fn discard_inner(&mut self) {
        let deadline = self.conn.cfg.timeout;
        let _ = self.conn.call_with_timeout(&Command::discard(), deadline).await;
    }
}

fn expect_status(reply: &Value, status: &str) -> Result<(), ClientError> {
    if reply.is_status(status) {
        Ok(())
    } else {
        Err(ClientError::UnexpectedReply(format!(
            "expected +{status}, got {reply}"
        )))
    }
}
