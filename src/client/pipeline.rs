// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::time::Duration;

use crate::{
    client::connection::Connection,
    models::{
        command::Command,
        error::{ClientError, ServerError},
        value::Value,
    },
};

/// Accumulates commands to be written as one batch.
///
/// Replies come back aligned 1:1 with the submitted commands; a
/// per-command error reply (wrong type, MOVED, ...) fills its own slot
/// and leaves every other command untouched.
#[derive(Debug, Default)]
pub struct Pipeline {
    cmds: Vec<Command>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self { cmds: Vec::new() }
    }

    pub fn cmd(mut self, cmd: Command) -> Self {
        self.cmds.push(cmd);
        self
    }

    pub fn push(&mut self, cmd: Command) {
        self.cmds.push(cmd);
    }

    pub fn len(&self) -> usize {
        self.cmds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cmds.is_empty()
    }

    /// Flushes the batch over one connection with the default
    /// deadline.
    pub async fn execute(
        self,
        conn: &mut Connection,
    ) -> Result<Vec<Result<Value, ServerError>>, ClientError> {
        let deadline = conn.cfg.timeout;
        self.execute_with_timeout(conn, deadline).await
    }

    pub async fn execute_with_timeout(
        self,
        conn: &mut Connection,
        deadline: Duration,
    ) -> Result<Vec<Result<Value, ServerError>>, ClientError> {
        if self.cmds.is_empty() {
            return Ok(Vec::new());
        }
        conn.call_pipeline(&self.cmds, deadline).await
    }
}
