// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::sync::Arc;

use anyhow::{Context, Result};
use resp_client_rs::{
    cfg::{config::Config, logger::init_logger},
    client::{pipeline::Pipeline, pool::Pool},
    events::EventBus,
    models::command::Command,
};
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let _init_logger = init_logger("tests/config_logger.yaml")?;

    // Load config
    let cfg = Config::load_from_file("tests/config.yaml")
        .context("failed to load config")?;
    let cfg = Arc::new(cfg);

    let events = EventBus::new(&cfg.event);
    let pool = Pool::new(Arc::clone(&cfg), events);

    // Warm up one connection and verify the server answers.
    let mut conn = pool.checkout().await?;
    let latency = conn.ping().await.context("ping failed")?;
    info!("server is reachable ({latency:?})");

    // Round-trip a key through a pipeline.
    let replies = Pipeline::new()
        .cmd(Command::set(b"resp-client-rs:demo", b"hello"))
        .cmd(Command::get(b"resp-client-rs:demo"))
        .execute(&mut conn)
        .await?;
    for (i, reply) in replies.iter().enumerate() {
        match reply {
            Ok(value) => info!("reply {i}: {value}"),
            Err(e) => info!("reply {i}: server error {e}"),
        }
    }
    drop(conn);

    pool.close().await;
    Ok(())
}
