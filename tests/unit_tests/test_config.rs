// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::time::Duration;

use anyhow::Result;
use resp_client_rs::{
    cfg::{
        config::{Config, ServerAddr},
        enums::{ProtocolVersion, TrackingMode},
    },
    resilience::retry::BackoffStrategy,
};

#[test]
fn fixture_config_loads_and_validates() -> Result<()> {
    let cfg = Config::load_from_file("tests/config.yaml")?;

    assert_eq!(cfg.address, vec![ServerAddr::tcp("localhost", 6379)]);
    assert_eq!(cfg.protocol_version, ProtocolVersion::Resp3);
    assert_eq!(cfg.client_name.as_deref(), Some("resp-client-rs"));
    assert_eq!(cfg.timeout, Duration::from_millis(5_000));
    assert_eq!(cfg.pool.size, 4);
    assert_eq!(cfg.pool.wait, Duration::from_millis(2_000));
    assert_eq!(cfg.retry.max_attempts, 3);
    assert_eq!(cfg.retry.backoff, BackoffStrategy::ExponentialFullJitter {
        base_ms: 50,
        cap_ms: 5_000
    });
    assert_eq!(cfg.circuit.open_for, Duration::from_millis(30_000));
    Ok(())
}

#[test]
fn defaults_fill_everything_absent() -> Result<()> {
    let cfg: Config = serde_yaml::from_str("{}")?;
    cfg.validate()?;
    assert_eq!(cfg.address, vec![ServerAddr::tcp("localhost", 6379)]);
    assert_eq!(cfg.protocol_version, ProtocolVersion::Resp3);
    assert_eq!(cfg.database_index, 0);
    assert!(cfg.tls.is_none());
    assert!(cfg.tracking.is_none());
    assert!(cfg.sentinel.is_none());
    assert!(!cfg.cluster.enabled);
    Ok(())
}

#[test]
fn unknown_options_are_rejected() {
    let err = serde_yaml::from_str::<Config>("timeout_msec: 100\n")
        .expect_err("typo must be rejected");
    assert!(err.to_string().contains("unknown field"));

    let err = serde_yaml::from_str::<Config>("pool:\n  sze: 3\n")
        .expect_err("nested typo must be rejected");
    assert!(err.to_string().contains("unknown field"));
}

#[test]
fn validation_catches_cross_field_mistakes() -> Result<()> {
    // Tracking demands protocol 3.
    let cfg: Config = serde_yaml::from_str(
        "protocol_version: \"2\"\ntracking:\n  mode: default\n",
    )?;
    assert!(cfg.validate().is_err());

    // Broadcast prefixes only make sense in broadcast mode.
    let cfg: Config = serde_yaml::from_str(
        "tracking:\n  mode: optin\n  prefixes: [\"user:\"]\n",
    )?;
    assert!(cfg.validate().is_err());
    let cfg: Config = serde_yaml::from_str(
        "tracking:\n  mode: broadcast\n  prefixes: [\"user:\"]\n",
    )?;
    cfg.validate()?;
    assert_eq!(
        cfg.tracking.as_ref().map(|t| t.mode),
        Some(TrackingMode::Broadcast)
    );

    // A username without a password cannot authenticate.
    let cfg: Config = serde_yaml::from_str("username: app\n")?;
    assert!(cfg.validate().is_err());

    // Sentinel and cluster routing are mutually exclusive.
    let cfg: Config = serde_yaml::from_str(
        "cluster:\n  enabled: true\nsentinel:\n  endpoints: [\"s1:26379\"]\n  service_name: main\n",
    )?;
    assert!(cfg.validate().is_err());
    Ok(())
}

#[test]
fn server_addr_parses_both_families() -> Result<()> {
    assert_eq!(
        "example.com:6380".parse::<ServerAddr>()?,
        ServerAddr::tcp("example.com", 6380)
    );
    assert_eq!(
        "example.com".parse::<ServerAddr>()?,
        ServerAddr::tcp("example.com", 6379)
    );
    assert_eq!(
        "unix:/run/data.sock".parse::<ServerAddr>()?,
        ServerAddr::unix("/run/data.sock")
    );
    assert_eq!(
        "/run/data.sock".parse::<ServerAddr>()?,
        ServerAddr::unix("/run/data.sock")
    );
    assert!("host:notaport".parse::<ServerAddr>().is_err());
    assert!("".parse::<ServerAddr>().is_err());
    Ok(())
}

#[test]
fn auth_pair_defaults_the_username() -> Result<()> {
    let cfg: Config = serde_yaml::from_str("password: hunter2\n")?;
    assert_eq!(cfg.auth_pair(), Some(("default", "hunter2")));

    let cfg: Config = serde_yaml::from_str("username: app\npassword: hunter2\n")?;
    assert_eq!(cfg.auth_pair(), Some(("app", "hunter2")));

    let cfg = Config::default();
    assert_eq!(cfg.auth_pair(), None);
    Ok(())
}
