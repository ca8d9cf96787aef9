// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use anyhow::{Context, Result, bail, ensure};
use url::Url;

use crate::cfg::{
    config::{Config, DEFAULT_PORT, ServerAddr, TlsConfig},
    enums::ProtocolVersion,
};

/// Builds a [`Config`] from a connection URI.
///
/// `scheme://[user[:password]@]host[:port][/database][?params]` with
/// schemes `tcp` (plain), `tls` (certificate verification on) and
/// `unix` (path follows). Recognized query parameters: `database`,
/// `client_name`, `timeout_ms`, `protocol`. Unknown query parameters
/// are ignored; an unknown scheme is an error.
pub fn parse_url(input: &str) -> Result<Config> {
    // `tcp` is the default scheme; a bare `host:port` is accepted.
    let input: std::borrow::Cow<'_, str> =
        if input.contains("://") || input.starts_with("unix:") {
            input.into()
        } else {
            format!("tcp://{input}").into()
        };
    let url = Url::parse(&input).with_context(|| format!("invalid URI {input:?}"))?;
    let mut cfg = Config::default();

    match url.scheme() {
        "tcp" => {
            cfg.address = vec![tcp_addr(&url)?];
        },
        "tls" => {
            cfg.address = vec![tcp_addr(&url)?];
            cfg.tls = Some(TlsConfig::default());
        },
        "unix" => {
            ensure!(!url.path().is_empty(), "unix URI is missing a path");
            cfg.address = vec![ServerAddr::unix(url.path())];
        },
        other => bail!("unsupported scheme {other:?}"),
    }

    if !url.username().is_empty() {
        cfg.username = Some(
            percent_decode(url.username())
                .context("username is not valid percent-encoded UTF-8")?,
        );
    }
    if let Some(password) = url.password() {
        cfg.password =
            Some(percent_decode(password).context("password is not valid UTF-8")?);
    }

    // A leading path segment selects the database, query param wins.
    if url.scheme() != "unix" {
        let db_path = url.path().trim_start_matches('/');
        if !db_path.is_empty() {
            cfg.database_index = db_path
                .parse()
                .with_context(|| format!("invalid database in path {db_path:?}"))?;
        }
    }

    for (key, value) in url.query_pairs() {
        match key.as_ref() {
            "database" => {
                cfg.database_index = value
                    .parse()
                    .with_context(|| format!("invalid database {value:?}"))?;
            },
            "client_name" => cfg.client_name = Some(value.into_owned()),
            "timeout_ms" => {
                let ms: u64 = value
                    .parse()
                    .with_context(|| format!("invalid timeout_ms {value:?}"))?;
                cfg.timeout = std::time::Duration::from_millis(ms);
            },
            "protocol" => {
                cfg.protocol_version = match value.as_ref() {
                    "2" => ProtocolVersion::Resp2,
                    "3" => ProtocolVersion::Resp3,
                    other => bail!("protocol must be 2 or 3, got {other:?}"),
                };
            },
            // Unknown query parameters are ignored on purpose.
            _ => {},
        }
    }

    cfg.validate()?;
    Ok(cfg)
}

fn tcp_addr(url: &Url) -> Result<ServerAddr> {
    let host = url
        .host_str()
        .with_context(|| format!("URI {url} is missing a host"))?;
    Ok(ServerAddr::tcp(host, url.port().unwrap_or(DEFAULT_PORT)))
}

/// The url crate keeps userinfo percent-encoded; undo it here.
fn percent_decode(s: &str) -> Result<String> {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            ensure!(i + 2 < bytes.len(), "truncated percent escape in {s:?}");
            let decoded = hex::decode(&bytes[i + 1..i + 3])
                .with_context(|| format!("bad percent escape in {s:?}"))?;
            out.extend_from_slice(&decoded);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).context("percent-decoded text is not UTF-8")
}
