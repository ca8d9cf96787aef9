// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{fs, io::BufReader, sync::Arc};

use rustls::{
    ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme,
    client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
    pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime},
};
use tokio_rustls::TlsConnector;

use crate::{
    cfg::config::{TlsConfig, TlsVersion},
    models::error::ClientError,
};

/// Builds the connector once per connection attempt. Web-PKI roots are
/// always trusted; a configured CA bundle is appended.
pub(crate) fn build_connector(cfg: &TlsConfig) -> Result<TlsConnector, ClientError> {
    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    if let Some(ca_file) = &cfg.ca_file {
        let pem = fs::read(ca_file).map_err(|e| {
            ClientError::Config(format!("cannot read ca_file {}: {e}", ca_file.display()))
        })?;
        let mut reader = BufReader::new(pem.as_slice());
        for cert in rustls_pemfile::certs(&mut reader) {
            let cert = cert.map_err(|e| {
                ClientError::Config(format!("bad certificate in ca_file: {e}"))
            })?;
            roots.add(cert).map_err(|e| {
                ClientError::Config(format!("rejected CA certificate: {e}"))
            })?;
        }
    }

    let builder = match cfg.min_version {
        Some(TlsVersion::Tls13) => {
            ClientConfig::builder_with_protocol_versions(&[&rustls::version::TLS13])
        },
        Some(TlsVersion::Tls12) => ClientConfig::builder_with_protocol_versions(&[
            &rustls::version::TLS12,
            &rustls::version::TLS13,
        ]),
        None => ClientConfig::builder(),
    };
    let builder = builder.with_root_certificates(roots);

    let mut config = match (&cfg.cert_file, &cfg.key_file) {
        (Some(cert_file), Some(key_file)) => {
            let certs = load_certs(cert_file)?;
            let key = load_key(key_file)?;
            builder.with_client_auth_cert(certs, key).map_err(|e| {
                ClientError::Config(format!("client certificate rejected: {e}"))
            })?
        },
        (None, None) => builder.with_no_client_auth(),
        _ => {
            return Err(ClientError::Config(
                "tls.cert_file and tls.key_file must be set together".to_string(),
            ));
        },
    };

    if !cfg.verify {
        config
            .dangerous()
            .set_certificate_verifier(Arc::new(NoVerification));
    }

    Ok(TlsConnector::from(Arc::new(config)))
}

pub(crate) fn server_name(host: &str) -> Result<ServerName<'static>, ClientError> {
    ServerName::try_from(host.to_string())
        .map_err(|_| ClientError::Config(format!("invalid TLS server name {host:?}")))
}

fn load_certs(path: &std::path::Path) -> Result<Vec<CertificateDer<'static>>, ClientError> {
    let pem = fs::read(path).map_err(|e| {
        ClientError::Config(format!("cannot read cert_file {}: {e}", path.display()))
    })?;
    let mut reader = BufReader::new(pem.as_slice());
    rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ClientError::Config(format!("bad certificate chain: {e}")))
}

fn load_key(path: &std::path::Path) -> Result<PrivateKeyDer<'static>, ClientError> {
    let pem = fs::read(path).map_err(|e| {
        ClientError::Config(format!("cannot read key_file {}: {e}", path.display()))
    })?;
    let mut reader = BufReader::new(pem.as_slice());
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| ClientError::Config(format!("bad private key: {e}")))?
        .ok_or_else(|| {
            ClientError::Config(format!("no private key found in {}", path.display()))
        })
}

/// Accept-anything verifier behind the explicit `verify: false` knob.
#[derive(Debug)]
struct NoVerification;

impl ServerCertVerifier for NoVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::ED25519,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
        ]
    }
}
