/*
 * vSMTP mail transfer agent
 *
 * Copyright (C) 2003 - viridIT SAS
 * Licensed under the Elastic License 2.0
 *
 * You should have received a copy of the Elastic License 2.0 along with
 * this program. If not, see https://www.elastic.co/licensing/elastic-license.
 *
 */

use egress_common::address::is_fqdn;
use tokio_rustls::rustls;

/// How hard to try for an encrypted channel.
#[derive(Default, Debug, Copy, Clone, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Requirement {
    /// STARTTLS must succeed, the policy mode is `enforce`.
    Required,
    /// Upgrade when advertised, continue in clear otherwise.
    #[default]
    Optional,
    /// Do not even try, a previous TLS failure is being worked around.
    Disabled,
}

/// Concrete TLS parameters of one attempt.
///
/// `min_version` floors at TLS 1.2 either way: rustls ships no older
/// protocol, so the strict/relaxed split lives in certificate
/// verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsContext {
    pub min_version: rustls::ProtocolVersion,
    /// Inverse of `rejectUnauthorized`: tolerate expired, mismatched and
    /// self-signed certificates.
    pub accept_invalid_certs: bool,
    /// SNI + certificate name to validate, only for syntactic FQDNs.
    pub server_name: Option<String>,
}

impl TlsContext {
    /// Derive the context from the candidate policy.
    ///
    /// Certificates are only verified under an enforced policy. A
    /// degraded attempt on a non-default port additionally tolerates the
    /// self-signed certificates of user-managed relays.
    #[must_use]
    pub fn build(
        require_tls: bool,
        degraded: bool,
        port: u16,
        default_port: u16,
        hostname: Option<&str>,
    ) -> Self {
        let reject_unauthorized = if degraded {
            require_tls && port == default_port
        } else {
            require_tls
        };

        Self {
            min_version: rustls::ProtocolVersion::TLSv1_2,
            accept_invalid_certs: !reject_unauthorized,
            server_name: hostname.filter(|h| is_fqdn(h)).map(str::to_owned),
        }
    }

    /// Connector over the public web PKI, swapped for a permissive
    /// verifier when the context tolerates invalid certificates.
    pub fn connector(&self) -> Result<tokio_rustls::TlsConnector, rustls::Error> {
        let mut root_store = rustls::RootCertStore::empty();
        root_store.add_trust_anchors(webpki_roots::TLS_SERVER_ROOTS.iter().map(|ta| {
            rustls::OwnedTrustAnchor::from_subject_spki_name_constraints(
                ta.subject,
                ta.spki,
                ta.name_constraints,
            )
        }));

        let mut config = rustls::ClientConfig::builder()
            .with_safe_default_cipher_suites()
            .with_safe_default_kx_groups()
            .with_protocol_versions(supported_versions(self.min_version))?
            .with_root_certificates(root_store)
            .with_no_client_auth();

        if self.accept_invalid_certs {
            config
                .dangerous()
                .set_certificate_verifier(std::sync::Arc::new(AcceptAnyCertificate));
        }

        Ok(tokio_rustls::TlsConnector::from(std::sync::Arc::new(
            config,
        )))
    }
}

const fn supported_versions(
    min: rustls::ProtocolVersion,
) -> &'static [&'static rustls::SupportedProtocolVersion] {
    match min {
        rustls::ProtocolVersion::TLSv1_3 => &[&rustls::version::TLS13],
        _ => &[&rustls::version::TLS13, &rustls::version::TLS12],
    }
}

/// Verifier for relaxed attempts: the channel is still encrypted, the
/// peer is just not authenticated.
struct AcceptAnyCertificate;

impl rustls::client::ServerCertVerifier for AcceptAnyCertificate {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::Certificate,
        _intermediates: &[rustls::Certificate],
        _server_name: &rustls::ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        _now: std::time::SystemTime,
    ) -> Result<rustls::client::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::ServerCertVerified::assertion())
    }
}
