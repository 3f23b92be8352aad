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

use std::net::IpAddr;

/// Error produced by the ip/mx lookup of a target
#[derive(Debug, Clone, thiserror::Error, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Lookup {
    /// No records found for the given query
    #[error("record not found")]
    NoRecords {},

    /// The lookup timed out
    #[error("timed out")]
    TimedOut,

    ///
    #[error("no connections available")]
    NoConnections,

    ///
    #[error("io error: {0}")]
    IO(String),

    ///
    #[error("dns-proto error: {0}")]
    Proto(String),

    ///
    #[error("message: {0}")]
    Message(String),

    ///
    #[error("not implemented")]
    NotImplemented,
}

impl From<trust_dns_resolver::error::ResolveError> for Lookup {
    #[inline]
    fn from(error: trust_dns_resolver::error::ResolveError) -> Self {
        match error.kind() {
            trust_dns_resolver::error::ResolveErrorKind::Message(e) => {
                Self::Message((*e).to_owned())
            }
            trust_dns_resolver::error::ResolveErrorKind::Msg(e) => Self::Message(e.to_string()),
            trust_dns_resolver::error::ResolveErrorKind::NoConnections => Self::NoConnections,
            trust_dns_resolver::error::ResolveErrorKind::NoRecordsFound { .. } => {
                Self::NoRecords {}
            }
            trust_dns_resolver::error::ResolveErrorKind::Io(io) => Self::IO(io.to_string()),
            trust_dns_resolver::error::ResolveErrorKind::Proto(proto) => {
                Self::Proto(proto.to_string())
            }
            trust_dns_resolver::error::ResolveErrorKind::Timeout => Self::TimedOut,
            // NOTE: non_exhaustive
            _ => Self::NotImplemented,
        }
    }
}

/// One MX record of the target domain.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct MxRecord {
    pub exchange: String,
    pub preference: u16,
}

impl MxRecord {
    /// A "null MX" (RFC 7505): the domain does not accept mail.
    #[must_use]
    pub fn is_null(&self) -> bool {
        self.preference == 0 && (self.exchange == "." || self.exchange.is_empty())
    }
}

/// Name resolution as the delivery engine needs it.
///
/// The surrounding application owns the resolver; the engine only ever
/// calls through this seam so tests can substitute canned answers.
#[async_trait::async_trait]
pub trait MailResolver: Send + Sync {
    /// Resolve a host name to its addresses (A then AAAA).
    async fn resolve(&self, host: &str) -> Result<Vec<IpAddr>, Lookup>;

    /// MX records of a domain, unsorted.
    async fn mx_lookup(&self, domain: &str) -> Result<Vec<MxRecord>, Lookup>;

    /// TXT records of a name, each record joined to a single string.
    async fn txt_lookup(&self, name: &str) -> Result<Vec<String>, Lookup>;
}

#[allow(dead_code)]
#[derive(Debug, Clone, serde::Serialize)]
pub struct DnsResolver {
    config: trust_dns_resolver::config::ResolverConfig,
    option: trust_dns_resolver::config::ResolverOpts,
    #[serde(skip)]
    pub resolver: trust_dns_resolver::TokioAsyncResolver,
}

impl DnsResolver {
    #[must_use]
    pub fn new(
        config: trust_dns_resolver::config::ResolverConfig,
        option: trust_dns_resolver::config::ResolverOpts,
    ) -> Self {
        Self {
            config: config.clone(),
            option: option.clone(),
            resolver: trust_dns_resolver::TokioAsyncResolver::tokio(config, option),
        }
    }

    #[must_use]
    pub fn google() -> Self {
        Self::new(
            trust_dns_resolver::config::ResolverConfig::google(),
            trust_dns_resolver::config::ResolverOpts::default(),
        )
    }

    #[must_use]
    pub fn cloudflare() -> Self {
        Self::new(
            trust_dns_resolver::config::ResolverConfig::cloudflare(),
            trust_dns_resolver::config::ResolverOpts::default(),
        )
    }
}

#[async_trait::async_trait]
impl MailResolver for DnsResolver {
    async fn resolve(&self, host: &str) -> Result<Vec<IpAddr>, Lookup> {
        Ok(self.resolver.lookup_ip(host).await?.iter().collect())
    }

    async fn mx_lookup(&self, domain: &str) -> Result<Vec<MxRecord>, Lookup> {
        Ok(self
            .resolver
            .mx_lookup(domain)
            .await?
            .iter()
            .map(|mx| MxRecord {
                exchange: mx.exchange().to_utf8(),
                preference: mx.preference(),
            })
            .collect())
    }

    async fn txt_lookup(&self, name: &str) -> Result<Vec<String>, Lookup> {
        Ok(self
            .resolver
            .txt_lookup(name)
            .await?
            .iter()
            .map(ToString::to_string)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[rstest::rstest]
    #[case(".", 0, true)]
    #[case("mx1.example.com.", 10, false)]
    #[case("mx1.example.com.", 0, false)]
    fn null_mx(#[case] exchange: &str, #[case] preference: u16, #[case] is_null: bool) {
        let record = MxRecord {
            exchange: exchange.to_owned(),
            preference,
        };
        pretty_assertions::assert_eq!(record.is_null(), is_null);
    }
}
