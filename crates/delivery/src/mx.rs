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

use egress_common::address::{is_fqdn, is_ip_literal};
use egress_common::dns_resolver::{Lookup, MailResolver, MxRecord};

/// MTA-STS mode of the matched policy.
#[derive(
    Debug,
    Default,
    Copy,
    Clone,
    PartialEq,
    Eq,
    strum::AsRefStr,
    strum::Display,
    strum::EnumString,
    serde_with::DeserializeFromStr,
    serde_with::SerializeDisplay,
)]
#[strum(serialize_all = "lowercase")]
pub enum PolicyMode {
    #[default]
    None,
    Testing,
    Enforce,
}

/// Where the policy came from.
#[derive(
    Debug,
    Copy,
    Clone,
    PartialEq,
    Eq,
    strum::AsRefStr,
    strum::Display,
    strum::EnumString,
    serde_with::DeserializeFromStr,
    serde_with::SerializeDisplay,
)]
#[strum(serialize_all = "lowercase")]
pub enum PolicySource {
    /// Entry written by the surrounding platform after fetching the
    /// policy body over HTTPS.
    Cache,
    /// Presence probe on the `_mta-sts` TXT record done by this engine.
    Probe,
}

/// Transport-security policy discovered for a destination domain.
#[derive(Debug, Copy, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct PolicyMatch {
    pub source: PolicySource,
    pub mode: PolicyMode,
}

/// Shared policy store keyed by destination domain.
///
/// Attempts running in parallel for the same domain reuse each other's
/// discoveries; the surrounding platform writes `enforce` entries here.
pub type StsCache =
    std::sync::Arc<tokio::sync::RwLock<std::collections::HashMap<String, PolicyMatch>>>;

/// One reachable mail exchanger, picked fresh for every attempt.
#[derive(Debug)]
pub struct MxCandidate {
    /// Address to connect to, an IP literal once probing succeeded.
    pub host: String,
    pub port: u16,
    /// Connection opened while probing the ranked list.
    pub socket: Option<tokio::net::TcpStream>,
    /// Name of the exchanger, when it is a valid FQDN.
    pub hostname: Option<String>,
    pub policy: Option<PolicyMatch>,
}

impl MxCandidate {
    #[must_use]
    pub fn require_tls(&self) -> bool {
        self.policy.is_some_and(|p| p.mode == PolicyMode::Enforce)
    }

    /// The candidate without its socket, as carried on errors.
    #[must_use]
    pub fn snapshot(&self) -> MxSnapshot {
        MxSnapshot {
            host: self.host.clone(),
            port: self.port,
            hostname: self.hostname.clone(),
            policy: self.policy,
        }
    }
}

/// Socket-less view of a candidate.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct MxSnapshot {
    pub host: String,
    pub port: u16,
    pub hostname: Option<String>,
    pub policy: Option<PolicyMatch>,
}

#[derive(Debug, thiserror::Error)]
pub enum MxError {
    #[error("mx lookup of '{domain}' failed: {source}")]
    Lookup { domain: String, source: Lookup },

    #[error("'{domain}' does not accept mail (null MX)")]
    NullMx { domain: String },

    #[error("no reachable mail exchanger for '{domain}': {last_error}")]
    NoReachableHost { domain: String, last_error: String },
}

pub struct ResolveOptions<'a> {
    pub target: &'a str,
    pub port: u16,
    pub local_address: Option<std::net::IpAddr>,
    /// Exchangers that already failed this message, skipped on fallback.
    pub ignore_hosts: &'a [String],
    /// Refuse candidates resolving to loopback/private/link-local space.
    pub block_local_addresses: bool,
    pub connect_timeout: std::time::Duration,
    pub dns_timeout: std::time::Duration,
    /// Bound on walking the whole ranked list.
    pub max_connect_time: std::time::Duration,
}

/// Produce a ranked, reachable candidate for the target, with its
/// transport-security policy and an open socket.
pub async fn resolve_candidate(
    resolver: &dyn MailResolver,
    cache: &StsCache,
    opts: &ResolveOptions<'_>,
) -> Result<MxCandidate, MxError> {
    let policy = if is_ip_literal(opts.target) {
        None
    } else {
        sts_policy(resolver, cache, opts.target, opts.dns_timeout).await
    };

    let hosts = exchanger_hosts(resolver, opts).await?;

    let deadline = tokio::time::Instant::now() + opts.max_connect_time;
    let mut last_error = format!("no candidate left for '{}'", opts.target);

    for host in &hosts {
        if opts
            .ignore_hosts
            .iter()
            .any(|h| h.eq_ignore_ascii_case(host))
        {
            tracing::debug!(%host, "skipping exchanger that already failed");
            continue;
        }

        let addrs = match candidate_addrs(resolver, host, opts).await {
            Ok(addrs) => addrs,
            Err(error) => {
                tracing::warn!(%host, %error, "address resolution failed");
                last_error = error.to_string();
                continue;
            }
        };
        if addrs.is_empty() {
            last_error = format!("every address of '{host}' is in blocked local space");
            tracing::warn!(%host, "{last_error}");
            continue;
        }

        for addr in addrs {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return Err(MxError::NoReachableHost {
                    domain: opts.target.to_owned(),
                    last_error: "maximum connect time reached".to_owned(),
                });
            }

            let timeout = opts.connect_timeout.min(remaining);
            match connect_to(
                std::net::SocketAddr::new(addr, opts.port),
                opts.local_address,
                timeout,
            )
            .await
            {
                Ok(socket) => {
                    return Ok(MxCandidate {
                        host: addr.to_string(),
                        port: opts.port,
                        socket: Some(socket),
                        hostname: Some(host.clone()).filter(|h| is_fqdn(h)),
                        policy,
                    });
                }
                Err(error) => {
                    tracing::debug!(%host, %addr, %error, "connect failed");
                    last_error = format!("{host}: {error}");
                }
            }
        }
    }

    Err(MxError::NoReachableHost {
        domain: opts.target.to_owned(),
        last_error,
    })
}

/// The ranked exchanger names for the target, falling back to the
/// implicit A/AAAA candidate when the domain publishes no MX
/// (RFC 5321 §5.1).
async fn exchanger_hosts(
    resolver: &dyn MailResolver,
    opts: &ResolveOptions<'_>,
) -> Result<Vec<String>, MxError> {
    if is_ip_literal(opts.target) {
        return Ok(vec![opts.target.to_owned()]);
    }

    let records = match tokio::time::timeout(opts.dns_timeout, resolver.mx_lookup(opts.target))
        .await
    {
        Ok(Ok(records)) => records,
        Ok(Err(Lookup::NoRecords {})) => return Ok(vec![opts.target.to_owned()]),
        Ok(Err(source)) => {
            return Err(MxError::Lookup {
                domain: opts.target.to_owned(),
                source,
            })
        }
        Err(_elapsed) => {
            return Err(MxError::Lookup {
                domain: opts.target.to_owned(),
                source: Lookup::TimedOut,
            })
        }
    };

    if records.is_empty() {
        return Ok(vec![opts.target.to_owned()]);
    }
    if records.iter().all(MxRecord::is_null) {
        return Err(MxError::NullMx {
            domain: opts.target.to_owned(),
        });
    }

    Ok(rank(records))
}

/// Sort by preference and strip the trailing root dot.
fn rank(mut records: Vec<MxRecord>) -> Vec<String> {
    records.retain(|r| !r.is_null());
    records.sort_by_key(|r| r.preference);
    let mut hosts = records
        .into_iter()
        .map(|r| r.exchange.trim_end_matches('.').to_owned())
        .collect::<Vec<_>>();
    hosts.dedup();
    hosts
}

async fn candidate_addrs(
    resolver: &dyn MailResolver,
    host: &str,
    opts: &ResolveOptions<'_>,
) -> Result<Vec<std::net::IpAddr>, Lookup> {
    let addrs = if let Ok(ip) = host.parse::<std::net::IpAddr>() {
        vec![ip]
    } else {
        match tokio::time::timeout(opts.dns_timeout, resolver.resolve(host)).await {
            Ok(result) => result?,
            Err(_elapsed) => return Err(Lookup::TimedOut),
        }
    };

    Ok(if opts.block_local_addresses {
        addrs
            .into_iter()
            .filter(|ip| !is_local_address(*ip))
            .collect()
    } else {
        addrs
    })
}

async fn connect_to(
    addr: std::net::SocketAddr,
    local: Option<std::net::IpAddr>,
    timeout: std::time::Duration,
) -> std::io::Result<tokio::net::TcpStream> {
    let connect = async {
        match local {
            Some(ip) if ip.is_ipv4() == addr.is_ipv4() => {
                let socket = if addr.is_ipv4() {
                    tokio::net::TcpSocket::new_v4()?
                } else {
                    tokio::net::TcpSocket::new_v6()?
                };
                socket.bind(std::net::SocketAddr::new(ip, 0))?;
                socket.connect(addr).await
            }
            _ => tokio::net::TcpStream::connect(addr).await,
        }
    };

    tokio::time::timeout(timeout, connect)
        .await
        .map_err(|_elapsed| std::io::Error::from(std::io::ErrorKind::TimedOut))?
}

/// Open a connection to a candidate that came without one.
pub(crate) async fn open_socket(
    host: &str,
    port: u16,
    local: Option<std::net::IpAddr>,
    timeout: std::time::Duration,
) -> std::io::Result<tokio::net::TcpStream> {
    match host.parse::<std::net::IpAddr>() {
        Ok(ip) => connect_to(std::net::SocketAddr::new(ip, port), local, timeout).await,
        // pre-resolution failed earlier, let the runtime resolve
        Err(_) => {
            tokio::time::timeout(timeout, tokio::net::TcpStream::connect((host, port)))
                .await
                .map_err(|_elapsed| std::io::Error::from(std::io::ErrorKind::TimedOut))?
        }
    }
}

/// Loopback, RFC 1918/4193 and link-local space never hosts a public
/// mail exchanger; a record pointing there is a misconfiguration or an
/// SSRF attempt.
#[must_use]
pub fn is_local_address(ip: std::net::IpAddr) -> bool {
    match ip {
        std::net::IpAddr::V4(v4) => {
            v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_unspecified()
                || v4.is_broadcast()
        }
        std::net::IpAddr::V6(v6) => {
            if let Some(mapped) = v6.to_ipv4_mapped() {
                return is_local_address(std::net::IpAddr::V4(mapped));
            }
            let first = v6.segments()[0];
            // fc00::/7 unique local, fe80::/10 link local
            v6.is_loopback()
                || v6.is_unspecified()
                || (first & 0xfe00) == 0xfc00
                || (first & 0xffc0) == 0xfe80
        }
    }
}

/// Look up the MTA-STS policy for a domain, consulting the shared cache
/// first and probing the `_mta-sts` TXT record on a miss.
///
/// The probe only proves a policy exists; without the HTTPS policy body
/// (fetched by the surrounding platform) the match stays in `testing`
/// mode. Lookup failures degrade to no policy, never fail the attempt.
async fn sts_policy(
    resolver: &dyn MailResolver,
    cache: &StsCache,
    domain: &str,
    dns_timeout: std::time::Duration,
) -> Option<PolicyMatch> {
    let key = domain.to_ascii_lowercase();
    if let Some(cached) = cache.read().await.get(&key) {
        tracing::debug!(%domain, mode = %cached.mode, "mta-sts policy found in cache");
        return Some(*cached);
    }

    let name = format!("_mta-sts.{key}");
    let discovered = match tokio::time::timeout(dns_timeout, resolver.txt_lookup(&name)).await {
        Ok(Ok(records)) => {
            let advertised = records
                .iter()
                .any(|r| r.to_ascii_lowercase().contains("v=stsv1"));
            PolicyMatch {
                source: PolicySource::Probe,
                mode: if advertised {
                    PolicyMode::Testing
                } else {
                    PolicyMode::None
                },
            }
        }
        Ok(Err(Lookup::NoRecords {})) => PolicyMatch {
            source: PolicySource::Probe,
            mode: PolicyMode::None,
        },
        Ok(Err(error)) => {
            tracing::warn!(%domain, %error, "mta-sts probe failed");
            return None;
        }
        Err(_elapsed) => {
            tracing::warn!(%domain, "mta-sts probe timed out");
            return None;
        }
    };

    tracing::info!(%domain, mode = %discovered.mode, "mta-sts policy discovered");
    cache.write().await.insert(key, discovered);
    Some(discovered)
}
