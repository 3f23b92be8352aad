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

pub mod bounce;
pub mod classify;
pub mod error;
pub mod mx;
pub mod tls;

pub mod smtp {
    mod exchange;

    pub use exchange::SmtpError;
    pub(crate) use exchange::{deliver, Session};
}

pub use bounce::{build_bounce, local_hostname, OriginalEmail};
pub use classify::{Classification, Classifier, Verdict};
pub use error::{
    BounceAction, BounceCategory, BounceInfo, DeliveryError, DeliveryResult, ErrorClass,
};
pub use mx::{MxCandidate, MxSnapshot, PolicyMatch, PolicyMode, PolicySource, StsCache};

use egress_common::address::is_ip_literal;
use egress_common::{EngineConfig, Envelope, MailResolver};

/// One message to hand to the mail exchangers of a routing target.
///
/// The job scheduler owns queuing and parallelism; this call runs one
/// strictly sequential delivery, with at most one degraded re-attempt.
pub struct DeliveryTask<'a> {
    /// Recipient domain, or the explicit host of a custom forward.
    pub target: &'a str,
    pub port: u16,
    pub envelope: &'a Envelope,
    /// The fully-built RFC 5322 message.
    pub message: &'a [u8],
    /// Address outbound sockets bind to.
    pub local_address: Option<std::net::IpAddr>,
    /// Our name for EHLO and report headers.
    pub local_hostname: &'a str,
    pub config: &'a EngineConfig,
}

/// Deliver one message, downgrading the transport once when the first
/// attempt fails below the SMTP layer.
///
/// On error the returned [`DeliveryError`] is fully classified: a
/// `response_code` below 500 asks the caller to requeue, 500 and above to
/// notify the sender with [`build_bounce`].
pub async fn send_mail(
    task: &DeliveryTask<'_>,
    resolver: &dyn MailResolver,
    cache: &StsCache,
) -> Result<DeliveryResult, DeliveryError> {
    let local_ip = task
        .local_address
        .unwrap_or(std::net::IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED));
    let classifier = Classifier::new(local_ip, task.config);

    let first = match attempt(task, resolver, cache, &classifier, &[], false, None).await {
        Ok(result) => return Ok(result),
        Err(error) => error,
    };

    let classification = classifier.classify(&first);
    match classification.verdict {
        Verdict::Bug | Verdict::Classified => {
            return Err(first.with_classification(classification))
        }
        Verdict::Retry => {}
    }
    let first = first.with_classification(classification);

    let mut ignore_hosts = vec![];
    if first.has_retryable_class() {
        if let Some(mx) = &first.mx {
            ignore_hosts.push(mx.hostname.clone().unwrap_or_else(|| mx.host.clone()));
        }
    }

    // a TLS failure under an enforced policy is never worked around by
    // downgrading; it surfaces as a retry and the policy stays in force
    if first.require_tls && !first.has_retryable_class() && first.is_tls_error() {
        let violation = classifier.sts_violation(&first);
        return Err(first.with_classification(violation));
    }

    if !should_fallback(&first) {
        return Err(first);
    }

    tracing::info!(
        domain = %task.target,
        "first attempt failed on transport, retrying with a degraded configuration"
    );

    match attempt(
        task,
        resolver,
        cache,
        &classifier,
        &ignore_hosts,
        true,
        Some(&first),
    )
    .await
    {
        Ok(result) => Ok(result),
        Err(second) => {
            let classification = classifier.classify(&second);
            match classification.verdict {
                Verdict::Bug | Verdict::Classified => {
                    Err(second.with_classification(classification))
                }
                Verdict::Retry => {
                    let second = second.with_classification(classification);
                    if second.has_retryable_class()
                        || second.is_tls_error()
                        || second.is_ssl_error()
                        || second.is_transport_library_error()
                    {
                        let exhausted = classifier.fallback_exhausted(&second);
                        Err(second.with_classification(exhausted))
                    } else {
                        Err(second)
                    }
                }
            }
        }
    }
}

/// A second, degraded attempt is only worth it for failures of the
/// transport itself.
fn should_fallback(error: &DeliveryError) -> bool {
    ((400..500).contains(&error.response_code) && error.response.is_none())
        || error.is_ssl_error()
        || error.is_tls_error()
        || error.is_transport_library_error()
        || error.has_retryable_class()
}

#[allow(clippy::too_many_lines)]
async fn attempt(
    task: &DeliveryTask<'_>,
    resolver: &dyn MailResolver,
    cache: &StsCache,
    classifier: &Classifier,
    ignore_hosts: &[String],
    degraded: bool,
    prior: Option<&DeliveryError>,
) -> Result<DeliveryResult, DeliveryError> {
    let config = task.config;
    let opts = mx::ResolveOptions {
        target: task.target,
        port: task.port,
        local_address: task.local_address,
        ignore_hosts,
        block_local_addresses: config.block_local_addresses,
        connect_timeout: config.timeouts.connect,
        dns_timeout: config.timeouts.dns,
        max_connect_time: config.max_connect_time,
    };

    let mut candidate = match mx::resolve_candidate(resolver, cache, &opts).await {
        Ok(candidate) => candidate,
        Err(error) => {
            let mut error = from_mx_error(&error);
            attach_context(&mut error, task, None, false, false);
            return Err(error);
        }
    };

    let require_tls = candidate.require_tls();
    let ignore_tls = degraded
        && !require_tls
        && prior.is_some_and(|p| {
            p.is_ssl_error()
                || p.is_tls_error()
                || p.is_transport_library_error()
                || p.class == Some(ErrorClass::ConnectionReset)
        });
    let starttls = if require_tls {
        tls::Requirement::Required
    } else if ignore_tls {
        tls::Requirement::Disabled
    } else {
        tls::Requirement::Optional
    };
    let tls_context = tls::TlsContext::build(
        require_tls,
        degraded,
        candidate.port,
        config.default_port,
        candidate.hostname.as_deref(),
    );

    // transport code may re-resolve a name mid-handshake and trip on a
    // certificate mismatch; pin the address before connecting
    if candidate.socket.is_none() && !is_ip_literal(&candidate.host) {
        match tokio::time::timeout(config.timeouts.dns, resolver.resolve(&candidate.host)).await {
            Ok(Ok(addrs)) if !addrs.is_empty() => candidate.host = addrs[0].to_string(),
            Ok(Ok(_)) => {}
            Ok(Err(error)) => {
                tracing::error!(%error, host = %candidate.host, "pre-resolution failed");
            }
            Err(_elapsed) => {
                tracing::error!(host = %candidate.host, "pre-resolution timed out");
            }
        }
    }

    let snapshot = candidate.snapshot();
    let socket = match candidate.socket.take() {
        Some(socket) => socket,
        None => {
            match mx::open_socket(
                &candidate.host,
                candidate.port,
                task.local_address,
                config.timeouts.connect,
            )
            .await
            {
                Ok(socket) => socket,
                Err(error) => {
                    let mut error = from_smtp_error(smtp::SmtpError::from(error));
                    attach_context(&mut error, task, Some(snapshot), require_tls, ignore_tls);
                    return Err(error);
                }
            }
        }
    };

    let session = smtp::Session {
        client_name: task.local_hostname,
        envelope: task.envelope,
        message: task.message,
        timeouts: &config.timeouts,
        starttls,
        tls: &tls_context,
    };

    match smtp::deliver(socket, &candidate.host, &session).await {
        Ok(outcome) => {
            let rejected = outcome
                .rejected
                .iter()
                .map(|(rcpt, _)| rcpt.clone())
                .collect();
            // individually refused recipients are classified here so the
            // caller can queue or bounce each one on its own
            let rejected_errors = outcome
                .rejected
                .into_iter()
                .map(|(rcpt, reply)| {
                    let mut error =
                        DeliveryError::new(None, format!("recipient refused: {reply}"))
                            .with_response(reply.code().value(), reply.to_string());
                    error.recipient = Some(rcpt);
                    attach_context(
                        &mut error,
                        task,
                        Some(snapshot.clone()),
                        require_tls,
                        ignore_tls,
                    );
                    let classification = classifier.classify(&error);
                    error.with_classification(classification)
                })
                .collect();

            Ok(DeliveryResult {
                accepted: outcome.accepted,
                rejected,
                rejected_errors,
            })
        }
        Err(smtp_error) => {
            let mut error = from_smtp_error(smtp_error);
            attach_context(&mut error, task, Some(snapshot), require_tls, ignore_tls);
            Err(error)
        }
    }
}

fn attach_context(
    error: &mut DeliveryError,
    task: &DeliveryTask<'_>,
    mx: Option<MxSnapshot>,
    require_tls: bool,
    ignore_tls: bool,
) {
    error.target = task.target.to_owned();
    error.envelope = Some(task.envelope.clone());
    error.mx = mx;
    error.require_tls = require_tls;
    error.opportunistic_tls = !require_tls;
    error.ignore_tls = ignore_tls;
}

fn from_mx_error(error: &mx::MxError) -> DeliveryError {
    match error {
        mx::MxError::Lookup { .. } => {
            DeliveryError::new(Some(ErrorClass::Dns), error.to_string())
        }
        mx::MxError::NoReachableHost { .. } => {
            DeliveryError::new(Some(ErrorClass::Connection), error.to_string())
        }
        mx::MxError::NullMx { domain } => DeliveryError::new(None, error.to_string())
            .with_response(
                556,
                format!("556 5.1.10 '{domain}' does not accept mail (null MX)"),
            ),
    }
}

fn from_smtp_error(error: smtp::SmtpError) -> DeliveryError {
    let message = error.to_string();
    match error {
        smtp::SmtpError::Io { kind, .. } => {
            let class = match kind {
                std::io::ErrorKind::ConnectionReset => ErrorClass::ConnectionReset,
                std::io::ErrorKind::ConnectionRefused
                | std::io::ErrorKind::ConnectionAborted
                | std::io::ErrorKind::NotConnected => ErrorClass::Connection,
                std::io::ErrorKind::TimedOut => ErrorClass::Timeout,
                _ => ErrorClass::Socket,
            };
            DeliveryError::new(Some(class), message)
        }
        smtp::SmtpError::Timeout { .. } => {
            DeliveryError::new(Some(ErrorClass::Timeout), message)
        }
        smtp::SmtpError::ReplyParsing { .. } => {
            DeliveryError::new(Some(ErrorClass::Protocol), message)
        }
        smtp::SmtpError::Tls { .. } | smtp::SmtpError::StartTlsUnsupported => {
            DeliveryError::new(Some(ErrorClass::Tls), message)
        }
        smtp::SmtpError::Internal { .. } => {
            DeliveryError::new(Some(ErrorClass::Internal), message)
        }
        smtp::SmtpError::Rejected { reply, .. } => DeliveryError::new(None, message)
            .with_response(reply.code().value(), reply.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use egress_common::dns_resolver::{Lookup, MxRecord};
    use egress_common::Mailbox;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt};

    /// Resolver pinning `remote.example` on the loopback listener.
    struct LoopbackResolver;

    #[async_trait::async_trait]
    impl MailResolver for LoopbackResolver {
        async fn resolve(&self, host: &str) -> Result<Vec<std::net::IpAddr>, Lookup> {
            if host == "mx.remote.example" {
                Ok(vec!["127.0.0.1".parse().unwrap()])
            } else {
                Err(Lookup::NoRecords {})
            }
        }

        async fn mx_lookup(&self, domain: &str) -> Result<Vec<MxRecord>, Lookup> {
            if domain == "remote.example" {
                Ok(vec![MxRecord {
                    exchange: "mx.remote.example.".to_owned(),
                    preference: 10,
                }])
            } else {
                Err(Lookup::NoRecords {})
            }
        }

        async fn txt_lookup(&self, _name: &str) -> Result<Vec<String>, Lookup> {
            Err(Lookup::NoRecords {})
        }
    }

    #[derive(Default)]
    struct ServerState {
        connections: AtomicUsize,
        starttls_after_first: AtomicBool,
    }

    /// SMTP server advertising STARTTLS and wrecking every handshake.
    async fn tls_breaking_server(listener: tokio::net::TcpListener, state: Arc<ServerState>) {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                return;
            };
            let connection = state.connections.fetch_add(1, Ordering::SeqCst);
            let state = Arc::clone(&state);

            tokio::spawn(async move {
                let (read, mut write) = socket.split();
                let mut lines = tokio::io::BufReader::new(read).lines();

                write.write_all(b"220 test ESMTP\r\n").await.unwrap();
                let mut in_data = false;
                while let Ok(Some(line)) = lines.next_line().await {
                    if in_data {
                        if line == "." {
                            in_data = false;
                            write.write_all(b"250 2.0.0 queued\r\n").await.unwrap();
                        }
                        continue;
                    }
                    let upper = line.to_ascii_uppercase();
                    if upper.starts_with("EHLO") {
                        write
                            .write_all(b"250-test\r\n250 STARTTLS\r\n")
                            .await
                            .unwrap();
                    } else if upper.starts_with("STARTTLS") {
                        if connection > 0 {
                            state.starttls_after_first.store(true, Ordering::SeqCst);
                        }
                        write.write_all(b"220 2.0.0 ready\r\n").await.unwrap();
                        // wreck the handshake with a plaintext blob
                        write.write_all(b"this is not a tls record\r\n").await.ok();
                        return;
                    } else if upper.starts_with("MAIL FROM") {
                        write.write_all(b"250 2.1.0 ok\r\n").await.unwrap();
                    } else if upper.starts_with("RCPT TO") {
                        write.write_all(b"250 2.1.5 ok\r\n").await.unwrap();
                    } else if upper.starts_with("DATA") {
                        write.write_all(b"354 go ahead\r\n").await.unwrap();
                        in_data = true;
                    } else if upper.starts_with("QUIT") {
                        write.write_all(b"221 bye\r\n").await.ok();
                        return;
                    }
                }
            });
        }
    }

    fn envelope() -> Envelope {
        Envelope::new(
            "sender@example.com".parse::<Mailbox>().unwrap(),
            vec!["rcpt@remote.example".parse::<Mailbox>().unwrap()],
        )
        .unwrap()
    }

    fn config() -> EngineConfig {
        EngineConfig {
            // candidates resolve to loopback in these tests
            block_local_addresses: false,
            ..EngineConfig::default()
        }
    }

    fn task<'a>(port: u16, envelope: &'a Envelope, config: &'a EngineConfig) -> DeliveryTask<'a> {
        DeliveryTask {
            target: "remote.example",
            port,
            envelope,
            message: b"Subject: hi\r\n\r\nhello\r\n",
            local_address: None,
            local_hostname: "mail.example.com",
            config,
        }
    }

    #[test_log::test(tokio::test)]
    async fn broken_starttls_falls_back_without_tls() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let state = Arc::new(ServerState::default());
        let server = tokio::spawn(tls_breaking_server(listener, Arc::clone(&state)));

        let envelope = envelope();
        let config = config();
        let cache = StsCache::default();
        let result = send_mail(&task(port, &envelope, &config), &LoopbackResolver, &cache)
            .await
            .unwrap();

        pretty_assertions::assert_eq!(result.accepted.len(), 1);
        assert!(result.rejected.is_empty());
        // the degraded attempt skipped STARTTLS entirely
        pretty_assertions::assert_eq!(state.connections.load(Ordering::SeqCst), 2);
        assert!(!state.starttls_after_first.load(Ordering::SeqCst));

        server.abort();
    }

    #[test_log::test(tokio::test)]
    async fn enforced_policy_is_never_downgraded() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let state = Arc::new(ServerState::default());
        let server = tokio::spawn(tls_breaking_server(listener, Arc::clone(&state)));

        let envelope = envelope();
        let config = config();
        let cache = StsCache::default();
        cache.write().await.insert(
            "remote.example".to_owned(),
            PolicyMatch {
                source: PolicySource::Cache,
                mode: PolicyMode::Enforce,
            },
        );

        let error = send_mail(&task(port, &envelope, &config), &LoopbackResolver, &cache)
            .await
            .unwrap_err();

        pretty_assertions::assert_eq!(error.response_code, 421);
        assert!(error
            .response
            .as_deref()
            .unwrap()
            .starts_with("421 TLS is required due to MTA-STS policy"));
        pretty_assertions::assert_eq!(
            error.bounce.as_ref().unwrap().category,
            BounceCategory::Policy
        );
        assert!(error.require_tls);
        // no degraded attempt was made
        pretty_assertions::assert_eq!(state.connections.load(Ordering::SeqCst), 1);

        server.abort();
    }

    #[test_log::test(tokio::test)]
    async fn unreachable_exchanger_surfaces_a_retry() {
        // bind then drop to find a port that refuses connections
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let envelope = envelope();
        let config = config();
        let cache = StsCache::default();
        let error = send_mail(&task(port, &envelope, &config), &LoopbackResolver, &cache)
            .await
            .unwrap_err();

        pretty_assertions::assert_eq!(error.response_code, 421);
        pretty_assertions::assert_eq!(error.class, Some(ErrorClass::Connection));
        assert!(error.bounce.is_none());
        assert!(error.response.is_none());
    }

    #[test_log::test(tokio::test)]
    async fn refused_recipient_comes_back_classified() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        // plain server refusing the second recipient
        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let (read, mut write) = socket.split();
            let mut lines = tokio::io::BufReader::new(read).lines();

            write.write_all(b"220 test ESMTP\r\n").await.unwrap();
            let mut in_data = false;
            while let Ok(Some(line)) = lines.next_line().await {
                if in_data {
                    if line == "." {
                        in_data = false;
                        write.write_all(b"250 2.0.0 queued\r\n").await.unwrap();
                    }
                    continue;
                }
                let upper = line.to_ascii_uppercase();
                if upper.starts_with("EHLO") {
                    write.write_all(b"250 test\r\n").await.unwrap();
                } else if upper.starts_with("MAIL FROM") {
                    write.write_all(b"250 2.1.0 ok\r\n").await.unwrap();
                } else if upper.starts_with("RCPT TO") {
                    if line.contains("nobody@") {
                        write
                            .write_all(b"550 5.1.1 no such user here\r\n")
                            .await
                            .unwrap();
                    } else {
                        write.write_all(b"250 2.1.5 ok\r\n").await.unwrap();
                    }
                } else if upper.starts_with("DATA") {
                    write.write_all(b"354 go ahead\r\n").await.unwrap();
                    in_data = true;
                } else if upper.starts_with("QUIT") {
                    write.write_all(b"221 bye\r\n").await.ok();
                    return;
                }
            }
        });

        let envelope = Envelope::new(
            "sender@example.com".parse().unwrap(),
            vec![
                "rcpt@remote.example".parse().unwrap(),
                "nobody@remote.example".parse().unwrap(),
            ],
        )
        .unwrap();
        let config = config();
        let cache = StsCache::default();
        let result = send_mail(
            &task(addr.port(), &envelope, &config),
            &LoopbackResolver,
            &cache,
        )
        .await
        .unwrap();

        pretty_assertions::assert_eq!(result.accepted.len(), 1);
        pretty_assertions::assert_eq!(result.rejected.len(), 1);
        let rejection = &result.rejected_errors[0];
        pretty_assertions::assert_eq!(rejection.response_code, 550);
        pretty_assertions::assert_eq!(
            rejection.recipient.as_ref().unwrap().to_string(),
            "nobody@remote.example"
        );
        pretty_assertions::assert_eq!(
            rejection.bounce.as_ref().unwrap().category,
            BounceCategory::Other
        );

        server.await.unwrap();
    }
}
