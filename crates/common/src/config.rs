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

/// Timeouts applied independently to each phase of an attempt.
///
/// All four default to the same duration, mirroring the queue timeout of
/// the surrounding platform.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Timeouts {
    /// TCP connection establishment.
    #[serde(with = "humantime_serde", default = "Timeouts::default_timeout")]
    pub connect: std::time::Duration,
    /// Waiting for the 220 greeting once connected.
    #[serde(with = "humantime_serde", default = "Timeouts::default_timeout")]
    pub greeting: std::time::Duration,
    /// Socket idle time between any subsequent read or write.
    #[serde(with = "humantime_serde", default = "Timeouts::default_timeout")]
    pub socket: std::time::Duration,
    /// DNS lookups done on behalf of an attempt.
    #[serde(with = "humantime_serde", default = "Timeouts::default_timeout")]
    pub dns: std::time::Duration,
}

impl Timeouts {
    const fn default_timeout() -> std::time::Duration {
        std::time::Duration::from_secs(60)
    }
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            connect: Self::default_timeout(),
            greeting: Self::default_timeout(),
            socket: Self::default_timeout(),
            dns: Self::default_timeout(),
        }
    }
}

/// Read-only configuration of the delivery engine.
///
/// Validated at startup by the surrounding application.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub timeouts: Timeouts,
    /// Upper bound on walking the ranked MX candidate list.
    #[serde(
        with = "humantime_serde",
        default = "EngineConfig::default_max_connect_time"
    )]
    pub max_connect_time: std::time::Duration,
    /// Port used when the routing target does not carry one.
    #[serde(default = "EngineConfig::default_port")]
    pub default_port: u16,
    /// How long the queue keeps retrying before a delayed message is
    /// abandoned; only used to announce `Will-Retry-Until` in reports.
    #[serde(
        with = "humantime_serde",
        default = "EngineConfig::default_max_retry_duration"
    )]
    pub max_retry_duration: std::time::Duration,
    /// Mailbox advertised in the abuse-reporting headers of a report.
    #[serde(default = "EngineConfig::default_abuse_contact")]
    pub abuse_contact: String,
    /// Platform version advertised in report headers.
    #[serde(default = "EngineConfig::default_platform_version")]
    pub platform_version: String,
    /// Refuse MX candidates resolving to loopback/private/link-local
    /// addresses. Disabled only in test environments.
    #[serde(default = "EngineConfig::default_true")]
    pub block_local_addresses: bool,
    /// Treat a remote response echoing our own IP address as evidence of
    /// a blocklist listing. Heuristic, see the failure classifier.
    #[serde(default = "EngineConfig::default_true")]
    pub ip_echo_heuristic: bool,
}

impl EngineConfig {
    const fn default_max_connect_time() -> std::time::Duration {
        std::time::Duration::from_secs(60)
    }

    const fn default_port() -> u16 {
        25
    }

    const fn default_max_retry_duration() -> std::time::Duration {
        // 5 days, the usual queue lifetime
        std::time::Duration::from_secs(5 * 24 * 60 * 60)
    }

    fn default_abuse_contact() -> String {
        "abuse@localhost".to_string()
    }

    fn default_platform_version() -> String {
        env!("CARGO_PKG_VERSION").to_string()
    }

    const fn default_true() -> bool {
        true
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            timeouts: Timeouts::default(),
            max_connect_time: Self::default_max_connect_time(),
            default_port: Self::default_port(),
            max_retry_duration: Self::default_max_retry_duration(),
            abuse_contact: Self::default_abuse_contact(),
            platform_version: Self::default_platform_version(),
            block_local_addresses: true,
            ip_echo_heuristic: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_from_empty_document() {
        let config = serde_json::from_str::<EngineConfig>("{}").unwrap();
        pretty_assertions::assert_eq!(config, EngineConfig::default());
        pretty_assertions::assert_eq!(config.default_port, 25);
        pretty_assertions::assert_eq!(
            config.max_retry_duration,
            std::time::Duration::from_secs(432_000)
        );
        assert!(config.block_local_addresses);
    }

    #[test]
    fn durations_use_humantime() {
        let config = serde_json::from_str::<EngineConfig>(
            r#"{ "max_connect_time": "1m 30s", "timeouts": { "connect": "10s" } }"#,
        )
        .unwrap();
        pretty_assertions::assert_eq!(
            config.max_connect_time,
            std::time::Duration::from_secs(90)
        );
        pretty_assertions::assert_eq!(
            config.timeouts.connect,
            std::time::Duration::from_secs(10)
        );
        pretty_assertions::assert_eq!(
            config.timeouts.greeting,
            std::time::Duration::from_secs(60)
        );
    }
}
