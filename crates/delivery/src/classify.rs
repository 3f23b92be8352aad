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

use crate::error::{BounceAction, BounceCategory, BounceInfo, DeliveryError};
use egress_common::{EngineConfig, Reply};

/// What the caller must do with a classified failure.
#[derive(Debug, Copy, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    /// Defect on our side: propagate uncaught, never retry or bounce.
    Bug,
    /// Transport failed before the remote could answer: retry.
    Retry,
    /// The remote response was interpreted; the response code decides.
    Classified,
}

/// Freshly-built classification of one raw failure.
///
/// The raw error is never touched while rules run; the controller applies
/// the result exactly once.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Classification {
    pub verdict: Verdict,
    pub response_code: u16,
    pub bounce: Option<BounceInfo>,
    /// Replacement response text, only used by the MTA-STS guard.
    pub response: Option<String>,
}

impl DeliveryError {
    /// Fold a classification into the error. The classifier is the only
    /// producer of these, which keeps the response code single-writer.
    #[must_use]
    pub fn with_classification(mut self, classification: Classification) -> Self {
        self.response_code = classification.response_code;
        self.bounce = classification.bounce;
        if let Some(response) = classification.response {
            self.response = Some(response);
        }
        self
    }
}

/// One entry of the generic bounce-parsing table.
struct BounceRule {
    /// Any-of phrases, matched on lowercased, whitespace-collapsed text.
    phrases: &'static [&'static str],
    action: BounceAction,
    category: BounceCategory,
    message: &'static str,
}

/// Fixed-order response parsing, first match wins.
const RULES: &[BounceRule] = &[
    BounceRule {
        phrases: &["spamhaus", "barracudacentral", "sorbs.net", "dnsbl"],
        action: BounceAction::Reject,
        category: BounceCategory::Blocklist,
        message: "Sending IP listed by a DNS blocklist",
    },
    BounceRule {
        phrases: &[
            "denylist",
            "deny list",
            "blacklist",
            "black list",
            "blocklist",
            "block list",
            "blocked using",
        ],
        action: BounceAction::Reject,
        category: BounceCategory::Blocklist,
        message: "Sender denied by a blocklist",
    },
    BounceRule {
        phrases: &["greylist", "graylist", "try again later"],
        action: BounceAction::Defer,
        category: BounceCategory::Other,
        message: "Greylisted, delivery will be reattempted",
    },
    BounceRule {
        phrases: &["virus", "infected"],
        action: BounceAction::Reject,
        category: BounceCategory::Virus,
        message: "Message flagged as carrying a virus",
    },
    BounceRule {
        phrases: &["spam", "unsolicited mail", "junk mail"],
        action: BounceAction::Reject,
        category: BounceCategory::Spam,
        message: "Message flagged as spam",
    },
    BounceRule {
        phrases: &["dmarc"],
        action: BounceAction::Reject,
        category: BounceCategory::Dmarc,
        message: "Remote DMARC evaluation failed",
    },
    BounceRule {
        phrases: &["spf"],
        action: BounceAction::Reject,
        category: BounceCategory::Policy,
        message: "Remote SPF evaluation failed",
    },
    BounceRule {
        phrases: &["dkim"],
        action: BounceAction::Reject,
        category: BounceCategory::Policy,
        message: "Remote DKIM evaluation failed",
    },
    BounceRule {
        phrases: &[
            "mailbox full",
            "mailbox is full",
            "over quota",
            "quota exceeded",
            "insufficient storage",
        ],
        action: BounceAction::Reject,
        category: BounceCategory::Capacity,
        message: "Recipient mailbox is out of storage",
    },
    BounceRule {
        phrases: &[
            "rate limit",
            "ratelimit",
            "rate limited",
            "too many messages",
            "slow down",
        ],
        action: BounceAction::Slowdown,
        category: BounceCategory::Capacity,
        message: "Sending rate exceeded",
    },
    BounceRule {
        phrases: &["too many connections", "connection limit"],
        action: BounceAction::Slowdown,
        category: BounceCategory::Network,
        message: "Connection limit reached",
    },
    BounceRule {
        phrases: &[
            "relay access denied",
            "relaying denied",
            "relay not permitted",
            "unable to relay",
        ],
        action: BounceAction::Reject,
        category: BounceCategory::Policy,
        message: "Relaying denied",
    },
    BounceRule {
        phrases: &[
            "user unknown",
            "unknown user",
            "no such user",
            "recipient rejected",
            "address rejected",
            "user not found",
            "invalid recipient",
        ],
        action: BounceAction::Reject,
        category: BounceCategory::Other,
        message: "Unknown recipient address",
    },
    BounceRule {
        phrases: &["message size", "size limit", "too large", "exceeds maximum"],
        action: BounceAction::Reject,
        category: BounceCategory::Message,
        message: "Message exceeds the size limit",
    },
    BounceRule {
        phrases: &[
            "local policy",
            "policy reasons",
            "policy violation",
            "prohibited by administrator",
        ],
        action: BounceAction::Reject,
        category: BounceCategory::Policy,
        message: "Rejected by the local policy of the receiving server",
    },
    BounceRule {
        phrases: &[
            "temporarily deferred",
            "temporarily rejected",
            "temporary failure",
            "try later",
        ],
        action: BounceAction::Defer,
        category: BounceCategory::Other,
        message: "Temporarily deferred by the receiving server",
    },
    BounceRule {
        phrases: &[
            "connection refused",
            "connection timed out",
            "network error",
        ],
        action: BounceAction::Defer,
        category: BounceCategory::Network,
        message: "Network trouble reported by the receiving server",
    },
    BounceRule {
        phrases: &[
            "bad sequence",
            "command rejected",
            "syntax error",
            "protocol error",
        ],
        action: BounceAction::Reject,
        category: BounceCategory::Protocol,
        message: "Protocol violation reported",
    },
    BounceRule {
        phrases: &["access denied", "not authorized", "permission denied"],
        action: BounceAction::Reject,
        category: BounceCategory::Block,
        message: "Sender blocked by the receiving server",
    },
];

const APPLE_HOSTS: &[&str] = &["apple.com", "icloud.com", "me.com", "mac.com"];

const SPOOFING: &[&str] = &["spoof", "impersonat"];
const LOCAL_POLICY: &[&str] = &["local policy"];
const SPAM: &[&str] = &["spam"];
const VIRUS: &[&str] = &["virus"];
const DENYLIST: &[&str] = &["denylist", "deny list"];
const BLACKLIST: &[&str] = &["blacklist", "black list"];
const BLOCKLIST: &[&str] = &["blocklist", "block list"];

const TLS_FAILURE: &[&str] = &["disconnected before secure tls connection was established"];
const SSL_FAILURE: &[&str] = &[
    "ssl routines",
    "ssl23_get_server_hello",
    "/deps/openssl",
    "ssl3_check",
];

/// Lowercase and collapse whitespace runs so multi-word phrases match
/// across line folds.
fn normalize(text: &str) -> String {
    text.to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

fn matches_any(normalized: &str, phrases: &[&str]) -> bool {
    phrases.iter().any(|phrase| normalized.contains(phrase))
}

/// Does the text look like a broken STARTTLS session?
#[must_use]
pub fn matches_tls_failure(text: &str) -> bool {
    matches_any(&normalize(text), TLS_FAILURE)
}

/// Does the text come out of the TLS library itself?
#[must_use]
pub fn matches_ssl_failure(text: &str) -> bool {
    matches_any(&normalize(text), SSL_FAILURE)
}

/// The failure classifier. Owns every rule table; nothing else is
/// allowed to assign a final response code.
pub struct Classifier {
    local_ip: std::net::IpAddr,
    /// Treat responses echoing our own IP as blocklist evidence.
    /// Heuristic, not a documented SMTP behavior; kept switchable.
    ip_echo_heuristic: bool,
}

impl Classifier {
    #[must_use]
    pub fn new(local_ip: std::net::IpAddr, config: &EngineConfig) -> Self {
        Self {
            local_ip,
            ip_echo_heuristic: config.ip_echo_heuristic,
        }
    }

    /// Interpret one raw failure.
    ///
    /// The input is never mutated; rules run over the response text and
    /// the result carries the final verdict, code and bounce info.
    #[allow(clippy::too_many_lines, clippy::cognitive_complexity)]
    pub fn classify(&self, error: &DeliveryError) -> Classification {
        let mut code = error.response_code;

        if error.is_code_bug {
            tracing::error!(fatal = true, %error, "delivery failed on a code defect");
            return Classification {
                verdict: Verdict::Bug,
                response_code: code,
                bounce: None,
                response: None,
            };
        }

        tracing::warn!(%error, domain = %error.target, "delivery attempt failed");

        // no response from the remote server: the caller simply retries
        let Some(raw) = error.response.as_deref() else {
            return Classification {
                verdict: Verdict::Retry,
                response_code: code,
                bounce: None,
                response: None,
            };
        };

        let normalized = normalize(raw);
        let status = Reply::parse(raw)
            .ok()
            .and_then(|r| r.code().details().map(str::to_owned));

        let mut bounce = parse_bounce(&normalized, code, status);

        // ambiguous parses get a second look for virus/spam phrasing
        if bounce.message == UNKNOWN
            || (bounce.action == BounceAction::Reject
                && matches!(
                    bounce.category,
                    BounceCategory::Policy
                        | BounceCategory::Message
                        | BounceCategory::Block
                        | BounceCategory::Other
                ))
        {
            if matches_any(&normalized, VIRUS) {
                bounce.category = BounceCategory::Virus;
            } else if matches_any(&normalized, SPAM) {
                bounce.category = BounceCategory::Spam;
            }
        }

        // provider-specific phrasings, fixed order
        if APPLE_HOSTS.contains(&error.target.as_str())
            && normalized.contains("message rejected due to local policy")
        {
            // [HM08] is their blocklist wording, [CS01] their spam one
            bounce.category = if normalized
                .contains("554 5.7.1 [hm08] message rejected due to local policy")
            {
                BounceCategory::Blocklist
            } else {
                BounceCategory::Spam
            };
        } else if normalized.contains("aup#1260") {
            // IPv6 not supported with Spectrum
            code = 421;
        } else if normalized.contains("temporarily deferred")
            || normalized.contains("junkmail rejected")
            || normalized.contains("spectrum.net/support/internet/understanding-email-error-codes")
            || normalized.contains("abuse_rbl@abuse-att.net")
            || normalized.contains("cloudmark.com")
            || normalized.contains("[ipts04]")
            || normalized.contains("cox.com/residential/support/email-error-codes")
            || normalized.contains("spamcop.net")
            || raw.contains("RBL")
        {
            bounce.category = BounceCategory::Blocklist;
        } else if error.target == "qq.com" && normalized.contains("550 mail content denied") {
            bounce.category = BounceCategory::Spam;
        } else if bounce.category == BounceCategory::Policy && matches_any(&normalized, SPOOFING) {
            bounce.category = BounceCategory::Spam;
        } else if self.ip_echo_heuristic && self.echoes_our_ip_in_lookup_url(raw) {
            bounce.category = BounceCategory::Blocklist;
        } else if normalized.contains("linuxmagic.com/power_of_ip_reputation")
            || normalized.contains("we don't accept mail from do spammers")
        {
            bounce.category = BounceCategory::Blocklist;
        } else if self.ip_echo_heuristic
            && bounce.category != BounceCategory::Spam
            && (normalized.contains("rate limited")
                || normalized.contains("reputation")
                || normalized.contains("451 4.7.1 resources restricted")
                || normalized.contains("blocked"))
            && raw.contains(&self.local_ip.to_string())
        {
            bounce.category = BounceCategory::Blocklist;
        }

        if matches!(
            bounce.category,
            BounceCategory::Virus
                | BounceCategory::Block
                | BounceCategory::Spam
                | BounceCategory::Blocklist
        ) {
            tracing::error!(
                fatal = true,
                category = %bounce.category,
                response = raw,
                domain = %error.target,
                "remote rejection requires operator attention"
            );
        }

        // we evaluate DMARC before accepting mail, a remote dmarc
        // rejection is treated as a transient anomaly
        if bounce.category == BounceCategory::Dmarc {
            code = 421;
        }

        let spoofing = matches_any(&normalized, SPOOFING);
        if matches!(bounce.category, BounceCategory::Virus | BounceCategory::Spam)
            || (bounce.category == BounceCategory::Policy && spoofing)
        {
            // confirmed virus/spam/spoof never retries
            if code < 500 {
                code = if bounce.category == BounceCategory::Virus {
                    554
                } else {
                    550
                };
            }
        } else if code >= 500
            && (matches!(bounce.action, BounceAction::Defer | BounceAction::Slowdown)
                || (matches!(
                    bounce.category,
                    BounceCategory::Block
                        | BounceCategory::Blocklist
                        | BounceCategory::Capacity
                        | BounceCategory::Network
                        | BounceCategory::Protocol
                        | BounceCategory::Policy
                ) && (bounce.category != BounceCategory::Policy || !spoofing))
                || matches_any(&normalized, DENYLIST)
                || matches_any(&normalized, BLACKLIST)
                || matches_any(&normalized, BLOCKLIST)
                || (matches_any(&normalized, LOCAL_POLICY) && !spoofing))
        {
            // a hard failure that smells like a listing false positive is
            // retried; once the IP is delisted the next attempt goes
            // through instead of bouncing to the sender
            code = 421;
        }

        Classification {
            verdict: Verdict::Classified,
            response_code: code,
            bounce: Some(bounce),
            response: None,
        }
    }

    /// A TLS failure under an enforced MTA-STS policy: fatal for this
    /// attempt, retried later, never downgraded.
    pub fn sts_violation(&self, error: &DeliveryError) -> Classification {
        tracing::error!(
            fatal = true,
            domain = %error.target,
            %error,
            "TLS is required by the MTA-STS policy and could not be negotiated"
        );

        Classification {
            verdict: Verdict::Classified,
            response_code: 421,
            bounce: Some(BounceInfo {
                category: BounceCategory::Policy,
                action: BounceAction::Defer,
                status: None,
                message: "TLS required by the destination policy".to_owned(),
            }),
            response: Some(format!(
                "421 TLS is required due to MTA-STS policy ({error})"
            )),
        }
    }

    /// The degraded attempt failed on transport as well; surface a plain
    /// retry to the caller.
    #[must_use]
    pub fn fallback_exhausted(&self, error: &DeliveryError) -> Classification {
        Classification {
            verdict: Verdict::Retry,
            response_code: 421,
            bounce: error.bounce.clone(),
            response: None,
        }
    }

    fn echoes_our_ip_in_lookup_url(&self, raw: &str) -> bool {
        let ip = self.local_ip.to_string();
        ["?q=", "?test=", "?query=", "?ip="]
            .iter()
            .any(|param| raw.contains(&format!("{param}{ip}")))
    }
}

const UNKNOWN: &str = "Unknown";

fn parse_bounce(normalized: &str, code: u16, status: Option<String>) -> BounceInfo {
    for rule in RULES {
        if matches_any(normalized, rule.phrases) {
            return BounceInfo {
                category: rule.category,
                action: rule.action,
                status,
                message: rule.message.to_owned(),
            };
        }
    }

    BounceInfo {
        category: BounceCategory::Unknown,
        action: match code {
            500.. => BounceAction::Reject,
            400.. => BounceAction::Defer,
            _ => BounceAction::Unknown,
        },
        status,
        message: UNKNOWN.to_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorClass;

    fn classifier() -> Classifier {
        Classifier::new(
            "203.0.113.7".parse().unwrap(),
            &EngineConfig::default(),
        )
    }

    fn remote_error(target: &str, code: u16, response: &str) -> DeliveryError {
        let mut error =
            DeliveryError::new(None, "remote server rejected the transaction")
                .with_response(code, response);
        error.target = target.to_owned();
        error
    }

    #[test]
    fn code_bug_is_reraised_untouched() {
        let mut error = DeliveryError::new(Some(ErrorClass::Internal), "state machine misuse");
        error.is_code_bug = true;

        let classification = classifier().classify(&error);
        pretty_assertions::assert_eq!(classification.verdict, Verdict::Bug);
        assert!(classification.bounce.is_none());
        pretty_assertions::assert_eq!(classification.response_code, error.response_code);
    }

    #[test]
    fn transport_timeout_without_response_retries() {
        let error = DeliveryError::new(Some(ErrorClass::Timeout), "connection timed out");

        let classification = classifier().classify(&error);
        pretty_assertions::assert_eq!(classification.verdict, Verdict::Retry);
        assert!(classification.bounce.is_none());
        pretty_assertions::assert_eq!(classification.response_code, 421);
    }

    #[rstest::rstest]
    #[case("554 5.7.1 your host is on our blacklist")]
    #[case("554 5.7.1 listed on a deny list, see https://example.net")]
    #[case("554 5.7.1 sender blocklisted")]
    fn listing_phrases_normalize_to_blocklist(#[case] response: &str) {
        let classification =
            classifier().classify(&remote_error("example.com", 554, response));
        pretty_assertions::assert_eq!(
            classification.bounce.unwrap().category,
            BounceCategory::Blocklist
        );
        // hard listing failures are deliberately retried
        pretty_assertions::assert_eq!(classification.response_code, 421);
    }

    #[test]
    fn listing_downgrade_is_idempotent() {
        let classifier = classifier();
        let error = remote_error("example.com", 554, "554 5.7.1 listed by spamhaus");

        let first = classifier.classify(&error);
        pretty_assertions::assert_eq!(first.response_code, 421);

        let reclassified = classifier.classify(&error.with_classification(first));
        pretty_assertions::assert_eq!(reclassified.response_code, 421);
        pretty_assertions::assert_eq!(
            reclassified.bounce.unwrap().category,
            BounceCategory::Blocklist
        );
    }

    #[rstest::rstest]
    #[case(421, "421 4.7.0 virus detected in message content", 554)]
    #[case(554, "554 5.7.1 virus detected in message content", 554)]
    fn virus_is_always_permanent(
        #[case] code: u16,
        #[case] response: &str,
        #[case] expected: u16,
    ) {
        let classification = classifier().classify(&remote_error("example.com", code, response));
        pretty_assertions::assert_eq!(classification.response_code, expected);
        pretty_assertions::assert_eq!(
            classification.bounce.unwrap().category,
            BounceCategory::Virus
        );
    }

    #[test]
    fn spam_detection_forces_550() {
        let classification = classifier().classify(&remote_error(
            "example.com",
            450,
            "550 5.7.1 spam detected",
        ));
        pretty_assertions::assert_eq!(classification.response_code, 550);
        pretty_assertions::assert_eq!(
            classification.bounce.unwrap().category,
            BounceCategory::Spam
        );
    }

    #[test]
    fn apple_local_policy_hm08_is_a_listing() {
        let classification = classifier().classify(&remote_error(
            "icloud.com",
            554,
            "554 5.7.1 [HM08] Message rejected due to local policy",
        ));
        pretty_assertions::assert_eq!(
            classification.bounce.unwrap().category,
            BounceCategory::Blocklist
        );
        pretty_assertions::assert_eq!(classification.response_code, 421);
    }

    #[test]
    fn apple_local_policy_cs01_is_spam() {
        let classification = classifier().classify(&remote_error(
            "icloud.com",
            554,
            "554 5.7.1 [CS01] Message rejected due to local policy.",
        ));
        pretty_assertions::assert_eq!(
            classification.bounce.unwrap().category,
            BounceCategory::Spam
        );
        pretty_assertions::assert_eq!(classification.response_code, 554);
    }

    #[rstest::rstest]
    #[case("554 5.7.1 access denied", BounceCategory::Block)]
    #[case("552 5.2.2 mailbox is full, over quota", BounceCategory::Capacity)]
    #[case("550 too many connections from your host", BounceCategory::Network)]
    #[case("501 5.5.2 syntax error in parameters", BounceCategory::Protocol)]
    fn hard_failures_in_listing_adjacent_categories_are_retried(
        #[case] response: &str,
        #[case] category: BounceCategory,
    ) {
        let code = response[..3].parse::<u16>().unwrap();
        let classification = classifier().classify(&remote_error("example.com", code, response));
        pretty_assertions::assert_eq!(classification.bounce.unwrap().category, category);
        pretty_assertions::assert_eq!(classification.response_code, 421);
    }

    #[test]
    fn remote_dmarc_rejection_is_retried() {
        let classification = classifier().classify(&remote_error(
            "example.com",
            550,
            "550 5.7.1 rejected per dmarc policy of the sender domain",
        ));
        pretty_assertions::assert_eq!(classification.response_code, 421);
        pretty_assertions::assert_eq!(
            classification.bounce.unwrap().category,
            BounceCategory::Dmarc
        );
    }

    #[test]
    fn spoofing_policy_rejection_stays_permanent() {
        let classification = classifier().classify(&remote_error(
            "example.com",
            451,
            "451 4.7.1 rejected by local policy, suspected spoofing of the sender",
        ));
        pretty_assertions::assert_eq!(classification.response_code, 550);
        pretty_assertions::assert_eq!(
            classification.bounce.unwrap().category,
            BounceCategory::Spam
        );
    }

    #[test]
    fn deferred_action_downgrades_hard_code() {
        let classification = classifier().classify(&remote_error(
            "example.com",
            550,
            "550 temporarily rejected, try later",
        ));
        pretty_assertions::assert_eq!(classification.response_code, 421);
    }

    // NOTE: heuristic subject to tuning; a response echoing our own IP in
    // a lookup URL is taken as listing evidence.
    #[test]
    fn ip_echo_heuristic_reclassifies_as_listing() {
        let classification = classifier().classify(&remote_error(
            "example.com",
            554,
            "554 5.7.1 see https://rbl.example.org/lookup?ip=203.0.113.7 for details",
        ));
        pretty_assertions::assert_eq!(
            classification.bounce.unwrap().category,
            BounceCategory::Blocklist
        );
    }

    #[test]
    fn ip_echo_heuristic_can_be_disabled() {
        let config = EngineConfig {
            ip_echo_heuristic: false,
            ..EngineConfig::default()
        };
        let classifier = Classifier::new("203.0.113.7".parse().unwrap(), &config);

        let classification = classifier.classify(&remote_error(
            "example.com",
            554,
            "554 5.7.1 your ip 203.0.113.7 was blocked",
        ));
        pretty_assertions::assert_eq!(
            classification.bounce.unwrap().category,
            BounceCategory::Unknown
        );
    }

    #[test]
    fn sts_violation_forces_a_retry_with_policy_category() {
        let error = DeliveryError::new(Some(ErrorClass::Tls), "handshake failed");
        let classification = classifier().sts_violation(&error);

        pretty_assertions::assert_eq!(classification.response_code, 421);
        pretty_assertions::assert_eq!(
            classification.bounce.as_ref().unwrap().category,
            BounceCategory::Policy
        );
        assert!(classification
            .response
            .as_deref()
            .unwrap()
            .starts_with("421 TLS is required due to MTA-STS policy"));
    }

    #[test]
    fn unknown_response_has_no_matching_rule() {
        let classification = classifier().classify(&remote_error(
            "example.com",
            554,
            "554 5.7.1 transaction unwelcome here",
        ));
        let bounce = classification.bounce.unwrap();
        pretty_assertions::assert_eq!(bounce.category, BounceCategory::Unknown);
        pretty_assertions::assert_eq!(bounce.action, BounceAction::Reject);
        pretty_assertions::assert_eq!(bounce.status.as_deref(), Some("5.7.1"));
        pretty_assertions::assert_eq!(classification.response_code, 554);
    }
}
