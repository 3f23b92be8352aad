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

use crate::mx::MxSnapshot;
use egress_common::{Envelope, Mailbox};

/// Low-level class of a failed attempt, assigned before any SMTP reply
/// text is considered.
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
#[strum(serialize_all = "snake_case")]
pub enum ErrorClass {
    /// The peer reset the connection.
    ConnectionReset,
    /// Socket-level read/write failure.
    Socket,
    /// Could not establish or keep the connection.
    Connection,
    /// One of the per-phase timeouts elapsed.
    Timeout,
    /// Name resolution failed.
    Dns,
    /// The peer violated the protocol below the SMTP dialogue.
    Protocol,
    /// STARTTLS negotiation or the TLS session itself failed.
    Tls,
    /// Failure inside the TLS library.
    Ssl,
    /// Invariant violation on our side.
    Internal,
}

impl ErrorClass {
    /// Classes worth a new attempt on another mail exchanger.
    pub const RETRYABLE: &'static [Self] = &[
        Self::ConnectionReset,
        Self::Socket,
        Self::Connection,
        Self::Timeout,
        Self::Dns,
        Self::Protocol,
    ];

    #[must_use]
    pub fn is_retryable(self) -> bool {
        Self::RETRYABLE.contains(&self)
    }
}

/// Why the remote server refused or deferred the message.
///
/// `blacklist` is accepted on input and normalized to [`Self::Blocklist`];
/// the distinction carries no meaning downstream.
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
pub enum BounceCategory {
    #[strum(to_string = "blocklist", serialize = "blacklist")]
    Blocklist,
    Spam,
    Virus,
    Policy,
    Block,
    Capacity,
    Network,
    Protocol,
    Message,
    Other,
    Dmarc,
    Unknown,
}

/// What the remote server asked us to do about it.
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
pub enum BounceAction {
    Reject,
    Defer,
    Slowdown,
    Unknown,
}

/// Parsed interpretation of the remote response.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct BounceInfo {
    pub category: BounceCategory,
    pub action: BounceAction,
    /// RFC 3463 status echoed by the server, when present.
    pub status: Option<String>,
    /// Short label of the matched rule.
    pub message: String,
}

/// A failed delivery attempt with everything the caller needs to decide
/// between queue retry and permanent bounce.
///
/// `response_code` is authoritative: below 500 means retry later, 500 and
/// above means notify the sender. Only the failure classifier assigns it.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct DeliveryError {
    /// Transport-level class, absent when the remote server replied.
    pub class: Option<ErrorClass>,
    /// Human description of the underlying failure.
    pub message: String,
    /// Verbatim SMTP response, when the remote server produced one.
    pub response: Option<String>,
    pub response_code: u16,
    /// Defect on our side; must propagate uncaught, never retried or
    /// bounced.
    pub is_code_bug: bool,
    pub bounce: Option<BounceInfo>,
    pub require_tls: bool,
    pub opportunistic_tls: bool,
    pub ignore_tls: bool,
    /// Routing target of the attempt (recipient domain or forward host).
    pub target: String,
    pub mx: Option<MxSnapshot>,
    pub envelope: Option<Envelope>,
    /// Recipient concerned, for per-recipient rejections.
    pub recipient: Option<Mailbox>,
    #[serde(with = "time::serde::rfc3339")]
    pub attempted_at: time::OffsetDateTime,
}

impl DeliveryError {
    #[must_use]
    pub fn new(class: Option<ErrorClass>, message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            response_code: derive_response_code(class, None),
            is_code_bug: matches!(class, Some(ErrorClass::Internal)),
            class,
            message,
            response: None,
            bounce: None,
            require_tls: false,
            opportunistic_tls: false,
            ignore_tls: false,
            target: String::new(),
            mx: None,
            envelope: None,
            recipient: None,
            attempted_at: time::OffsetDateTime::now_utc(),
        }
    }

    #[must_use]
    pub fn with_response(mut self, code: u16, response: impl Into<String>) -> Self {
        self.response = Some(response.into());
        self.response_code = code;
        self
    }

    /// The response text the classifier rules run over, falling back to
    /// the failure description.
    #[must_use]
    pub fn response_text(&self) -> &str {
        self.response.as_deref().unwrap_or(&self.message)
    }

    #[must_use]
    pub fn is_tls_error(&self) -> bool {
        self.class == Some(ErrorClass::Tls)
            || crate::classify::matches_tls_failure(self.response_text())
    }

    #[must_use]
    pub fn is_ssl_error(&self) -> bool {
        self.class == Some(ErrorClass::Ssl)
            || crate::classify::matches_ssl_failure(self.response_text())
    }

    /// Connection-phase failures raised by our own client rather than by
    /// the remote SMTP dialogue.
    #[must_use]
    pub fn is_transport_library_error(&self) -> bool {
        matches!(
            self.class,
            Some(ErrorClass::Connection | ErrorClass::Timeout | ErrorClass::Protocol)
        )
    }

    #[must_use]
    pub fn has_retryable_class(&self) -> bool {
        self.class.is_some_and(ErrorClass::is_retryable)
    }
}

impl std::fmt::Display for DeliveryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.response {
            Some(response) => write!(f, "{response}"),
            None => write!(f, "{}", self.message),
        }
    }
}

impl std::error::Error for DeliveryError {}

/// Initial response code of a raw failure: the remote code when one was
/// received, otherwise 421 for retryable transport classes and 550 for
/// the rest.
#[must_use]
pub fn derive_response_code(class: Option<ErrorClass>, reply_code: Option<u16>) -> u16 {
    reply_code.unwrap_or_else(|| match class {
        Some(class) if class.is_retryable() => 421,
        _ => 550,
    })
}

/// Outcome of an accepted attempt. Terminal and immutable.
///
/// An attempt can be partially accepted: recipients individually refused
/// end up in `rejected` with their classified error in `rejected_errors`.
#[derive(Debug, serde::Serialize, serde::Deserialize)]
pub struct DeliveryResult {
    pub accepted: Vec<Mailbox>,
    pub rejected: Vec<Mailbox>,
    pub rejected_errors: Vec<DeliveryError>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[rstest::rstest]
    #[case("blocklist", BounceCategory::Blocklist)]
    #[case("blacklist", BounceCategory::Blocklist)]
    #[case("spam", BounceCategory::Spam)]
    #[case("dmarc", BounceCategory::Dmarc)]
    fn category_from_str(#[case] input: &str, #[case] expected: BounceCategory) {
        pretty_assertions::assert_eq!(input.parse::<BounceCategory>().unwrap(), expected);
    }

    #[test]
    fn blacklist_never_survives_serialization() {
        let parsed = "blacklist".parse::<BounceCategory>().unwrap();
        pretty_assertions::assert_eq!(parsed.to_string(), "blocklist");
        pretty_assertions::assert_eq!(serde_json::to_string(&parsed).unwrap(), r#""blocklist""#);
    }

    #[rstest::rstest]
    #[case(Some(ErrorClass::Timeout), None, 421)]
    #[case(Some(ErrorClass::Dns), None, 421)]
    #[case(Some(ErrorClass::Tls), None, 550)]
    #[case(None, Some(554), 554)]
    #[case(Some(ErrorClass::Timeout), Some(454), 454)]
    #[case(None, None, 550)]
    fn initial_code(
        #[case] class: Option<ErrorClass>,
        #[case] reply: Option<u16>,
        #[case] expected: u16,
    ) {
        pretty_assertions::assert_eq!(derive_response_code(class, reply), expected);
    }
}
