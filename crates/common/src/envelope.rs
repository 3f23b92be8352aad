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

use crate::Mailbox;

/// The envelope to use for the SMTP exchange is invalid.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvelopeError {
    /// No rcpt provided, therefore no `RCPT TO` can be sent to the remote server
    #[error("the envelope does not contain any recipient")]
    NoRecipient,
}

/// Reverse path and forward paths of one delivery attempt.
///
/// Immutable once built, a fallback attempt reuses the same envelope.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Envelope {
    pub from: Mailbox,
    pub to: Vec<Mailbox>,
}

impl Envelope {
    pub fn new(from: Mailbox, to: Vec<Mailbox>) -> Result<Self, EnvelopeError> {
        if to.is_empty() {
            return Err(EnvelopeError::NoRecipient);
        }
        Ok(Self { from, to })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reject_empty_recipients() {
        let from = "sender@example.com".parse::<Mailbox>().unwrap();
        assert_eq!(
            Envelope::new(from, vec![]).unwrap_err(),
            EnvelopeError::NoRecipient
        );
    }
}
