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

#[derive(Debug, thiserror::Error)]
pub enum MailboxFromStrError {
    #[error("cannot parse {s:?}")]
    CannotParse { s: String },
}

/// A single RFC 5321 mailbox, the unit of the envelope.
#[derive(Clone, Debug, Eq, serde_with::SerializeDisplay, serde_with::DeserializeFromStr)]
pub struct Mailbox {
    at_sign: usize,
    full: String,
}

impl std::str::FromStr for Mailbox {
    type Err = MailboxFromStrError;

    #[inline]
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Err(error) = addr::parse_email_address(s) {
            return Err(MailboxFromStrError::CannotParse {
                s: error.to_string(),
            });
        }
        match s.find('@') {
            Some(at_sign) => Ok(Self {
                at_sign,
                full: s.to_owned(),
            }),
            None => Err(MailboxFromStrError::CannotParse { s: s.to_owned() }),
        }
    }
}

impl PartialEq for Mailbox {
    #[inline]
    fn eq(&self, other: &Self) -> bool {
        self.full == other.full
    }
}

impl std::hash::Hash for Mailbox {
    #[inline]
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.full.hash(state);
    }
}

impl std::fmt::Display for Mailbox {
    #[inline]
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.full)
    }
}

impl Mailbox {
    /// get the user of the address.
    #[must_use]
    #[inline]
    pub fn local_part(&self) -> &str {
        #[allow(clippy::indexing_slicing, clippy::string_slice)]
        &self.full[..self.at_sign]
    }

    /// get the fqdn of the address.
    #[must_use]
    #[inline]
    pub fn domain(&self) -> &str {
        #[allow(clippy::indexing_slicing, clippy::string_slice)]
        &self.full[self.at_sign + 1..]
    }
}

/// Is the host a syntactically valid fully qualified domain name?
///
/// IP literals and bare labels (e.g. `localhost`) are not FQDNs.
#[must_use]
pub fn is_fqdn(host: &str) -> bool {
    let host = host.strip_suffix('.').unwrap_or(host);
    if host.is_empty()
        || host.len() > 253
        || !host.contains('.')
        || host.parse::<std::net::IpAddr>().is_ok()
    {
        return false;
    }

    host.split('.').all(|label| {
        !label.is_empty()
            && label.len() <= 63
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    })
}

/// Is the host an IPv4 or IPv6 literal?
#[must_use]
pub fn is_ip_literal(host: &str) -> bool {
    host.parse::<std::net::IpAddr>().is_ok()
}
