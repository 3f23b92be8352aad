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

/// Codes at the start of each line of a reply
#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
#[serde(untagged)]
pub enum ReplyCode {
    /// simple Reply Code as defined in RFC5321
    Code {
        // https://datatracker.ietf.org/doc/html/rfc5321#section-4.2
        /// code base
        code: u16,
    },
    /// enhanced codes
    Enhanced {
        /// code base
        code: u16,
        /// RFC 3463 status
        enhanced: String,
    },
}

const ENHANCED: i32 = 0;
const SIMPLE: i32 = 1;

impl ReplyCode {
    /// Return the underlying value of the reply code
    #[must_use]
    #[inline]
    pub const fn value(&self) -> u16 {
        match self {
            Self::Code { code, .. } | Self::Enhanced { code, .. } => *code,
        }
    }

    /// Return the enhanced value of the reply code
    #[must_use]
    #[inline]
    pub fn details(&self) -> Option<&str> {
        match self {
            Self::Enhanced { enhanced, .. } => Some(enhanced),
            Self::Code { .. } => None,
        }
    }

    fn try_parse(which: i32, words: &[&str]) -> Option<Self> {
        match (which, words) {
            (ENHANCED, [_, "", ..]) => None,
            (ENHANCED, [code, enhanced, ..]) => {
                let mut enhanced = enhanced.splitn(3, '.').map(str::parse::<u16>);

                let (a, b, c) = (
                    enhanced.next()?.ok()?,
                    enhanced.next()?.ok()?,
                    enhanced.next()?.ok()?,
                );

                #[allow(clippy::unreachable)]
                Some(Self::Enhanced {
                    code: match Self::try_parse(SIMPLE, &[code])? {
                        Self::Code { code, .. } => code,
                        Self::Enhanced { .. } => unreachable!(),
                    },
                    enhanced: format!("{a}.{b}.{c}"),
                })
            }
            (SIMPLE, [code, ..]) => Some(Self::Code {
                code: code.parse::<u16>().ok()?,
            }),
            _ => None,
        }
    }

    pub(super) fn from_str(s: &str) -> Result<(Self, String), ReplyParseError> {
        for i in ENHANCED..=SIMPLE {
            let words = s.split([' ', '-']).collect::<Vec<&str>>();
            if let Some(code) = Self::try_parse(i, words.as_slice()) {
                let code_len = code.to_string().len();

                #[allow(clippy::string_slice, clippy::indexing_slicing)]
                return Ok((code, s[code_len..].to_string()));
            }
        }

        Err(ReplyParseError::CannotParse { s: s.to_string() })
    }
}

impl std::fmt::Display for ReplyCode {
    #[inline]
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Code { code } => f.write_fmt(format_args!("{code}")),
            Self::Enhanced { code, enhanced } => f.write_fmt(format_args!("{code} {enhanced}")),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ReplyParseError {
    #[error("cannot parse {s:?}")]
    CannotParse { s: String },
    #[error("empty reply")]
    Empty,
}

/// A complete reply from the remote server, one or more lines sharing the
/// same reply code.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Reply {
    code: ReplyCode,
    lines: Vec<String>,
}

impl Reply {
    /// Parse a full reply, `\r\n` separated, as received from the wire.
    ///
    /// The code of the final line is authoritative.
    pub fn parse(raw: &str) -> Result<Self, ReplyParseError> {
        let mut code = None;
        let mut lines = vec![];

        for line in raw.lines().filter(|l| !l.is_empty()) {
            let (line_code, rest) = ReplyCode::from_str(line)?;
            lines.push(
                rest.strip_prefix(|c| c == ' ' || c == '-')
                    .map_or_else(|| rest.clone(), str::to_owned),
            );
            code = Some(line_code);
        }

        match code {
            Some(code) => Ok(Self { code, lines }),
            None => Err(ReplyParseError::Empty),
        }
    }

    #[must_use]
    pub const fn code(&self) -> &ReplyCode {
        &self.code
    }

    /// The text of each line, reply code stripped.
    pub fn lines(&self) -> impl Iterator<Item = &String> {
        self.lines.iter()
    }

    /// Is the final line of the last continuation still to come?
    ///
    /// SMTP marks continuation with a dash right after the 3-digit code.
    #[must_use]
    pub fn is_complete(raw: &str) -> bool {
        raw.lines()
            .last()
            .is_some_and(|l| l.as_bytes().get(3) != Some(&b'-'))
    }
}

impl std::fmt::Display for Reply {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut lines = self.lines.iter();
        match lines.next() {
            Some(first) => write!(f, "{} {}", self.code, first)?,
            None => write!(f, "{}", self.code)?,
        }
        for line in lines {
            write!(f, "\n{line}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // NOTE: if the separator is `-`, it will not be included in the output of
    // `ReplyCode::to_string()` but is handled correctly in `Reply::to_string()`
    #[rstest::rstest]
    #[case(
        "250",
        (&ReplyCode::Code { code: 250 }, ""),
        "250"
    )]
    #[case(
        "504 5.5.4",
        (&ReplyCode::Enhanced {
            code: 504,
            enhanced: "5.5.4".to_owned(),
        },
        ""),
        "504 5.5.4",
    )]
    #[case(
        "250-2.0.0",
        (&ReplyCode::Enhanced {
            code: 250,
            enhanced: "2.0.0".to_owned(),
        },
        ""),
        "250 2.0.0",
    )]
    #[case(
        "250 ",
        (&ReplyCode::Code { code: 250 }, " "),
        "250"
    )]
    #[case(
        "504 5.5.4 ",
        (&ReplyCode::Enhanced {
            code: 504,
            enhanced: "5.5.4".to_owned(),
        },
        " "),
        "504 5.5.4",
    )]
    fn parse_reply_code(
        #[case] input: &str,
        #[case] expected: (&ReplyCode, &str),
        #[case] to_string: &str,
    ) {
        let (code, message) = ReplyCode::from_str(input).unwrap();
        pretty_assertions::assert_eq!(code, *expected.0);
        pretty_assertions::assert_eq!(code.to_string(), to_string);
        pretty_assertions::assert_eq!(message, expected.1);
    }

    #[test]
    fn parse_single_line() {
        let reply = Reply::parse("554 5.7.1 Message rejected due to local policy\r\n").unwrap();
        pretty_assertions::assert_eq!(reply.code().value(), 554);
        pretty_assertions::assert_eq!(reply.code().details(), Some("5.7.1"));
        pretty_assertions::assert_eq!(
            reply.to_string(),
            "554 5.7.1 Message rejected due to local policy"
        );
    }

    #[test]
    fn parse_multiline() {
        let reply = Reply::parse("250-mx.example.com\r\n250-PIPELINING\r\n250 STARTTLS\r\n")
            .unwrap();
        pretty_assertions::assert_eq!(reply.code().value(), 250);
        pretty_assertions::assert_eq!(
            reply.lines().collect::<Vec<_>>(),
            ["mx.example.com", "PIPELINING", "STARTTLS"]
        );
    }

    #[rstest::rstest]
    #[case("250-mx.example.com\r\n250-PIPELINING\r\n", false)]
    #[case("250-mx.example.com\r\n250 STARTTLS\r\n", true)]
    #[case("220 mx.example.com ESMTP\r\n", true)]
    fn completeness(#[case] raw: &str, #[case] complete: bool) {
        pretty_assertions::assert_eq!(Reply::is_complete(raw), complete);
    }
}
