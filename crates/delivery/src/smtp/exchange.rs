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

use crate::tls::{Requirement, TlsContext};
use egress_common::config::Timeouts;
use egress_common::{Envelope, Mailbox, Reply};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt};
use tokio_rustls::rustls;

/// Errors produced by one SMTP exchange.
#[derive(Debug, thiserror::Error)]
pub enum SmtpError {
    /// Failure of the underlying connection.
    #[error("connection: {source}")]
    Io {
        kind: std::io::ErrorKind,
        source: String,
    },

    /// One of the per-phase timeouts elapsed.
    #[error("{phase} timed out")]
    Timeout { phase: &'static str },

    /// Failed to parse the reply of the server.
    #[error("failed to parse the reply of the server: {source}")]
    ReplyParsing { source: String },

    /// STARTTLS negotiation or the TLS session itself failed.
    #[error("tls: {source}")]
    Tls { source: String },

    /// Encryption is mandatory but the server does not offer it.
    #[error("encrypted connection is required, but the server did not advertise STARTTLS")]
    StartTlsUnsupported,

    /// The server answered a command with an error reply.
    #[error("{command} rejected: {reply}")]
    Rejected { command: &'static str, reply: Reply },

    /// Invariant violation on our side.
    #[error("internal: {source}")]
    Internal { source: String },
}

impl From<std::io::Error> for SmtpError {
    fn from(error: std::io::Error) -> Self {
        Self::Io {
            kind: error.kind(),
            source: error.to_string(),
        }
    }
}

/// Everything one attempt needs to run the conversation.
pub(crate) struct Session<'a> {
    /// Name we announce in EHLO, the local hostname.
    pub client_name: &'a str,
    pub envelope: &'a Envelope,
    pub message: &'a [u8],
    pub timeouts: &'a Timeouts,
    pub starttls: Requirement,
    pub tls: &'a TlsContext,
}

/// Per-recipient outcome of an accepted exchange.
pub(crate) struct Outcome {
    pub accepted: Vec<Mailbox>,
    pub rejected: Vec<(Mailbox, Reply)>,
}

/// Extensions advertised by the server that change our behavior.
#[derive(Debug, Default, Copy, Clone)]
struct Extensions {
    starttls: bool,
    pipelining: bool,
}

impl Extensions {
    fn from_reply(reply: &Reply) -> Self {
        let mut extensions = Self::default();
        // first line carries the server name
        for line in reply.lines().skip(1) {
            let keyword = line.split_whitespace().next().unwrap_or_default();
            if keyword.eq_ignore_ascii_case("STARTTLS") {
                extensions.starttls = true;
            } else if keyword.eq_ignore_ascii_case("PIPELINING") {
                extensions.pipelining = true;
            }
        }
        extensions
    }
}

/// Run the SMTP conversation over a connected socket and deliver the
/// message: greeting, EHLO, optional STARTTLS upgrade, envelope, DATA.
///
/// The socket is released on every path: QUIT on success, dropped (and
/// thereby closed) when an error unwinds.
pub(crate) async fn deliver(
    socket: tokio::net::TcpStream,
    host: &str,
    session: &Session<'_>,
) -> Result<Outcome, SmtpError> {
    let mut conn = Connection::plain(socket, session.timeouts.socket);

    let greeting = conn.read_reply(session.timeouts.greeting, "greeting").await?;
    if greeting.code().value() != 220 {
        return Err(SmtpError::Rejected {
            command: "connection greeting",
            reply: greeting,
        });
    }

    let (mut conn, extensions) = handshake(conn, host, session).await?;

    if extensions.pipelining {
        send_envelope_pipelining(&mut conn, session).await?;
    } else {
        send_envelope_sequential(&mut conn, session).await?;
    }
    let (accepted, rejected) = recipients(&mut conn, session, extensions.pipelining).await?;

    if accepted.is_empty() {
        // every recipient was refused; surface the last reply
        let reply = rejected
            .last()
            .map(|(_, reply)| reply.clone())
            .ok_or_else(|| SmtpError::Internal {
                source: "no recipient outcome recorded".to_owned(),
            })?;
        conn.quit().await;
        return Err(SmtpError::Rejected {
            command: "RCPT TO",
            reply,
        });
    }

    let reply = conn.command("DATA\r\n", "DATA").await?;
    if reply.code().value() != 354 {
        conn.quit().await;
        return Err(SmtpError::Rejected {
            command: "DATA",
            reply,
        });
    }

    conn.write_raw(&prepare_data(session.message)).await?;
    let reply = conn.read_reply(session.timeouts.socket, "end of DATA").await?;
    if reply.code().value() != 250 {
        conn.quit().await;
        return Err(SmtpError::Rejected {
            command: "end of DATA",
            reply,
        });
    }

    conn.quit().await;
    Ok(Outcome { accepted, rejected })
}

/// EHLO (HELO fallback) and the STARTTLS upgrade decision, re-greeting
/// on the encrypted channel.
async fn handshake(
    mut conn: Connection,
    host: &str,
    session: &Session<'_>,
) -> Result<(Connection, Extensions), SmtpError> {
    let ehlo = format!("EHLO {}\r\n", session.client_name);
    let reply = conn.command(&ehlo, "EHLO").await?;
    let mut extensions = if reply.code().value() == 250 {
        Extensions::from_reply(&reply)
    } else {
        // ancient servers only speak HELO, without extensions
        let reply = conn
            .command(&format!("HELO {}\r\n", session.client_name), "HELO")
            .await?;
        if reply.code().value() != 250 {
            return Err(SmtpError::Rejected {
                command: "HELO",
                reply,
            });
        }
        Extensions::default()
    };

    match (session.starttls, extensions.starttls) {
        (Requirement::Required, false) => return Err(SmtpError::StartTlsUnsupported),
        (Requirement::Required | Requirement::Optional, true) => {
            let reply = conn.command("STARTTLS\r\n", "STARTTLS").await?;
            if reply.code().value() == 220 {
                conn = conn.upgrade_tls(host, session.tls).await?;
                // the pre-upgrade extension list is untrusted
                let reply = conn.command(&ehlo, "EHLO").await?;
                if reply.code().value() != 250 {
                    return Err(SmtpError::Rejected {
                        command: "EHLO",
                        reply,
                    });
                }
                extensions = Extensions::from_reply(&reply);
            } else if matches!(session.starttls, Requirement::Required) {
                return Err(SmtpError::Tls {
                    source: format!("the STARTTLS command was not successful: {reply}"),
                });
            } else {
                tracing::warn!(%host, %reply, "STARTTLS refused, continuing in clear");
            }
        }
        (Requirement::Optional | Requirement::Disabled, _) => {}
    }

    Ok((conn, extensions))
}

fn mail_from_command(envelope: &Envelope) -> String {
    format!("MAIL FROM:<{}>\r\n", envelope.from)
}

fn rcpt_to_command(rcpt: &Mailbox) -> String {
    format!("RCPT TO:<{rcpt}>\r\n")
}

/// Write the whole envelope in one burst; replies are read afterwards in
/// command order.
async fn send_envelope_pipelining(
    conn: &mut Connection,
    session: &Session<'_>,
) -> Result<(), SmtpError> {
    let command = [
        mail_from_command(session.envelope),
        session
            .envelope
            .to
            .iter()
            .map(rcpt_to_command)
            .collect::<String>(),
    ]
    .concat();
    conn.write_raw(command.as_bytes()).await
}

async fn send_envelope_sequential(
    conn: &mut Connection,
    session: &Session<'_>,
) -> Result<(), SmtpError> {
    conn.write_raw(mail_from_command(session.envelope).as_bytes())
        .await
}

/// Read the MAIL FROM reply and walk the recipient list, collecting the
/// per-recipient verdicts.
async fn recipients(
    conn: &mut Connection,
    session: &Session<'_>,
    pipelining: bool,
) -> Result<(Vec<Mailbox>, Vec<(Mailbox, Reply)>), SmtpError> {
    let reply = conn
        .read_reply(session.timeouts.socket, "MAIL FROM")
        .await?;
    if reply.code().value() != 250 {
        if pipelining {
            // drain the pipelined RCPT replies before reporting
            for _ in &session.envelope.to {
                let _ = conn.read_reply(session.timeouts.socket, "RCPT TO").await;
            }
        }
        return Err(SmtpError::Rejected {
            command: "MAIL FROM",
            reply,
        });
    }

    let mut accepted = vec![];
    let mut rejected = vec![];
    for rcpt in &session.envelope.to {
        if !pipelining {
            conn.write_raw(rcpt_to_command(rcpt).as_bytes()).await?;
        }
        let reply = conn.read_reply(session.timeouts.socket, "RCPT TO").await?;
        match reply.code().value() {
            250 | 251 => accepted.push(rcpt.clone()),
            _ => {
                tracing::warn!(recipient = %rcpt, %reply, "recipient refused");
                rejected.push((rcpt.clone(), reply));
            }
        }
    }

    Ok((accepted, rejected))
}

/// Terminate the payload with `CRLF.CRLF`, normalizing line endings and
/// doubling leading dots (RFC 5321 §4.5.2).
fn prepare_data(message: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(message.len() + 5);
    for line in message.split(|&b| b == b'\n') {
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        if line.first() == Some(&b'.') {
            out.push(b'.');
        }
        out.extend_from_slice(line);
        out.extend_from_slice(b"\r\n");
    }
    // the final split element is empty when the message ends in CRLF
    if out.ends_with(b"\r\n\r\n") {
        out.truncate(out.len() - 2);
    }
    out.extend_from_slice(b".\r\n");
    out
}

enum Stream {
    Plain(tokio::io::BufReader<tokio::net::TcpStream>),
    Tls(Box<tokio::io::BufReader<tokio_rustls::client::TlsStream<tokio::net::TcpStream>>>),
}

/// A connection with per-operation idle timeouts, plain or upgraded.
struct Connection {
    stream: Stream,
    socket_timeout: std::time::Duration,
}

impl Connection {
    fn plain(socket: tokio::net::TcpStream, socket_timeout: std::time::Duration) -> Self {
        Self {
            stream: Stream::Plain(tokio::io::BufReader::new(socket)),
            socket_timeout,
        }
    }

    async fn read_line(&mut self, buf: &mut String) -> std::io::Result<usize> {
        match &mut self.stream {
            Stream::Plain(stream) => stream.read_line(buf).await,
            Stream::Tls(stream) => stream.read_line(buf).await,
        }
    }

    async fn write_raw(&mut self, bytes: &[u8]) -> Result<(), SmtpError> {
        let write = async {
            match &mut self.stream {
                Stream::Plain(stream) => {
                    stream.get_mut().write_all(bytes).await?;
                    stream.get_mut().flush().await
                }
                Stream::Tls(stream) => {
                    stream.get_mut().write_all(bytes).await?;
                    stream.get_mut().flush().await
                }
            }
        };
        tokio::time::timeout(self.socket_timeout, write)
            .await
            .map_err(|_elapsed| SmtpError::Timeout { phase: "write" })?
            .map_err(Into::into)
    }

    /// Read one complete, possibly multiline reply.
    async fn read_reply(
        &mut self,
        timeout: std::time::Duration,
        phase: &'static str,
    ) -> Result<Reply, SmtpError> {
        let mut raw = String::new();
        loop {
            let mut line = String::new();
            let read = tokio::time::timeout(timeout, self.read_line(&mut line))
                .await
                .map_err(|_elapsed| SmtpError::Timeout { phase })??;
            if read == 0 {
                return Err(SmtpError::Io {
                    kind: std::io::ErrorKind::UnexpectedEof,
                    source: "the server closed the connection".to_owned(),
                });
            }
            raw.push_str(&line);
            if Reply::is_complete(&raw) {
                break;
            }
        }

        Reply::parse(&raw).map_err(|error| SmtpError::ReplyParsing {
            source: error.to_string(),
        })
    }

    async fn command(&mut self, command: &str, phase: &'static str) -> Result<Reply, SmtpError> {
        self.write_raw(command.as_bytes()).await?;
        self.read_reply(self.socket_timeout, phase).await
    }

    /// Wrap the socket in TLS. Only ever called on a plain connection.
    async fn upgrade_tls(self, host: &str, tls: &TlsContext) -> Result<Self, SmtpError> {
        let Stream::Plain(stream) = self.stream else {
            return Err(SmtpError::Internal {
                source: "TLS upgrade requested on an encrypted connection".to_owned(),
            });
        };

        let connector = tls.connector().map_err(|error| SmtpError::Tls {
            source: error.to_string(),
        })?;
        let name = server_name(tls, host)?;

        let upgrade = connector.connect(name, stream.into_inner());
        let stream = tokio::time::timeout(self.socket_timeout, upgrade)
            .await
            .map_err(|_elapsed| SmtpError::Timeout { phase: "TLS handshake" })?
            .map_err(|error| SmtpError::Tls {
                source: error.to_string(),
            })?;

        Ok(Self {
            stream: Stream::Tls(Box::new(tokio::io::BufReader::new(stream))),
            socket_timeout: self.socket_timeout,
        })
    }

    /// Best-effort QUIT; failure to close is logged, never escalated.
    async fn quit(mut self) {
        if let Err(error) = self.command("QUIT\r\n", "QUIT").await {
            tracing::debug!(%error, "connection did not close cleanly");
        }
    }
}

fn server_name(tls: &TlsContext, host: &str) -> Result<rustls::ServerName, SmtpError> {
    let name = tls.server_name.as_deref().unwrap_or(host);
    if let Ok(ip) = name.parse::<std::net::IpAddr>() {
        return Ok(rustls::ServerName::IpAddress(ip));
    }
    rustls::ServerName::try_from(name).map_err(|error| SmtpError::Tls {
        source: error.to_string(),
    })
}
