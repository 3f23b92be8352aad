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

use crate::error::DeliveryError;
use egress_common::address::{is_fqdn, is_ip_literal};
use egress_common::{EngineConfig, Envelope};

/// Metadata of the message a notification is being produced for.
pub struct OriginalEmail<'a> {
    pub envelope: &'a Envelope,
    /// `Message-ID` header of the original, used for threading.
    pub message_id: Option<&'a str>,
    /// Identifier of the message inside the platform queue.
    pub queue_id: Option<&'a str>,
    pub arrived_at: Option<time::OffsetDateTime>,
}

/// Name of this machine, used as `Reporting-MTA`.
#[must_use]
pub fn local_hostname() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "localhost".to_owned())
}

/// Build the RFC 3464 non-delivery report for one classified failure.
///
/// multipart/report with a human-readable part, a machine-readable
/// delivery-status part and the original message. Never fails: fields
/// that cannot be rendered are left out of the report.
#[must_use]
#[allow(clippy::too_many_lines)]
pub fn build_bounce(
    email: &OriginalEmail<'_>,
    error: &DeliveryError,
    original_message: &[u8],
    config: &EngineConfig,
    local_hostname: &str,
    local_ip: std::net::IpAddr,
) -> Vec<u8> {
    let is_delayed = error.response_code < 500;
    let sender = email.envelope.from.to_string();
    let recipient = error
        .recipient
        .as_ref()
        .map(ToString::to_string)
        .or_else(|| email.envelope.to.first().map(ToString::to_string));
    let boundary = format!("{}/{local_hostname}", uuid::Uuid::new_v4());

    let mut out = String::new();

    // the notification goes back to the envelope sender
    push_field(&mut out, "From", &sender);
    push_field(&mut out, "To", &sender);
    if let Some(recipient) = &recipient {
        push_field(&mut out, "X-Failed-Recipients", recipient);
    }
    push_field(&mut out, "Auto-Submitted", "auto-replied");
    push_field(&mut out, "X-Auto-Response-Suppress", "All");
    push_field(&mut out, "Precedence", "auto_reply");
    if is_delayed {
        if let Some(date) = rfc2822(error.attempted_at) {
            push_field(&mut out, "Last-Attempt-Date", &date);
        }
        if let Some(date) = rfc2822(error.attempted_at + config.max_retry_duration) {
            push_field(&mut out, "Will-Retry-Until", &date);
        }
    }
    push_field(
        &mut out,
        "Subject",
        &format!(
            "Delivery Status Notification ({})",
            if is_delayed { "Delayed" } else { "Failure" }
        ),
    );
    if let Some(message_id) = email.message_id {
        push_field(&mut out, "In-Reply-To", message_id);
        push_field(&mut out, "References", message_id);
        push_field(&mut out, "X-Original-Message-ID", message_id);
    }
    if let Some(date) = rfc2822(time::OffsetDateTime::now_utc()) {
        push_field(&mut out, "Date", &date);
    }
    push_field(
        &mut out,
        "Message-ID",
        &format!("<{}@{local_hostname}>", uuid::Uuid::new_v4()),
    );
    push_field(&mut out, "MIME-Version", "1.0");
    push_field(
        &mut out,
        "Content-Type",
        &format!("multipart/report; report-type=delivery-status; boundary=\"{boundary}\""),
    );
    out.push_str("\r\n");

    // human-readable part
    out.push_str(&format!("--{boundary}\r\n"));
    push_field(&mut out, "Content-Type", "text/plain; charset=utf-8");
    push_field(&mut out, "Content-Description", "Notification");
    out.push_str("\r\n");
    out.push_str(&format!(
        "Your message {} to {} due to an error.\r\n\r\nThe response was:\r\n\r\n{}\r\n",
        if is_delayed {
            "is delayed and will be retried later"
        } else {
            "wasn't delivered"
        },
        recipient.as_deref().unwrap_or("the recipient"),
        markup_to_text(error.response_text()),
    ));

    // machine-readable part
    out.push_str(&format!("\r\n--{boundary}\r\n"));
    push_field(&mut out, "Content-Type", "message/delivery-status");
    push_field(&mut out, "Content-Description", "Delivery report");
    out.push_str("\r\n");

    if let Some(date) = email.arrived_at.and_then(rfc2822) {
        push_field(&mut out, "Arrival-Date", &date);
    }
    if let Some(recipient) = &recipient {
        push_field(&mut out, "Final-Recipient", &format!("rfc822; {recipient}"));
    }
    push_field(&mut out, "Action", if is_delayed { "delayed" } else { "failed" });
    push_field(&mut out, "Status", if is_delayed { "4.0.0" } else { "5.0.0" });
    push_field(
        &mut out,
        "Diagnostic-Code",
        &format!("smtp; {}", diagnostic_code(error)),
    );
    if is_fqdn(&error.target) || is_ip_literal(&error.target) {
        push_field(&mut out, "Remote-MTA", &format!("dns; {}", error.target));
    }
    push_field(&mut out, "Reporting-MTA", &format!("dns; {local_hostname}"));
    push_field(&mut out, "X-Report-Abuse-To", &config.abuse_contact);
    push_field(&mut out, "X-Report-Abuse", &config.abuse_contact);
    push_field(&mut out, "X-Complaints-To", &config.abuse_contact);
    push_field(&mut out, "X-Egress-Version", &config.platform_version);
    push_field(
        &mut out,
        "X-Egress-Sender",
        &format!("rfc822; {sender}, {local_hostname}, {local_ip}"),
    );
    if let Some(queue_id) = email.queue_id {
        push_field(&mut out, "X-Egress-ID", queue_id);
    }

    // original message, verbatim
    out.push_str(&format!("\r\n--{boundary}\r\n"));
    out.push_str("Content-Type: message/rfc822\r\n\r\n");

    let mut bytes = out.into_bytes();
    bytes.extend_from_slice(original_message);
    bytes.extend_from_slice(format!("\r\n--{boundary}--\r\n").as_bytes());
    bytes
}

fn push_field(out: &mut String, name: &str, value: &str) {
    out.push_str(name);
    out.push_str(": ");
    out.push_str(value);
    out.push_str("\r\n");
}

/// The failure on one line, for the `Diagnostic-Code` field.
fn diagnostic_code(error: &DeliveryError) -> String {
    let text = error.response.clone().unwrap_or_else(|| {
        format!("{} {}", error.response_code, error.message)
    });
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn rfc2822(date: time::OffsetDateTime) -> Option<String> {
    date.format(&time::format_description::well_known::Rfc2822)
        .ok()
}

/// Render remote markup as plain text: tags are dropped, images are
/// stripped and links keep their target without brackets.
#[allow(clippy::while_let_on_iterator)]
fn markup_to_text(input: &str) -> String {
    if !input.contains('<') {
        return decode_entities(input);
    }

    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();
    let mut pending_href: Option<String> = None;

    while let Some(c) = chars.next() {
        if c != '<' {
            out.push(c);
            continue;
        }

        let mut tag = String::new();
        while let Some(&next) = chars.peek() {
            chars.next();
            if next == '>' {
                break;
            }
            tag.push(next);
        }

        let name = tag
            .trim_start_matches('/')
            .split([' ', '\t', '\n', '/'])
            .next()
            .unwrap_or("")
            .to_ascii_lowercase();
        let closing = tag.starts_with('/');

        match name.as_str() {
            "a" if !closing => pending_href = href_attribute(&tag),
            "a" => {
                if let Some(href) = pending_href.take() {
                    if !out.ends_with(&href) {
                        if !out.ends_with(' ') {
                            out.push(' ');
                        }
                        out.push_str(&href);
                    }
                }
            }
            "br" | "p" | "div" | "li" | "tr" => {
                if closing || name == "br" {
                    out.push('\n');
                }
            }
            // images carry no text worth keeping
            _ => {}
        }
    }

    decode_entities(out.trim())
}

fn href_attribute(tag: &str) -> Option<String> {
    let start = tag.to_ascii_lowercase().find("href=")? + "href=".len();
    let rest = tag.get(start..)?;
    let (quote, rest) = match rest.chars().next() {
        Some(q @ ('"' | '\'')) => (Some(q), rest.get(1..)?),
        _ => (None, rest),
    };
    let end = match quote {
        Some(q) => rest.find(q)?,
        None => rest.find(' ').unwrap_or(rest.len()),
    };
    rest.get(..end).map(str::to_owned)
}

fn decode_entities(input: &str) -> String {
    input
        .replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}
