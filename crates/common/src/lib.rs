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

pub mod address;
pub mod config;
pub mod dns_resolver;
pub mod envelope;
pub mod reply;

pub use address::Mailbox;
pub use config::EngineConfig;
pub use dns_resolver::{DnsResolver, Lookup, MailResolver, MxRecord};
pub use envelope::Envelope;
pub use reply::{Reply, ReplyCode};

pub use time;
pub use trust_dns_resolver;
