//! Thin client for remediating mailbox forwarding via the Microsoft Graph
//! mailbox-settings API: disable forwarding, enable forwarding to a given
//! address, and query current status. Every operation acquires a tenant
//! token, issues one HTTP call, and maps the outcome into a
//! [`mailguard_core::ResponseEnvelope`] — faults are reported as data, never
//! raised to the caller.

mod client;
mod error;
mod token;

pub use client::{RemediationClient, RemediationClientBuilder};
pub use error::ClientError;
pub use token::ClientCredentialsProvider;
