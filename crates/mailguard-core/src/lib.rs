//! Mailguard core primitives shared across the remediation client and tooling.

pub mod envelope;
pub mod provider;

pub use envelope::{
    missing_params, OperationTimer, ParamValue, RequestEnvelope, ResponseEnvelope,
};
pub use provider::{StaticTokenProvider, TokenError, TokenProvider};
