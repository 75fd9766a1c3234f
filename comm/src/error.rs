//! Communication error types.

use thiserror::Error;

/// Errors reported by message endpoints.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EndpointError {
    #[error("Endpoint {0} is dead")]
    Dead(String),

    #[error("Endpoint {endpoint} gave up after {attempts} attempts: {last_error}")]
    RetriesExhausted {
        endpoint: String,
        attempts: u32,
        last_error: String,
    },

    #[error("Partner of endpoint {endpoint} is gone: {reason}")]
    PartnerGone { endpoint: String, reason: String },
}

/// Failure of a single send attempt, as reported by a transport.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    /// Worth retrying, e.g. the partner is temporarily unreachable.
    #[error("Transient transport failure: {0}")]
    Transient(String),

    /// The partner will never accept messages again.
    #[error("Permanent transport failure: {0}")]
    Permanent(String),
}

/// Errors from correlated request/response calls.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CallError {
    /// No response within the deadline. `result_arrived` tells whether a
    /// response turned up while the call was giving up, meaning the operation
    /// did complete on the partner.
    #[error("Invocation {invocation_id} timed out (result arrived: {result_arrived})")]
    Timeout {
        invocation_id: u64,
        result_arrived: bool,
    },

    #[error("Invocation {invocation_id} failed: endpoint disabled: {reason}")]
    EndpointDisabled { invocation_id: u64, reason: String },

    #[error("Could not send invocation: {0}")]
    Send(#[from] EndpointError),
}
