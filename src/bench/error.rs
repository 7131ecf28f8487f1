use std::{error, io};

use thiserror::Error;

use crate::ctrl::ExchangeError;
use crate::rdma::cm::{CmError, CmEventType};
use crate::rdma::cq::WcStatus;
use crate::rdma::mr::RegistrationError;
use crate::rdma::qp::PostError;
use crate::rdma::type_alias::WrId;

/// Benchmark error type.
#[derive(Debug, Error)]
pub enum BenchError {
    /// A transport resource could not be allocated.
    #[error("cannot allocate {what}")]
    ResourceExhausted {
        what: &'static str,
        #[source]
        source: Box<dyn error::Error + Send + Sync>,
    },

    /// Memory registration failed.
    #[error("memory registration failed")]
    RegistrationFailed(#[from] RegistrationError),

    /// The connection manager reported a failure for a connection.
    #[error("connection failed with {event} (status {status})")]
    ConnectionError { event: CmEventType, status: i32 },

    /// Posting a work request failed.
    #[error("cannot post work request")]
    Post(#[from] PostError),

    /// A work request completed with an error status.
    #[error("WR {wr_id} completed with error: {status}")]
    Completion { wr_id: WrId, status: WcStatus },

    /// The descriptor exchange failed.
    #[error("descriptor exchange failed")]
    Exchange(#[from] ExchangeError),

    /// A connection manager call failed.
    #[error("connection manager call failed")]
    Cm(#[from] CmError),

    /// The configuration is invalid.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// I/O error.
    #[error("I/O error")]
    Io(#[from] io::Error),

    /// A bounded wait elapsed.
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),
}

impl BenchError {
    pub(crate) fn exhausted(
        what: &'static str,
        source: impl Into<Box<dyn error::Error + Send + Sync>>,
    ) -> Self {
        BenchError::ResourceExhausted {
            what,
            source: source.into(),
        }
    }
}
