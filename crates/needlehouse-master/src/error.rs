//! Master Error Types
//!
//! `NotLeader` is the load-bearing variant: the HTTP layer turns it into a
//! reverse proxy to the leader, the gRPC layer into FAILED_PRECONDITION
//! with a leader hint. Everything else maps onto 4xx/5xx or logs and
//! continues, depending on whether it happened on a request path or in a
//! background loop.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("not the leader{}", .0.as_deref().map(|l| format!(", leader is {l}")).unwrap_or_default())]
    NotLeader(Option<String>),

    #[error("no leader elected yet")]
    NoLeader,

    #[error("consensus error: {0}")]
    Consensus(String),

    #[error(transparent)]
    Topology(#[from] needlehouse_topology::Error),

    #[error(transparent)]
    Core(#[from] needlehouse_core::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("rpc error: {0}")]
    Rpc(#[from] tonic::Status),

    #[error("transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    #[error("{0}")]
    Internal(String),
}
