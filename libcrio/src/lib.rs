pub mod client;
pub mod config;

pub use client::CrioClient;
pub use config::CrioConfig;

use thiserror::Error;

/// Generated CRI types (`runtime.v1`).
pub mod runtime {
    tonic::include_proto!("runtime.v1");
}

pub type Result<T> = std::result::Result<T, CrioError>;

#[derive(Debug, Error)]
pub enum CrioError {
    #[error("unsupported runtime endpoint {0:?}: only unix sockets are supported")]
    UnsupportedEndpoint(String),

    #[error("failed to read runtime config: {0}")]
    Config(String),

    #[error("runtime transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    #[error("runtime rpc failed: {0}")]
    Rpc(#[from] tonic::Status),
}
