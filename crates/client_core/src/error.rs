use shared::error::DomainError;
use thiserror::Error;

use crate::{reconciler::ReconcileError, stream::StreamError};

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("request to {endpoint} failed: {source}")]
    Transport {
        endpoint: String,
        #[source]
        source: reqwest::Error,
    },
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error(transparent)]
    Reconcile(#[from] ReconcileError),
    #[error(transparent)]
    Stream(#[from] StreamError),
    #[error("invalid client configuration: {0}")]
    Config(String),
    #[error(transparent)]
    Capability(#[from] anyhow::Error),
}

impl ClientError {
    pub(crate) fn transport(endpoint: impl Into<String>) -> impl FnOnce(reqwest::Error) -> Self {
        let endpoint = endpoint.into();
        move |source| Self::Transport { endpoint, source }
    }

    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport { .. })
    }
}

pub type ClientResult<T> = std::result::Result<T, ClientError>;
