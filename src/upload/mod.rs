//! Request body upload.
//!
//! The application supplies an [`UploadDataProvider`]; the engine drives it
//! through an [`UploadDataStream`], which runs every provider call on the
//! request's upload executor and reconciles `reset`/`init`/`read`/`rewind`
//! against provider completions that may arrive from any thread.

mod provider;
mod stream;

pub use provider::{RewindSink, UploadDataProvider, UploadDataProviders, UploadDataSink};
pub use stream::{InitStatus, PendingInit, UploadChunk, UploadDataStream};

use crate::base::neterror::{BoxError, NetError, SharedError};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error, Clone)]
pub enum UploadError {
    /// Error reported or returned by the provider itself.
    #[error(transparent)]
    Provider(SharedError),
    #[error("Bytes read can't be zero except for last chunk!")]
    ZeroLengthRead,
    #[error("Read upload data length {read} exceeds expected length {expected}")]
    ExceedsLength { read: u64, expected: u64 },
    #[error("Non-chunked upload can't have last chunk")]
    FinalChunkOnFixedLength,
    #[error("Upload data length has not been queried")]
    NotInitialized,
    #[error("Upload data stream is busy")]
    NotReady,
    #[error("UploadDataSink dropped without reporting a result")]
    SinkDropped,
    #[error("Upload read interrupted by reset")]
    Interrupted,
    #[error("Upload data stream is closed")]
    Destroyed,
    /// The upload executor refused a provider call.
    #[error(transparent)]
    Executor(Arc<NetError>),
}

impl UploadError {
    pub(crate) fn provider(err: BoxError) -> Self {
        UploadError::Provider(Arc::from(err))
    }

    pub(crate) fn executor(err: NetError) -> Self {
        UploadError::Executor(Arc::new(err))
    }
}

impl From<UploadError> for NetError {
    fn from(err: UploadError) -> Self {
        NetError::Upload(err)
    }
}
