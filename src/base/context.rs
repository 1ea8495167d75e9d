//! Ergonomic error context helpers.
//!
//! Converts IO and hyper errors raised inside a transport into the
//! `NetError` the request state machine reports through `on_failed`.

use crate::base::neterror::NetError;
use crate::upload::UploadError;
use std::io;

/// Map an IO error to the closest Chromium network error.
pub fn net_error_from_io(err: &io::Error) -> NetError {
    match err.kind() {
        io::ErrorKind::ConnectionRefused => NetError::ConnectionRefused,
        io::ErrorKind::ConnectionReset => NetError::ConnectionReset,
        io::ErrorKind::ConnectionAborted => NetError::ConnectionAborted,
        io::ErrorKind::NotConnected => NetError::SocketNotConnected,
        io::ErrorKind::AddrInUse => NetError::AddressInUse,
        io::ErrorKind::AddrNotAvailable => NetError::AddressInvalid,
        io::ErrorKind::TimedOut => NetError::ConnectionTimedOut,
        io::ErrorKind::UnexpectedEof | io::ErrorKind::BrokenPipe => NetError::ConnectionClosed,
        _ => NetError::ConnectionFailed,
    }
}

/// Map a hyper error to a network error, looking through to an IO cause.
///
/// A failing request body surfaces as the upload error that stopped it.
pub fn net_error_from_hyper(err: &hyper::Error) -> NetError {
    let mut source = std::error::Error::source(err);
    while let Some(cause) = source {
        if let Some(upload_err) = cause.downcast_ref::<UploadError>() {
            return NetError::Upload(upload_err.clone());
        }
        if let Some(io_err) = cause.downcast_ref::<io::Error>() {
            return net_error_from_io(io_err);
        }
        source = cause.source();
    }
    if err.is_incomplete_message() {
        NetError::ConnectionClosed
    } else if err.is_parse() {
        NetError::InvalidHttpResponse
    } else if err.is_canceled() {
        NetError::Aborted
    } else if err.is_timeout() {
        NetError::TimedOut
    } else {
        NetError::ConnectionFailed
    }
}

/// Extension trait for adding context to IO Results.
pub trait IoResultExt<T> {
    /// Convert a connect error, logging the target.
    ///
    /// # Example
    /// ```ignore
    /// use cronet::base::context::IoResultExt;
    ///
    /// let stream = TcpStream::connect(addr).await
    ///     .connection_context("example.com", 443)?;
    /// ```
    fn connection_context(self, host: &str, port: u16) -> Result<T, NetError>;
}

impl<T> IoResultExt<T> for Result<T, io::Error> {
    fn connection_context(self, host: &str, port: u16) -> Result<T, NetError> {
        self.map_err(|e| {
            tracing::debug!(host = %host, port, error = %e, "connect failed");
            net_error_from_io(&e)
        })
    }
}
