use crate::upload::UploadError;
use std::sync::Arc;
use thiserror::Error;

/// Boxed application error raised by callbacks and upload providers.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Shared form of [`BoxError`], so that [`NetError`] stays `Clone`.
pub type SharedError = Arc<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Debug, Error, Clone)]
pub enum NetError {
    // Generic Errors
    #[error("Generic failure")]
    Failed,
    #[error("Operation aborted")]
    Aborted,
    #[error("Operation timed out")]
    TimedOut,
    #[error("Network changed")]
    NetworkChanged,
    #[error("Upload stream rewind not supported")]
    UploadStreamRewindNotSupported,

    // Connection Errors
    #[error("Connection closed (TCP FIN)")]
    ConnectionClosed,
    #[error("Connection reset (TCP RST)")]
    ConnectionReset,
    #[error("Connection refused")]
    ConnectionRefused,
    #[error("Connection aborted")]
    ConnectionAborted,
    #[error("Connection failed")]
    ConnectionFailed,
    #[error("Name not resolved")]
    NameNotResolved,
    #[error("Internet disconnected")]
    InternetDisconnected,
    #[error("SSL protocol error")]
    SslProtocolError,
    #[error("Address invalid")]
    AddressInvalid,
    #[error("Address unreachable")]
    AddressUnreachable,
    #[error("Socket not connected")]
    SocketNotConnected,
    #[error("Connection timed out")]
    ConnectionTimedOut,
    #[error("Address in use")]
    AddressInUse,

    // HTTP Errors
    #[error("Invalid URL")]
    InvalidUrl,
    #[error("Disallowed URL scheme")]
    DisallowedUrlScheme,
    #[error("Unknown URL scheme")]
    UnknownUrlScheme,
    #[error("Invalid redirect")]
    InvalidRedirect,
    #[error("Too many redirects")]
    TooManyRedirects,
    #[error("Unsafe redirect")]
    UnsafeRedirect,
    #[error("Invalid response")]
    InvalidResponse,
    #[error("Invalid chunked encoding")]
    InvalidChunkedEncoding,
    #[error("Method not supported")]
    MethodNotSupported,
    #[error("Empty response")]
    EmptyResponse,
    #[error("Response headers too big")]
    ResponseHeadersTooBig,
    #[error("Content decoding failed")]
    ContentDecodingFailed,
    #[error("HTTP/2 protocol error")]
    Http2ProtocolError,
    #[error("Content-Length mismatch")]
    ContentLengthMismatch,
    #[error("Incomplete chunked encoding")]
    IncompleteChunkedEncoding,
    #[error("QUIC protocol error")]
    QuicProtocolError,
    #[error("QUIC handshake failed")]
    QuicHandshakeFailed,
    #[error("Invalid HTTP response")]
    InvalidHttpResponse,
    #[error("Too many retries")]
    TooManyRetries,

    #[error("Unknown error: {0}")]
    Unknown(i32),

    // Usage errors. Returned synchronously from the offending call, never
    // delivered through a callback.
    #[error("{0}")]
    InvalidArgument(String),
    #[error("{0}")]
    InvalidState(String),

    // Application errors surfaced through on_failed.
    #[error("{message}")]
    Callback {
        message: String,
        #[source]
        source: SharedError,
    },
    #[error("Exception posting task to executor")]
    ExecutorRejected(#[source] Arc<NetError>),
    #[error("Inline execution is prohibited for this request")]
    InlineExecutionProhibited,
    #[error("Executor is shut down")]
    ExecutorShutdown,
    #[error("Exception received from UploadDataProvider")]
    Upload(#[source] UploadError),
}

/// Public error classification, stable across transports.
///
/// Matches the `NetworkException.ERROR_*` constants of the Java API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    HostnameNotResolved = 1,
    InternetDisconnected = 2,
    NetworkChanged = 3,
    TimedOut = 4,
    ConnectionClosed = 5,
    ConnectionTimedOut = 6,
    ConnectionRefused = 7,
    ConnectionReset = 8,
    AddressUnreachable = 9,
    QuicProtocolFailed = 10,
    Other = 11,
}

impl NetError {
    pub fn as_i32(&self) -> i32 {
        match self {
            NetError::Failed => -2,
            NetError::Aborted => -3,
            NetError::TimedOut => -7,
            NetError::NetworkChanged => -21,
            NetError::UploadStreamRewindNotSupported => -25,

            NetError::ConnectionClosed => -100,
            NetError::ConnectionReset => -101,
            NetError::ConnectionRefused => -102,
            NetError::ConnectionAborted => -103,
            NetError::ConnectionFailed => -104,
            NetError::NameNotResolved => -105,
            NetError::InternetDisconnected => -106,
            NetError::SslProtocolError => -107,
            NetError::AddressInvalid => -108,
            NetError::AddressUnreachable => -109,
            NetError::SocketNotConnected => -112,
            NetError::ConnectionTimedOut => -118,
            NetError::AddressInUse => -147,

            NetError::InvalidUrl => -300,
            NetError::DisallowedUrlScheme => -301,
            NetError::UnknownUrlScheme => -302,
            NetError::InvalidRedirect => -303,
            NetError::TooManyRedirects => -310,
            NetError::UnsafeRedirect => -311,
            NetError::InvalidResponse => -320,
            NetError::InvalidChunkedEncoding => -321,
            NetError::MethodNotSupported => -322,
            NetError::EmptyResponse => -324,
            NetError::ResponseHeadersTooBig => -325,
            NetError::ContentDecodingFailed => -330,
            NetError::Http2ProtocolError => -337,
            NetError::ContentLengthMismatch => -354,
            NetError::IncompleteChunkedEncoding => -355,
            NetError::QuicProtocolError => -356,
            NetError::QuicHandshakeFailed => -358,
            NetError::InvalidHttpResponse => -370,
            NetError::TooManyRetries => -375,
            NetError::Unknown(code) => *code,

            // Application-side failures have no network code of their own.
            NetError::InvalidArgument(_)
            | NetError::InvalidState(_)
            | NetError::Callback { .. }
            | NetError::ExecutorRejected(_)
            | NetError::InlineExecutionProhibited
            | NetError::ExecutorShutdown
            | NetError::Upload(_) => -2,
        }
    }

    /// Whether this error came from the network rather than from application
    /// code or API misuse.
    pub fn is_network_error(&self) -> bool {
        !matches!(
            self,
            NetError::InvalidArgument(_)
                | NetError::InvalidState(_)
                | NetError::Callback { .. }
                | NetError::ExecutorRejected(_)
                | NetError::InlineExecutionProhibited
                | NetError::ExecutorShutdown
                | NetError::Upload(_)
        )
    }

    /// Whether this is a usage error (bad argument or illegal call order).
    pub fn is_usage_error(&self) -> bool {
        matches!(self, NetError::InvalidArgument(_) | NetError::InvalidState(_))
    }

    pub fn error_code(&self) -> ErrorCode {
        match self {
            NetError::NameNotResolved => ErrorCode::HostnameNotResolved,
            NetError::InternetDisconnected => ErrorCode::InternetDisconnected,
            NetError::NetworkChanged => ErrorCode::NetworkChanged,
            NetError::TimedOut => ErrorCode::TimedOut,
            NetError::ConnectionClosed => ErrorCode::ConnectionClosed,
            NetError::ConnectionTimedOut => ErrorCode::ConnectionTimedOut,
            NetError::ConnectionRefused => ErrorCode::ConnectionRefused,
            NetError::ConnectionReset => ErrorCode::ConnectionReset,
            NetError::AddressUnreachable => ErrorCode::AddressUnreachable,
            NetError::QuicProtocolError => ErrorCode::QuicProtocolFailed,
            _ => ErrorCode::Other,
        }
    }

    /// Whether retrying the request right away has a reasonable chance of
    /// succeeding.
    pub fn immediately_retryable(&self) -> bool {
        matches!(
            self,
            NetError::NetworkChanged | NetError::ConnectionClosed | NetError::ConnectionReset
        )
    }

    pub(crate) fn invalid_argument(msg: impl Into<String>) -> Self {
        NetError::InvalidArgument(msg.into())
    }

    pub(crate) fn invalid_state(msg: impl Into<String>) -> Self {
        NetError::InvalidState(msg.into())
    }

    /// Wrap an error raised by application code inside a callback.
    pub fn callback(source: BoxError) -> Self {
        NetError::Callback {
            message: "Exception in CronetUrlRequest".to_string(),
            source: Arc::from(source),
        }
    }

    pub(crate) fn callback_with_message(message: impl Into<String>, source: BoxError) -> Self {
        NetError::Callback {
            message: message.into(),
            source: Arc::from(source),
        }
    }

    pub(crate) fn executor(cause: NetError) -> Self {
        NetError::ExecutorRejected(Arc::new(cause))
    }
}

impl From<i32> for NetError {
    fn from(code: i32) -> Self {
        match code {
            -2 => NetError::Failed,
            -3 => NetError::Aborted,
            -7 => NetError::TimedOut,
            -21 => NetError::NetworkChanged,
            -25 => NetError::UploadStreamRewindNotSupported,

            -100 => NetError::ConnectionClosed,
            -101 => NetError::ConnectionReset,
            -102 => NetError::ConnectionRefused,
            -103 => NetError::ConnectionAborted,
            -104 => NetError::ConnectionFailed,
            -105 => NetError::NameNotResolved,
            -106 => NetError::InternetDisconnected,
            -107 => NetError::SslProtocolError,
            -108 => NetError::AddressInvalid,
            -109 => NetError::AddressUnreachable,
            -112 => NetError::SocketNotConnected,
            -118 => NetError::ConnectionTimedOut,
            -147 => NetError::AddressInUse,

            -300 => NetError::InvalidUrl,
            -301 => NetError::DisallowedUrlScheme,
            -302 => NetError::UnknownUrlScheme,
            -303 => NetError::InvalidRedirect,
            -310 => NetError::TooManyRedirects,
            -311 => NetError::UnsafeRedirect,
            -320 => NetError::InvalidResponse,
            -321 => NetError::InvalidChunkedEncoding,
            -322 => NetError::MethodNotSupported,
            -324 => NetError::EmptyResponse,
            -325 => NetError::ResponseHeadersTooBig,
            -330 => NetError::ContentDecodingFailed,
            -337 => NetError::Http2ProtocolError,
            -354 => NetError::ContentLengthMismatch,
            -355 => NetError::IncompleteChunkedEncoding,
            -356 => NetError::QuicProtocolError,
            -358 => NetError::QuicHandshakeFailed,
            -370 => NetError::InvalidHttpResponse,
            -375 => NetError::TooManyRetries,
            _ => NetError::Unknown(code),
        }
    }
}
