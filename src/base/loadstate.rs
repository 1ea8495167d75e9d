/// The current state of a request inside the transport.
/// This roughly matches net/base/load_states.h
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum LoadState {
    /// The request is idle.
    #[default]
    Idle,

    /// Waiting for a socket from the pool.
    WaitingForStalledSocketPool,

    /// Waiting for an available socket.
    WaitingForAvailableSocket,

    /// Waiting for the delegate to run a job.
    WaitingForDelegate,

    /// Waiting for the cache lock.
    WaitingForCache,

    /// Downloading the PAC script.
    DownloadingPacFile,

    /// Resolving the proxy.
    ResolvingProxyForUrl,

    /// Resolving the host in PAC file.
    ResolvingHostInPacFile,

    /// Establishing proxy tunnel.
    EstablishingProxyTunnel,

    /// Resolving the host.
    ResolvingHost,

    /// Connecting to the host (TCP handshake).
    Connecting,

    /// Establishing an SSL connection.
    SslHandshake,

    /// Sending the HTTP request.
    SendingRequest,

    /// Waiting for the server response (TTFB).
    WaitingForResponse,

    /// Reading the response body.
    ReadingResponse,
}

/// Out-of-band answer to "what is this request doing right now".
///
/// Variants are declared in happens-after order, so for a single request a
/// later answer never compares lower than an earlier one. `Invalid` is
/// reported before `start()` and after the terminal callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RequestStatus {
    Invalid,
    Idle,
    WaitingForStalledSocketPool,
    WaitingForAvailableSocket,
    WaitingForDelegate,
    WaitingForCache,
    DownloadingPacFile,
    ResolvingProxyForUrl,
    ResolvingHostInPacFile,
    EstablishingProxyTunnel,
    ResolvingHost,
    Connecting,
    SslHandshake,
    SendingRequest,
    WaitingForResponse,
    ReadingResponse,
}

impl RequestStatus {
    /// The socket-level waiting states collapsed into one, as the Java
    /// `WAITING_FOR_STREAM` convenience bucket.
    pub fn is_waiting_for_stream(self) -> bool {
        matches!(
            self,
            RequestStatus::WaitingForStalledSocketPool
                | RequestStatus::WaitingForAvailableSocket
                | RequestStatus::WaitingForDelegate
                | RequestStatus::WaitingForCache
        )
    }
}

impl From<LoadState> for RequestStatus {
    fn from(state: LoadState) -> Self {
        match state {
            LoadState::Idle => RequestStatus::Idle,
            LoadState::WaitingForStalledSocketPool => RequestStatus::WaitingForStalledSocketPool,
            LoadState::WaitingForAvailableSocket => RequestStatus::WaitingForAvailableSocket,
            LoadState::WaitingForDelegate => RequestStatus::WaitingForDelegate,
            LoadState::WaitingForCache => RequestStatus::WaitingForCache,
            LoadState::DownloadingPacFile => RequestStatus::DownloadingPacFile,
            LoadState::ResolvingProxyForUrl => RequestStatus::ResolvingProxyForUrl,
            LoadState::ResolvingHostInPacFile => RequestStatus::ResolvingHostInPacFile,
            LoadState::EstablishingProxyTunnel => RequestStatus::EstablishingProxyTunnel,
            LoadState::ResolvingHost => RequestStatus::ResolvingHost,
            LoadState::Connecting => RequestStatus::Connecting,
            LoadState::SslHandshake => RequestStatus::SslHandshake,
            LoadState::SendingRequest => RequestStatus::SendingRequest,
            LoadState::WaitingForResponse => RequestStatus::WaitingForResponse,
            LoadState::ReadingResponse => RequestStatus::ReadingResponse,
        }
    }
}
