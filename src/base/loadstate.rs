/// Where a network transaction is, as reported in logs.
///
/// A subset of Chromium's `net/base/load_states.h`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoadState {
    #[default]
    Idle,
    /// Reusing or opening a connection: DNS, TCP, tunnel and TLS.
    Connecting,
    SendingRequest,
    /// Request written, no response head yet.
    WaitingForResponse,
}

impl LoadState {
    pub fn as_str(self) -> &'static str {
        match self {
            LoadState::Idle => "idle",
            LoadState::Connecting => "connecting",
            LoadState::SendingRequest => "sending_request",
            LoadState::WaitingForResponse => "waiting_for_response",
        }
    }
}
