//! Stream lifecycle.

use super::flow::{Replenish, Window};
use super::hpack::HeaderField;
use crate::base::neterror::NetError;
use bytes::Bytes;
use tokio::sync::mpsc;

/// Client-side view of a stream's state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Idle,
    Open,
    /// We sent END_STREAM.
    HalfClosedLocal,
    /// The peer sent END_STREAM.
    HalfClosedRemote,
    Closed,
}

impl StreamState {
    /// HEADERS went out; `end_stream` if the request has no body.
    pub fn open(self, end_stream: bool) -> Self {
        match (self, end_stream) {
            (StreamState::Idle, false) => StreamState::Open,
            (StreamState::Idle, true) => StreamState::HalfClosedLocal,
            (other, _) => other,
        }
    }

    pub fn close_local(self) -> Self {
        match self {
            StreamState::Idle | StreamState::Open => StreamState::HalfClosedLocal,
            StreamState::HalfClosedRemote | StreamState::Closed => StreamState::Closed,
            StreamState::HalfClosedLocal => StreamState::HalfClosedLocal,
        }
    }

    pub fn close_remote(self) -> Self {
        match self {
            StreamState::Idle | StreamState::Open => StreamState::HalfClosedRemote,
            StreamState::HalfClosedLocal | StreamState::Closed => StreamState::Closed,
            StreamState::HalfClosedRemote => StreamState::HalfClosedRemote,
        }
    }

    pub fn can_send(self) -> bool {
        matches!(self, StreamState::Open | StreamState::HalfClosedRemote)
    }

    pub fn can_receive(self) -> bool {
        matches!(self, StreamState::Open | StreamState::HalfClosedLocal)
    }
}

/// What the reader task forwards to the owner of a stream.
#[derive(Debug)]
pub(crate) enum StreamEvent {
    Headers { fields: Vec<HeaderField>, end_stream: bool },
    Data { chunk: Bytes, end_stream: bool },
    Failed(NetError),
}

/// Per-stream entry in the session registry.
pub(crate) struct StreamEntry {
    pub state: StreamState,
    pub send_window: Window,
    pub recv_window: Window,
    pub replenish: Replenish,
    pub events: mpsc::UnboundedSender<StreamEvent>,
}

impl StreamEntry {
    pub fn new(
        send_window: u32,
        recv_window: u32,
        events: mpsc::UnboundedSender<StreamEvent>,
    ) -> Self {
        Self {
            state: StreamState::Idle,
            send_window: Window::new(send_window),
            recv_window: Window::new(recv_window),
            replenish: Replenish::new(recv_window),
            events,
        }
    }

    pub fn emit(&self, event: StreamEvent) {
        // the owner may already be gone; its drop resets the stream
        let _ = self.events.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_without_body() {
        let s = StreamState::Idle.open(true);
        assert_eq!(s, StreamState::HalfClosedLocal);
        assert!(s.can_receive());
        assert!(!s.can_send());
        assert_eq!(s.close_remote(), StreamState::Closed);
    }

    #[test]
    fn test_response_before_request_body_finishes() {
        let s = StreamState::Idle.open(false).close_remote();
        assert_eq!(s, StreamState::HalfClosedRemote);
        assert!(s.can_send());
        assert_eq!(s.close_local(), StreamState::Closed);
    }
}
