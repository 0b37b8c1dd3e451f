//! Handle to a live worker socket.
//!
//! The gateway owns the socket itself; everything else (registry, offline
//! queue, command service) talks to the connection through this handle,
//! which feeds the per-connection writer task. The handle carries an
//! identity token so close callbacks racing a replacement can be told apart
//! from the live connection.

use foreman_protocol::Frame;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Messages consumed by the per-connection writer task.
#[derive(Debug, Clone)]
pub enum Outbound {
    /// An encoded wire frame.
    Text(String),
    /// Close the socket with the given code and reason.
    Close { code: u16, reason: String },
}

/// Cloneable sending side of one worker connection.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    identity: Uuid,
    sender: mpsc::UnboundedSender<Outbound>,
}

impl ConnectionHandle {
    /// Create a handle and the receiver its writer task will drain.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Outbound>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (
            Self {
                identity: Uuid::new_v4(),
                sender,
            },
            receiver,
        )
    }

    /// Identity token distinguishing this connection from a replacement
    /// under the same agent id.
    pub fn identity(&self) -> Uuid {
        self.identity
    }

    /// Whether the writer task is still draining this handle.
    pub fn is_open(&self) -> bool {
        !self.sender.is_closed()
    }

    /// Queue a frame; returns false if the connection is gone or the frame
    /// does not encode.
    pub fn send_frame(&self, frame: &Frame) -> bool {
        match frame.encode() {
            Ok(text) => self.sender.send(Outbound::Text(text)).is_ok(),
            Err(err) => {
                tracing::error!(error = %err, "dropping unencodable frame");
                false
            }
        }
    }

    /// Queue a close; the writer task sends it and shuts the socket.
    pub fn close(&self, code: u16, reason: &str) {
        let _ = self.sender.send(Outbound::Close {
            code,
            reason: reason.to_string(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use foreman_protocol::{HeartbeatPing, Message};

    #[test]
    fn test_send_after_receiver_drop_reports_closed() {
        let (handle, receiver) = ConnectionHandle::new();
        assert!(handle.is_open());
        drop(receiver);
        assert!(!handle.is_open());
        let frame = Frame::new(&Message::HeartbeatPing(HeartbeatPing { server_time: 0 })).unwrap();
        assert!(!handle.send_frame(&frame));
    }

    #[test]
    fn test_identities_differ_across_connections() {
        let (a, _ra) = ConnectionHandle::new();
        let (b, _rb) = ConnectionHandle::new();
        assert_ne!(a.identity(), b.identity());
    }
}
