//! Wire protocol shared by the Foreman gateway and its workers.
//!
//! Every message on the socket is a JSON envelope with four fields: a unique
//! message id, a kind tag from a closed enumeration, an opaque payload
//! validated against the schema for that kind, and a wall-clock timestamp in
//! milliseconds. This crate owns:
//!
//! - [`Frame`]: envelope serialization and parsing
//! - [`Message`]: the typed payload union, one variant per kind
//! - [`MessageKind`]: the closed kind enumeration
//! - [`close`]: the socket close codes both sides agree on
//!
//! Parsing is strict per kind: a payload that fails its schema yields
//! [`ProtocolError::Malformed`] carrying the kind and reason. An unknown kind
//! yields [`ProtocolError::UnknownKind`]; receivers report it and keep the
//! connection open.

pub mod close;
pub mod error;
pub mod frame;
pub mod message;

pub use error::ProtocolError;
pub use frame::{Frame, Inbound};
pub use message::{
    AgentStatus, Attachment, AuthRequest, AuthResponse, ChatContext, HeartbeatPing, HeartbeatPong,
    Message, MessageKind, ProgressKind, SystemRestart, TaskAck, TaskCancel, TaskCancelled,
    TaskComplete, TaskError, TaskProgress, TaskStream, TaskSubmit,
};
