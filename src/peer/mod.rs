//! Peer connection management

mod connection;

pub use connection::{ConnectionEvent, ConnectionEventKind, ConnectionManager, PeerState};
