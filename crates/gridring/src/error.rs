//! Discovery error types

use crate::node::NodeId;
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

/// Result type for discovery operations
pub type Result<T> = std::result::Result<T, DiscoveryError>;

/// Discovery errors
#[derive(Debug, Error)]
pub enum DiscoveryError {
    // ==================== Configuration Errors ====================
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("invalid address: {0}")]
    InvalidAddress(String),

    // ==================== Admission Errors ====================
    #[error("duplicate node identity: {node_id} is already a ring member")]
    DuplicateIdentity { node_id: NodeId },

    #[error("join timed out after {0:?}")]
    JoinTimeout(Duration),

    #[error("local node has not joined the ring")]
    NotJoined,

    // ==================== Membership Errors ====================
    #[error("node unreachable: {addr}")]
    NodeUnreachable { addr: SocketAddr },

    #[error("unexpected peer at {addr}: expected {expected}, found {found}")]
    UnexpectedPeer {
        addr: SocketAddr,
        expected: NodeId,
        found: NodeId,
    },

    // ==================== Protocol Errors ====================
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("unsupported protocol version {version} (supported {min}..={max})")]
    UnsupportedVersion { version: u16, min: u16, max: u16 },

    #[error("message too large: {size} bytes (max {max})")]
    MessageTooLarge { size: usize, max: usize },

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("deserialization error: {0}")]
    Deserialization(String),

    // ==================== Network Errors ====================
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("connection closed")]
    ConnectionClosed,

    #[error("request timeout")]
    Timeout,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    // ==================== Collaborator Errors ====================
    #[error("address registry error: {0}")]
    Registry(String),

    #[error("metrics store error: {0}")]
    MetricsStore(String),

    // ==================== Internal Errors ====================
    #[error("channel closed")]
    ChannelClosed,

    #[error("shutdown in progress")]
    ShuttingDown,
}

impl DiscoveryError {
    /// Check if this error is retriable
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            DiscoveryError::NodeUnreachable { .. }
                | DiscoveryError::Timeout
                | DiscoveryError::ConnectionFailed(_)
                | DiscoveryError::ConnectionClosed
                | DiscoveryError::Registry(_)
        )
    }

    /// Check if this error came from talking to a peer.
    ///
    /// Connectivity errors are handled by reconnect-then-repair and are never
    /// surfaced to callers of the upward API.
    pub fn is_connectivity(&self) -> bool {
        matches!(
            self,
            DiscoveryError::NodeUnreachable { .. }
                | DiscoveryError::UnexpectedPeer { .. }
                | DiscoveryError::Timeout
                | DiscoveryError::ConnectionFailed(_)
                | DiscoveryError::ConnectionClosed
                | DiscoveryError::Io(_)
        )
    }

    /// Check if this is a fatal error: the process must not continue as a member
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            DiscoveryError::DuplicateIdentity { .. } | DiscoveryError::JoinTimeout(_)
        )
    }
}

// Conversion from channel errors
impl<T> From<tokio::sync::mpsc::error::SendError<T>> for DiscoveryError {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        DiscoveryError::ChannelClosed
    }
}

impl From<tokio::sync::oneshot::error::RecvError> for DiscoveryError {
    fn from(_: tokio::sync::oneshot::error::RecvError) -> Self {
        DiscoveryError::ChannelClosed
    }
}

impl From<tokio::time::error::Elapsed> for DiscoveryError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        DiscoveryError::Timeout
    }
}

// Conversion from postcard for serialization
impl From<postcard::Error> for DiscoveryError {
    fn from(e: postcard::Error) -> Self {
        DiscoveryError::Serialization(e.to_string())
    }
}
