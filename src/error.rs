//! Error types for packetlink operations
//!
//! This module defines all error types that can occur while framing
//! packets, moving them through the session queues, and driving a
//! transport.

use thiserror::Error;

/// packetlink error types
///
/// All fallible operations in this library return `Result<T, LinkError>`
/// to provide explicit error handling.
#[derive(Error, Debug)]
pub enum LinkError {
    /// Decoding ran past the end of the received buffer
    ///
    /// This error occurs when:
    /// - A packet was truncated in transit
    /// - A type-specific decoder disagrees with the sender about the layout
    /// - A length prefix declares more bytes than the payload carries
    ///
    /// # Example
    /// ```no_run
    /// # use packetlink::error::LinkError;
    /// let err = LinkError::TruncatedPacket { needed: 4, available: 1 };
    /// ```
    #[error("Truncated packet: needed {needed} bytes, {available} available")]
    TruncatedPacket {
        /// Bytes the decoder needed to make progress
        needed: usize,
        /// Bytes left in the buffer
        available: usize,
    },

    /// Encoding ran past the end of the fixed outgoing buffer
    ///
    /// This error occurs when:
    /// - A payload serializes to more than the configured buffer size
    /// - A string field is longer than the space left behind the cursor
    ///
    /// Raise `buffer_size` in the session configuration or shrink the
    /// payload.
    #[error("Buffer overflow: needed {needed} bytes, {available} available")]
    BufferOverflow {
        /// Bytes the encoder needed to make progress
        needed: usize,
        /// Bytes left in the buffer
        available: usize,
    },

    /// Payload exceeds a hard size limit
    ///
    /// Unlike the silent oversized-drop on the send/receive paths, this
    /// is returned where a caller hands the library a payload that can
    /// never fit (for example a datagram above the UDP maximum).
    #[error("Payload too large: {size} bytes (max: {max})")]
    PayloadTooLarge {
        /// Actual payload size in bytes
        size: usize,
        /// Maximum allowed size in bytes
        max: usize,
    },

    /// The transport refused or could not establish the connection
    ///
    /// This error occurs when:
    /// - The server is full (`max_clients` peers already connected)
    /// - Nothing is listening at the configured address
    #[error("Connection refused: {0}")]
    ConnectionRefused(String),

    /// Operation requires an established connection
    #[error("Not connected")]
    NotConnected,

    /// The configured host or bind address could not be parsed
    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    /// I/O error from the underlying socket
    ///
    /// Wraps standard library I/O errors: bind failures, send/receive
    /// failures, timeouts surfaced by the socket layer.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// UTF-8 conversion error while decoding a string field
    ///
    /// String fields on the wire are UTF-8; this indicates the sender
    /// is not following the framing contract.
    #[error("UTF-8 conversion error: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),
}

/// Result type alias for packetlink operations
pub type Result<T> = std::result::Result<T, LinkError>;
