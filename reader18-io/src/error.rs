//! Error types for reader18-io
//!
//! Codec errors (`InvalidPacket`, `Checksum`) are recoverable: the stream
//! parser resynchronizes byte-wise and the inventory engine keeps running.
//! Link errors (`Io`, `LinkClosed`) end the read pump; reconnecting is the
//! caller's decision.

use thiserror::Error;

/// Errors that can occur in reader18-io
#[derive(Error, Debug)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid packet: {0}")]
    InvalidPacket(String),

    #[error("CRC mismatch: expected 0x{expected:04X}, got 0x{actual:04X}")]
    Checksum { expected: u16, actual: u16 },

    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("not connected")]
    NotConnected,

    #[error("already connected")]
    AlreadyConnected,

    #[error("inventory already running")]
    InventoryRunning,

    #[error("link closed: {0}")]
    LinkClosed(String),
}

pub type Result<T> = std::result::Result<T, Error>;
