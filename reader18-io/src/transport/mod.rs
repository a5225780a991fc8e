//! Transport abstraction between the inventory engine and a reader link.

mod mock;
mod tcp;

pub use mock::MockLink;
pub use tcp::TcpLink;

use crate::error::{Error, Result};
use crate::types::Endpoint;
use crossbeam_channel::Receiver;
use std::time::{Duration, SystemTime};

/// Raw bytes received from the reader.
#[derive(Debug, Clone)]
pub struct Packet {
    pub when: SystemTime,
    pub data: Vec<u8>,
}

/// A connected reader byte link.
///
/// Implementations own the read pump; received byte bursts and unrecoverable
/// read errors surface through bounded channels. Channels drop on full: the
/// framing layer reassembles from subsequent bytes, so a prompt consumer is
/// required for correctness but a slow one cannot block the pump.
pub trait ReaderLink: Send + Sync {
    /// Writes raw bytes with a deadline. A failed write does not close the
    /// link; the next read surfaces the broken connection.
    fn send_raw(&self, data: &[u8], timeout: Duration) -> Result<()>;

    /// Receiver for inbound byte bursts, `None` when not connected.
    fn packets(&self) -> Option<Receiver<Packet>>;

    /// Receiver for pump errors, `None` when not connected.
    fn errors(&self) -> Option<Receiver<Error>>;

    fn is_connected(&self) -> bool;

    fn endpoint(&self) -> Option<Endpoint>;
}
