//! In-memory link for testing engine logic without a reader.

use super::{Packet, ReaderLink};
use crate::error::{Error, Result};
use crate::types::Endpoint;
use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, SystemTime};

/// Mock reader link: injected bytes become packets, writes are captured.
pub struct MockLink {
    packets_tx: Mutex<Option<Sender<Packet>>>,
    packets_rx: Receiver<Packet>,
    errors_tx: Mutex<Option<Sender<Error>>>,
    errors_rx: Receiver<Error>,
    written: Mutex<Vec<Vec<u8>>>,
    connected: AtomicBool,
}

impl Default for MockLink {
    fn default() -> Self {
        Self::new()
    }
}

impl MockLink {
    pub fn new() -> Self {
        let (packets_tx, packets_rx) = bounded(256);
        let (errors_tx, errors_rx) = bounded(32);
        MockLink {
            packets_tx: Mutex::new(Some(packets_tx)),
            packets_rx,
            errors_tx: Mutex::new(Some(errors_tx)),
            errors_rx,
            written: Mutex::new(Vec::new()),
            connected: AtomicBool::new(true),
        }
    }

    /// Injects a byte burst as if the pump had read it.
    pub fn inject(&self, data: &[u8]) {
        if let Some(tx) = self.packets_tx.lock().as_ref() {
            let _ = tx.try_send(Packet {
                when: SystemTime::now(),
                data: data.to_vec(),
            });
        }
    }

    /// Injects a pump error.
    pub fn inject_error(&self, err: Error) {
        if let Some(tx) = self.errors_tx.lock().as_ref() {
            let _ = tx.try_send(err);
        }
    }

    /// Simulates the pump exiting: channels close, the link reads as down.
    pub fn close(&self) {
        self.connected.store(false, Ordering::SeqCst);
        self.packets_tx.lock().take();
        self.errors_tx.lock().take();
    }

    /// Everything written through the link, in order.
    pub fn written(&self) -> Vec<Vec<u8>> {
        self.written.lock().clone()
    }
}

impl ReaderLink for MockLink {
    fn send_raw(&self, data: &[u8], _timeout: Duration) -> Result<()> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(Error::NotConnected);
        }
        self.written.lock().push(data.to_vec());
        Ok(())
    }

    fn packets(&self) -> Option<Receiver<Packet>> {
        Some(self.packets_rx.clone())
    }

    fn errors(&self) -> Option<Receiver<Error>> {
        Some(self.errors_rx.clone())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn endpoint(&self) -> Option<Endpoint> {
        Some(Endpoint::new("mock", 1))
    }
}
