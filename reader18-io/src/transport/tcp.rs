//! TCP reader session with a dedicated read pump thread.

use super::{Packet, ReaderLink};
use crate::error::{Error, Result};
use crate::types::Endpoint;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError};
use parking_lot::Mutex;
use std::io::Read;
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, SystemTime};

const PACKET_CHANNEL_CAPACITY: usize = 256;
const ERROR_CHANNEL_CAPACITY: usize = 32;
const READ_CHUNK: usize = 4096;
/// How long `disconnect` waits for the pump to observe the closed socket.
const PUMP_EXIT_WAIT: Duration = Duration::from_millis(1200);

struct Session {
    generation: u64,
    endpoint: Endpoint,
    stream: Arc<TcpStream>,
    packets: Receiver<Packet>,
    errors: Receiver<Error>,
    done: Receiver<()>,
}

/// One TCP connection to a reader. Exactly one pump thread per connection;
/// a second `connect` while a session is live fails.
pub struct TcpLink {
    inner: Arc<Mutex<Option<Session>>>,
    generation: Mutex<u64>,
}

impl Default for TcpLink {
    fn default() -> Self {
        Self::new()
    }
}

impl TcpLink {
    pub fn new() -> Self {
        TcpLink {
            inner: Arc::new(Mutex::new(None)),
            generation: Mutex::new(0),
        }
    }

    /// Dials the endpoint and starts the read pump.
    pub fn connect(&self, endpoint: Endpoint, timeout: Duration) -> Result<()> {
        if endpoint.host.is_empty() || endpoint.port == 0 {
            return Err(Error::InvalidEndpoint(endpoint.address()));
        }
        if self.inner.lock().is_some() {
            return Err(Error::AlreadyConnected);
        }

        let addr = endpoint
            .address()
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| Error::InvalidEndpoint(endpoint.address()))?;
        let stream = Arc::new(TcpStream::connect_timeout(&addr, timeout)?);

        let (packets_tx, packets_rx) = bounded(PACKET_CHANNEL_CAPACITY);
        let (errors_tx, errors_rx) = bounded(ERROR_CHANNEL_CAPACITY);
        let (done_tx, done_rx) = bounded::<()>(1);

        let generation = {
            let mut counter = self.generation.lock();
            *counter += 1;
            *counter
        };

        {
            let mut inner = self.inner.lock();
            if inner.is_some() {
                let _ = stream.shutdown(Shutdown::Both);
                return Err(Error::AlreadyConnected);
            }
            *inner = Some(Session {
                generation,
                endpoint: endpoint.clone(),
                stream: Arc::clone(&stream),
                packets: packets_rx,
                errors: errors_rx,
                done: done_rx,
            });
        }

        let inner = Arc::clone(&self.inner);
        thread::Builder::new()
            .name("reader18-pump".to_string())
            .spawn(move || {
                // done_tx is dropped on exit; receivers observe the close.
                let _done = done_tx;
                let mut buf = [0u8; READ_CHUNK];
                loop {
                    match (&*stream).read(&mut buf) {
                        Ok(0) => {
                            let _ = errors_tx.try_send(Error::LinkClosed(
                                "connection closed by peer".to_string(),
                            ));
                            break;
                        }
                        Ok(n) => {
                            let packet = Packet {
                                when: SystemTime::now(),
                                data: buf[..n].to_vec(),
                            };
                            // Drop on full; the consumer must keep up.
                            let _ = packets_tx.try_send(packet);
                        }
                        Err(err) => {
                            let _ = errors_tx.try_send(Error::Io(err));
                            break;
                        }
                    }
                }

                let mut slot = inner.lock();
                if slot.as_ref().is_some_and(|s| s.generation == generation) {
                    *slot = None;
                }
            })?;

        Ok(())
    }

    /// Closes the socket and waits briefly for the pump to exit.
    pub fn disconnect(&self) -> Result<()> {
        let (stream, done) = {
            let inner = self.inner.lock();
            match inner.as_ref() {
                Some(s) => (Arc::clone(&s.stream), s.done.clone()),
                None => return Ok(()),
            }
        };

        let _ = stream.shutdown(Shutdown::Both);
        match done.recv_timeout(PUMP_EXIT_WAIT) {
            Ok(_) | Err(RecvTimeoutError::Disconnected) => {}
            Err(RecvTimeoutError::Timeout) => {
                log::warn!("read pump did not exit within {:?}", PUMP_EXIT_WAIT);
            }
        }

        *self.inner.lock() = None;
        Ok(())
    }
}

impl ReaderLink for TcpLink {
    fn send_raw(&self, data: &[u8], timeout: Duration) -> Result<()> {
        if data.is_empty() {
            return Err(Error::InvalidPacket("empty payload".into()));
        }
        let stream = {
            let inner = self.inner.lock();
            match inner.as_ref() {
                Some(s) => Arc::clone(&s.stream),
                None => return Err(Error::NotConnected),
            }
        };

        stream.set_write_timeout(Some(timeout))?;
        use std::io::Write;
        (&*stream).write_all(data)?;
        Ok(())
    }

    fn packets(&self) -> Option<Receiver<Packet>> {
        self.inner.lock().as_ref().map(|s| s.packets.clone())
    }

    fn errors(&self) -> Option<Receiver<Error>> {
        self.inner.lock().as_ref().map(|s| s.errors.clone())
    }

    fn is_connected(&self) -> bool {
        self.inner.lock().is_some()
    }

    fn endpoint(&self) -> Option<Endpoint> {
        self.inner.lock().as_ref().map(|s| s.endpoint.clone())
    }
}

impl Drop for TcpLink {
    fn drop(&mut self) {
        let _ = self.disconnect();
    }
}
