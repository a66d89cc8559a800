use std::io::{Read, Write};
use std::net;
use std::sync::Arc;
use std::time;

use crate::clock;

const SOCKET_POLLING_KEY: usize = 0;

// Upper bound on how long a frame write may stall on a congested peer
// before the connection is declared dead.
const WRITE_STALL_TIMEOUT_MS: u64 = 10_000;

/// The listening socket. Non-blocking; `accept` either returns a ready
/// connection or nothing.
pub struct ServerSocket {
    listener: net::TcpListener,
}

impl ServerSocket {
    pub fn bind(address: &str, port: u16) -> std::io::Result<Self> {
        let listener = net::TcpListener::bind((address, port))?;
        listener.set_nonblocking(true)?;

        Ok(Self { listener })
    }

    /// Accepts one pending connection, if any. The accepted stream is
    /// switched to non-blocking before it is returned.
    pub fn accept(&self) -> Option<Transport> {
        match self.listener.accept() {
            Ok((stream, peer_addr)) => {
                if stream.set_nonblocking(true).is_err() {
                    return None;
                }
                let _ = stream.set_nodelay(true);

                Some(Transport { stream, peer_addr })
            }
            Err(_) => None,
        }
    }

    pub fn local_addr(&self) -> std::io::Result<net::SocketAddr> {
        self.listener.local_addr()
    }
}

/// A connected peer socket with the read/write contract the connection
/// state machine consumes: `read` returns `Ok(0)` when no data is
/// pending, the byte count otherwise, and an error on transport failure
/// (an orderly remote close included). `write` transmits the whole
/// frame or fails.
pub struct Transport {
    stream: net::TcpStream,
    peer_addr: net::SocketAddr,
}

impl Transport {
    pub fn read(&self, buffer: &mut [u8]) -> std::io::Result<usize> {
        match (&self.stream).read(buffer) {
            Ok(0) => Err(std::io::ErrorKind::UnexpectedEof.into()),
            Ok(n) => Ok(n),
            Err(err) => match err.kind() {
                std::io::ErrorKind::WouldBlock => Ok(0),
                _ => Err(err),
            },
        }
    }

    pub fn write(&self, frame_bytes: &[u8]) -> std::io::Result<()> {
        let mut written = 0;
        let deadline = clock::now_ms() + WRITE_STALL_TIMEOUT_MS;

        while written < frame_bytes.len() {
            match (&self.stream).write(&frame_bytes[written..]) {
                Ok(n) => written += n,
                Err(err) => match err.kind() {
                    std::io::ErrorKind::WouldBlock => {
                        if clock::now_ms() > deadline {
                            return Err(std::io::ErrorKind::TimedOut.into());
                        }
                        std::thread::yield_now();
                    }
                    _ => return Err(err),
                },
            }
        }

        Ok(())
    }

    pub fn peer_addr(&self) -> net::SocketAddr {
        self.peer_addr
    }

    pub fn peer_ip(&self) -> net::IpAddr {
        self.peer_addr.ip()
    }

    pub(crate) fn stream(&self) -> &net::TcpStream {
        &self.stream
    }
}

/// Bounded readable-wait on one transport. Owned by whichever driver
/// (worker thread or threadless tick) runs the connection.
pub struct SocketWaiter {
    transport: Arc<Transport>,
    poller: polling::Poller,
    poller_events: polling::Events,
}

impl SocketWaiter {
    pub fn new(transport: Arc<Transport>) -> std::io::Result<Self> {
        let poller = polling::Poller::new()?;

        unsafe {
            poller.add(
                transport.stream(),
                polling::Event::readable(SOCKET_POLLING_KEY),
            )?;
        }

        Ok(Self {
            transport,
            poller,
            poller_events: polling::Events::new(),
        })
    }

    /// Waits up to `timeout` for the socket to become readable. Returns
    /// false on timeout or spurious wakeup.
    pub fn wait_readable(&mut self, timeout: time::Duration) -> bool {
        // Re-arm before every wait() call.
        if self
            .poller
            .modify(
                self.transport.stream(),
                polling::Event::readable(SOCKET_POLLING_KEY),
            )
            .is_err()
        {
            return false;
        }

        self.poller_events.clear();

        match self.poller.wait(&mut self.poller_events, Some(timeout)) {
            Ok(n) => n > 0,
            Err(_) => false,
        }
    }
}

impl Drop for SocketWaiter {
    fn drop(&mut self) {
        let _ = self.poller.delete(self.transport.stream());
    }
}
