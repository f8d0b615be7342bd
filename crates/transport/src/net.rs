//! Big-endian primitives over one TCP connection, plus the listen/connect
//! helpers that produce them.

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use crossbeam_channel::{Receiver, unbounded};
use socket2::{Domain, Socket, Type};
use tracing::{debug, warn};

use crate::TransportError;

/// One established connection.
///
/// All methods take `&self`: reads and writes go through the stream's
/// shared-reference I/O impls, so a reader thread and a writer thread can
/// drive the same `Net` without coordination. `close` is idempotent and
/// makes every subsequent operation fail.
#[derive(Debug)]
pub struct Net {
    stream: TcpStream,
    closed: AtomicBool,
}

impl Net {
    pub(crate) fn new(stream: TcpStream) -> Self {
        Self {
            stream,
            closed: AtomicBool::new(false),
        }
    }

    fn check_open(&self) -> Result<(), TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        Ok(())
    }

    /// Writes the whole buffer.
    pub fn write_all(&self, data: &[u8]) -> Result<(), TransportError> {
        self.check_open()?;
        (&self.stream).write_all(data)?;
        Ok(())
    }

    /// Writes one byte.
    pub fn write_u8(&self, v: u8) -> Result<(), TransportError> {
        self.write_all(&[v])
    }

    /// Writes a big-endian `u16`.
    pub fn write_u16(&self, v: u16) -> Result<(), TransportError> {
        self.write_all(&v.to_be_bytes())
    }

    /// Writes a big-endian `u32`.
    pub fn write_u32(&self, v: u32) -> Result<(), TransportError> {
        self.write_all(&v.to_be_bytes())
    }

    /// Writes a big-endian `u64`.
    pub fn write_u64(&self, v: u64) -> Result<(), TransportError> {
        self.write_all(&v.to_be_bytes())
    }

    /// Reads whatever is available, returning the byte count (0 at EOF).
    pub fn read(&self, buf: &mut [u8]) -> Result<usize, TransportError> {
        self.check_open()?;
        Ok((&self.stream).read(buf)?)
    }

    /// Reads until `buf` is full, retrying short reads; EOF mid-fill fails.
    pub fn read_exact_buf(&self, buf: &mut [u8]) -> Result<(), TransportError> {
        self.check_open()?;
        (&self.stream).read_exact(buf)?;
        Ok(())
    }

    /// Reads one byte.
    pub fn read_u8(&self) -> Result<u8, TransportError> {
        let mut b = [0u8; 1];
        self.read_exact_buf(&mut b)?;
        Ok(b[0])
    }

    /// Reads a big-endian `u16`.
    pub fn read_u16(&self) -> Result<u16, TransportError> {
        let mut b = [0u8; 2];
        self.read_exact_buf(&mut b)?;
        Ok(u16::from_be_bytes(b))
    }

    /// Reads a big-endian `u32`.
    pub fn read_u32(&self) -> Result<u32, TransportError> {
        let mut b = [0u8; 4];
        self.read_exact_buf(&mut b)?;
        Ok(u32::from_be_bytes(b))
    }

    /// Reads a big-endian `u64`.
    pub fn read_u64(&self) -> Result<u64, TransportError> {
        let mut b = [0u8; 8];
        self.read_exact_buf(&mut b)?;
        Ok(u64::from_be_bytes(b))
    }

    /// Shuts the connection down in both directions. Safe to call more than
    /// once; blocked reads on other threads return an error.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            let _ = self.stream.shutdown(std::net::Shutdown::Both);
        }
    }

    /// True once `close` has run.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Address of the remote end, when still known.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.stream.peer_addr().ok()
    }
}

/// Listening side: binds every address `host` resolves to.
///
/// IPv4 and IPv6 candidates each get their own listener (v6 sockets are
/// pinned to v6-only so the two can coexist), all with address reuse so a
/// restarted server can rebind immediately.
pub struct NetAcceptor {
    incoming: Receiver<std::io::Result<TcpStream>>,
    addrs: Vec<SocketAddr>,
}

impl NetAcceptor {
    /// Resolves `host:port` and starts listening on every candidate.
    pub fn bind(host: &str, port: u16) -> Result<Self, TransportError> {
        let candidates: Vec<SocketAddr> = (host, port)
            .to_socket_addrs()
            .map_err(|_| TransportError::Resolve {
                host: host.to_owned(),
                port,
            })?
            .collect();
        if candidates.is_empty() {
            return Err(TransportError::Resolve {
                host: host.to_owned(),
                port,
            });
        }

        let (tx, rx) = unbounded();
        let mut addrs = Vec::new();
        for addr in candidates {
            let domain = Domain::for_address(addr);
            let socket = Socket::new(domain, Type::STREAM, None)?;
            socket.set_reuse_address(true)?;
            if addr.is_ipv6() {
                socket.set_only_v6(true)?;
            }
            socket.bind(&addr.into())?;
            socket.listen(128)?;
            let listener: TcpListener = socket.into();
            addrs.push(listener.local_addr()?);
            debug!(%addr, "listening");

            let tx = tx.clone();
            thread::Builder::new()
                .name(format!("accept-{addr}"))
                .spawn(move || {
                    loop {
                        match listener.accept() {
                            Ok((stream, peer)) => {
                                debug!(%peer, "accepted connection");
                                if tx.send(Ok(stream)).is_err() {
                                    return;
                                }
                            }
                            Err(e) => {
                                warn!(error = %e, "accept failed");
                                let _ = tx.send(Err(e));
                                return;
                            }
                        }
                    }
                })
                .expect("spawn accept thread");
        }

        Ok(Self { incoming: rx, addrs })
    }

    /// Blocks until the next connection arrives on any listener.
    pub fn accept(&self) -> Result<Net, TransportError> {
        match self.incoming.recv() {
            Ok(Ok(stream)) => Ok(Net::new(stream)),
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(TransportError::Closed),
        }
    }

    /// The bound local addresses, in bind order.
    pub fn local_addrs(&self) -> &[SocketAddr] {
        &self.addrs
    }
}

/// Connecting side: resolves at connect time and walks the candidates.
#[derive(Debug, Clone)]
pub struct NetConnector {
    host: String,
    port: u16,
}

impl NetConnector {
    /// Remembers the target; resolution happens per `connect` call.
    #[must_use]
    pub fn new(host: &str, port: u16) -> Self {
        Self {
            host: host.to_owned(),
            port,
        }
    }

    /// Tries every resolved address in order, returning the first success.
    pub fn connect(&self) -> Result<Net, TransportError> {
        let candidates =
            (self.host.as_str(), self.port)
                .to_socket_addrs()
                .map_err(|_| TransportError::Resolve {
                    host: self.host.clone(),
                    port: self.port,
                })?;

        let mut last = None;
        for addr in candidates {
            match TcpStream::connect(addr) {
                Ok(stream) => {
                    debug!(%addr, "connected");
                    return Ok(Net::new(stream));
                }
                Err(e) => {
                    debug!(%addr, error = %e, "connect candidate failed");
                    last = Some(e);
                }
            }
        }
        Err(match last {
            Some(last) => TransportError::Connect {
                host: self.host.clone(),
                port: self.port,
                last,
            },
            None => TransportError::Resolve {
                host: self.host.clone(),
                port: self.port,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn pair() -> (Net, Net) {
        let acceptor = NetAcceptor::bind("127.0.0.1", 0).unwrap();
        let port = acceptor.local_addrs()[0].port();
        let client = NetConnector::new("127.0.0.1", port).connect().unwrap();
        let server = acceptor.accept().unwrap();
        (client, server)
    }

    #[test]
    fn primitives_round_trip_big_endian() {
        let (a, b) = pair();
        a.write_u8(7).unwrap();
        a.write_u16(0xBEEF).unwrap();
        a.write_u32(0xDEAD_BEEF).unwrap();
        a.write_u64(u64::MAX - 1).unwrap();
        a.write_all(b"tail").unwrap();

        assert_eq!(b.read_u8().unwrap(), 7);
        assert_eq!(b.read_u16().unwrap(), 0xBEEF);
        assert_eq!(b.read_u32().unwrap(), 0xDEAD_BEEF);
        assert_eq!(b.read_u64().unwrap(), u64::MAX - 1);
        let mut tail = [0u8; 4];
        b.read_exact_buf(&mut tail).unwrap();
        assert_eq!(&tail, b"tail");
    }

    #[test]
    fn read_exact_spans_partial_writes() {
        let (a, b) = pair();
        let writer = thread::spawn(move || {
            a.write_all(&[1, 2, 3]).unwrap();
            thread::sleep(Duration::from_millis(30));
            a.write_all(&[4, 5, 6, 7]).unwrap();
            a
        });
        let mut buf = [0u8; 7];
        b.read_exact_buf(&mut buf).unwrap();
        assert_eq!(buf, [1, 2, 3, 4, 5, 6, 7]);
        writer.join().unwrap();
    }

    #[test]
    fn close_is_idempotent_and_fails_later_writes() {
        let (a, _b) = pair();
        a.close();
        a.close();
        assert!(a.is_closed());
        assert!(matches!(a.write_u8(0), Err(TransportError::Closed)));
        assert!(matches!(a.read_u8(), Err(TransportError::Closed)));
    }

    #[test]
    fn close_unblocks_a_pending_read() {
        let (a, b) = pair();
        let b = std::sync::Arc::new(b);
        let b2 = b.clone();
        let reader = thread::spawn(move || b2.read_u8());
        thread::sleep(Duration::from_millis(30));
        a.close();
        assert!(reader.join().unwrap().is_err());
        drop(b);
    }

    #[test]
    fn peer_eof_fails_read_exact() {
        let (a, b) = pair();
        a.write_all(&[1, 2]).unwrap();
        drop(a);
        let mut buf = [0u8; 4];
        assert!(b.read_exact_buf(&mut buf).is_err());
    }

    #[test]
    fn resolve_failure_is_reported() {
        assert!(matches!(
            NetConnector::new("host.invalid.libsync", 1).connect(),
            Err(TransportError::Resolve { .. } | TransportError::Connect { .. })
        ));
    }
}
