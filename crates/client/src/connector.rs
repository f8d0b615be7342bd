//! The client's view of the server.
//!
//! A [`Connector`] owns the authenticated connection and exposes the five
//! protocol operations plus the broadcast wait. When a shared secret is
//! configured, file payloads are sealed on push and opened on pull; the
//! server only ever stores ciphertext and the catalog records the sealed
//! size. Control messages and catalog bytes travel in the clear either way.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use tracing::{debug, info};

use catalog::Catalog;
use crypto::{Crypt, DecryptStream, EncryptStream};
use protocol::command::{self, Broadcast, Request, STATUS_OK, STATUS_STALE};
use protocol::handshake::{self, AuthCommand};
use transport::{NetConnector, NetMsg};

use crate::ClientError;

/// Result of a push: the server stored it, or held something newer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// Payload accepted and recorded.
    Stored,
    /// Refused: the server's record is newer. Not an error.
    Stale,
}

/// An authenticated connection to the server.
pub struct Connector {
    link: NetMsg,
    crypt: Option<Crypt>,
}

impl Connector {
    /// Connects, runs the handshake, and starts the multiplexer.
    pub fn connect(
        host: &str,
        port: u16,
        user: &str,
        pass: &str,
        secret: Option<&str>,
    ) -> Result<Self, ClientError> {
        let net = NetConnector::new(host, port).connect()?;

        let version = net.read_u8()?;
        if version != handshake::VERSION {
            net.close();
            return Err(ClientError::IncompatibleServer { version });
        }

        net.write_u8(AuthCommand::Login.code())?;
        net.write_u16(user.len() as u16)?;
        net.write_all(user.as_bytes())?;
        net.write_u16(pass.len() as u16)?;
        net.write_all(pass.as_bytes())?;

        match net.read_u8()? {
            handshake::RESULT_OK => {}
            handshake::RESULT_REG_CLOSED => {
                net.close();
                return Err(ClientError::RegistrationClosed);
            }
            _ => {
                net.close();
                return Err(ClientError::InvalidCredentials);
            }
        }
        info!(host, port, user, "connected");

        Ok(Self {
            link: NetMsg::new(net),
            crypt: secret.map(Crypt::new),
        })
    }

    /// Downloads the server's catalog.
    pub fn fetch_catalog(&self) -> Result<Catalog, ClientError> {
        let reply = self.link.send_and_wait(Request::Meta.encode())?;
        let catalog = Catalog::from_bytes(&reply.payload);
        self.link.destroy(reply.handle);
        Ok(catalog?)
    }

    /// Uploads a file's bytes under the given stamp.
    pub fn push_file(
        &self,
        path: &str,
        modified: u64,
        file: File,
        size: u64,
    ) -> Result<PushOutcome, ClientError> {
        let req = Request::Push {
            modified,
            path: path.to_owned(),
        };
        let reply = self.link.send_and_wait(req.encode())?;
        if command::parse_status(&reply.payload)? == STATUS_STALE {
            self.link.destroy(reply.handle);
            info!(path, modified, "server skipped stale push");
            return Ok(PushOutcome::Stale);
        }

        let (source, declared): (Box<dyn Read + Send>, u64) = match &self.crypt {
            None => (Box::new(BufReader::new(file)), size),
            Some(crypt) => (
                Box::new(SealingReader::new(file, crypt.encrypt_stream()?)),
                Crypt::sealed_len(size),
            ),
        };

        let done = self
            .link
            .reply_and_wait_from(reply.handle, source, declared)?;
        let status = command::parse_status(&done)?;
        self.link.destroy(reply.handle);
        if status != STATUS_OK {
            return Err(ClientError::PushRefused {
                path: path.to_owned(),
            });
        }
        debug!(path, modified, size, "pushed file");
        Ok(PushOutcome::Stored)
    }

    /// Downloads a file into `dest`, returning the server's stamp.
    pub fn pull_file(&self, path: &str, dest: &Path) -> Result<u64, ClientError> {
        let reply = self
            .link
            .send_and_wait(Request::Pull { path: path.to_owned() }.encode())?;
        let (status, modified) = command::parse_pull_reply(&reply.payload)?;
        if status != STATUS_OK {
            self.link.destroy(reply.handle);
            return Err(ClientError::PullRefused {
                path: path.to_owned(),
            });
        }

        match &self.crypt {
            None => {
                let file = File::create(dest).map_err(ClientError::FileIo)?;
                self.link.reply_and_wait_into(
                    reply.handle,
                    command::status_body(STATUS_OK),
                    Box::new(BufWriter::new(file)),
                )?;
            }
            Some(crypt) => {
                // Sealed payloads verify as a whole, so the ciphertext is
                // collected first and only verified plaintext touches disk.
                let opener = OpeningSink::new(crypt.decrypt_stream());
                let shared = opener.stream_handle();
                self.link.reply_and_wait_into(
                    reply.handle,
                    command::status_body(STATUS_OK),
                    Box::new(opener),
                )?;
                let plain = OpeningSink::finish(&shared)?;
                std::fs::write(dest, plain).map_err(ClientError::FileIo)?;
            }
        }

        self.link
            .reply_only(reply.handle, command::status_body(STATUS_OK))?;
        debug!(path, modified, "pulled file");
        Ok(modified)
    }

    /// Reports a local deletion.
    pub fn delete_file(&self, path: &str, modified: u64) -> Result<(), ClientError> {
        let req = Request::Del {
            modified,
            path: path.to_owned(),
        };
        let reply = self.link.send_and_wait(req.encode())?;
        let status = command::parse_status(&reply.payload)?;
        self.link.destroy(reply.handle);
        if status != STATUS_OK {
            return Err(ClientError::DeleteRefused {
                path: path.to_owned(),
            });
        }
        debug!(path, modified, "reported deletion");
        Ok(())
    }

    /// Blocks for the next server-initiated change notification and
    /// acknowledges it.
    pub fn wait_event(&self) -> Result<Broadcast, ClientError> {
        let msg = self.link.wait_new()?;
        let event = Broadcast::parse(&msg.payload)?;
        self.link
            .reply_only(msg.handle, command::status_body(STATUS_OK))?;
        Ok(event)
    }

    /// Announces QUIT and tears the connection down. Idempotent enough to
    /// run on an already-dead connection.
    pub fn close(&self) {
        let _ = self.link.send_only(Request::Quit.encode());
        self.link.close();
    }
}

/// Adapts a plaintext file into its sealed byte stream on the fly, so a
/// push never holds the whole file in memory.
struct SealingReader {
    file: BufReader<File>,
    stream: EncryptStream,
    input_done: bool,
}

impl SealingReader {
    fn new(file: File, stream: EncryptStream) -> Self {
        Self {
            file: BufReader::new(file),
            stream,
            input_done: false,
        }
    }
}

impl Read for SealingReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        loop {
            let n = self.stream.read(buf);
            if n > 0 || self.input_done {
                return Ok(n);
            }
            let mut chunk = [0u8; 8192];
            let got = self.file.read(&mut chunk)?;
            let fed = if got == 0 {
                self.input_done = true;
                self.stream.write(&[])
            } else {
                self.stream.write(&chunk[..got])
            };
            fed.map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()))?;
        }
    }
}

/// Collects sealed bytes as they arrive; `finish` verifies and releases the
/// plaintext.
struct OpeningSink {
    stream: std::sync::Arc<std::sync::Mutex<DecryptStream>>,
}

impl OpeningSink {
    fn new(stream: DecryptStream) -> Self {
        Self {
            stream: std::sync::Arc::new(std::sync::Mutex::new(stream)),
        }
    }

    fn stream_handle(&self) -> std::sync::Arc<std::sync::Mutex<DecryptStream>> {
        std::sync::Arc::clone(&self.stream)
    }

    fn finish(
        stream: &std::sync::Arc<std::sync::Mutex<DecryptStream>>,
    ) -> Result<Vec<u8>, ClientError> {
        let mut stream = stream.lock().expect("decrypt stream poisoned");
        stream.write(&[])?;
        let mut plain = Vec::new();
        let mut buf = [0u8; 8192];
        loop {
            let n = stream.read(&mut buf);
            if n == 0 {
                break;
            }
            plain.extend_from_slice(&buf[..n]);
        }
        Ok(plain)
    }
}

impl Write for OpeningSink {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.stream
            .lock()
            .expect("decrypt stream poisoned")
            .write(buf)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}
