//! Conversation multiplexing over one [`Net`].
//!
//! Both endpoints run the same machinery: a writer thread serializes frames
//! from a send queue, a reader thread parses inbound frames and routes each
//! to the conversation it belongs to. Conversations are keyed by a 64-bit
//! id inside two independent tables (ids we assigned and ids the peer
//! assigned), so neither side ever needs to coordinate id allocation.
//!
//! Within one conversation the parties strictly alternate: whoever sent
//! last waits, whoever received last may send. Callers that block do so on
//! a one-shot completion slot armed before their frame is queued, which is
//! what makes "every wait resolves exactly once or fails" hold by
//! construction rather than by convention.
//!
//! Large bodies never materialize in memory: a send may attach a reader
//! that is streamed after the length word, and a wait may attach a writer
//! that receives the inbound body chunk by chunk.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, Sender, bounded, unbounded};
use tracing::{debug, warn};

use protocol::frame::{FrameHeader, HEADER_LEN, Initiator};

use crate::{Net, TransportError};

/// Fixed chunk size for streamed bodies.
const CHUNK: usize = 8192;

/// Opaque reference to one live conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Handle {
    initiator: Initiator,
    id: u64,
}

/// A completed wait: the conversation handle and the received body.
#[derive(Debug)]
pub struct Reply {
    /// Conversation the body arrived on.
    pub handle: Handle,
    /// The body, empty when it was streamed into a sink.
    pub payload: Vec<u8>,
}

/// What the writer thread should put after a frame header.
enum BodySource {
    Buffered(Vec<u8>),
    Streamed {
        source: Box<dyn Read + Send>,
        len: u64,
    },
}

impl BodySource {
    fn len(&self) -> u64 {
        match self {
            Self::Buffered(b) => b.len() as u64,
            Self::Streamed { len, .. } => *len,
        }
    }
}

enum WriteCommand {
    Frame {
        initiator: Initiator,
        id: u64,
        body: BodySource,
        destroy_after: bool,
    },
    Shutdown,
}

type Completion = Result<Vec<u8>, TransportError>;

/// Per-conversation state while a wait or sink is armed.
#[derive(Default)]
struct MsgState {
    /// Body of a fresh peer conversation, held until `wait_new` claims it.
    payload: Vec<u8>,
    /// Destination for the next inbound body on this conversation.
    sink: Option<Box<dyn Write + Send>>,
    /// One-shot slot for the caller blocked on this conversation.
    waiter: Option<Sender<Completion>>,
}

#[derive(Default)]
struct Tables {
    local: HashMap<u64, MsgState>,
    peer: HashMap<u64, MsgState>,
    next_id: u64,
}

impl Tables {
    fn side(&mut self, initiator: Initiator) -> &mut HashMap<u64, MsgState> {
        match initiator {
            Initiator::Local => &mut self.local,
            Initiator::Peer => &mut self.peer,
        }
    }
}

struct Shared {
    net: Arc<Net>,
    tables: Mutex<Tables>,
    write_tx: Sender<WriteCommand>,
    closed: AtomicBool,
}

impl Shared {
    /// Tears the connection down and wakes every blocked caller with an
    /// error. Run on close and on any terminal failure from either thread;
    /// safe to run repeatedly.
    fn terminate(&self) {
        self.closed.store(true, Ordering::Release);
        self.net.close();
        let _ = self.write_tx.send(WriteCommand::Shutdown);
        let mut tables = self.tables.lock().expect("message tables poisoned");
        let Tables { local, peer, .. } = &mut *tables;
        for state in local.values_mut().chain(peer.values_mut()) {
            if let Some(waiter) = state.waiter.take() {
                let _ = waiter.send(Err(TransportError::Closed));
            }
        }
    }
}

/// The multiplexer. One per connection, shared freely across threads.
pub struct NetMsg {
    shared: Arc<Shared>,
    new_rx: Receiver<u64>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl NetMsg {
    /// Takes ownership of a connection and starts the reader and writer
    /// threads. The handshake, if any, must already be done.
    #[must_use]
    pub fn new(net: Net) -> Self {
        let (write_tx, write_rx) = unbounded();
        let (new_tx, new_rx) = unbounded();
        let shared = Arc::new(Shared {
            net: Arc::new(net),
            tables: Mutex::new(Tables::default()),
            write_tx,
            closed: AtomicBool::new(false),
        });

        let writer = {
            let shared = Arc::clone(&shared);
            thread::Builder::new()
                .name("netmsg-writer".into())
                .spawn(move || writer_loop(&shared, &write_rx))
                .expect("spawn netmsg writer")
        };
        let reader = {
            let shared = Arc::clone(&shared);
            thread::Builder::new()
                .name("netmsg-reader".into())
                .spawn(move || reader_loop(&shared, &new_tx))
                .expect("spawn netmsg reader")
        };

        Self {
            shared,
            new_rx,
            threads: Mutex::new(vec![writer, reader]),
        }
    }

    /// Opens a conversation, sends the body, and forgets it. No reply is
    /// expected; one arriving anyway is drained and logged by the reader.
    pub fn send_only(&self, body: Vec<u8>) -> Result<(), TransportError> {
        let id = self.allocate_id();
        self.enqueue(Initiator::Local, id, BodySource::Buffered(body), true)
    }

    /// Opens a conversation and blocks until the peer's reply arrives.
    pub fn send_and_wait(&self, body: Vec<u8>) -> Result<Reply, TransportError> {
        let id = self.allocate_id();
        let rx = self.arm(Initiator::Local, id, None, true)?;
        self.enqueue(Initiator::Local, id, BodySource::Buffered(body), false)?;
        let payload = self.await_completion(&rx)?;
        Ok(Reply {
            handle: Handle {
                initiator: Initiator::Local,
                id,
            },
            payload,
        })
    }

    /// Blocks until the peer opens a conversation we have not seen before.
    /// Fresh conversations are delivered in arrival order.
    pub fn wait_new(&self) -> Result<Reply, TransportError> {
        let id = self.new_rx.recv().map_err(|_| TransportError::Closed)?;
        let mut tables = self.shared.tables.lock().expect("message tables poisoned");
        let state = tables
            .peer
            .get_mut(&id)
            .ok_or(TransportError::UnknownConversation { id })?;
        Ok(Reply {
            handle: Handle {
                initiator: Initiator::Peer,
                id,
            },
            payload: std::mem::take(&mut state.payload),
        })
    }

    /// Sends `body` on an open conversation and blocks for the next frame
    /// on it.
    pub fn reply_and_wait(&self, handle: Handle, body: Vec<u8>) -> Result<Vec<u8>, TransportError> {
        let rx = self.arm(handle.initiator, handle.id, None, false)?;
        self.enqueue(handle.initiator, handle.id, BodySource::Buffered(body), false)?;
        self.await_completion(&rx)
    }

    /// Sends a body streamed out of `source` (exactly `len` bytes) and
    /// blocks for the next frame on the conversation.
    pub fn reply_and_wait_from(
        &self,
        handle: Handle,
        source: Box<dyn Read + Send>,
        len: u64,
    ) -> Result<Vec<u8>, TransportError> {
        let rx = self.arm(handle.initiator, handle.id, None, false)?;
        self.enqueue(
            handle.initiator,
            handle.id,
            BodySource::Streamed { source, len },
            false,
        )?;
        self.await_completion(&rx)
    }

    /// Sends `body`, then blocks until the next frame on the conversation
    /// has been streamed into `sink`.
    pub fn reply_and_wait_into(
        &self,
        handle: Handle,
        body: Vec<u8>,
        sink: Box<dyn Write + Send>,
    ) -> Result<(), TransportError> {
        let rx = self.arm(handle.initiator, handle.id, Some(sink), false)?;
        self.enqueue(handle.initiator, handle.id, BodySource::Buffered(body), false)?;
        self.await_completion(&rx).map(|_| ())
    }

    /// Sends a final body on the conversation and retires it after the
    /// frame hits the wire.
    pub fn reply_only(&self, handle: Handle, body: Vec<u8>) -> Result<(), TransportError> {
        self.enqueue(handle.initiator, handle.id, BodySource::Buffered(body), true)
    }

    /// Drops a conversation's state. Handles are dead after this.
    pub fn destroy(&self, handle: Handle) {
        let mut tables = self.shared.tables.lock().expect("message tables poisoned");
        tables.side(handle.initiator).remove(&handle.id);
    }

    /// Tears the multiplexer down: closes the connection, wakes every
    /// blocked caller with an error, and stops both threads. Idempotent.
    pub fn close(&self) {
        self.shared.terminate();
    }

    fn allocate_id(&self) -> u64 {
        let mut tables = self.shared.tables.lock().expect("message tables poisoned");
        let id = tables.next_id;
        tables.next_id += 1;
        id
    }

    /// Installs the one-shot completion slot (and optional sink) for a
    /// conversation, creating the entry when `create` is set.
    fn arm(
        &self,
        initiator: Initiator,
        id: u64,
        sink: Option<Box<dyn Write + Send>>,
        create: bool,
    ) -> Result<Receiver<Completion>, TransportError> {
        let (tx, rx) = bounded(1);
        let mut tables = self.shared.tables.lock().expect("message tables poisoned");
        // Checked under the tables lock: `terminate` raises the flag before
        // draining waiters, so a slot armed here is either drained by it or
        // refused outright.
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        let table = tables.side(initiator);
        let state = if create {
            table.entry(id).or_default()
        } else {
            table
                .get_mut(&id)
                .ok_or(TransportError::UnknownConversation { id })?
        };
        state.waiter = Some(tx);
        state.sink = sink;
        Ok(rx)
    }

    fn enqueue(
        &self,
        initiator: Initiator,
        id: u64,
        body: BodySource,
        destroy_after: bool,
    ) -> Result<(), TransportError> {
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        self.shared
            .write_tx
            .send(WriteCommand::Frame {
                initiator,
                id,
                body,
                destroy_after,
            })
            .map_err(|_| TransportError::Closed)
    }

    fn await_completion(&self, rx: &Receiver<Completion>) -> Result<Vec<u8>, TransportError> {
        rx.recv().map_err(|_| TransportError::Closed)?
    }
}

impl Drop for NetMsg {
    fn drop(&mut self) {
        self.close();
        let mut threads = self.threads.lock().expect("thread list poisoned");
        for handle in threads.drain(..) {
            let _ = handle.join();
        }
    }
}

fn writer_loop(shared: &Shared, write_rx: &Receiver<WriteCommand>) {
    for command in write_rx {
        let WriteCommand::Frame {
            initiator,
            id,
            body,
            destroy_after,
        } = command
        else {
            break;
        };

        if let Err(e) = write_frame(&shared.net, initiator, id, body) {
            debug!(error = %e, "writer stopping after transport failure");
            shared.terminate();
            break;
        }

        if destroy_after {
            let mut tables = shared.tables.lock().expect("message tables poisoned");
            tables.side(initiator).remove(&id);
        }
    }
}

fn write_frame(
    net: &Net,
    initiator: Initiator,
    id: u64,
    body: BodySource,
) -> Result<(), TransportError> {
    let header = FrameHeader {
        initiator,
        id,
        body_len: body.len(),
    };
    net.write_all(&header.encode())?;

    match body {
        BodySource::Buffered(bytes) => net.write_all(&bytes),
        BodySource::Streamed {
            mut source,
            mut len,
        } => {
            let mut buf = [0u8; CHUNK];
            while len > 0 {
                let want = usize::try_from(len.min(CHUNK as u64)).expect("chunk fits in usize");
                let got = source.read(&mut buf[..want]).map_err(TransportError::Io)?;
                if got == 0 {
                    // The declared length is a promise to the peer; a dry
                    // source leaves the stream unframeable.
                    return Err(TransportError::ShortSource { remaining: len });
                }
                net.write_all(&buf[..got])?;
                len -= got as u64;
            }
            Ok(())
        }
    }
}

fn reader_loop(shared: &Shared, new_tx: &Sender<u64>) {
    loop {
        match read_frame(shared, new_tx) {
            Ok(()) => {}
            Err(e) => {
                if !shared.closed.load(Ordering::Acquire) {
                    debug!(error = %e, "reader stopping");
                }
                break;
            }
        }
    }
    // Waking the waiters and dropping new_tx unblocks everyone else.
    shared.terminate();
}

fn read_frame(shared: &Shared, new_tx: &Sender<u64>) -> Result<(), TransportError> {
    let mut raw = [0u8; HEADER_LEN];
    shared.net.read_exact_buf(&mut raw)?;
    let header = FrameHeader::decode(&raw)?;
    let body_len =
        usize::try_from(header.body_len).map_err(|_| protocol::ProtocolError::BadLength {
            field: "body_len",
            value: header.body_len,
        })?;

    // A frame for one of our conversations must match live state; anything
    // else is a stray reply whose body still has to leave the socket.
    let (known, is_new, sink) = {
        let mut tables = shared.tables.lock().expect("message tables poisoned");
        match header.initiator {
            Initiator::Local => match tables.local.get_mut(&header.id) {
                Some(state) => (true, false, state.sink.take()),
                None => (false, false, None),
            },
            Initiator::Peer => {
                let is_new = !tables.peer.contains_key(&header.id);
                let state = tables.peer.entry(header.id).or_default();
                (true, is_new, state.sink.take())
            }
        }
    };

    if !known {
        warn!(id = header.id, len = body_len, "frame for retired conversation");
        drain_body(&shared.net, body_len)?;
        return Ok(());
    }

    let (payload, sink_result) = match sink {
        Some(mut sink) => {
            let result = stream_body(&shared.net, body_len, &mut sink);
            (Vec::new(), result)
        }
        None => {
            let mut payload = vec![0u8; body_len];
            shared.net.read_exact_buf(&mut payload)?;
            (payload, Ok(()))
        }
    };

    let mut tables = shared.tables.lock().expect("message tables poisoned");
    let Some(state) = tables.side(header.initiator).get_mut(&header.id) else {
        // Destroyed while the body was in flight; nothing to deliver.
        return Ok(());
    };
    let completion = sink_result.map(|()| payload);
    if let Some(waiter) = state.waiter.take() {
        let _ = waiter.send(completion);
    } else if is_new {
        state.payload = completion.unwrap_or_default();
        let _ = new_tx.send(header.id);
    } else {
        warn!(id = header.id, "frame arrived with nobody waiting");
    }
    Ok(())
}

/// Streams a body straight into a sink; sink failures are reported to the
/// waiter but the socket is drained either way so framing survives.
fn stream_body(
    net: &Net,
    mut len: usize,
    sink: &mut Box<dyn Write + Send>,
) -> Result<(), TransportError> {
    let mut buf = [0u8; CHUNK];
    let mut sink_error = None;
    while len > 0 {
        let want = len.min(CHUNK);
        net.read_exact_buf(&mut buf[..want])?;
        len -= want;
        if sink_error.is_none()
            && let Err(e) = sink.write_all(&buf[..want])
        {
            sink_error = Some(e);
        }
    }
    if sink_error.is_none()
        && let Err(e) = sink.flush()
    {
        sink_error = Some(e);
    }
    match sink_error {
        Some(e) => Err(TransportError::Sink(e)),
        None => Ok(()),
    }
}

fn drain_body(net: &Net, mut len: usize) -> Result<(), TransportError> {
    let mut buf = [0u8; CHUNK];
    while len > 0 {
        let want = len.min(CHUNK);
        net.read_exact_buf(&mut buf[..want])?;
        len -= want;
    }
    Ok(())
}
