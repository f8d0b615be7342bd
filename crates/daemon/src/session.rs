//! One authenticated connection.
//!
//! A session owns nothing but its connection and its id: the user's state
//! lives in the shared [`Workspace`](crate::workspace::Workspace), which the
//! session attaches to after the handshake and detaches from on the way
//! out. The dispatch loop serves commands until the client sends QUIT, the
//! connection dies, or the peer violates the protocol; the last of these
//! tears down this session only, never its siblings.

use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter};
use std::sync::Arc;

use tracing::{debug, info, warn};

use protocol::command::{self, Broadcast, Request};
use protocol::handshake::{self, AuthCommand};
use transport::{Net, NetMsg, TransportError};

use crate::users::{AuthError, Users};
use crate::workspace::{Workspace, WorkspaceTable};
use crate::DaemonError;

/// Serves one connection to completion. Errors out only on faults that
/// should be logged at session granularity; a clean QUIT returns `Ok`.
pub fn serve(
    net: Net,
    session_id: u64,
    users: &Users,
    table: &WorkspaceTable,
) -> Result<(), DaemonError> {
    let user_id = match handshake(&net, users) {
        Ok(id) => id,
        Err(e) => {
            net.close();
            info!(session_id, error = %e, "handshake failed");
            return Ok(());
        }
    };

    let link = Arc::new(NetMsg::new(net));
    let workspace = table.attach(user_id, session_id, Arc::clone(&link))?;
    info!(session_id, user_id, "session attached");

    let result = dispatch_loop(&link, session_id, &workspace);

    table.detach(user_id, session_id);
    link.close();
    info!(session_id, user_id, "session detached");
    result
}

/// Runs the credential exchange on the raw connection and resolves the
/// account id. LOGIN falls back to registration for unknown users, so a
/// first connection with fresh credentials just works.
fn handshake(net: &Net, users: &Users) -> Result<u64, DaemonError> {
    net.write_u8(handshake::VERSION)?;

    let cmd = net.read_u8()?;
    let cmd = AuthCommand::from_code(cmd)
        .ok_or(protocol::ProtocolError::BadStatus(cmd))?;

    let user = read_credential(net)?;
    let pass = read_credential(net)?;

    let attempt = match cmd {
        AuthCommand::Login => users
            .login(&user, &pass)
            .or_else(|_| users.register(&user, &pass)),
        AuthCommand::Register => users.register(&user, &pass),
    };

    match attempt {
        Ok(id) => {
            net.write_u8(handshake::RESULT_OK)?;
            Ok(id)
        }
        Err(e @ AuthError::RegistrationClosed) => {
            net.write_u8(handshake::RESULT_REG_CLOSED)?;
            Err(DaemonError::Auth(e))
        }
        Err(e) => {
            net.write_u8(handshake::RESULT_INVALID)?;
            Err(DaemonError::Auth(e))
        }
    }
}

fn read_credential(net: &Net) -> Result<String, DaemonError> {
    let len = net.read_u16()? as usize;
    let mut buf = vec![0u8; len];
    net.read_exact_buf(&mut buf)?;
    Ok(String::from_utf8(buf).map_err(|_| protocol::ProtocolError::BadPath)?)
}

fn dispatch_loop(
    link: &Arc<NetMsg>,
    session_id: u64,
    workspace: &Arc<Workspace>,
) -> Result<(), DaemonError> {
    loop {
        let msg = match link.wait_new() {
            Ok(msg) => msg,
            // The peer vanished; nothing left to serve.
            Err(TransportError::Closed) => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        match Request::parse(&msg.payload)? {
            Request::Quit => {
                debug!(session_id, "client quit");
                link.destroy(msg.handle);
                return Ok(());
            }
            Request::Meta => {
                let blob = workspace.read(catalog::Catalog::to_bytes);
                link.reply_only(msg.handle, blob)?;
            }
            Request::Push { modified, path } => {
                handle_push(link, session_id, workspace, msg.handle, modified, &path)?;
            }
            Request::Pull { path } => {
                handle_pull(link, workspace, msg.handle, &path)?;
            }
            Request::Del { modified, path } => {
                handle_del(link, session_id, workspace, msg.handle, modified, &path)?;
            }
        }
    }
}

/// PUSH: refuse stale stamps, stream the payload into the store, persist
/// the catalog, acknowledge, then fan the change out.
fn handle_push(
    link: &Arc<NetMsg>,
    session_id: u64,
    workspace: &Arc<Workspace>,
    handle: transport::Handle,
    modified: u64,
    path: &str,
) -> Result<(), DaemonError> {
    let current = workspace.read(|c| c.get(path));
    if modified < current.modified {
        info!(session_id, path, modified, held = current.modified, "stale push skipped");
        link.reply_only(handle, command::status_body(command::STATUS_STALE))?;
        return Ok(());
    }

    let full = workspace.resolve(path)?;
    if let Some(parent) = full.parent() {
        fs::create_dir_all(parent).map_err(DaemonError::Storage)?;
    }
    let file = File::create(&full).map_err(DaemonError::Storage)?;

    let received = link.reply_and_wait_into(
        handle,
        command::status_body(command::STATUS_OK),
        Box::new(BufWriter::new(file)),
    );
    if let Err(e) = received {
        // The payload never landed; leave the catalog untouched.
        warn!(session_id, path, error = %e, "push payload failed");
        let _ = fs::remove_file(&full);
        return match e {
            TransportError::Sink(_) => {
                link.reply_only(handle, command::status_body(command::STATUS_STALE))?;
                Ok(())
            }
            other => Err(other.into()),
        };
    }

    let size = fs::metadata(&full).map_err(DaemonError::Storage)?.len();
    workspace
        .mutate(|c| c.upsert_file(path, size, modified))
        .map_err(DaemonError::Storage)?;
    link.reply_only(handle, command::status_body(command::STATUS_OK))?;
    info!(session_id, path, size, modified, "stored file");

    broadcast(
        workspace,
        session_id,
        &Broadcast {
            path: path.to_owned(),
            modified,
            deleted: false,
        },
    );
    Ok(())
}

/// PULL: reply with the stamp, then stream the stored bytes using the
/// catalog's recorded size as the declared length.
fn handle_pull(
    link: &Arc<NetMsg>,
    workspace: &Arc<Workspace>,
    handle: transport::Handle,
    path: &str,
) -> Result<(), DaemonError> {
    let (record, known) = workspace.read(|c| (c.get(path), c.contains(path)));
    if record.deleted || !known {
        link.reply_only(handle, command::status_body(command::STATUS_STALE))?;
        return Ok(());
    }

    let full = workspace.resolve(path)?;
    let file = match File::open(&full) {
        Ok(f) => f,
        Err(e) => {
            warn!(path, error = %e, "pull of unreadable file");
            link.reply_only(handle, command::status_body(command::STATUS_STALE))?;
            return Ok(());
        }
    };

    // First turn: stamp. Second turn: the payload. The client's closing
    // ack retires the conversation.
    link.reply_and_wait(handle, command::pull_reply(record.modified))?;
    link.reply_and_wait_from(handle, Box::new(BufReader::new(file)), record.size)?;
    link.destroy(handle);
    Ok(())
}

/// DEL: tombstone the record, persist, acknowledge, fan out.
fn handle_del(
    link: &Arc<NetMsg>,
    session_id: u64,
    workspace: &Arc<Workspace>,
    handle: transport::Handle,
    modified: u64,
    path: &str,
) -> Result<(), DaemonError> {
    let full = workspace.resolve(path)?;
    if let Err(e) = fs::remove_file(&full)
        && e.kind() != io::ErrorKind::NotFound
    {
        warn!(path, error = %e, "stored file not removable");
    }

    workspace
        .mutate(|c| c.delete_file(path, modified))
        .map_err(DaemonError::Storage)?;
    link.reply_only(handle, command::status_body(command::STATUS_OK))?;
    info!(session_id, path, modified, "deleted file");

    broadcast(
        workspace,
        session_id,
        &Broadcast {
            path: path.to_owned(),
            modified,
            deleted: true,
        },
    );
    Ok(())
}

/// Fans a change out to every peer session of the workspace. Failures are
/// logged and swallowed: a dying peer must not take this session with it.
fn broadcast(workspace: &Arc<Workspace>, originator: u64, event: &Broadcast) {
    for peer in workspace.peers(originator) {
        match peer.send_and_wait(event.encode()) {
            Ok(reply) => peer.destroy(reply.handle),
            Err(e) => warn!(path = %event.path, error = %e, "broadcast to peer failed"),
        }
    }
}
