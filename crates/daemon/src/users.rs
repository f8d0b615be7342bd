//! The account directory.
//!
//! One record per username, persisted in `<store>/login.mtd`:
//!
//! ```text
//! u64 next_id
//! u64 count
//! repeat count:
//!   u64 id
//!   u64 name_len;  bytes name
//!   u64 pass_len;  bytes salt || password digest
//! ```
//!
//! Ids are assigned once and never reused; an id is the permanent name of
//! the user's workspace directory on disk. Passwords are stored only as
//! salted PBKDF2 digests and verified in constant time.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use thiserror::Error;
use tracing::{info, warn};

use crypto::PasswordHash;
use protocol::wire::{self, ByteReader};

/// Name of the account file inside the store directory.
const LOGIN_FILE: &str = "login.mtd";

/// Authentication and account failures.
#[derive(Debug, Error)]
pub enum AuthError {
    /// Unknown user or wrong password.
    #[error("invalid username or password")]
    InvalidCredentials,

    /// Registration attempted for a name that already exists.
    #[error("user already exists")]
    UserExists,

    /// The server does not accept new accounts.
    #[error("registration is closed")]
    RegistrationClosed,

    /// The account file on disk is unreadable or malformed.
    #[error("account directory corrupt: {0}")]
    Corrupt(String),

    /// The account file could not be written.
    #[error("failed to persist account directory: {0}")]
    Persist(#[from] io::Error),
}

struct UserRecord {
    id: u64,
    password: PasswordHash,
}

#[derive(Default)]
struct Directory {
    next_id: u64,
    records: HashMap<String, UserRecord>,
}

/// The mutable, persistent set of accounts.
pub struct Users {
    path: PathBuf,
    open_registration: bool,
    state: Mutex<Directory>,
}

impl Users {
    /// Loads the account file from `store_dir`, starting empty when the
    /// file does not exist yet.
    pub fn open(store_dir: &Path, open_registration: bool) -> Result<Self, AuthError> {
        let path = store_dir.join(LOGIN_FILE);
        let state = match fs::read(&path) {
            Ok(bytes) => parse_directory(&bytes)?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => Directory::default(),
            Err(e) => return Err(AuthError::Corrupt(e.to_string())),
        };
        Ok(Self {
            path,
            open_registration,
            state: Mutex::new(state),
        })
    }

    /// Verifies credentials and returns the account id.
    pub fn login(&self, user: &str, pass: &str) -> Result<u64, AuthError> {
        let state = self.state.lock().expect("account directory poisoned");
        let record = state
            .records
            .get(user)
            .ok_or(AuthError::InvalidCredentials)?;
        if record.password.verify(pass) {
            Ok(record.id)
        } else {
            warn!(user, "rejected login");
            Err(AuthError::InvalidCredentials)
        }
    }

    /// Creates an account and returns its freshly assigned id.
    pub fn register(&self, user: &str, pass: &str) -> Result<u64, AuthError> {
        if !self.open_registration {
            return Err(AuthError::RegistrationClosed);
        }
        let password = PasswordHash::create(pass)
            .map_err(|e| AuthError::Corrupt(e.to_string()))?;

        let mut state = self.state.lock().expect("account directory poisoned");
        if state.records.contains_key(user) {
            return Err(AuthError::UserExists);
        }
        let id = state.next_id;
        state.next_id += 1;
        state
            .records
            .insert(user.to_owned(), UserRecord { id, password });
        save_directory(&self.path, &state)?;
        info!(user, id, "registered user");
        Ok(id)
    }

    /// Number of known accounts.
    pub fn len(&self) -> usize {
        self.state.lock().expect("account directory poisoned").records.len()
    }

    /// True when no account has ever been registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn parse_directory(bytes: &[u8]) -> Result<Directory, AuthError> {
    let corrupt = |e: protocol::ProtocolError| AuthError::Corrupt(e.to_string());
    let mut r = ByteReader::new(bytes);
    let next_id = r.u64().map_err(corrupt)?;
    let count = r.u64().map_err(corrupt)?;
    let mut records = HashMap::new();
    for _ in 0..count {
        let id = r.u64().map_err(corrupt)?;
        let name_len = r.u64().map_err(corrupt)? as usize;
        let name = r.str(name_len).map_err(corrupt)?.to_owned();
        let pass_len = r.u64().map_err(corrupt)? as usize;
        let pass = r.bytes(pass_len).map_err(corrupt)?;
        let password =
            PasswordHash::from_bytes(pass).map_err(|e| AuthError::Corrupt(e.to_string()))?;
        records.insert(name, UserRecord { id, password });
    }
    Ok(Directory { next_id, records })
}

fn save_directory(path: &Path, state: &Directory) -> Result<(), io::Error> {
    let mut out = Vec::new();
    wire::put_u64(&mut out, state.next_id);
    wire::put_u64(&mut out, state.records.len() as u64);
    for (name, record) in &state.records {
        wire::put_u64(&mut out, record.id);
        wire::put_u64(&mut out, name.len() as u64);
        out.extend_from_slice(name.as_bytes());
        let pass = record.password.to_bytes();
        wire::put_u64(&mut out, pass.len() as u64);
        out.extend_from_slice(&pass);
    }
    fs::write(path, out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_then_login() {
        let tmp = tempfile::tempdir().unwrap();
        let users = Users::open(tmp.path(), true).unwrap();
        let id = users.register("alice", "wonder").unwrap();
        assert_eq!(id, 0);
        assert_eq!(users.login("alice", "wonder").unwrap(), 0);
    }

    #[test]
    fn wrong_password_and_unknown_user_fail() {
        let tmp = tempfile::tempdir().unwrap();
        let users = Users::open(tmp.path(), true).unwrap();
        users.register("alice", "wonder").unwrap();
        assert!(matches!(
            users.login("alice", "blunder"),
            Err(AuthError::InvalidCredentials)
        ));
        assert!(matches!(
            users.login("bob", "wonder"),
            Err(AuthError::InvalidCredentials)
        ));
    }

    #[test]
    fn ids_are_monotonic_and_survive_reload() {
        let tmp = tempfile::tempdir().unwrap();
        {
            let users = Users::open(tmp.path(), true).unwrap();
            assert_eq!(users.register("alice", "a").unwrap(), 0);
            assert_eq!(users.register("bob", "b").unwrap(), 1);
        }
        let users = Users::open(tmp.path(), true).unwrap();
        assert_eq!(users.len(), 2);
        assert_eq!(users.login("bob", "b").unwrap(), 1);
        // next_id persisted past the highest assignment
        assert_eq!(users.register("carol", "c").unwrap(), 2);
    }

    #[test]
    fn duplicate_registration_fails() {
        let tmp = tempfile::tempdir().unwrap();
        let users = Users::open(tmp.path(), true).unwrap();
        users.register("alice", "a").unwrap();
        assert!(matches!(
            users.register("alice", "again"),
            Err(AuthError::UserExists)
        ));
    }

    #[test]
    fn closed_registration_rejects_new_accounts() {
        let tmp = tempfile::tempdir().unwrap();
        {
            let users = Users::open(tmp.path(), true).unwrap();
            users.register("alice", "a").unwrap();
        }
        let users = Users::open(tmp.path(), false).unwrap();
        assert!(matches!(
            users.register("bob", "b"),
            Err(AuthError::RegistrationClosed)
        ));
        // Existing accounts still log in.
        assert_eq!(users.login("alice", "a").unwrap(), 0);
    }

    #[test]
    fn passwords_are_not_stored_in_the_clear() {
        let tmp = tempfile::tempdir().unwrap();
        let users = Users::open(tmp.path(), true).unwrap();
        users.register("alice", "super-secret-password").unwrap();
        drop(users);
        let raw = fs::read(tmp.path().join(LOGIN_FILE)).unwrap();
        let needle = b"super-secret-password";
        assert!(!raw.windows(needle.len()).any(|w| w == needle));
    }

    #[test]
    fn truncated_account_file_is_corrupt() {
        let tmp = tempfile::tempdir().unwrap();
        {
            let users = Users::open(tmp.path(), true).unwrap();
            users.register("alice", "a").unwrap();
        }
        let path = tmp.path().join(LOGIN_FILE);
        let mut raw = fs::read(&path).unwrap();
        raw.truncate(raw.len() - 3);
        fs::write(&path, raw).unwrap();
        assert!(matches!(
            Users::open(tmp.path(), true),
            Err(AuthError::Corrupt(_))
        ));
    }
}
