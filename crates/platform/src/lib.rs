//! Process-level platform glue.
//!
//! Currently just daemonization: the classic double fork with a new
//! session, a chdir to `/`, and stdio pointed at `/dev/null`. The caller is
//! expected to have deferred log setup until after this returns, since file
//! descriptors opened before the fork would survive into the daemon.

use std::io;

/// Detaches the process from its controlling terminal.
///
/// On success the caller continues as the daemon; the intermediate parents
/// have already exited. Fails with the underlying `errno` if any step of
/// the fork/setsid sequence does.
#[cfg(unix)]
pub fn daemonize() -> io::Result<()> {
    // SAFETY: fork/setsid/dup2 are async-signal-safe libc calls used in the
    // standard daemonization sequence; no Rust state is shared across the
    // fork boundary.
    unsafe {
        match libc::fork() {
            -1 => return Err(io::Error::last_os_error()),
            0 => {}
            _ => libc::_exit(0),
        }

        if libc::setsid() == -1 {
            return Err(io::Error::last_os_error());
        }

        match libc::fork() {
            -1 => return Err(io::Error::last_os_error()),
            0 => {}
            _ => libc::_exit(0),
        }

        if libc::chdir(c"/".as_ptr()) == -1 {
            return Err(io::Error::last_os_error());
        }
        libc::umask(0o022);

        let null = libc::open(c"/dev/null".as_ptr(), libc::O_RDWR);
        if null == -1 {
            return Err(io::Error::last_os_error());
        }
        for fd in [libc::STDIN_FILENO, libc::STDOUT_FILENO, libc::STDERR_FILENO] {
            if libc::dup2(null, fd) == -1 {
                return Err(io::Error::last_os_error());
            }
        }
        if null > libc::STDERR_FILENO {
            libc::close(null);
        }
    }
    Ok(())
}

/// Daemonization is not supported off Unix; run in the foreground instead.
#[cfg(not(unix))]
pub fn daemonize() -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "daemonization is only available on unix",
    ))
}
