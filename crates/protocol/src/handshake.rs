//! The credentialed handshake.
//!
//! Exchanged on the raw connection before the multiplexer threads start:
//!
//! ```text
//! server -> client   u8 version (0)
//! client -> server   u8 cmd; u16 user_len; bytes user; u16 pass_len; bytes pass
//! server -> client   u8 result
//! ```

/// Protocol version announced by the server. There is exactly one.
pub const VERSION: u8 = 0;

/// Client's opening request: authenticate or create an account.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthCommand {
    /// Present existing credentials. An unknown user falls back to
    /// registration on the server side.
    Login,
    /// Create the account outright.
    Register,
}

impl AuthCommand {
    /// Wire code for this command.
    #[must_use]
    pub fn code(self) -> u8 {
        match self {
            Self::Login => 0,
            Self::Register => 1,
        }
    }

    /// Decodes a wire code; anything unknown is `None`.
    #[must_use]
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Self::Login),
            1 => Some(Self::Register),
            _ => None,
        }
    }
}

/// Handshake accepted; the session may begin.
pub const RESULT_OK: u8 = 0;
/// Login rejected (bad password) or registration rejected (name taken).
pub const RESULT_INVALID: u8 = 1;
/// Registration is administratively closed on this server.
pub const RESULT_REG_CLOSED: u8 = 2;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_codes_round_trip() {
        for cmd in [AuthCommand::Login, AuthCommand::Register] {
            assert_eq!(AuthCommand::from_code(cmd.code()), Some(cmd));
        }
        assert_eq!(AuthCommand::from_code(7), None);
    }
}
