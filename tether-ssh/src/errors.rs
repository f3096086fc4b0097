use std::io;

use thiserror::Error;

/// libssh2 session error codes the engine reacts to.
pub mod codes {
    pub const KEX_FAILURE: i32 = -5;
    pub const SOCKET_SEND: i32 = -7;
    pub const KEY_EXCHANGE_FAILURE: i32 = -8;
    pub const TIMEOUT: i32 = -9;
    pub const HOSTKEY_INIT: i32 = -10;
    pub const HOSTKEY_SIGN: i32 = -11;
    pub const SOCKET_DISCONNECT: i32 = -13;
    pub const PASSWORD_EXPIRED: i32 = -15;
    pub const FILE: i32 = -16;
    pub const AUTHENTICATION_FAILED: i32 = -18;
    pub const PUBLICKEY_UNVERIFIED: i32 = -19;
    pub const CHANNEL_FAILURE: i32 = -21;
    pub const CHANNEL_REQUEST_DENIED: i32 = -22;
    pub const SOCKET_TIMEOUT: i32 = -30;
    pub const SFTP_PROTOCOL: i32 = -31;
    pub const REQUEST_DENIED: i32 = -32;
    pub const INVAL: i32 = -34;
    pub const EAGAIN: i32 = -37;
    pub const AGENT_PROTOCOL: i32 = -42;
    pub const SOCKET_RECV: i32 = -43;
    pub const KNOWN_HOSTS: i32 = -46;
}

/// SFTP status codes (`SSH_FX_*`) reported by the server.
pub mod sftp_status {
    pub const EOF: i32 = 1;
    pub const NO_SUCH_FILE: i32 = 2;
    pub const PERMISSION_DENIED: i32 = 3;
    pub const FAILURE: i32 = 4;
    pub const NO_CONNECTION: i32 = 6;
    pub const NO_SUCH_PATH: i32 = 10;
    pub const FILE_ALREADY_EXISTS: i32 = 11;
    pub const WRITE_PROTECT: i32 = 12;
    pub const NO_SPACE_ON_FILESYSTEM: i32 = 14;
    pub const DIR_NOT_EMPTY: i32 = 18;
    pub const NOT_A_DIRECTORY: i32 = 19;
    pub const INVALID_FILENAME: i32 = 20;
    pub const LINK_LOOP: i32 = 21;
}

/// Raw failure reported by the transport: the numeric code plus the
/// transport's last error text.
///
/// Negative codes are libssh2 session codes, positive codes are SFTP status
/// codes.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message} (code {code})")]
pub struct WireError {
    code: i32,
    message: String,
}

impl WireError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// The non-blocking retry signal.
    pub fn would_block() -> Self {
        Self::new(codes::EAGAIN, "would block")
    }

    pub fn code(&self) -> i32 {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn is_would_block(&self) -> bool {
        self.code == codes::EAGAIN
    }

    pub fn is_sftp_status(&self) -> bool {
        self.code > 0
    }
}

/// Result of a single transport primitive.
pub type WireResult<T> = std::result::Result<T, WireError>;

/// Errors surfaced by sessions, channels and streams.
#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to connect to {host}: {source}")]
    Connect {
        host: String,
        #[source]
        source: io::Error,
    },

    #[error("ssh operation timed out: {0}")]
    Timeout(WireError),

    #[error("ssh session disconnected: {0}")]
    Disconnected(WireError),

    #[error("authentication failed: {0}")]
    AuthenticationFailed(WireError),

    #[error("host key negotiation failed: {0}")]
    HostKey(WireError),

    #[error("channel request denied: {0}")]
    ChannelRequestDenied(WireError),

    #[error("sftp error: {0}")]
    Sftp(WireError),

    #[error("ssh error: {0}")]
    Ssh(WireError),

    #[error("ssh channel not opened")]
    ChannelNotOpened,

    #[error("ssh channel already open")]
    AlreadyOpen,

    #[error("ssh channel was closed and cannot be reopened")]
    ChannelClosed,

    #[error("ssh session not connected")]
    NotConnected,

    #[error("ssh session already connected")]
    AlreadyConnected,

    #[error("ssh session not authenticated")]
    NotAuthenticated,

    #[error("end of stream reached")]
    EndOfStream,

    #[error("socket i/o error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    /// Numeric transport code carried by wire failures.
    pub fn code(&self) -> Option<i32> {
        self.wire().map(WireError::code)
    }

    /// Transport failure behind this error, if any.
    pub fn wire(&self) -> Option<&WireError> {
        match self {
            Error::Timeout(err)
            | Error::Disconnected(err)
            | Error::AuthenticationFailed(err)
            | Error::HostKey(err)
            | Error::ChannelRequestDenied(err)
            | Error::Sftp(err)
            | Error::Ssh(err) => Some(err),
            _ => None,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout(_))
    }

    pub fn is_disconnect(&self) -> bool {
        matches!(self, Error::Disconnected(_))
    }
}

impl From<WireError> for Error {
    fn from(err: WireError) -> Self {
        use codes::*;

        match err.code() {
            TIMEOUT | SOCKET_TIMEOUT => Error::Timeout(err),
            SOCKET_DISCONNECT | SOCKET_RECV | SOCKET_SEND => {
                Error::Disconnected(err)
            },
            AUTHENTICATION_FAILED
            | PUBLICKEY_UNVERIFIED
            | PASSWORD_EXPIRED
            | AGENT_PROTOCOL => Error::AuthenticationFailed(err),
            KEX_FAILURE | KEY_EXCHANGE_FAILURE | HOSTKEY_INIT | HOSTKEY_SIGN
            | KNOWN_HOSTS => Error::HostKey(err),
            CHANNEL_REQUEST_DENIED | REQUEST_DENIED | CHANNEL_FAILURE => {
                Error::ChannelRequestDenied(err)
            },
            code if code > 0 => Error::Sftp(err),
            _ => Error::Ssh(err),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
