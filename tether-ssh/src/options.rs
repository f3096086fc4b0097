use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use secrecy::SecretString;
use serde::{Deserialize, Serialize};

/// Default SSH port.
pub const DEFAULT_PORT: u16 = 22;

/// Default window size advertised when opening a channel.
pub const WINDOW_DEFAULT: u32 = 2 * 1024 * 1024;

/// Default maximum packet size advertised when opening a channel.
pub const PACKET_DEFAULT: u32 = 32 * 1024;

/// Transport settings applied at connect time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectOptions {
    /// Transport timeout in milliseconds, `0` disables it.
    pub timeout_ms: u32,
    /// Whether libssh2 blocks internally instead of reporting would-block.
    pub blocking: bool,
    /// Negotiate transport compression.
    pub compress: bool,
    /// Allow SIGPIPE to be raised when the peer closes the socket.
    pub sigpipe: bool,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            timeout_ms: 0,
            blocking: true,
            compress: false,
            sigpipe: false,
        }
    }
}

impl ConnectOptions {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms =
            u32::try_from(timeout.as_millis()).unwrap_or(u32::MAX);
        self
    }

    pub fn with_blocking(mut self, blocking: bool) -> Self {
        self.blocking = blocking;
        self
    }

    pub fn with_compress(mut self, compress: bool) -> Self {
        self.compress = compress;
        self
    }

    pub fn with_sigpipe(mut self, sigpipe: bool) -> Self {
        self.sigpipe = sigpipe;
        self
    }

    /// Timeout as a duration, `None` when disabled.
    pub fn timeout(&self) -> Option<Duration> {
        (self.timeout_ms > 0)
            .then(|| Duration::from_millis(u64::from(self.timeout_ms)))
    }
}

/// Pseudo terminal request parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PtyOptions {
    /// Value of `TERM` on the remote side.
    pub term: String,
    /// Encoded terminal modes as `(opcode, value)` pairs.
    pub modes: Vec<(u8, u32)>,
    pub chars_wide: u32,
    pub chars_high: u32,
    pub pixels_wide: u32,
    pub pixels_high: u32,
}

impl Default for PtyOptions {
    fn default() -> Self {
        Self {
            term: String::from("vanilla"),
            modes: Vec::new(),
            chars_wide: 80,
            chars_high: 24,
            pixels_wide: 0,
            pixels_high: 0,
        }
    }
}

impl PtyOptions {
    pub fn with_term(mut self, term: &str) -> Self {
        self.term = term.into();
        self
    }

    pub fn with_mode(mut self, opcode: u8, value: u32) -> Self {
        self.modes.push((opcode, value));
        self
    }

    pub fn with_size(mut self, chars_wide: u32, chars_high: u32) -> Self {
        self.chars_wide = chars_wide;
        self.chars_high = chars_high;
        self
    }

    pub fn with_pixels(mut self, pixels_wide: u32, pixels_high: u32) -> Self {
        self.pixels_wide = pixels_wide;
        self.pixels_high = pixels_high;
        self
    }
}

/// Authentication strategy used by [`crate::Session::login`].
pub enum Auth {
    /// Try every identity offered by the running ssh-agent.
    Agent,
    /// Authenticate with a private key file; the public key is looked up next
    /// to it with a `.pub` suffix.
    PublicKey {
        private_key: PathBuf,
        passphrase: Option<SecretString>,
    },
    /// Plain password, possibly empty.
    Password(SecretString),
    /// Keyboard-interactive, answered by the session's secret prompt.
    Interactive,
}

impl Auth {
    pub fn password(password: impl Into<String>) -> Self {
        Auth::Password(SecretString::from(password.into()))
    }

    pub fn public_key(
        private_key: impl Into<PathBuf>,
        passphrase: Option<String>,
    ) -> Self {
        Auth::PublicKey {
            private_key: private_key.into(),
            passphrase: passphrase.map(SecretString::from),
        }
    }

    /// Pick a strategy from loose caller options.
    ///
    /// Precedence is agent, key file, password, interactive. A present
    /// password selects password auth even when empty; only an absent one
    /// falls through to interactive prompting.
    pub fn select(
        agent: bool,
        key: Option<PathBuf>,
        passphrase: Option<String>,
        password: Option<String>,
    ) -> Self {
        match (agent, key, password) {
            (true, _, _) => Auth::Agent,
            (false, Some(private_key), _) => Auth::PublicKey {
                private_key,
                passphrase: passphrase.map(SecretString::from),
            },
            (false, None, Some(password)) => Auth::password(password),
            (false, None, None) => Auth::Interactive,
        }
    }

    /// Short method name, matching the names servers list.
    pub fn method(&self) -> &'static str {
        match self {
            Auth::Agent | Auth::PublicKey { .. } => "publickey",
            Auth::Password(_) => "password",
            Auth::Interactive => "keyboard-interactive",
        }
    }
}

impl fmt::Debug for Auth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Auth::Agent => f.write_str("Agent"),
            Auth::PublicKey { private_key, .. } => f
                .debug_struct("PublicKey")
                .field("private_key", private_key)
                .finish_non_exhaustive(),
            Auth::Password(_) => f.write_str("Password(..)"),
            Auth::Interactive => f.write_str("Interactive"),
        }
    }
}
