//! Primitive operations the engine expects from an SSH transport.
//!
//! Every primitive is non-blocking friendly: it either completes, fails with
//! a [`WireError`], or fails with the would-block signal
//! ([`WireError::is_would_block`]) after which the caller waits for socket
//! readiness and calls it again. The libssh2 implementation lives in
//! [`crate::backend`].

use std::net::TcpStream;
use std::path::{Path, PathBuf};

use secrecy::SecretString;

use crate::errors::{WireError, WireResult};
use crate::options::{ConnectOptions, PtyOptions};

/// Which socket direction the transport was waiting on when it reported
/// would-block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BlockDirections {
    #[default]
    None,
    Inbound,
    Outbound,
    Both,
}

/// How extended data (stderr) is delivered on a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExtendedData {
    /// Keep stderr on its own stream id.
    #[default]
    Normal,
    /// Drop stderr.
    Ignore,
    /// Fold stderr into the normal stream.
    Merge,
}

/// Sub-stream of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum StreamId {
    #[default]
    Stdio,
    Stderr,
}

impl StreamId {
    pub fn as_raw(self) -> i32 {
        match self {
            StreamId::Stdio => 0,
            StreamId::Stderr => 1,
        }
    }
}

/// Supplies keyboard-interactive answers. Implemented by
/// [`crate::prompt::SecretPrompt`] adapters.
pub trait KeyboardInteractive {
    fn respond(&mut self, prompts: &[String]) -> Vec<SecretString>;
}

/// Session-level primitives of an SSH transport.
pub trait Transport: Sized {
    type Channel: ChannelIo;
    type Sftp: SftpIo;

    /// Wrap a connected socket and apply the connect options. No network
    /// traffic happens yet.
    fn init(socket: TcpStream, options: &ConnectOptions) -> WireResult<Self>;

    fn handshake(&self) -> WireResult<()>;

    fn block_directions(&self) -> BlockDirections;

    fn is_blocking(&self) -> bool;

    fn set_blocking(&self, blocking: bool);

    /// Transport timeout in milliseconds, `0` means none.
    fn timeout(&self) -> u32;

    fn set_timeout(&self, timeout_ms: u32);

    fn userauth_password(&self, user: &str, password: &str) -> WireResult<()>;

    fn userauth_pubkey_file(
        &self,
        user: &str,
        public_key: Option<&Path>,
        private_key: &Path,
        passphrase: Option<&str>,
    ) -> WireResult<()>;

    fn userauth_keyboard_interactive(
        &self,
        user: &str,
        responder: &mut dyn KeyboardInteractive,
    ) -> WireResult<()>;

    fn userauth_agent(&self, user: &str) -> WireResult<()>;

    fn authenticated(&self) -> bool;

    /// Comma separated list of auth methods the server accepts for `user`.
    fn userauth_list(&self, user: &str) -> WireResult<String>;

    /// SHA-1 digest of the server host key.
    fn host_key_hash(&self) -> Option<Vec<u8>>;

    fn last_error(&self) -> Option<WireError>;

    fn disconnect(&self) -> WireResult<()>;

    fn channel_open(
        &self,
        kind: &str,
        window_size: u32,
        packet_size: u32,
        message: Option<&str>,
    ) -> WireResult<Self::Channel>;

    fn sftp(&self) -> WireResult<Self::Sftp>;
}

/// Primitives of one open channel.
pub trait ChannelIo {
    fn handle_extended_data(&mut self, mode: ExtendedData) -> WireResult<()>;

    fn process_startup(
        &mut self,
        request: &str,
        message: Option<&str>,
    ) -> WireResult<()>;

    fn request_pty(&mut self, pty: &PtyOptions) -> WireResult<()>;

    fn setenv(&mut self, name: &str, value: &str) -> WireResult<()>;

    fn send_eof(&mut self) -> WireResult<()>;

    fn wait_eof(&mut self) -> WireResult<()>;

    fn eof(&self) -> WireResult<bool>;

    fn close(&mut self) -> WireResult<()>;

    fn wait_close(&mut self) -> WireResult<()>;

    fn exit_status(&self) -> WireResult<i32>;

    /// Read from `stream`; `Ok(0)` means the stream reached EOF.
    fn read(&mut self, stream: StreamId, buf: &mut [u8]) -> WireResult<usize>;

    fn write(&mut self, stream: StreamId, data: &[u8]) -> WireResult<usize>;

    fn flush(&mut self, stream: StreamId) -> WireResult<()>;
}

/// One directory entry returned by [`SftpDirIo::readdir`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: PathBuf,
    pub size: Option<u64>,
    pub perm: Option<u32>,
    pub mtime: Option<u64>,
    pub is_dir: bool,
}

/// SFTP sub-protocol handle.
pub trait SftpIo {
    type Dir: SftpDirIo;

    fn opendir(&self, path: &Path) -> WireResult<Self::Dir>;
}

/// Open SFTP directory handle.
pub trait SftpDirIo {
    /// Next entry, or `None` once the listing is exhausted.
    fn readdir(&mut self) -> WireResult<Option<DirEntry>>;
}
