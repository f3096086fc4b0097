//! Blocking-style SSH and SFTP sessions driven over a non-blocking libssh2
//! transport.
//!
//! A [`Session`] owns one socket and one transport. Every transport primitive
//! runs in non-blocking mode and is retried after a bounded readiness wait
//! whenever it reports would-block, so callers see ordinary blocking calls.
//! [`Channel`]s and their [`Stream`]s hold weak references back to the
//! session and report themselves closed once it goes away.
//!
//! ```no_run
//! use tether_ssh::{Auth, ConnectOptions, DEFAULT_PORT, Session, runtime};
//!
//! # fn main() -> tether_ssh::Result<()> {
//! let _runtime = runtime::startup();
//! let session: Session = Session::start(
//!     "example.org",
//!     DEFAULT_PORT,
//!     &ConnectOptions::default(),
//!     Some(("deploy", &Auth::Agent)),
//! )?;
//! let uptime = session.exec("uptime", true)?;
//! println!("{}", uptime.unwrap_or_default());
//! # Ok(())
//! # }
//! ```

mod backend;
mod channel;
mod errors;
mod options;
mod prompt;
mod session;
mod sftp;
mod stream;
mod transport;
mod wait;

pub mod runtime;

#[cfg(test)]
mod fake;

pub use crate::backend::{Ssh2Channel, Ssh2Dir, Ssh2Sftp, Ssh2Transport};
pub use crate::channel::{Captured, Channel, ChannelBuilder};
pub use crate::errors::{
    Error, Result, WireError, WireResult, codes, sftp_status,
};
pub use crate::options::{
    Auth, ConnectOptions, DEFAULT_PORT, PACKET_DEFAULT, PtyOptions,
    WINDOW_DEFAULT,
};
pub use crate::prompt::{SecretPrompt, TerminalPrompt};
pub use crate::session::Session;
pub use crate::sftp::{SftpEntry, SftpSession};
pub use crate::stream::{Delimiter, Lines, Stream};
pub use crate::transport::{
    BlockDirections, ChannelIo, DirEntry, ExtendedData, KeyboardInteractive,
    SftpDirIo, SftpIo, StreamId, Transport,
};
pub use crate::wait::{
    Readiness, SocketWaiter, WAIT_CEILING, WaitOutcome, retry_on_would_block,
};
