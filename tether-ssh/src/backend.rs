//! libssh2 transport built on the `ssh2` crate.

use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::path::Path;

use secrecy::ExposeSecret;
use ssh2::{
    BlockDirections as Ssh2Directions, Channel, Error as SshError, ErrorCode,
    ExtendedData as Ssh2ExtendedData, File, HashType, KeyboardInteractivePrompt,
    Prompt, PtyModes, Session as Ssh2Session, Sftp,
};

use crate::errors::{WireError, WireResult, codes};
use crate::options::{ConnectOptions, PtyOptions};
use crate::transport::{
    BlockDirections, ChannelIo, DirEntry, ExtendedData, KeyboardInteractive,
    SftpDirIo, SftpIo, StreamId, Transport,
};

const DISCONNECT_DESCRIPTION: &str = "closed by client";

/// Transport backed by a libssh2 session.
pub struct Ssh2Transport {
    session: Ssh2Session,
}

impl Transport for Ssh2Transport {
    type Channel = Ssh2Channel;
    type Sftp = Ssh2Sftp;

    fn init(socket: TcpStream, options: &ConnectOptions) -> WireResult<Self> {
        let mut session = Ssh2Session::new().map_err(wire_error)?;
        session.set_tcp_stream(socket);
        session.set_blocking(options.blocking);
        session.set_timeout(options.timeout_ms);
        session.set_compress(options.compress);
        session.set_allow_sigpipe(options.sigpipe);

        Ok(Self { session })
    }

    fn handshake(&self) -> WireResult<()> {
        // The session handle is shared, handshaking a clone drives the same
        // libssh2 session.
        self.session.clone().handshake().map_err(wire_error)
    }

    fn block_directions(&self) -> BlockDirections {
        match self.session.block_directions() {
            Ssh2Directions::None => BlockDirections::None,
            Ssh2Directions::Inbound => BlockDirections::Inbound,
            Ssh2Directions::Outbound => BlockDirections::Outbound,
            Ssh2Directions::Both => BlockDirections::Both,
        }
    }

    fn is_blocking(&self) -> bool {
        self.session.is_blocking()
    }

    fn set_blocking(&self, blocking: bool) {
        self.session.set_blocking(blocking);
    }

    fn timeout(&self) -> u32 {
        self.session.timeout()
    }

    fn set_timeout(&self, timeout_ms: u32) {
        self.session.set_timeout(timeout_ms);
    }

    fn userauth_password(&self, user: &str, password: &str) -> WireResult<()> {
        self.session
            .userauth_password(user, password)
            .map_err(wire_error)
    }

    fn userauth_pubkey_file(
        &self,
        user: &str,
        public_key: Option<&Path>,
        private_key: &Path,
        passphrase: Option<&str>,
    ) -> WireResult<()> {
        self.session
            .userauth_pubkey_file(user, public_key, private_key, passphrase)
            .map_err(wire_error)
    }

    fn userauth_keyboard_interactive(
        &self,
        user: &str,
        responder: &mut dyn KeyboardInteractive,
    ) -> WireResult<()> {
        let mut prompter = PromptAdapter { responder };
        self.session
            .userauth_keyboard_interactive(user, &mut prompter)
            .map_err(wire_error)
    }

    fn userauth_agent(&self, user: &str) -> WireResult<()> {
        self.session
            .userauth_agent(user)
            .map_err(wire_error)
    }

    fn authenticated(&self) -> bool {
        self.session.authenticated()
    }

    fn userauth_list(&self, user: &str) -> WireResult<String> {
        self.session
            .auth_methods(user)
            .map(str::to_owned)
            .map_err(wire_error)
    }

    fn host_key_hash(&self) -> Option<Vec<u8>> {
        self.session.host_key_hash(HashType::Sha1).map(<[u8]>::to_vec)
    }

    fn last_error(&self) -> Option<WireError> {
        SshError::last_session_error(&self.session).map(wire_error)
    }

    fn disconnect(&self) -> WireResult<()> {
        self.session
            .disconnect(None, DISCONNECT_DESCRIPTION, None)
            .map_err(wire_error)
    }

    fn channel_open(
        &self,
        kind: &str,
        window_size: u32,
        packet_size: u32,
        message: Option<&str>,
    ) -> WireResult<Ssh2Channel> {
        self.session
            .channel_open(kind, window_size, packet_size, message)
            .map(|channel| Ssh2Channel { channel })
            .map_err(wire_error)
    }

    fn sftp(&self) -> WireResult<Ssh2Sftp> {
        self.session
            .sftp()
            .map(|sftp| Ssh2Sftp { sftp })
            .map_err(wire_error)
    }
}

/// Open libssh2 channel.
pub struct Ssh2Channel {
    channel: Channel,
}

impl ChannelIo for Ssh2Channel {
    fn handle_extended_data(&mut self, mode: ExtendedData) -> WireResult<()> {
        let mode = match mode {
            ExtendedData::Normal => Ssh2ExtendedData::Normal,
            ExtendedData::Ignore => Ssh2ExtendedData::Ignore,
            ExtendedData::Merge => Ssh2ExtendedData::Merge,
        };
        self.channel.handle_extended_data(mode).map_err(wire_error)
    }

    fn process_startup(
        &mut self,
        request: &str,
        message: Option<&str>,
    ) -> WireResult<()> {
        self.channel
            .process_startup(request, message)
            .map_err(wire_error)
    }

    fn request_pty(&mut self, pty: &PtyOptions) -> WireResult<()> {
        let modes = (!pty.modes.is_empty()).then(|| {
            let mut modes = PtyModes::new();
            for &(opcode, value) in &pty.modes {
                modes.set_u32(opcode, value);
            }
            modes
        });

        self.channel
            .request_pty(
                &pty.term,
                modes,
                Some((
                    pty.chars_wide,
                    pty.chars_high,
                    pty.pixels_wide,
                    pty.pixels_high,
                )),
            )
            .map_err(wire_error)
    }

    fn setenv(&mut self, name: &str, value: &str) -> WireResult<()> {
        self.channel.setenv(name, value).map_err(wire_error)
    }

    fn send_eof(&mut self) -> WireResult<()> {
        self.channel.send_eof().map_err(wire_error)
    }

    fn wait_eof(&mut self) -> WireResult<()> {
        self.channel.wait_eof().map_err(wire_error)
    }

    fn eof(&self) -> WireResult<bool> {
        Ok(self.channel.eof())
    }

    fn close(&mut self) -> WireResult<()> {
        self.channel.close().map_err(wire_error)
    }

    fn wait_close(&mut self) -> WireResult<()> {
        self.channel.wait_close().map_err(wire_error)
    }

    fn exit_status(&self) -> WireResult<i32> {
        self.channel.exit_status().map_err(wire_error)
    }

    fn read(&mut self, stream: StreamId, buf: &mut [u8]) -> WireResult<usize> {
        self.channel
            .stream(stream.as_raw())
            .read(buf)
            .map_err(io_wire_error)
    }

    fn write(&mut self, stream: StreamId, data: &[u8]) -> WireResult<usize> {
        self.channel
            .stream(stream.as_raw())
            .write(data)
            .map_err(io_wire_error)
    }

    fn flush(&mut self, stream: StreamId) -> WireResult<()> {
        self.channel
            .stream(stream.as_raw())
            .flush()
            .map_err(io_wire_error)
    }
}

/// libssh2 SFTP sub-protocol handle.
pub struct Ssh2Sftp {
    sftp: Sftp,
}

impl SftpIo for Ssh2Sftp {
    type Dir = Ssh2Dir;

    fn opendir(&self, path: &Path) -> WireResult<Ssh2Dir> {
        self.sftp
            .opendir(path)
            .map(|dir| Ssh2Dir { dir })
            .map_err(wire_error)
    }
}

/// Open SFTP directory handle.
pub struct Ssh2Dir {
    dir: File,
}

impl SftpDirIo for Ssh2Dir {
    fn readdir(&mut self) -> WireResult<Option<DirEntry>> {
        match self.dir.readdir() {
            Ok((name, stat)) => Ok(Some(DirEntry {
                is_dir: stat.is_dir(),
                name,
                size: stat.size,
                perm: stat.perm,
                mtime: stat.mtime,
            })),
            // libssh2 signals the end of a listing with a FILE error.
            Err(err)
                if matches!(err.code(), ErrorCode::Session(codes::FILE)) =>
            {
                Ok(None)
            },
            Err(err) => Err(wire_error(err)),
        }
    }
}

/// Forwards libssh2 keyboard-interactive prompts to a
/// [`KeyboardInteractive`] responder.
struct PromptAdapter<'a> {
    responder: &'a mut dyn KeyboardInteractive,
}

impl KeyboardInteractivePrompt for PromptAdapter<'_> {
    fn prompt<'p>(
        &mut self,
        _username: &str,
        _instructions: &str,
        prompts: &[Prompt<'p>],
    ) -> Vec<String> {
        let labels: Vec<String> =
            prompts.iter().map(|prompt| prompt.text.to_string()).collect();

        self.responder
            .respond(&labels)
            .iter()
            .map(|answer| answer.expose_secret().to_owned())
            .collect()
    }
}

fn wire_error(err: SshError) -> WireError {
    wire_error_ref(&err)
}

fn wire_error_ref(err: &SshError) -> WireError {
    let code = match err.code() {
        ErrorCode::Session(code) => code,
        ErrorCode::SFTP(code) => code,
    };
    WireError::new(code, err.message())
}

/// Recover the libssh2 code from an error surfaced through `std::io`.
fn io_wire_error(err: io::Error) -> WireError {
    if err.kind() == io::ErrorKind::WouldBlock {
        return WireError::would_block();
    }

    match err.get_ref().and_then(|inner| inner.downcast_ref::<SshError>()) {
        Some(inner) => wire_error_ref(inner),
        None => {
            let code = match err.kind() {
                io::ErrorKind::TimedOut => codes::TIMEOUT,
                io::ErrorKind::ConnectionReset
                | io::ErrorKind::ConnectionAborted
                | io::ErrorKind::BrokenPipe
                | io::ErrorKind::UnexpectedEof => codes::SOCKET_DISCONNECT,
                _ => codes::SOCKET_RECV,
            };
            WireError::new(code, err.to_string())
        },
    }
}
