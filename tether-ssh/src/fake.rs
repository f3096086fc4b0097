//! Scripted in-memory transport and waiter used by unit tests.

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::io;
use std::net::TcpStream;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use secrecy::SecretString;

use crate::errors::{WireError, WireResult, codes};
use crate::options::{ConnectOptions, PtyOptions};
use crate::session::Session;
use crate::transport::{
    BlockDirections, ChannelIo, DirEntry, ExtendedData, KeyboardInteractive,
    SftpDirIo, SftpIo, StreamId, Transport,
};
use crate::wait::{Readiness, WaitOutcome};

pub(crate) type Wire = Rc<RefCell<FakeWire>>;

thread_local! {
    static INSTALLED: RefCell<Option<Wire>> = const { RefCell::new(None) };
}

/// Server behaviour and recorded client calls.
#[derive(Default)]
pub(crate) struct FakeWire {
    pub handshake_blocks: usize,
    pub handshake_error: Option<WireError>,
    pub auth_blocks: usize,
    pub auth_error: Option<WireError>,
    pub authenticated: bool,
    pub methods: String,
    pub host_key: Option<Vec<u8>>,
    pub last_error: Option<WireError>,
    pub disconnect_blocks: usize,
    pub disconnects: usize,
    pub open_blocks: usize,
    pub open_error: Option<WireError>,
    pub request_errors: HashMap<String, WireError>,
    pub read_blocks: usize,
    /// Would-blocks scripted per channel primitive, keyed by call name
    /// (`extended`, `startup`, `pty`, `env`, `send_eof`, `wait_eof`, `close`,
    /// `wait_close`, `write`, `flush`).
    pub channel_blocks: HashMap<&'static str, usize>,
    pub write_error: Option<WireError>,
    /// Upper bound for bytes returned by one read, `0` for no bound.
    pub read_chunk: usize,
    /// Upper bound for bytes accepted by one write, `0` for no bound.
    pub write_chunk: usize,
    pub stdout: VecDeque<u8>,
    pub stderr: VecDeque<u8>,
    pub written: Vec<(StreamId, Vec<u8>)>,
    pub exit_status: i32,
    pub eof_sent: bool,
    pub eof_waited: bool,
    pub calls: Vec<String>,
    pub blocking: bool,
    pub timeout_ms: u32,
    pub init_options: Option<ConnectOptions>,
    pub interactive_answers: Vec<String>,
    pub directories: HashMap<PathBuf, Vec<DirEntry>>,
    pub sftp_error: Option<WireError>,
}

impl FakeWire {
    pub fn shared() -> Wire {
        Rc::new(RefCell::new(FakeWire {
            blocking: true,
            methods: String::from("publickey,password"),
            ..FakeWire::default()
        }))
    }

    pub fn deny(&mut self, request: &str) {
        self.request_errors.insert(
            request.to_owned(),
            WireError::new(codes::CHANNEL_REQUEST_DENIED, "request denied"),
        );
    }

    pub fn with_stdout(&mut self, data: &[u8]) {
        self.stdout.extend(data);
    }

    pub fn with_stderr(&mut self, data: &[u8]) {
        self.stderr.extend(data);
    }

    /// Make the channel primitive `call` report would-block `times` times.
    pub fn block_channel(&mut self, call: &'static str, times: usize) {
        self.channel_blocks.insert(call, times);
    }

    pub fn called(&self, call: &str) -> bool {
        self.calls.iter().any(|recorded| recorded == call)
    }

    fn record(&mut self, call: impl Into<String>) {
        self.calls.push(call.into());
    }
}

fn with_message(call: String, message: Option<&str>) -> String {
    match message {
        Some(message) => format!("{call} {message}"),
        None => call,
    }
}

/// Consume one scripted would-block, if any remain.
fn block(counter: &mut usize) -> WireResult<()> {
    if *counter > 0 {
        *counter -= 1;
        return Err(WireError::would_block());
    }
    Ok(())
}

fn block_channel(wire: &mut FakeWire, call: &str) -> WireResult<()> {
    match wire.channel_blocks.get_mut(call) {
        Some(counter) => block(counter),
        None => Ok(()),
    }
}

pub(crate) struct FakeTransport {
    wire: Wire,
}

impl FakeTransport {
    pub fn new(wire: Wire) -> Self {
        Self { wire }
    }

    /// Make the next [`Transport::init`] on this thread use `wire`.
    pub fn install(wire: Wire) {
        INSTALLED.with(|slot| *slot.borrow_mut() = Some(wire));
    }
}

impl Transport for FakeTransport {
    type Channel = FakeChannel;
    type Sftp = FakeSftp;

    fn init(_socket: TcpStream, options: &ConnectOptions) -> WireResult<Self> {
        let wire = INSTALLED
            .with(|slot| slot.borrow_mut().take())
            .unwrap_or_else(FakeWire::shared);
        {
            let mut state = wire.borrow_mut();
            state.blocking = options.blocking;
            state.timeout_ms = options.timeout_ms;
            state.init_options = Some(options.clone());
        }
        Ok(Self { wire })
    }

    fn handshake(&self) -> WireResult<()> {
        let mut wire = self.wire.borrow_mut();
        block(&mut wire.handshake_blocks)?;
        wire.record("handshake");
        wire.handshake_error.clone().map_or(Ok(()), Err)
    }

    fn block_directions(&self) -> BlockDirections {
        BlockDirections::Inbound
    }

    fn is_blocking(&self) -> bool {
        self.wire.borrow().blocking
    }

    fn set_blocking(&self, blocking: bool) {
        self.wire.borrow_mut().blocking = blocking;
    }

    fn timeout(&self) -> u32 {
        self.wire.borrow().timeout_ms
    }

    fn set_timeout(&self, timeout_ms: u32) {
        self.wire.borrow_mut().timeout_ms = timeout_ms;
    }

    fn userauth_password(&self, user: &str, password: &str) -> WireResult<()> {
        self.authenticate(format!("password {user} {password}"))
    }

    fn userauth_pubkey_file(
        &self,
        user: &str,
        public_key: Option<&Path>,
        private_key: &Path,
        passphrase: Option<&str>,
    ) -> WireResult<()> {
        self.authenticate(format!(
            "publickey {user} {} {} {}",
            public_key.map(|p| p.display().to_string()).unwrap_or_default(),
            private_key.display(),
            passphrase.unwrap_or_default(),
        ))
    }

    fn userauth_keyboard_interactive(
        &self,
        user: &str,
        responder: &mut dyn KeyboardInteractive,
    ) -> WireResult<()> {
        let answers = responder.respond(&[String::from("Password: ")]);
        {
            use secrecy::ExposeSecret;

            let mut wire = self.wire.borrow_mut();
            wire.interactive_answers = answers
                .iter()
                .map(|answer| answer.expose_secret().to_owned())
                .collect();
        }
        self.authenticate(format!("keyboard-interactive {user}"))
    }

    fn userauth_agent(&self, user: &str) -> WireResult<()> {
        self.authenticate(format!("agent {user}"))
    }

    fn authenticated(&self) -> bool {
        self.wire.borrow().authenticated
    }

    fn userauth_list(&self, _user: &str) -> WireResult<String> {
        Ok(self.wire.borrow().methods.clone())
    }

    fn host_key_hash(&self) -> Option<Vec<u8>> {
        self.wire.borrow().host_key.clone()
    }

    fn last_error(&self) -> Option<WireError> {
        self.wire.borrow().last_error.clone()
    }

    fn disconnect(&self) -> WireResult<()> {
        let mut wire = self.wire.borrow_mut();
        block(&mut wire.disconnect_blocks)?;
        wire.disconnects += 1;
        wire.record("disconnect");
        Ok(())
    }

    fn channel_open(
        &self,
        kind: &str,
        window_size: u32,
        packet_size: u32,
        message: Option<&str>,
    ) -> WireResult<FakeChannel> {
        let mut wire = self.wire.borrow_mut();
        block(&mut wire.open_blocks)?;
        wire.record(with_message(
            format!("open {kind} {window_size} {packet_size}"),
            message,
        ));
        if let Some(err) = wire.open_error.clone() {
            return Err(err);
        }
        Ok(FakeChannel {
            wire: Rc::clone(&self.wire),
        })
    }

    fn sftp(&self) -> WireResult<FakeSftp> {
        let mut wire = self.wire.borrow_mut();
        wire.record("sftp");
        if let Some(err) = wire.sftp_error.clone() {
            return Err(err);
        }
        Ok(FakeSftp {
            wire: Rc::clone(&self.wire),
        })
    }
}

impl FakeTransport {
    fn authenticate(&self, call: String) -> WireResult<()> {
        let mut wire = self.wire.borrow_mut();
        block(&mut wire.auth_blocks)?;
        wire.record(call);
        if let Some(err) = wire.auth_error.clone() {
            wire.last_error = Some(err.clone());
            return Err(err);
        }
        wire.authenticated = true;
        Ok(())
    }
}

pub(crate) struct FakeChannel {
    wire: Wire,
}

impl FakeChannel {
    fn startup_result(&self, request: &str) -> WireResult<()> {
        self.wire
            .borrow()
            .request_errors
            .get(request)
            .cloned()
            .map_or(Ok(()), Err)
    }
}

impl Drop for FakeChannel {
    fn drop(&mut self) {
        self.wire.borrow_mut().record("free channel");
    }
}

impl ChannelIo for FakeChannel {
    fn handle_extended_data(&mut self, mode: ExtendedData) -> WireResult<()> {
        let mut wire = self.wire.borrow_mut();
        block_channel(&mut wire, "extended")?;
        wire.record(format!("extended {mode:?}"));
        Ok(())
    }

    fn process_startup(
        &mut self,
        request: &str,
        message: Option<&str>,
    ) -> WireResult<()> {
        {
            let mut wire = self.wire.borrow_mut();
            block_channel(&mut wire, "startup")?;
            wire.record(with_message(request.to_owned(), message));
        }
        self.startup_result(request)
    }

    fn request_pty(&mut self, pty: &PtyOptions) -> WireResult<()> {
        {
            let mut wire = self.wire.borrow_mut();
            block_channel(&mut wire, "pty")?;
            wire.record(format!(
                "pty {} {}x{}",
                pty.term, pty.chars_wide, pty.chars_high
            ));
        }
        self.startup_result("pty-req")
    }

    fn setenv(&mut self, name: &str, value: &str) -> WireResult<()> {
        {
            let mut wire = self.wire.borrow_mut();
            block_channel(&mut wire, "env")?;
            wire.record(format!("env {name}={value}"));
        }
        self.startup_result("env")
    }

    fn send_eof(&mut self) -> WireResult<()> {
        let mut wire = self.wire.borrow_mut();
        block_channel(&mut wire, "send_eof")?;
        wire.eof_sent = true;
        wire.record("send_eof");
        Ok(())
    }

    fn wait_eof(&mut self) -> WireResult<()> {
        let mut wire = self.wire.borrow_mut();
        block_channel(&mut wire, "wait_eof")?;
        wire.eof_waited = true;
        wire.record("wait_eof");
        Ok(())
    }

    fn eof(&self) -> WireResult<bool> {
        let wire = self.wire.borrow();
        Ok(wire.stdout.is_empty() && wire.stderr.is_empty())
    }

    fn close(&mut self) -> WireResult<()> {
        let mut wire = self.wire.borrow_mut();
        block_channel(&mut wire, "close")?;
        wire.record("close");
        Ok(())
    }

    /// Like libssh2, waiting for the close requires the peer's EOF first.
    fn wait_close(&mut self) -> WireResult<()> {
        let mut wire = self.wire.borrow_mut();
        if !wire.eof_waited {
            return Err(WireError::new(
                codes::INVAL,
                "channel not in EOF state",
            ));
        }
        block_channel(&mut wire, "wait_close")?;
        wire.record("wait_close");
        Ok(())
    }

    fn exit_status(&self) -> WireResult<i32> {
        Ok(self.wire.borrow().exit_status)
    }

    fn read(&mut self, stream: StreamId, buf: &mut [u8]) -> WireResult<usize> {
        let mut guard = self.wire.borrow_mut();
        let wire = &mut *guard;
        block(&mut wire.read_blocks)?;

        let source = match stream {
            StreamId::Stdio => &mut wire.stdout,
            StreamId::Stderr => &mut wire.stderr,
        };
        let mut n = buf.len().min(source.len());
        if wire.read_chunk > 0 {
            n = n.min(wire.read_chunk);
        }
        for (slot, byte) in buf.iter_mut().zip(source.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }

    fn write(&mut self, stream: StreamId, data: &[u8]) -> WireResult<usize> {
        let mut wire = self.wire.borrow_mut();
        block_channel(&mut wire, "write")?;
        if let Some(err) = wire.write_error.clone() {
            return Err(err);
        }
        let n = match wire.write_chunk {
            0 => data.len(),
            chunk => data.len().min(chunk),
        };
        wire.written.push((stream, data[..n].to_vec()));
        Ok(n)
    }

    fn flush(&mut self, stream: StreamId) -> WireResult<()> {
        let mut wire = self.wire.borrow_mut();
        block_channel(&mut wire, "flush")?;
        wire.record(format!("flush {stream:?}"));
        Ok(())
    }
}

pub(crate) struct FakeSftp {
    wire: Wire,
}

impl SftpIo for FakeSftp {
    type Dir = FakeDir;

    fn opendir(&self, path: &Path) -> WireResult<FakeDir> {
        let wire = self.wire.borrow();
        match wire.directories.get(path) {
            Some(entries) => Ok(FakeDir {
                entries: entries.iter().cloned().collect(),
            }),
            None => Err(WireError::new(
                crate::errors::sftp_status::NO_SUCH_FILE,
                "no such file",
            )),
        }
    }
}

pub(crate) struct FakeDir {
    entries: VecDeque<DirEntry>,
}

impl SftpDirIo for FakeDir {
    fn readdir(&mut self) -> WireResult<Option<DirEntry>> {
        Ok(self.entries.pop_front())
    }
}

pub(crate) fn dir_entry(name: &str, is_dir: bool) -> DirEntry {
    DirEntry {
        name: PathBuf::from(name),
        size: Some(if is_dir { 4096 } else { 12 }),
        perm: Some(if is_dir { 0o040755 } else { 0o100644 }),
        mtime: Some(1_700_000_000),
        is_dir,
    }
}

/// Waiter that only counts how often it was asked to wait.
#[derive(Default)]
pub(crate) struct CountingWaiter {
    waits: Rc<Cell<usize>>,
    last: Rc<Cell<Option<BlockDirections>>>,
    time_out: bool,
}

impl CountingWaiter {
    pub fn timing_out() -> Self {
        Self {
            time_out: true,
            ..Self::default()
        }
    }

    pub fn waits(&self) -> usize {
        self.waits.get()
    }

    pub fn last_directions(&self) -> Option<BlockDirections> {
        self.last.get()
    }

    /// A second view sharing the counters, for waiters moved into a session.
    pub fn observer(&self) -> Self {
        Self {
            waits: Rc::clone(&self.waits),
            last: Rc::clone(&self.last),
            time_out: self.time_out,
        }
    }
}

impl Readiness for CountingWaiter {
    fn wait(&mut self, directions: BlockDirections) -> io::Result<WaitOutcome> {
        self.waits.set(self.waits.get() + 1);
        self.last.set(Some(directions));
        if self.time_out {
            Ok(WaitOutcome::TimedOut)
        } else {
            Ok(WaitOutcome::Ready)
        }
    }
}

/// Prompt answering every label with the same secret.
pub(crate) fn fixed_prompt(
    answer: &'static str,
) -> impl FnMut(&str) -> io::Result<SecretString> {
    move |_| Ok(SecretString::from(answer.to_owned()))
}

/// Session connected over `wire` without touching the network.
pub(crate) fn connected(wire: &Wire) -> Session<FakeTransport> {
    let session = Session::new();
    session
        .establish(
            "fake-host",
            FakeTransport::new(Rc::clone(wire)),
            Box::new(CountingWaiter::default()),
        )
        .expect("fake handshake should succeed");
    session
}

/// Connected and authenticated session over `wire`.
pub(crate) fn logged_in(wire: &Wire) -> Session<FakeTransport> {
    let session = connected(wire);
    session
        .login("deploy", &crate::options::Auth::password("secret"))
        .expect("fake login should succeed");
    session
}

/// Like [`logged_in`], plus a view of the waiter the session owns.
pub(crate) fn logged_in_observed(
    wire: &Wire,
) -> (Session<FakeTransport>, CountingWaiter) {
    let waiter = CountingWaiter::default();
    let observer = waiter.observer();
    let session = Session::new();
    session
        .establish(
            "fake-host",
            FakeTransport::new(Rc::clone(wire)),
            Box::new(waiter),
        )
        .expect("fake handshake should succeed");
    session
        .login("deploy", &crate::options::Auth::password("secret"))
        .expect("fake login should succeed");
    (session, observer)
}
