//! SSH session: one socket, one transport, and the connect / login lifecycle.

use std::cell::{Cell, RefCell};
use std::fmt::Write as _;
use std::io;
use std::net::{TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::rc::{Rc, Weak};
use std::time::Duration;

use secrecy::ExposeSecret;

use crate::backend::Ssh2Transport;
use crate::channel::{Channel, ChannelBuilder, ChannelInner};
use crate::errors::{Error, Result, WireError, WireResult};
use crate::options::{Auth, ConnectOptions};
use crate::prompt::{PromptResponder, SecretPrompt, TerminalPrompt};
use crate::transport::Transport;
use crate::wait::{Readiness, SocketWaiter, retry_on_would_block};

type CloseCallback = Box<dyn FnOnce(&str)>;

/// Blocking-style SSH session.
///
/// Channels opened against a session only hold weak references to it; once
/// the session is closed or dropped they report themselves closed.
pub struct Session<T: Transport = Ssh2Transport> {
    shared: Rc<Shared<T>>,
}

pub(crate) struct Shared<T: Transport> {
    state: RefCell<SessionState<T>>,
    generation: Cell<u64>,
    prompt: RefCell<Box<dyn SecretPrompt>>,
    on_close: RefCell<Vec<CloseCallback>>,
    channels: RefCell<Vec<Weak<ChannelInner<T>>>>,
}

struct SessionState<T: Transport> {
    connection: Option<Connection<T>>,
    host: Option<String>,
}

/// Transport and socket of a live connection. Both exist together or not at
/// all; the transport is declared first so it is freed before the socket.
pub(crate) struct Connection<T: Transport> {
    pub(crate) transport: T,
    waiter: Box<dyn Readiness>,
}

impl<T: Transport> Connection<T> {
    /// Run a transport primitive until it stops reporting would-block.
    pub(crate) fn retry<R>(
        &mut self,
        mut op: impl FnMut(&T) -> WireResult<R>,
    ) -> Result<R> {
        let Connection { transport, waiter } = self;
        let transport = &*transport;
        retry_on_would_block(
            || op(transport),
            || transport.block_directions(),
            waiter.as_mut(),
        )
    }
}

impl<T: Transport> Shared<T> {
    /// Current connection generation, `None` while disconnected.
    pub(crate) fn live_generation(&self) -> Option<u64> {
        self.state
            .borrow()
            .connection
            .is_some()
            .then(|| self.generation.get())
    }

    pub(crate) fn with_connection<R>(
        &self,
        f: impl FnOnce(&mut Connection<T>) -> Result<R>,
    ) -> Result<R> {
        let mut state = self.state.borrow_mut();
        let connection = state.connection.as_mut().ok_or(Error::NotConnected)?;
        f(connection)
    }

    pub(crate) fn track(&self, channel: &Rc<ChannelInner<T>>) {
        let mut channels = self.channels.borrow_mut();
        channels.retain(|tracked| tracked.strong_count() > 0);
        channels.push(Rc::downgrade(channel));
    }

    fn close(&self) -> Result<()> {
        let callbacks = std::mem::take(&mut *self.on_close.borrow_mut());
        if !callbacks.is_empty() {
            let host = self.state.borrow().host.clone().unwrap_or_default();
            for callback in callbacks {
                callback(&host);
            }
        }

        // Channel handles go before the transport they were opened on.
        for channel in self.channels.take() {
            if let Some(channel) = channel.upgrade() {
                channel.release();
            }
        }

        let Some(mut connection) = self.state.borrow_mut().connection.take()
        else {
            return Ok(());
        };

        let result = match connection.retry(T::disconnect) {
            Err(err) if err.is_disconnect() => Ok(()),
            other => other,
        };
        drop(connection);

        if let Some(host) = self.state.borrow_mut().host.take() {
            log::info!("ssh session to {host} closed");
        }
        result
    }
}

impl<T: Transport> Drop for Shared<T> {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            log::warn!("ssh session teardown failed: {err}");
        }
    }
}

impl<T: Transport> Default for Session<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Transport> Session<T> {
    /// Create a disconnected session.
    pub fn new() -> Self {
        Self {
            shared: Rc::new(Shared {
                state: RefCell::new(SessionState {
                    connection: None,
                    host: None,
                }),
                generation: Cell::new(0),
                prompt: RefCell::new(Box::new(TerminalPrompt)),
                on_close: RefCell::new(Vec::new()),
                channels: RefCell::new(Vec::new()),
            }),
        }
    }

    /// Connect and, when credentials are given, log in.
    pub fn start(
        host: &str,
        port: u16,
        options: &ConnectOptions,
        login: Option<(&str, &Auth)>,
    ) -> Result<Self> {
        let session = Self::new();
        session.connect(host, port, options)?;
        if let Some((user, auth)) = login {
            session.login(user, auth)?;
        }
        Ok(session)
    }

    /// Open a socket to `host:port` and drive the SSH handshake.
    ///
    /// On failure the session is left disconnected and can be connected
    /// again.
    pub fn connect(
        &self,
        host: &str,
        port: u16,
        options: &ConnectOptions,
    ) -> Result<()> {
        if self.is_connected() {
            return Err(Error::AlreadyConnected);
        }

        let socket = open_socket(host, port)?;
        let connect_error = |source: io::Error| Error::Connect {
            host: format!("{host}:{port}"),
            source,
        };
        let transport_socket = socket.try_clone().map_err(connect_error)?;
        let waiter = SocketWaiter::new(socket).map_err(connect_error)?;
        let transport = T::init(transport_socket, options)?;

        self.establish(host, transport, Box::new(waiter))
    }

    /// Drive the handshake over an initialised transport and install it.
    pub(crate) fn establish(
        &self,
        host: &str,
        transport: T,
        waiter: Box<dyn Readiness>,
    ) -> Result<()> {
        if self.is_connected() {
            return Err(Error::AlreadyConnected);
        }

        let mut connection = Connection { transport, waiter };
        // A failed handshake drops the transport and then the socket.
        connection.retry(T::handshake)?;

        let mut state = self.shared.state.borrow_mut();
        state.connection = Some(connection);
        state.host = Some(host.to_owned());
        self.shared.generation.set(self.shared.generation.get() + 1);

        log::info!("ssh session established with {host}");
        Ok(())
    }

    /// Authenticate `user` with exactly one strategy.
    ///
    /// A socket disconnect during authentication closes the session before
    /// the error is returned.
    pub fn login(&self, user: &str, auth: &Auth) -> Result<()> {
        let result = self.shared.with_connection(|connection| match auth {
            Auth::Agent => connection.retry(|t| t.userauth_agent(user)),
            Auth::PublicKey {
                private_key,
                passphrase,
            } => {
                let public_key = public_key_path(private_key);
                let passphrase = passphrase.as_ref().map(|p| p.expose_secret());
                connection.retry(|t| {
                    t.userauth_pubkey_file(
                        user,
                        Some(&public_key),
                        private_key,
                        passphrase,
                    )
                })
            },
            Auth::Password(password) => connection
                .retry(|t| t.userauth_password(user, password.expose_secret())),
            Auth::Interactive => {
                let mut prompt = self.shared.prompt.borrow_mut();
                let mut responder = PromptResponder::new(prompt.as_mut());
                connection.retry(|t| {
                    t.userauth_keyboard_interactive(user, &mut responder)
                })
            },
        });

        match result {
            Ok(()) => {
                log::info!("ssh login as {user} succeeded ({})", auth.method());
                Ok(())
            },
            Err(err) if err.is_disconnect() => {
                if let Err(close_err) = self.close() {
                    log::warn!("closing after disconnect failed: {close_err}");
                }
                Err(err)
            },
            Err(err) => Err(err),
        }
    }

    /// Whether the transport reports a completed authentication.
    pub fn logged_in(&self) -> bool {
        self.shared
            .with_connection(|connection| {
                Ok(connection.transport.authenticated())
            })
            .unwrap_or(false)
    }

    /// Disconnect gracefully and release the transport and socket.
    /// Calling it again is a no-op.
    pub fn close(&self) -> Result<()> {
        self.shared.close()
    }

    /// Register a callback run once at the start of the next [`close`].
    ///
    /// [`close`]: Session::close
    pub fn on_close(&self, callback: impl FnOnce(&str) + 'static) {
        self.shared.on_close.borrow_mut().push(Box::new(callback));
    }

    /// Replace the prompt used for keyboard-interactive authentication.
    pub fn set_prompt(&self, prompt: impl SecretPrompt + 'static) {
        *self.shared.prompt.borrow_mut() = Box::new(prompt);
    }

    pub fn is_connected(&self) -> bool {
        self.shared.live_generation().is_some()
    }

    pub fn is_closed(&self) -> bool {
        !self.is_connected()
    }

    /// Host name of the live connection, `None` once closed.
    pub fn host(&self) -> Option<String> {
        self.shared.state.borrow().host.clone()
    }

    /// SHA-1 fingerprint of the server host key as twenty space separated
    /// uppercase hex pairs, `None` when the transport has no host key.
    pub fn fingerprint(&self) -> Result<Option<String>> {
        self.shared.with_connection(|connection| {
            Ok(connection
                .transport
                .host_key_hash()
                .map(|digest| format_fingerprint(&digest)))
        })
    }

    /// Message of the last transport error, empty when there is none.
    pub fn last_error(&self) -> Result<String> {
        self.last_wire_error()
            .map(|err| err.map(|err| err.message().to_owned()))
            .map(Option::unwrap_or_default)
    }

    /// Code of the last transport error, `0` when there is none.
    pub fn last_errno(&self) -> Result<i32> {
        self.last_wire_error()
            .map(|err| err.map_or(0, |err| err.code()))
    }

    pub(crate) fn last_wire_error(&self) -> Result<Option<WireError>> {
        self.shared
            .with_connection(|connection| Ok(connection.transport.last_error()))
    }

    /// Comma separated auth methods the server accepts for `user`.
    pub fn userauth_list(&self, user: &str) -> Result<String> {
        self.shared
            .with_connection(|connection| {
                connection.retry(|t| t.userauth_list(user))
            })
    }

    /// Auth methods accepted for `user`; empty once authenticated.
    pub fn userauth_methods(&self, user: &str) -> Result<Vec<String>> {
        if self.logged_in() {
            return Ok(Vec::new());
        }

        let list = self.userauth_list(user)?;
        Ok(list
            .split(',')
            .map(str::trim)
            .filter(|method| !method.is_empty())
            .map(str::to_owned)
            .collect())
    }

    pub fn userauth_method_supported(
        &self,
        user: &str,
        method: &str,
    ) -> Result<bool> {
        Ok(self
            .userauth_methods(user)?
            .iter()
            .any(|supported| supported == method))
    }

    pub fn blocking(&self) -> Result<bool> {
        self.shared
            .with_connection(|connection| {
                Ok(connection.transport.is_blocking())
            })
    }

    pub fn set_blocking(&self, blocking: bool) -> Result<()> {
        self.shared.with_connection(|connection| {
            connection.transport.set_blocking(blocking);
            Ok(())
        })
    }

    /// Transport timeout, zero when disabled.
    pub fn timeout(&self) -> Result<Duration> {
        self.shared.with_connection(|connection| {
            Ok(Duration::from_millis(u64::from(
                connection.transport.timeout(),
            )))
        })
    }

    pub fn set_timeout(&self, timeout: Duration) -> Result<()> {
        let timeout_ms = u32::try_from(timeout.as_millis()).unwrap_or(u32::MAX);
        self.shared.with_connection(|connection| {
            connection.transport.set_timeout(timeout_ms);
            Ok(())
        })
    }

    /// Builder for a channel of a custom type or window.
    pub fn channel(&self) -> ChannelBuilder<T> {
        ChannelBuilder::new(self)
    }

    /// Open a default `session` channel.
    pub fn open_channel(&self) -> Result<Channel<T>> {
        self.channel().open(None)
    }

    /// Run `command` on a fresh channel and return its standard output.
    pub fn exec(&self, command: &str, chomp: bool) -> Result<Option<String>> {
        let channel = self.open_channel()?;
        let output = channel.exec(command, chomp);
        let closed = channel.close(false);
        let output = output?;
        closed?;
        Ok(output)
    }

    pub(crate) fn shared(&self) -> &Rc<Shared<T>> {
        &self.shared
    }
}

/// Resolve `host` and connect to the first address that accepts.
fn open_socket(host: &str, port: u16) -> Result<TcpStream> {
    let connect_error = |source: io::Error| Error::Connect {
        host: format!("{host}:{port}"),
        source,
    };

    let mut last_error = None;
    for addr in (host, port).to_socket_addrs().map_err(connect_error)? {
        match TcpStream::connect(addr) {
            Ok(socket) => {
                socket.set_nodelay(true).map_err(connect_error)?;
                return Ok(socket);
            },
            Err(err) => {
                log::debug!("connect to {addr} failed: {err}");
                last_error = Some(err);
            },
        }
    }

    Err(connect_error(last_error.unwrap_or_else(|| {
        io::Error::new(io::ErrorKind::NotFound, "host resolved to no addresses")
    })))
}

fn public_key_path(private_key: &Path) -> PathBuf {
    let mut path = private_key.as_os_str().to_owned();
    path.push(".pub");
    PathBuf::from(path)
}

fn format_fingerprint(digest: &[u8]) -> String {
    let mut out = String::with_capacity(digest.len() * 3);
    for (i, byte) in digest.iter().enumerate() {
        if i > 0 {
            out.push(' ');
        }
        let _ = write!(out, "{byte:02X}");
    }
    out
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::net::TcpListener;
    use std::path::Path;
    use std::rc::Rc;

    use super::*;
    use crate::errors::codes;
    use crate::fake::{
        CountingWaiter, FakeTransport, FakeWire, connected, fixed_prompt,
        logged_in,
    };

    #[test]
    fn connect_over_loopback_installs_transport_and_close_clears_it() {
        let listener =
            TcpListener::bind("127.0.0.1:0").expect("bind loopback listener");
        let port = listener.local_addr().expect("listener address").port();
        let wire = FakeWire::shared();
        FakeTransport::install(Rc::clone(&wire));

        let session = Session::<FakeTransport>::new();
        let options = ConnectOptions::default().with_compress(true);
        session
            .connect("127.0.0.1", port, &options)
            .expect("connect should succeed");

        assert!(session.is_connected());
        assert_eq!(session.host().as_deref(), Some("127.0.0.1"));
        assert_eq!(wire.borrow().init_options, Some(options));

        session.close().expect("close should succeed");
        assert!(session.is_closed());
        assert_eq!(session.host(), None);
        assert_eq!(wire.borrow().disconnects, 1);
        assert!(matches!(session.fingerprint(), Err(Error::NotConnected)));
    }

    #[test]
    fn connect_refused_leaves_session_disconnected() {
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0")
                .expect("bind loopback listener");
            listener.local_addr().expect("listener address").port()
        };

        let session = Session::<FakeTransport>::new();
        let err = session
            .connect("127.0.0.1", port, &ConnectOptions::default())
            .expect_err("nobody listens on the port");

        assert!(matches!(err, Error::Connect { .. }));
        assert!(session.is_closed());
        assert_eq!(session.host(), None);
    }

    #[test]
    fn connecting_twice_is_rejected() {
        let wire = FakeWire::shared();
        let session = connected(&wire);

        let err = session
            .establish(
                "again",
                FakeTransport::new(FakeWire::shared()),
                Box::new(CountingWaiter::default()),
            )
            .expect_err("second connect should fail");

        assert!(matches!(err, Error::AlreadyConnected));
        assert_eq!(session.host().as_deref(), Some("fake-host"));
    }

    #[test]
    fn handshake_retries_through_would_block() {
        let wire = FakeWire::shared();
        wire.borrow_mut().handshake_blocks = 2;
        let waiter = CountingWaiter::default();
        let observer = waiter.observer();

        let session = Session::new();
        session
            .establish(
                "h",
                FakeTransport::new(Rc::clone(&wire)),
                Box::new(waiter),
            )
            .expect("handshake should succeed");

        assert_eq!(observer.waits(), 2);
        assert!(session.is_connected());
    }

    #[test]
    fn failed_handshake_keeps_session_disconnected() {
        let wire = FakeWire::shared();
        wire.borrow_mut().handshake_error =
            Some(WireError::new(codes::KEX_FAILURE, "no common kex"));

        let session = Session::new();
        let err = session
            .establish(
                "h",
                FakeTransport::new(Rc::clone(&wire)),
                Box::new(CountingWaiter::default()),
            )
            .expect_err("handshake should fail");

        assert!(matches!(err, Error::HostKey(_)));
        assert!(session.is_closed());
        assert_eq!(wire.borrow().disconnects, 0);
    }

    #[test]
    fn close_is_idempotent_and_reconnect_works() {
        let wire = FakeWire::shared();
        let session = connected(&wire);

        session.close().expect("first close");
        session.close().expect("second close");
        assert_eq!(wire.borrow().disconnects, 1);

        session
            .establish(
                "again",
                FakeTransport::new(Rc::clone(&wire)),
                Box::new(CountingWaiter::default()),
            )
            .expect("reconnect should succeed");
        assert!(session.is_connected());
    }

    #[test]
    fn close_forgets_the_host() {
        let wire = FakeWire::shared();
        let session = connected(&wire);
        assert_eq!(session.host().as_deref(), Some("fake-host"));

        session.close().expect("close");

        assert_eq!(session.host(), None);
    }

    #[test]
    fn disconnect_retries_through_would_block() {
        let wire = FakeWire::shared();
        wire.borrow_mut().disconnect_blocks = 3;
        let waiter = CountingWaiter::default();
        let observer = waiter.observer();
        let session = Session::new();
        session
            .establish(
                "h",
                FakeTransport::new(Rc::clone(&wire)),
                Box::new(waiter),
            )
            .expect("handshake should succeed");

        session.close().expect("close should succeed");

        assert_eq!(observer.waits(), 3);
        assert_eq!(wire.borrow().disconnects, 1);
        assert!(session.is_closed());
    }

    #[test]
    fn dropping_session_disconnects_once() {
        let wire = FakeWire::shared();
        let session = connected(&wire);

        drop(session);

        assert_eq!(wire.borrow().disconnects, 1);
    }

    #[test]
    fn login_requires_connection() {
        let session = Session::<FakeTransport>::new();

        let err = session
            .login("u", &Auth::password("p"))
            .expect_err("login without connect should fail");

        assert!(matches!(err, Error::NotConnected));
        assert!(!session.logged_in());
    }

    #[test]
    fn public_key_login_uses_pub_suffix() {
        let wire = FakeWire::shared();
        let session = connected(&wire);

        session
            .login(
                "deploy",
                &Auth::public_key("/keys/id_ed25519", Some("phrase".into())),
            )
            .expect("key login should succeed");

        assert!(session.logged_in());
        assert!(wire.borrow().called(
            "publickey deploy /keys/id_ed25519.pub /keys/id_ed25519 phrase"
        ));
    }

    #[test]
    fn login_dispatches_to_exactly_one_strategy() {
        let wire = FakeWire::shared();
        let session = connected(&wire);

        session.login("deploy", &Auth::Agent).expect("agent login");

        assert_eq!(wire.borrow().calls, vec!["handshake", "agent deploy"]);
    }

    #[test]
    fn interactive_login_answers_with_the_prompt() {
        let wire = FakeWire::shared();
        let session = connected(&wire);
        session.set_prompt(fixed_prompt("s3cret"));

        session
            .login("deploy", &Auth::Interactive)
            .expect("interactive login should succeed");

        assert_eq!(wire.borrow().interactive_answers, vec!["s3cret"]);
    }

    #[test]
    fn login_retries_through_would_block() {
        let wire = FakeWire::shared();
        wire.borrow_mut().auth_blocks = 3;
        let session = connected(&wire);

        session
            .login("deploy", &Auth::password("pw"))
            .expect("login should succeed");

        assert!(session.logged_in());
    }

    #[test]
    fn rejected_login_keeps_connection() {
        let wire = FakeWire::shared();
        wire.borrow_mut().auth_error = Some(WireError::new(
            codes::AUTHENTICATION_FAILED,
            "Authentication failed (username/password)",
        ));
        let session = connected(&wire);

        let err = session
            .login("deploy", &Auth::password("wrong"))
            .expect_err("login should fail");

        assert!(matches!(err, Error::AuthenticationFailed(_)));
        assert_eq!(err.code(), Some(codes::AUTHENTICATION_FAILED));
        assert!(session.is_connected());
        assert!(!session.logged_in());
        assert_eq!(
            session.last_error().expect("connected"),
            "Authentication failed (username/password)"
        );
        assert_eq!(
            session.last_errno().expect("connected"),
            codes::AUTHENTICATION_FAILED
        );
    }

    #[test]
    fn disconnect_during_login_closes_session_first() {
        let wire = FakeWire::shared();
        wire.borrow_mut().auth_error =
            Some(WireError::new(codes::SOCKET_DISCONNECT, "peer went away"));
        let session = connected(&wire);

        let err = session
            .login("deploy", &Auth::password("pw"))
            .expect_err("login should fail");

        assert!(err.is_disconnect());
        assert!(session.is_closed());
    }

    #[test]
    fn introspection_requires_connection() {
        let session = Session::<FakeTransport>::new();

        assert!(matches!(session.fingerprint(), Err(Error::NotConnected)));
        assert!(matches!(session.last_error(), Err(Error::NotConnected)));
        assert!(matches!(session.last_errno(), Err(Error::NotConnected)));
        assert!(matches!(session.userauth_list("u"), Err(Error::NotConnected)));
        assert!(matches!(session.blocking(), Err(Error::NotConnected)));
        assert!(matches!(session.timeout(), Err(Error::NotConnected)));
    }

    #[test]
    fn fingerprint_is_spaced_uppercase_hex() {
        let wire = FakeWire::shared();
        wire.borrow_mut().host_key = Some((0u8..20).map(|b| b * 13).collect());
        let session = connected(&wire);

        let fingerprint = session
            .fingerprint()
            .expect("connected")
            .expect("host key known");

        assert_eq!(fingerprint.len(), 59);
        assert!(fingerprint.starts_with("00 0D 1A 27"));
        assert_eq!(fingerprint, fingerprint.to_uppercase());
    }

    #[test]
    fn auth_methods_are_split_and_empty_once_logged_in() {
        let wire = FakeWire::shared();
        let session = connected(&wire);

        assert_eq!(
            session.userauth_methods("deploy").expect("methods"),
            vec!["publickey", "password"]
        );
        assert!(
            session
                .userauth_method_supported("deploy", "password")
                .expect("methods")
        );
        assert!(
            !session
                .userauth_method_supported("deploy", "keyboard-interactive")
                .expect("methods")
        );

        session
            .login("deploy", &Auth::password("pw"))
            .expect("login should succeed");
        let methods = session.userauth_methods("deploy").expect("methods");
        assert!(methods.is_empty());
    }

    #[test]
    fn timeout_and_blocking_round_trip_through_transport() {
        let wire = FakeWire::shared();
        let session = connected(&wire);

        session
            .set_timeout(Duration::from_millis(2500))
            .expect("set timeout");
        session.set_blocking(false).expect("set blocking");

        assert_eq!(
            session.timeout().expect("timeout"),
            Duration::from_millis(2500)
        );
        assert!(!session.blocking().expect("blocking"));
    }

    #[test]
    fn close_callbacks_run_once_with_host() {
        let wire = FakeWire::shared();
        let session = logged_in(&wire);
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&seen);
        session.on_close(move |host| sink.borrow_mut().push(host.to_owned()));

        session.close().expect("close");
        session.close().expect("close again");

        assert_eq!(*seen.borrow(), vec!["fake-host"]);
        assert_eq!(session.host(), None);
    }

    #[test]
    fn exec_runs_command_on_fresh_channel() {
        let wire = FakeWire::shared();
        wire.borrow_mut().with_stdout(b"Linux\n");
        let session = logged_in(&wire);

        let output = session.exec("uname", true).expect("exec should succeed");

        assert_eq!(output.as_deref(), Some("Linux"));
        assert!(wire.borrow().called("exec uname"));
        assert!(wire.borrow().called("close"));
    }

    #[test]
    fn public_key_path_appends_suffix() {
        assert_eq!(
            public_key_path(Path::new("/home/u/.ssh/id_rsa")),
            Path::new("/home/u/.ssh/id_rsa.pub")
        );
    }
}
