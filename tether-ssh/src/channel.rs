//! Logical channels multiplexed over a session's transport.

use std::cell::RefCell;
use std::rc::{Rc, Weak};

use crate::backend::Ssh2Transport;
use crate::errors::{Error, Result};
use crate::options::{PACKET_DEFAULT, PtyOptions, WINDOW_DEFAULT};
use crate::session::{Connection, Session, Shared};
use crate::stream::{Delimiter, Stream};
use crate::transport::{ChannelIo, ExtendedData, StreamId, Transport};

const SESSION_KIND: &str = "session";

/// Output of a command run through one of the `capture*` helpers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Captured {
    pub stdout: String,
    pub stderr: String,
    /// Whether the server accepted the `exec` request.
    pub accepted: bool,
}

/// Describes a channel before it is opened.
pub struct ChannelBuilder<T: Transport = Ssh2Transport> {
    session: Weak<Shared<T>>,
    kind: String,
    window_size: u32,
    packet_size: u32,
}

impl<T: Transport> ChannelBuilder<T> {
    pub fn new(session: &Session<T>) -> Self {
        Self {
            session: Rc::downgrade(session.shared()),
            kind: SESSION_KIND.to_owned(),
            window_size: WINDOW_DEFAULT,
            packet_size: PACKET_DEFAULT,
        }
    }

    pub fn with_kind(mut self, kind: &str) -> Self {
        self.kind = kind.into();
        self
    }

    pub fn with_window_size(mut self, window_size: u32) -> Self {
        self.window_size = window_size;
        self
    }

    pub fn with_packet_size(mut self, packet_size: u32) -> Self {
        self.packet_size = packet_size;
        self
    }

    /// Unopened channel with these settings.
    pub fn build(self) -> Channel<T> {
        Channel {
            inner: Rc::new(ChannelInner {
                session: self.session,
                kind: self.kind,
                window_size: self.window_size,
                packet_size: self.packet_size,
                state: RefCell::new(ChannelState {
                    handle: None,
                    generation: 0,
                    exit_status: None,
                    closed: false,
                }),
            }),
        }
    }

    pub fn open(self, extra_data: Option<&str>) -> Result<Channel<T>> {
        let channel = self.build();
        channel.open(extra_data)?;
        Ok(channel)
    }
}

/// Duplex channel over a [`Session`].
///
/// Lifecycle is unopened, open, closed; a closed channel cannot be reopened.
pub struct Channel<T: Transport = Ssh2Transport> {
    inner: Rc<ChannelInner<T>>,
}

pub(crate) struct ChannelInner<T: Transport> {
    session: Weak<Shared<T>>,
    kind: String,
    window_size: u32,
    packet_size: u32,
    state: RefCell<ChannelState<T::Channel>>,
}

struct ChannelState<H> {
    handle: Option<H>,
    /// Connection generation the handle was opened on.
    generation: u64,
    exit_status: Option<i32>,
    closed: bool,
}

impl<T: Transport> ChannelInner<T> {
    /// Drop the handle if the session is gone or was reconnected since the
    /// channel was opened.
    fn refresh(&self) {
        let session = self.session.upgrade();
        let mut state = self.state.borrow_mut();
        if state.handle.is_none() {
            return;
        }

        let live = session
            .and_then(|session| session.live_generation())
            .is_some_and(|generation| generation == state.generation);
        if !live {
            state.handle = None;
            state.closed = true;
        }
    }

    fn is_open(&self) -> bool {
        self.refresh();
        self.state.borrow().handle.is_some()
    }

    /// Release the handle ahead of its session's transport.
    pub(crate) fn release(&self) {
        if let Ok(mut state) = self.state.try_borrow_mut() {
            if state.handle.take().is_some() {
                state.closed = true;
            }
        }
    }

    /// Run `f` against the live connection and channel handle.
    pub(crate) fn with_open<R>(
        &self,
        f: impl FnOnce(&mut Connection<T>, &mut T::Channel) -> Result<R>,
    ) -> Result<R> {
        self.refresh();
        let session = self.session.upgrade().ok_or(Error::ChannelNotOpened)?;
        let mut state = self.state.borrow_mut();
        let Some(handle) = state.handle.as_mut() else {
            return Err(Error::ChannelNotOpened);
        };
        session.with_connection(|connection| f(connection, handle))
    }

    pub(crate) fn read(
        &self,
        stream: StreamId,
        buf: &mut [u8],
    ) -> Result<usize> {
        self.with_open(|connection, handle| {
            connection.retry(|_| handle.read(stream, buf))
        })
    }

    pub(crate) fn write(&self, stream: StreamId, data: &[u8]) -> Result<usize> {
        self.with_open(|connection, handle| {
            connection.retry(|_| handle.write(stream, data))
        })
    }

    pub(crate) fn flush(&self, stream: StreamId) -> Result<()> {
        self.with_open(|connection, handle| {
            connection.retry(|_| handle.flush(stream))
        })
    }

    pub(crate) fn send_eof(&self, wait: bool) -> Result<()> {
        self.with_open(|connection, handle| {
            connection.retry(|_| handle.send_eof())?;
            if wait {
                connection.retry(|_| handle.wait_eof())?;
            }
            Ok(())
        })
    }

    pub(crate) fn is_eof(&self) -> Result<bool> {
        self.with_open(|_, handle| Ok(handle.eof()?))
    }

    fn close(&self, wait: bool) -> Result<i32> {
        self.refresh();
        {
            let mut state = self.state.borrow_mut();
            if state.handle.is_none() {
                let status = state.exit_status.unwrap_or(0);
                state.exit_status = Some(status);
                return Ok(status);
            }
        }

        let result = self.with_open(|connection, handle| {
            connection.retry(|_| handle.close())?;
            if wait {
                // The close can only be confirmed once the peer's EOF is in.
                connection.retry(|_| handle.wait_eof())?;
                connection.retry(|_| handle.wait_close())?;
            }
            connection.retry(|_| handle.exit_status())
        });

        let mut state = self.state.borrow_mut();
        state.handle = None;
        state.closed = true;
        let status = result?;
        state.exit_status = Some(status);

        log::debug!("{} channel closed with exit status {status}", self.kind);
        Ok(status)
    }
}

impl<T: Transport> Drop for ChannelInner<T> {
    fn drop(&mut self) {
        if self.is_open() {
            if let Err(err) = self.close(false) {
                log::warn!(
                    "closing dropped {} channel failed: {err}",
                    self.kind
                );
            }
        }
    }
}

impl<T: Transport> Channel<T> {
    /// Unopened `session` channel with default window and packet sizes.
    pub fn new(session: &Session<T>) -> Self {
        ChannelBuilder::new(session).build()
    }

    /// Open the channel on its session's transport.
    ///
    /// The session must be connected and authenticated.
    pub fn open(&self, extra_data: Option<&str>) -> Result<()> {
        let inner = &self.inner;
        inner.refresh();
        {
            let state = inner.state.borrow();
            if state.closed {
                return Err(Error::ChannelClosed);
            }
            if state.handle.is_some() {
                return Err(Error::AlreadyOpen);
            }
        }

        let session = inner.session.upgrade().ok_or(Error::NotConnected)?;
        let generation = session.live_generation().ok_or(Error::NotConnected)?;
        let handle = session.with_connection(|connection| {
            if !connection.transport.authenticated() {
                return Err(Error::NotAuthenticated);
            }
            connection.retry(|t| {
                t.channel_open(
                    &inner.kind,
                    inner.window_size,
                    inner.packet_size,
                    extra_data,
                )
            })
        })?;

        {
            let mut state = inner.state.borrow_mut();
            state.handle = Some(handle);
            state.generation = generation;
            state.exit_status = None;
        }
        session.track(inner);

        log::debug!("{} channel opened", inner.kind);
        Ok(())
    }

    /// Issue a channel request such as `exec`, `shell` or `subsystem`.
    ///
    /// Returns `Ok(false)` when the server denies the request.
    pub fn request(
        &self,
        name: &str,
        message: Option<&str>,
        mode: ExtendedData,
    ) -> Result<bool> {
        self.inner.with_open(|connection, handle| {
            connection.retry(|_| handle.handle_extended_data(mode))?;
            denied_as_false(
                name,
                connection.retry(|_| handle.process_startup(name, message)),
            )
        })
    }

    pub fn request_pty(&self, pty: &PtyOptions) -> Result<bool> {
        self.inner.with_open(|connection, handle| {
            let result = connection.retry(|_| handle.request_pty(pty));
            denied_as_false("pty-req", result)
        })
    }

    /// Set a remote environment variable; servers commonly refuse these.
    pub fn env(&self, name: &str, value: &str) -> Result<bool> {
        self.inner.with_open(|connection, handle| {
            let result = connection.retry(|_| handle.setenv(name, value));
            denied_as_false("env", result)
        })
    }

    /// Tell the remote side no more data will be sent.
    pub fn send_eof(&self) -> Result<()> {
        self.inner.send_eof(false)
    }

    /// Like [`send_eof`](Channel::send_eof), then wait for the peer's EOF.
    pub fn send_eof_and_wait(&self) -> Result<()> {
        self.inner.send_eof(true)
    }

    pub fn is_eof(&self) -> Result<bool> {
        self.inner.is_eof()
    }

    /// Close the channel and return the remote exit status.
    ///
    /// With `wait` the call returns only after the peer confirmed the close.
    /// Closing twice returns the recorded status again.
    pub fn close(&self, wait: bool) -> Result<i32> {
        self.inner.close(wait)
    }

    /// True when never opened, closed, or its session is gone.
    pub fn is_closed(&self) -> bool {
        !self.inner.is_open()
    }

    /// Exit status recorded by [`close`](Channel::close).
    pub fn exit_status(&self) -> Option<i32> {
        self.inner.state.borrow().exit_status
    }

    pub fn kind(&self) -> &str {
        &self.inner.kind
    }

    pub fn window_size(&self) -> u32 {
        self.inner.window_size
    }

    pub fn packet_size(&self) -> u32 {
        self.inner.packet_size
    }

    pub fn stream(&self, id: StreamId) -> Result<Stream<T>> {
        if !self.inner.is_open() {
            return Err(Error::ChannelNotOpened);
        }
        Ok(Stream::new(Rc::downgrade(&self.inner), id))
    }

    pub fn stdout(&self) -> Result<Stream<T>> {
        self.stream(StreamId::Stdio)
    }

    pub fn stderr(&self) -> Result<Stream<T>> {
        self.stream(StreamId::Stderr)
    }

    pub fn subsystem(&self, name: &str, mode: ExtendedData) -> Result<bool> {
        self.request("subsystem", Some(name), mode)
    }

    /// Run `command` and read its whole standard output.
    ///
    /// `None` when the request was denied or nothing was printed.
    pub fn exec(&self, command: &str, chomp: bool) -> Result<Option<String>> {
        if !self.request("exec", Some(command), ExtendedData::Ignore)? {
            return Ok(None);
        }

        let output = self.stdout()?.gets(Delimiter::All, false)?;
        Ok(output.map(|bytes| {
            let text = String::from_utf8_lossy(&bytes).into_owned();
            if chomp { chomp_newline(text) } else { text }
        }))
    }

    /// Run `command` with stderr discarded.
    pub fn popen2(&self, command: &str) -> Result<(Stream<T>, bool)> {
        let accepted =
            self.request("exec", Some(command), ExtendedData::Ignore)?;
        Ok((self.stdout()?, accepted))
    }

    /// Run `command` with stderr merged into stdout.
    pub fn popen2e(&self, command: &str) -> Result<(Stream<T>, bool)> {
        let accepted =
            self.request("exec", Some(command), ExtendedData::Merge)?;
        Ok((self.stdout()?, accepted))
    }

    /// Run `command` keeping stdout and stderr apart.
    pub fn popen3(
        &self,
        command: &str,
    ) -> Result<(Stream<T>, Stream<T>, bool)> {
        let accepted =
            self.request("exec", Some(command), ExtendedData::Normal)?;
        Ok((self.stdout()?, self.stderr()?, accepted))
    }

    pub fn capture2(&self, command: &str) -> Result<Captured> {
        let (mut stdout, accepted) = self.popen2(command)?;
        Ok(Captured {
            stdout: read_to_string(&mut stdout, accepted)?,
            stderr: String::new(),
            accepted,
        })
    }

    pub fn capture2e(&self, command: &str) -> Result<Captured> {
        let (mut stdout, accepted) = self.popen2e(command)?;
        Ok(Captured {
            stdout: read_to_string(&mut stdout, accepted)?,
            stderr: String::new(),
            accepted,
        })
    }

    pub fn capture3(&self, command: &str) -> Result<Captured> {
        let (mut stdout, mut stderr, accepted) = self.popen3(command)?;
        Ok(Captured {
            stdout: read_to_string(&mut stdout, accepted)?,
            stderr: read_to_string(&mut stderr, accepted)?,
            accepted,
        })
    }
}

fn denied_as_false(request: &str, result: Result<()>) -> Result<bool> {
    match result {
        Ok(()) => {
            log::debug!("channel request {request} accepted");
            Ok(true)
        },
        Err(Error::ChannelRequestDenied(err)) => {
            log::debug!("channel request {request} denied: {err}");
            Ok(false)
        },
        Err(err) => Err(err),
    }
}

fn read_to_string<T: Transport>(
    stream: &mut Stream<T>,
    accepted: bool,
) -> Result<String> {
    if !accepted {
        return Ok(String::new());
    }
    let bytes = stream.gets(Delimiter::All, false)?.unwrap_or_default();
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

fn chomp_newline(mut text: String) -> String {
    if text.ends_with('\n') {
        text.pop();
        if text.ends_with('\r') {
            text.pop();
        }
    }
    text
}
