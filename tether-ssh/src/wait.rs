//! Socket readiness waiting and the would-block retry combinator.

use std::io::{self, ErrorKind};
use std::net::TcpStream;
use std::time::Duration;

use mio::{Events, Interest, Poll, Token};

use crate::errors::{Error, Result, WireResult};
use crate::transport::BlockDirections;

/// Upper bound for a single readiness wait.
pub const WAIT_CEILING: Duration = Duration::from_secs(10);

const SOCKET_TOKEN: Token = Token(0);
const DEFAULT_EVENT_CAPACITY: usize = 16;

/// Result of one bounded readiness wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Ready,
    TimedOut,
}

/// Blocks until the transport socket can make progress in the requested
/// direction.
pub trait Readiness {
    fn wait(&mut self, directions: BlockDirections) -> io::Result<WaitOutcome>;
}

/// Mio-backed waiter that owns the session socket.
pub struct SocketWaiter {
    poll: Poll,
    events: Events,
    socket: mio::net::TcpStream,
    registered: bool,
    ceiling: Duration,
}

impl SocketWaiter {
    /// Take ownership of a connected socket. The socket is switched to
    /// non-blocking mode.
    pub fn new(socket: TcpStream) -> io::Result<Self> {
        socket.set_nonblocking(true)?;

        Ok(Self {
            poll: Poll::new()?,
            events: Events::with_capacity(DEFAULT_EVENT_CAPACITY),
            socket: mio::net::TcpStream::from_std(socket),
            registered: false,
            ceiling: WAIT_CEILING,
        })
    }

    /// Override the per-call wait bound; it never exceeds [`WAIT_CEILING`].
    pub fn with_ceiling(mut self, ceiling: Duration) -> Self {
        self.ceiling = ceiling.min(WAIT_CEILING);
        self
    }

    pub fn ceiling(&self) -> Duration {
        self.ceiling
    }

    fn arm(&mut self, interest: Interest) -> io::Result<()> {
        let registry = self.poll.registry();
        // Edge-triggered: re-arming reports the socket's current state.
        if self.registered {
            registry.reregister(&mut self.socket, SOCKET_TOKEN, interest)
        } else {
            registry.register(&mut self.socket, SOCKET_TOKEN, interest)?;
            self.registered = true;
            Ok(())
        }
    }
}

impl Readiness for SocketWaiter {
    fn wait(&mut self, directions: BlockDirections) -> io::Result<WaitOutcome> {
        self.arm(interest_for(directions))?;

        self.events.clear();
        loop {
            match self.poll.poll(&mut self.events, Some(self.ceiling)) {
                Ok(()) => break,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            }
        }

        if self.events.is_empty() {
            Ok(WaitOutcome::TimedOut)
        } else {
            Ok(WaitOutcome::Ready)
        }
    }
}

impl Drop for SocketWaiter {
    fn drop(&mut self) {
        if self.registered {
            let _ = self.poll.registry().deregister(&mut self.socket);
        }
    }
}

fn interest_for(directions: BlockDirections) -> Interest {
    match directions {
        BlockDirections::Inbound => Interest::READABLE,
        BlockDirections::Outbound => Interest::WRITABLE,
        BlockDirections::Both | BlockDirections::None => {
            Interest::READABLE | Interest::WRITABLE
        },
    }
}

/// Run `op` until it stops reporting would-block.
///
/// Each would-block result is followed by exactly one readiness wait in the
/// direction reported by `directions`; a timed out wait simply retries.
/// Every other failure is classified into [`Error`].
pub fn retry_on_would_block<R>(
    mut op: impl FnMut() -> WireResult<R>,
    directions: impl Fn() -> BlockDirections,
    waiter: &mut dyn Readiness,
) -> Result<R> {
    loop {
        match op() {
            Ok(value) => return Ok(value),
            Err(err) if err.is_would_block() => {
                let wanted = directions();
                log::trace!("transport would block ({wanted:?}), waiting");
                if waiter.wait(wanted).map_err(Error::Io)?
                    == WaitOutcome::TimedOut
                {
                    log::debug!(
                        "socket not ready for {wanted:?} within the wait bound"
                    );
                }
            },
            Err(err) => return Err(err.into()),
        }
    }
}
