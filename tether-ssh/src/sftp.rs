//! SFTP sessions: an SSH session plus the SFTP sub-protocol handle, with
//! directory listing.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::path::Path;

use crate::backend::Ssh2Transport;
use crate::errors::{Error, Result, codes};
use crate::options::{Auth, ConnectOptions};
use crate::session::Session;
use crate::transport::{DirEntry, SftpDirIo, SftpIo, Transport};

const DEFAULT_USER: &str = "anonymous";

/// One entry of a remote directory listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SftpEntry {
    pub name: String,
    pub size: Option<u64>,
    pub permissions: Option<u32>,
    pub modified: Option<u64>,
    pub is_dir: bool,
}

impl SftpEntry {
    fn from_dir_entry(entry: DirEntry) -> Self {
        Self {
            name: entry.name.to_string_lossy().into_owned(),
            size: entry.size,
            permissions: entry.perm,
            modified: entry.mtime,
            is_dir: entry.is_dir,
        }
    }

    /// `ls -l` style mode column, e.g. `drwxr-xr-x`.
    pub fn mode(&self) -> String {
        let mut mode = String::with_capacity(10);
        mode.push(if self.is_dir { 'd' } else { '-' });

        let perm = self.permissions.unwrap_or(0);
        for shift in [6, 3, 0] {
            let bits = (perm >> shift) & 0o7;
            mode.push(if bits & 0o4 != 0 { 'r' } else { '-' });
            mode.push(if bits & 0o2 != 0 { 'w' } else { '-' });
            mode.push(if bits & 0o1 != 0 { 'x' } else { '-' });
        }
        mode
    }
}

impl fmt::Display for SftpEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {:>10} {}",
            self.mode(),
            self.size.unwrap_or(0),
            self.name
        )
    }
}

/// SSH session dedicated to SFTP directory access.
pub struct SftpSession<T: Transport = Ssh2Transport> {
    // Declared before the session so the handle is freed first on drop.
    sftp: RefCell<Option<SftpHandle<T::Sftp>>>,
    last_status: Cell<Option<i32>>,
    session: Session<T>,
}

struct SftpHandle<S> {
    /// Connection generation the handle was started on.
    generation: u64,
    sftp: S,
}

impl<T: Transport> Default for SftpSession<T> {
    fn default() -> Self {
        Self::new(Session::new())
    }
}

impl<T: Transport> SftpSession<T> {
    /// Wrap an existing session. The SFTP handle is created by
    /// [`login`](SftpSession::login).
    pub fn new(session: Session<T>) -> Self {
        Self {
            sftp: RefCell::new(None),
            last_status: Cell::new(None),
            session,
        }
    }

    /// Connect to `host:port` without logging in.
    pub fn connect(
        host: &str,
        port: u16,
        options: &ConnectOptions,
    ) -> Result<Self> {
        let session = Session::new();
        session.connect(host, port, options)?;
        Ok(Self::new(session))
    }

    /// Authenticate with a password and start the SFTP sub-protocol.
    ///
    /// `user` defaults to `anonymous` and `password` to the empty string.
    pub fn login(
        &self,
        user: Option<&str>,
        password: Option<&str>,
    ) -> Result<()> {
        if self.session.is_closed() {
            return Err(Error::NotConnected);
        }

        let user = user.unwrap_or(DEFAULT_USER);
        let auth = Auth::password(password.unwrap_or_default());
        if let Err(err) = self.session.login(user, &auth) {
            self.drop_stale_handle();
            return Err(err);
        }

        let shared = self.session.shared();
        let generation =
            shared.live_generation().ok_or(Error::NotConnected)?;
        let sftp = shared
            .with_connection(|connection| connection.retry(T::sftp))
            .inspect_err(|err| self.record(err))?;
        *self.sftp.borrow_mut() = Some(SftpHandle { generation, sftp });

        log::debug!("sftp subsystem started for {user}");
        Ok(())
    }

    pub fn logged_in(&self) -> bool {
        self.session.logged_in()
    }

    /// Shut down the SFTP handle, then the session. Idempotent.
    pub fn close(&self) -> Result<()> {
        self.sftp.borrow_mut().take();
        self.last_status.set(None);
        self.session.close()
    }

    pub fn is_closed(&self) -> bool {
        self.session.is_closed()
    }

    pub fn is_connected(&self) -> bool {
        self.session.is_connected()
    }

    pub fn host(&self) -> Option<String> {
        self.session.host()
    }

    /// The underlying SSH session.
    pub fn session(&self) -> &Session<T> {
        &self.session
    }

    /// Entries of `dir` (the login directory when `None`), without `.` and
    /// `..`.
    pub fn list(&self, dir: Option<&str>) -> Result<Vec<SftpEntry>> {
        let dir = normalize_dir(dir);
        self.read_dir(dir, SftpEntry::from_dir_entry)
    }

    /// Paths of the entries of `dir`, joined onto `dir` as given.
    pub fn entries(&self, dir: Option<&str>) -> Result<Vec<String>> {
        let dir = normalize_dir(dir);
        self.read_dir(dir, |entry| {
            join_path(dir, &entry.name.to_string_lossy())
        })
    }

    /// Message of the last transport error, empty when there is none.
    pub fn last_error(&self) -> Result<String> {
        self.session.last_error()
    }

    /// Code of the last failure. SFTP protocol failures report the SFTP
    /// status code the server sent instead of the generic protocol code.
    pub fn last_errno(&self) -> Result<i32> {
        let errno = self.session.last_errno()?;
        match self.last_status.get() {
            Some(status) if errno == codes::SFTP_PROTOCOL => Ok(status),
            _ => Ok(errno),
        }
    }

    fn read_dir<R>(
        &self,
        dir: &str,
        mut convert: impl FnMut(DirEntry) -> R,
    ) -> Result<Vec<R>> {
        if self.session.is_closed() {
            return Err(Error::NotConnected);
        }
        self.drop_stale_handle();
        let slot = self.sftp.borrow();
        let sftp = slot
            .as_ref()
            .map(|handle| &handle.sftp)
            .ok_or(Error::NotAuthenticated)?;

        let listing = self.session.shared().with_connection(|connection| {
            let path = Path::new(dir);
            let mut handle = connection.retry(|_| sftp.opendir(path))?;

            let mut out = Vec::new();
            while let Some(entry) = connection.retry(|_| handle.readdir())? {
                if is_dot_entry(&entry) {
                    continue;
                }
                out.push(convert(entry));
            }
            Ok(out)
        });

        listing.inspect_err(|err| self.record(err))
    }

    /// Forget a handle started on a connection that has since closed.
    fn drop_stale_handle(&self) {
        let live = self.session.shared().live_generation();
        let mut handle = self.sftp.borrow_mut();
        if handle
            .as_ref()
            .is_some_and(|handle| Some(handle.generation) != live)
        {
            log::debug!("dropping sftp handle of a closed connection");
            *handle = None;
            self.last_status.set(None);
        }
    }

    fn record(&self, err: &Error) {
        if let Error::Sftp(wire) = err {
            log::debug!("sftp status {}: {}", wire.code(), wire.message());
            self.last_status.set(Some(wire.code()));
        }
    }
}

fn is_dot_entry(entry: &DirEntry) -> bool {
    let name = entry.name.as_os_str();
    name == "." || name == ".."
}

/// Strip one trailing `/`, keeping a bare root.
fn normalize_dir(dir: Option<&str>) -> &str {
    let dir = dir.unwrap_or_default();
    match dir.strip_suffix('/') {
        Some(stripped) if !stripped.is_empty() => stripped,
        _ => dir,
    }
}

fn join_path(prefix: &str, name: &str) -> String {
    match prefix {
        "" => name.to_owned(),
        "/" => format!("/{name}"),
        _ => format!("{prefix}/{name}"),
    }
}
