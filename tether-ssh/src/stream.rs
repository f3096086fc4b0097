//! Byte and line oriented views over one sub-stream of a channel.

use std::io;
use std::rc::{Rc, Weak};

use memchr::memmem;

use crate::backend::Ssh2Transport;
use crate::channel::ChannelInner;
use crate::errors::{Error, Result};
use crate::transport::{StreamId, Transport};

const READ_CHUNK: usize = 4096;

/// Where [`Stream::gets`] stops reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delimiter<'a> {
    /// Up to and including the first occurrence of the separator. An empty
    /// separator reads to EOF.
    Separator(&'a [u8]),
    /// Exactly this many bytes, fewer at EOF.
    Size(usize),
    /// Everything up to EOF.
    All,
}

impl Default for Delimiter<'_> {
    fn default() -> Self {
        Delimiter::Separator(b"\n")
    }
}

impl<'a> From<&'a str> for Delimiter<'a> {
    fn from(separator: &'a str) -> Self {
        Delimiter::Separator(separator.as_bytes())
    }
}

impl<'a> From<&'a [u8]> for Delimiter<'a> {
    fn from(separator: &'a [u8]) -> Self {
        Delimiter::Separator(separator)
    }
}

impl From<usize> for Delimiter<'_> {
    fn from(size: usize) -> Self {
        Delimiter::Size(size)
    }
}

/// One sub-stream (stdout or stderr) of a [`Channel`](crate::Channel).
///
/// Bytes read past the last returned delimiter stay buffered for the next
/// read. The stream stops working once its channel closes.
pub struct Stream<T: Transport = Ssh2Transport> {
    channel: Weak<ChannelInner<T>>,
    id: StreamId,
    buffer: Vec<u8>,
}

impl<T: Transport> Stream<T> {
    pub(crate) fn new(channel: Weak<ChannelInner<T>>, id: StreamId) -> Self {
        Self {
            channel,
            id,
            buffer: Vec::new(),
        }
    }

    pub fn id(&self) -> StreamId {
        self.id
    }

    /// Bytes read ahead and not yet returned.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    fn channel(&self) -> Result<Rc<ChannelInner<T>>> {
        self.channel.upgrade().ok_or(Error::ChannelNotOpened)
    }

    /// Write at this stream's id and return the number of bytes accepted.
    pub fn write(&self, data: &[u8]) -> Result<usize> {
        self.channel()?.write(self.id, data)
    }

    pub fn write_all(&self, mut data: &[u8]) -> Result<()> {
        let channel = self.channel()?;
        while !data.is_empty() {
            match channel.write(self.id, data)? {
                0 => return Err(Error::Io(io::ErrorKind::WriteZero.into())),
                n => data = &data[n..],
            }
        }
        Ok(())
    }

    pub fn print(&self, text: &str) -> Result<()> {
        self.write_all(text.as_bytes())
    }

    /// Write `text`, adding a newline unless it already ends with one.
    pub fn puts(&self, text: &str) -> Result<()> {
        self.write_all(text.as_bytes())?;
        if !text.ends_with('\n') {
            self.write_all(b"\n")?;
        }
        Ok(())
    }

    /// Drop read-ahead bytes and flush this stream on the channel.
    pub fn flush(&mut self) -> Result<()> {
        let channel = self.channel()?;
        self.buffer.clear();
        channel.flush(self.id)
    }

    /// Read up to `delimiter`.
    ///
    /// Returns `None` when nothing is left, which is distinct from an empty
    /// line produced by `chomp`. With `chomp` the trailing separator (or line
    /// ending for newline separators) is removed.
    pub fn gets<'a>(
        &mut self,
        delimiter: impl Into<Delimiter<'a>>,
        chomp: bool,
    ) -> Result<Option<Vec<u8>>> {
        let channel = self.channel()?;
        let delimiter = delimiter.into();

        let chunk = match delimiter {
            Delimiter::Separator(separator) if !separator.is_empty() => {
                self.read_until(&channel, separator)?
            },
            Delimiter::Separator(_) | Delimiter::All => {
                self.read_to_end(&channel)?
            },
            Delimiter::Size(size) => self.read_size(&channel, size)?,
        };

        if chunk.is_empty() {
            return Ok(None);
        }

        Ok(Some(match (chomp, delimiter) {
            (false, _) => chunk,
            (true, Delimiter::Separator(separator)) => {
                chomp_separator(chunk, separator)
            },
            (true, _) => chomp_line_ending(chunk),
        }))
    }

    /// One byte, `None` at EOF.
    pub fn getc(&mut self) -> Result<Option<u8>> {
        let byte = self.gets(Delimiter::Size(1), false)?;
        Ok(byte.and_then(|b| b.first().copied()))
    }

    /// `size` bytes (fewer at EOF), or everything when `size` is `None`.
    pub fn read(&mut self, size: Option<usize>) -> Result<Option<Vec<u8>>> {
        match size {
            Some(size) => self.gets(Delimiter::Size(size), false),
            None => self.gets(Delimiter::All, false),
        }
    }

    /// Next line; fails with [`Error::EndOfStream`] at EOF.
    pub fn readline(&mut self, chomp: bool) -> Result<String> {
        let line = self
            .gets(Delimiter::default(), chomp)?
            .ok_or(Error::EndOfStream)?;
        Ok(String::from_utf8_lossy(&line).into_owned())
    }

    pub fn readlines(&mut self, chomp: bool) -> Result<Vec<String>> {
        self.lines(chomp).collect()
    }

    /// Iterate over the remaining lines.
    pub fn lines(&mut self, chomp: bool) -> Lines<'_, T> {
        Lines {
            stream: self,
            chomp,
        }
    }

    /// Whether the channel has seen EOF from the peer.
    pub fn is_eof(&self) -> Result<bool> {
        self.channel()?.is_eof()
    }

    /// Send EOF on the channel, optionally waiting for the peer's EOF.
    pub fn close(&self, wait: bool) -> Result<()> {
        self.channel()?.send_eof(wait)
    }

    /// Append one read to the buffer; `0` means EOF.
    fn fill(&mut self, channel: &ChannelInner<T>) -> Result<usize> {
        let start = self.buffer.len();
        self.buffer.resize(start + READ_CHUNK, 0);
        let read = channel.read(self.id, &mut self.buffer[start..]);
        let n = *read.as_ref().unwrap_or(&0);
        self.buffer.truncate(start + n);
        read
    }

    fn read_until(
        &mut self,
        channel: &ChannelInner<T>,
        separator: &[u8],
    ) -> Result<Vec<u8>> {
        let mut scanned: usize = 0;
        loop {
            // A match may straddle the previously scanned tail.
            let from = scanned.saturating_sub(separator.len() - 1);
            if let Some(pos) = memmem::find(&self.buffer[from..], separator) {
                let end = from + pos + separator.len();
                return Ok(self.buffer.drain(..end).collect());
            }
            scanned = self.buffer.len();

            if self.fill(channel)? == 0 {
                return Ok(std::mem::take(&mut self.buffer));
            }
        }
    }

    fn read_size(
        &mut self,
        channel: &ChannelInner<T>,
        size: usize,
    ) -> Result<Vec<u8>> {
        while self.buffer.len() < size {
            if self.fill(channel)? == 0 {
                break;
            }
        }
        let end = size.min(self.buffer.len());
        Ok(self.buffer.drain(..end).collect())
    }

    fn read_to_end(&mut self, channel: &ChannelInner<T>) -> Result<Vec<u8>> {
        while self.fill(channel)? > 0 {}
        Ok(std::mem::take(&mut self.buffer))
    }
}

fn chomp_separator(mut chunk: Vec<u8>, separator: &[u8]) -> Vec<u8> {
    if separator == b"\n" {
        return chomp_line_ending(chunk);
    }
    if chunk.ends_with(separator) {
        chunk.truncate(chunk.len() - separator.len());
    }
    chunk
}

fn chomp_line_ending(mut chunk: Vec<u8>) -> Vec<u8> {
    if chunk.ends_with(b"\n") {
        chunk.pop();
        if chunk.ends_with(b"\r") {
            chunk.pop();
        }
    } else if chunk.ends_with(b"\r") {
        chunk.pop();
    }
    chunk
}

/// Iterator returned by [`Stream::lines`].
pub struct Lines<'s, T: Transport> {
    stream: &'s mut Stream<T>,
    chomp: bool,
}

impl<T: Transport> Iterator for Lines<'_, T> {
    type Item = Result<String>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.stream.gets(Delimiter::default(), self.chomp) {
            Ok(Some(line)) => {
                Some(Ok(String::from_utf8_lossy(&line).into_owned()))
            },
            Ok(None) => None,
            Err(err) => Some(Err(err)),
        }
    }
}

fn into_io(err: Error) -> io::Error {
    match err {
        Error::Io(err) => err,
        other => io::Error::other(other),
    }
}

impl<T: Transport> io::Read for Stream<T> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.buffer.is_empty() {
            let channel = self.channel().map_err(into_io)?;
            return channel.read(self.id, buf).map_err(into_io);
        }

        let n = buf.len().min(self.buffer.len());
        buf[..n].copy_from_slice(&self.buffer[..n]);
        self.buffer.drain(..n);
        Ok(n)
    }
}

impl<T: Transport> io::Write for Stream<T> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        Stream::write(self, buf).map_err(into_io)
    }

    fn flush(&mut self) -> io::Result<()> {
        Stream::flush(self).map_err(into_io)
    }
}
