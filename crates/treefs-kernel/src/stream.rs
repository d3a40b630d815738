//! Byte streams and directory streams handed out by the facade.
//!
//! Input streams read a snapshot of the content taken when they were opened.
//! Output streams buffer everything and produce one commit in
//! [`OutputStream::finish`]; dropping an unfinished stream discards it.
//! Byte channels combine both over a seekable buffer.

use std::fmt;
use std::io::{self, Cursor, SeekFrom};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncSeek, AsyncWrite, ReadBuf};
use tracing::debug;
use treefs_types::{FsPath, FsResult, OptionSet};

use crate::provider::{EntryInfo, ProviderRef};

/// Readable snapshot of one file.
#[derive(Debug)]
pub struct InputStream {
    path: FsPath,
    inner: Cursor<Arc<[u8]>>,
}

impl InputStream {
    pub(crate) fn new(path: FsPath, data: Arc<[u8]>) -> Self {
        Self {
            path,
            inner: Cursor::new(data),
        }
    }

    pub fn path(&self) -> &FsPath {
        &self.path
    }

    /// Total length of the snapshot.
    pub fn len(&self) -> u64 {
        self.inner.get_ref().len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.inner.get_ref().is_empty()
    }

    /// Bytes not yet read.
    pub fn remaining(&self) -> u64 {
        self.len().saturating_sub(self.inner.position())
    }
}

impl AsyncRead for InputStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncSeek for InputStream {
    fn start_seek(mut self: Pin<&mut Self>, position: SeekFrom) -> io::Result<()> {
        Pin::new(&mut self.inner).start_seek(position)
    }

    fn poll_complete(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<u64>> {
        Pin::new(&mut self.inner).poll_complete(cx)
    }
}

/// Seekable read/write view of one file.
///
/// Starts from the file's content (or empty when truncated or new). Writes
/// stay in memory until [`finish`](ByteChannel::finish), which commits once
/// and only if something changed.
pub struct ByteChannel {
    provider: ProviderRef,
    path: FsPath,
    options: OptionSet,
    inner: Cursor<Vec<u8>>,
    dirty: bool,
}

impl fmt::Debug for ByteChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ByteChannel")
            .field("path", &self.path)
            .field("size", &self.size())
            .field("position", &self.position())
            .field("dirty", &self.dirty)
            .finish()
    }
}

impl ByteChannel {
    pub(crate) fn new(provider: ProviderRef, path: FsPath, options: OptionSet, content: Vec<u8>, at_end: bool) -> Self {
        let mut inner = Cursor::new(content);
        if at_end {
            inner.set_position(inner.get_ref().len() as u64);
        }
        Self {
            provider,
            path,
            options,
            inner,
            dirty: false,
        }
    }

    pub fn path(&self) -> &FsPath {
        &self.path
    }

    pub fn size(&self) -> u64 {
        self.inner.get_ref().len() as u64
    }

    pub fn position(&self) -> u64 {
        self.inner.position()
    }

    /// Cut the content to `len` bytes. Larger values do nothing.
    pub fn truncate(&mut self, len: u64) {
        let len = usize::try_from(len).unwrap_or(usize::MAX);
        if len < self.inner.get_ref().len() {
            self.inner.get_mut().truncate(len);
            self.dirty = true;
        }
        if self.inner.position() > len as u64 {
            self.inner.set_position(len as u64);
        }
    }

    /// Commit on finish even if nothing is written, so the file gets created.
    pub(crate) fn creating(mut self) -> Self {
        self.dirty = true;
        self
    }

    /// Whether [`finish`](Self::finish) will commit.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Commit the content if it changed. Returns whether a write happened.
    pub async fn finish(self) -> FsResult<bool> {
        if !self.dirty {
            return Ok(false);
        }
        debug!(path = %self.path, bytes = self.size(), "finishing byte channel");
        self.provider
            .write(&self.path, self.inner.into_inner(), &self.options)
            .await?;
        Ok(true)
    }
}

impl AsyncRead for ByteChannel {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for ByteChannel {
    fn poll_write(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        if !buf.is_empty() {
            self.dirty = true;
        }
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

impl AsyncSeek for ByteChannel {
    fn start_seek(mut self: Pin<&mut Self>, position: SeekFrom) -> io::Result<()> {
        Pin::new(&mut self.inner).start_seek(position)
    }

    fn poll_complete(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<u64>> {
        Pin::new(&mut self.inner).poll_complete(cx)
    }
}

/// Buffered writer that commits on [`finish`](OutputStream::finish).
pub struct OutputStream {
    provider: ProviderRef,
    path: FsPath,
    options: OptionSet,
    buffer: Vec<u8>,
}

impl fmt::Debug for OutputStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutputStream")
            .field("path", &self.path)
            .field("buffered", &self.buffer.len())
            .finish()
    }
}

impl OutputStream {
    pub(crate) fn new(provider: ProviderRef, path: FsPath, options: OptionSet) -> Self {
        Self {
            provider,
            path,
            options,
            buffer: Vec::new(),
        }
    }

    pub fn path(&self) -> &FsPath {
        &self.path
    }

    /// Bytes written so far.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Write the buffered content. Nothing is visible before this returns.
    pub async fn finish(self) -> FsResult<FsPath> {
        debug!(path = %self.path, bytes = self.buffer.len(), "finishing output stream");
        self.provider.write(&self.path, self.buffer, &self.options).await?;
        Ok(self.path)
    }
}

impl AsyncWrite for OutputStream {
    fn poll_write(mut self: Pin<&mut Self>, _cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        self.buffer.extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

/// Predicate applied to directory entries.
pub type PathFilter = Arc<dyn Fn(&FsPath) -> bool + Send + Sync>;

/// Entries of one directory.
///
/// Each call to [`iter`](DirectoryStream::iter) lists the directory again
/// at the then-current head, so a stream can be walked any number of times.
#[derive(Clone)]
pub struct DirectoryStream {
    provider: ProviderRef,
    dir: FsPath,
    filter: Option<PathFilter>,
}

impl fmt::Debug for DirectoryStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DirectoryStream")
            .field("dir", &self.dir)
            .field("filtered", &self.filter.is_some())
            .finish()
    }
}

impl DirectoryStream {
    pub(crate) fn new(provider: ProviderRef, dir: FsPath, filter: Option<PathFilter>) -> Self {
        Self { provider, dir, filter }
    }

    pub fn dir(&self) -> &FsPath {
        &self.dir
    }

    /// A fresh pass over the directory.
    pub async fn iter(&self) -> FsResult<DirectoryIter> {
        let entries = self.provider.list(&self.dir).await?;
        Ok(DirectoryIter {
            dir: self.dir.clone(),
            entries: entries.into_iter(),
            filter: self.filter.clone(),
        })
    }

    /// All matching paths, in backend order.
    pub async fn paths(&self) -> FsResult<Vec<FsPath>> {
        self.iter().await?.collect()
    }
}

/// One pass over a [`DirectoryStream`]. The filter runs as entries are pulled.
pub struct DirectoryIter {
    dir: FsPath,
    entries: std::vec::IntoIter<EntryInfo>,
    filter: Option<PathFilter>,
}

impl Iterator for DirectoryIter {
    type Item = FsResult<FsPath>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let entry = self.entries.next()?;
            let path = match self.dir.join(&entry.name) {
                Ok(path) => path,
                Err(e) => return Some(Err(e)),
            };
            match &self.filter {
                Some(filter) if !filter(&path) => continue,
                _ => return Some(Ok(path)),
            }
        }
    }
}
