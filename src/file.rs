use std::future::Future;
use std::io::{self, Cursor};
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use pin_project::pin_project;
use tokio::io::{AsyncRead, AsyncSeek, AsyncSeekExt, ReadBuf};
use tracing::debug;

use crate::{AsyncSeekStart, Error, RangeBody};

/// Implements [`RangeBody`] for any [`AsyncRead`] and [`AsyncSeekStart`], constructed with a fixed
/// byte size.
#[pin_project]
pub struct KnownSize<B: AsyncRead + AsyncSeekStart> {
    byte_size: u64,
    #[pin]
    body: B,
}

impl<B: AsyncRead + AsyncSeekStart> std::fmt::Debug for KnownSize<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KnownSize")
            .field("byte_size", &self.byte_size)
            .finish()
    }
}

impl KnownSize<tokio::fs::File> {
    /// Calls [`tokio::fs::File::metadata`] to determine file size.
    pub async fn file(file: tokio::fs::File) -> io::Result<KnownSize<tokio::fs::File>> {
        let byte_size = file.metadata().await?.len();
        Ok(KnownSize { byte_size, body: file })
    }
}

impl<B: AsyncRead + AsyncSeekStart> KnownSize<B> {
    /// Construct a [`KnownSize`] instance with a byte size supplied manually.
    pub fn sized(body: B, byte_size: u64) -> Self {
        KnownSize { byte_size, body }
    }
}

impl<B: AsyncRead + AsyncSeek + Unpin> KnownSize<B> {
    /// Uses `seek` to determine size by seeking to the end and getting stream position.
    pub async fn seek(mut body: B) -> io::Result<KnownSize<B>> {
        let byte_size = Pin::new(&mut body).seek(io::SeekFrom::End(0)).await?;
        Ok(KnownSize { byte_size, body })
    }
}

impl<B: AsyncRead + AsyncSeekStart> AsyncRead for KnownSize<B> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.project();
        this.body.poll_read(cx, buf)
    }
}

impl<B: AsyncRead + AsyncSeekStart> AsyncSeekStart for KnownSize<B> {
    fn start_seek(
        self: Pin<&mut Self>,
        position: u64,
    ) -> io::Result<()> {
        let this = self.project();
        this.body.start_seek(position)
    }

    fn poll_complete(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.project();
        this.body.poll_complete(cx)
    }
}

impl<B: AsyncRead + AsyncSeekStart> RangeBody for KnownSize<B> {
    fn byte_size(&self) -> u64 {
        self.byte_size
    }
}

/// A resource that can be served with preconditions and byte ranges.
///
/// The length must be known up front, while the byte source is only opened
/// once the engine knows a body will actually be sent.
pub trait Resource: Send {
    type Body: RangeBody + Send + 'static;

    /// Total size of the representation in bytes.
    fn byte_size(&self) -> u64;

    /// Opens the byte source, consuming the resource.
    fn open(self) -> impl Future<Output = io::Result<Self::Body>> + Send;
}

/// In-memory file contents.
#[derive(Debug, Clone)]
pub struct FileContents(Bytes);

impl FileContents {
    pub fn new(contents: impl Into<Bytes>) -> Self {
        FileContents(contents.into())
    }
}

impl Resource for FileContents {
    type Body = KnownSize<Cursor<Bytes>>;

    fn byte_size(&self) -> u64 {
        self.0.len() as u64
    }

    async fn open(self) -> io::Result<Self::Body> {
        let byte_size = self.byte_size();
        Ok(KnownSize::sized(Cursor::new(self.0), byte_size))
    }
}

/// A byte source the caller has already opened.
#[derive(Debug)]
pub struct FileStream<B: AsyncRead + AsyncSeekStart>(KnownSize<B>);

impl<B: AsyncRead + AsyncSeekStart> FileStream<B> {
    pub fn new(body: KnownSize<B>) -> Self {
        FileStream(body)
    }
}

impl<B> Resource for FileStream<B>
where
    B: AsyncRead + AsyncSeekStart + Send + 'static,
{
    type Body = KnownSize<B>;

    fn byte_size(&self) -> u64 {
        self.0.byte_size()
    }

    async fn open(self) -> io::Result<Self::Body> {
        Ok(self.0)
    }
}

/// A file on disk addressed by an absolute path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhysicalFile {
    path: PathBuf,
    byte_size: u64,
}

impl PhysicalFile {
    /// Looks up the file's size without opening it.
    ///
    /// Fails with [`Error::PathNotRooted`] for relative paths and
    /// [`Error::NotFound`] when no regular file exists at `path`.
    pub async fn new(path: impl Into<PathBuf>) -> Result<Self, Error> {
        let path = path.into();
        if !path.is_absolute() {
            return Err(Error::PathNotRooted(path));
        }

        let metadata = match tokio::fs::metadata(&path).await {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Err(Error::NotFound(path)),
            Err(e) => return Err(e.into()),
        };

        if !metadata.is_file() {
            return Err(Error::NotFound(path));
        }

        Ok(PhysicalFile { path, byte_size: metadata.len() })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Resource for PhysicalFile {
    type Body = KnownSize<tokio::fs::File>;

    fn byte_size(&self) -> u64 {
        self.byte_size
    }

    async fn open(self) -> io::Result<Self::Body> {
        debug!(path = %self.path.display(), "opening file");
        let file = tokio::fs::File::open(&self.path).await?;
        // keep the length the response headers were computed from
        Ok(KnownSize::sized(file, self.byte_size))
    }
}

/// A file addressed by a virtual path below a web root, e.g. `~/docs/a.pdf`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VirtualFile(PhysicalFile);

impl VirtualFile {
    /// Maps `virtual_path` onto `root`. A leading `~` is stripped. Paths that
    /// would leave the root resolve to [`Error::NotFound`].
    pub async fn resolve(root: impl AsRef<Path>, virtual_path: &str) -> Result<Self, Error> {
        let relative = virtual_path.strip_prefix('~').unwrap_or(virtual_path);

        let mut path = root.as_ref().to_path_buf();
        for segment in relative.split(['/', '\\']) {
            match segment {
                "" | "." => {}
                ".." => return Err(Error::NotFound(PathBuf::from(virtual_path))),
                name => path.push(name),
            }
        }

        match PhysicalFile::new(path).await {
            Ok(file) => Ok(VirtualFile(file)),
            Err(Error::NotFound(_)) => Err(Error::NotFound(PathBuf::from(virtual_path))),
            Err(e) => Err(e),
        }
    }

    /// The physical path the virtual path resolved to.
    pub fn path(&self) -> &Path {
        self.0.path()
    }
}

impl Resource for VirtualFile {
    type Body = KnownSize<tokio::fs::File>;

    fn byte_size(&self) -> u64 {
        self.0.byte_size()
    }

    fn open(self) -> impl Future<Output = io::Result<Self::Body>> + Send {
        self.0.open()
    }
}
