//! # axum-resume
//!
//! Resumable file responses for [`axum`][1]: conditional requests
//! (RFC 7232) and byte ranges, including `multipart/byteranges`
//! (RFC 7233).
//!
//! A [`Resuming`] responder pairs a [`Resource`] with its [`FileMeta`]
//! (content type, validators, disposition) and answers a request described
//! by [`RequestConditions`]. Preconditions are evaluated first; the byte
//! source is only opened once a body is actually going to be sent.
//!
//! Any type implementing both [`AsyncRead`] and [`AsyncSeekStart`] can be
//! served through the [`KnownSize`] adapter and [`FileStream`]. In-memory
//! buffers, absolute paths and paths below a web root have dedicated
//! resources: [`FileContents`], [`PhysicalFile`] and [`VirtualFile`].
//!
//! [`AsyncSeekStart`] is a trait defined by this crate which only allows
//! seeking from the start of a file. It is automatically implemented for any
//! type implementing [`AsyncSeek`].
//!
//! ```
//! use axum::Router;
//! use axum::response::{IntoResponse, Response};
//! use axum::routing::get;
//!
//! use axum_resume::{EntityTag, FileMeta, PhysicalFile, RequestConditions, Resuming};
//!
//! async fn file(conditions: RequestConditions) -> Response {
//!     let path = std::env::current_dir().unwrap().join("document.txt");
//!     let file = match PhysicalFile::new(&path).await {
//!         Ok(file) => file,
//!         Err(e) => return e.into_response(),
//!     };
//!     let meta = FileMeta::guess(&path).with_entity_tag(EntityTag::strong("v1"));
//!     Resuming::new(file, meta).respond(&conditions).await.into_response()
//! }
//!
//! #[tokio::main]
//! async fn main() {
//!     // build our application with a single route
//!     let _app = Router::<()>::new().route("/", get(file));
//! }
//! ```
//!
//! [1]: https://docs.rs/axum

mod config;
mod error;
mod etag;
mod file;
mod meta;
mod precondition;
mod range;
mod response;
mod stream;

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use axum::http::Method;
use tokio::io::{AsyncRead, AsyncSeek};
use tracing::debug;

pub use config::ResumeConfig;
pub use error::Error;
pub use etag::{EntityTag, InvalidEntityTag};
pub use file::{FileContents, FileStream, KnownSize, PhysicalFile, Resource, VirtualFile};
pub use meta::FileMeta;
pub use precondition::{evaluate, Precondition, RequestConditions};
pub use range::{parse_range_header, resolve, ByteRange, RangeSpec, ResolvedRanges};
pub use response::{write_default_headers, write_response, BodyPlan, ResponseHead, ResumingResponse};
pub use stream::{multipart_len, MultipartStream, RangedStream, ResumingBody};

/// [`AsyncSeek`] narrowed to only allow seeking from start.
pub trait AsyncSeekStart {
    /// Same semantics as [`AsyncSeek::start_seek`], always passing position as the
    /// `SeekFrom::Start` variant.
    fn start_seek(self: Pin<&mut Self>, position: u64) -> io::Result<()>;

    /// Same semantics as [`AsyncSeek::poll_complete`], returning `()` instead of the new stream
    /// position.
    fn poll_complete(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>>;
}

impl<T: AsyncSeek> AsyncSeekStart for T {
    fn start_seek(self: Pin<&mut Self>, position: u64) -> io::Result<()> {
        AsyncSeek::start_seek(self, io::SeekFrom::Start(position))
    }

    fn poll_complete(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        AsyncSeek::poll_complete(self, cx).map_ok(|_| ())
    }
}

/// An [`AsyncRead`] and [`AsyncSeekStart`] with a fixed known byte size.
pub trait RangeBody: AsyncRead + AsyncSeekStart {
    /// The total size of the underlying file.
    ///
    /// This should not change for the lifetime of the object once queried.
    /// Behaviour is not guaranteed if it does change.
    fn byte_size(&self) -> u64;
}

/// The main responder type. Answers one request for a [`Resource`].
#[derive(Debug, Clone)]
pub struct Resuming<R> {
    resource: R,
    meta: FileMeta,
    config: ResumeConfig,
}

impl<R: Resource> Resuming<R> {
    pub fn new(resource: R, meta: FileMeta) -> Self {
        Resuming { resource, meta, config: ResumeConfig::default() }
    }

    pub fn with_config(mut self, config: ResumeConfig) -> Self {
        self.config = config;
        self
    }

    /// Evaluates preconditions and ranges, returning headers and body as
    /// [`ResumingResponse`].
    ///
    /// `304` and `412` outcomes and `HEAD` requests carry an empty body and
    /// never open the byte source. Fails only if opening the source fails.
    pub async fn respond(
        self,
        conditions: &RequestConditions,
    ) -> Result<ResumingResponse<R::Body>, Error> {
        let mut head = ResponseHead::default();
        write_default_headers(&self.meta, &mut head.headers);

        let honor_range = match evaluate(conditions, &self.meta) {
            Precondition::ShortCircuit(status) => {
                head.status = status;
                return Ok(ResumingResponse { head, body: ResumingBody::Empty });
            }
            Precondition::Proceed { honor_range } => honor_range,
        };

        let complete_length = self.resource.byte_size();
        let ranges = if honor_range {
            range::resolve(conditions.range(), complete_length)
        } else {
            ResolvedRanges::default()
        };

        let plan = BodyPlan::new(&self.meta, complete_length, ranges, &self.config);
        plan.write_headers(&self.meta, &mut head);
        debug!(method = %conditions.method(), status = %head.status, ?plan, "responding");

        if conditions.method() == Method::HEAD {
            return Ok(ResumingResponse { head, body: ResumingBody::Empty });
        }

        let source = self.resource.open().await?;
        let body = plan.into_body(source, &self.config);
        Ok(ResumingResponse { head, body })
    }
}
