//! Response headers and body selection for full, single-range and
//! `multipart/byteranges` responses (RFC 7233 §4).

use axum::body::Body;
use axum::http::header::{self, HeaderName};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum_extra::headers::{AcceptRanges, ContentLength, ContentRange, HeaderMapExt, LastModified};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::stream::{multipart_len, MultipartStream, RangedStream, ResumingBody};
use crate::{ByteRange, FileMeta, RangeBody, ResolvedRanges, ResumeConfig};

/// Status line and header fields of a response, before its body.
#[derive(Debug, Clone)]
pub struct ResponseHead {
    pub status: StatusCode,
    pub headers: HeaderMap,
}

impl Default for ResponseHead {
    fn default() -> Self {
        ResponseHead {
            status: StatusCode::OK,
            headers: HeaderMap::new(),
        }
    }
}

/// Fields sent with every response for a resource, whatever the outcome of
/// precondition and range evaluation: `Accept-Ranges`,
/// `Content-Disposition`, and the `ETag` / `Last-Modified` validators when
/// known.
pub fn write_default_headers(meta: &FileMeta, headers: &mut HeaderMap) {
    headers.typed_insert(AcceptRanges::bytes());
    insert_str(headers, header::CONTENT_DISPOSITION, &meta.content_disposition());

    if let Some(entity_tag) = meta.entity_tag() {
        insert_str(headers, header::ETAG, &entity_tag.to_string());
    }
    if let Some(last_modified) = meta.last_modified() {
        headers.typed_insert(LastModified::from(last_modified));
    }
}

fn insert_str(headers: &mut HeaderMap, name: HeaderName, value: &str) {
    match HeaderValue::from_str(value) {
        Ok(value) => {
            headers.insert(name, value);
        }
        Err(_) => warn!(%name, value, "dropping header with invalid value"),
    }
}

/// The shape of a response body, decided before the byte source is opened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BodyPlan {
    /// The whole representation.
    Full { length: u64 },
    /// One span, sent as `206` with `Content-Range`.
    Single { range: ByteRange, complete_length: u64 },
    /// Several spans, sent as a `206` `multipart/byteranges` document.
    Multipart {
        ranges: Vec<ByteRange>,
        complete_length: u64,
        boundary: String,
        content_type: String,
    },
}

impl BodyPlan {
    pub fn new(
        meta: &FileMeta,
        complete_length: u64,
        ranges: ResolvedRanges,
        config: &ResumeConfig,
    ) -> Self {
        let mut ranges = ranges.into_vec();
        match ranges.len() {
            0 => BodyPlan::Full { length: complete_length },
            1 => BodyPlan::Single { range: ranges.remove(0), complete_length },
            _ => BodyPlan::Multipart {
                ranges,
                complete_length,
                boundary: format!("{}{}", config.boundary_prefix, Uuid::new_v4().simple()),
                content_type: meta.content_type().to_string(),
            },
        }
    }

    /// Exact number of body bytes this plan produces.
    pub fn content_length(&self) -> u64 {
        match self {
            BodyPlan::Full { length } => *length,
            BodyPlan::Single { range, .. } => range.len(),
            BodyPlan::Multipart { ranges, complete_length, boundary, content_type } => {
                multipart_len(ranges, boundary, content_type, *complete_length)
            }
        }
    }

    /// Sets the status, `Content-Type`, `Content-Range` and `Content-Length`
    /// for this plan. The status is only touched for partial content.
    pub fn write_headers(&self, meta: &FileMeta, head: &mut ResponseHead) {
        match self {
            BodyPlan::Full { .. } => {
                insert_str(&mut head.headers, header::CONTENT_TYPE, meta.content_type());
            }
            BodyPlan::Single { range, complete_length } => {
                head.status = StatusCode::PARTIAL_CONTENT;
                insert_str(&mut head.headers, header::CONTENT_TYPE, meta.content_type());
                match ContentRange::bytes(range.from()..range.to() + 1, *complete_length) {
                    Ok(content_range) => head.headers.typed_insert(content_range),
                    Err(_) => warn!(%range, complete_length, "range outside representation"),
                }
            }
            BodyPlan::Multipart { boundary, .. } => {
                head.status = StatusCode::PARTIAL_CONTENT;
                insert_str(
                    &mut head.headers,
                    header::CONTENT_TYPE,
                    &format!("multipart/byteranges; boundary={boundary}"),
                );
            }
        }

        head.headers.typed_insert(ContentLength(self.content_length()));
    }

    /// Builds the body stream over an opened byte source.
    pub fn into_body<B: RangeBody + Send + 'static>(
        self,
        source: B,
        config: &ResumeConfig,
    ) -> ResumingBody<B> {
        let buffer_size = config.chunk_size();
        match self {
            BodyPlan::Full { length } => {
                ResumingBody::Ranged(RangedStream::new(source, 0, length, buffer_size))
            }
            BodyPlan::Single { range, .. } => {
                let stream = RangedStream::new(source, range.from(), range.len(), buffer_size);
                ResumingBody::Ranged(stream)
            }
            BodyPlan::Multipart { ranges, boundary, content_type, .. } => {
                let stream =
                    MultipartStream::new(source, ranges, boundary, content_type, buffer_size);
                ResumingBody::Multipart(stream)
            }
        }
    }
}

/// Writes the headers for `ranges` of `source` into `head` and returns the
/// body to stream. An empty `ranges` sends the whole representation.
///
/// Drive the returned body into a sink with [`ResumingBody::write_to`], or
/// hand it to axum inside a [`ResumingResponse`].
pub fn write_response<B: RangeBody + Send + 'static>(
    meta: &FileMeta,
    ranges: ResolvedRanges,
    source: B,
    head: &mut ResponseHead,
    config: &ResumeConfig,
) -> ResumingBody<B> {
    write_default_headers(meta, &mut head.headers);

    let plan = BodyPlan::new(meta, source.byte_size(), ranges, config);
    plan.write_headers(meta, head);
    debug!(status = %head.status, ?plan, "writing response");

    plan.into_body(source, config)
}

/// Computed head and body of a resumable response. Implements [`IntoResponse`].
#[derive(Debug)]
pub struct ResumingResponse<B> {
    pub head: ResponseHead,
    pub body: ResumingBody<B>,
}

impl<B: RangeBody + Send + 'static> IntoResponse for ResumingResponse<B> {
    fn into_response(self) -> Response {
        (self.head.status, self.head.headers, Body::new(self.body)).into_response()
    }
}
