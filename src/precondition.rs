//! Conditional request evaluation (RFC 7232 §3, §6 and RFC 7233 §3.2).

use std::convert::Infallible;
use std::iter;
use std::time::SystemTime;

use axum::extract::FromRequestParts;
use axum::http::header::{self, HeaderName};
use axum::http::request::Parts;
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode};
use axum_extra::headers::{Header, LastModified};
use tracing::debug;

use crate::etag::EntityTagList;
use crate::FileMeta;

/// The request method and the request header fields that drive
/// preconditions and range selection.
///
/// Usable as an axum extractor; extraction never fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestConditions {
    method: Method,
    if_match: Option<String>,
    if_none_match: Option<String>,
    if_modified_since: Option<String>,
    if_unmodified_since: Option<String>,
    if_range: Option<String>,
    range: Option<String>,
}

impl RequestConditions {
    /// Collects the relevant fields from `headers`. Fields that appear on
    /// several lines are joined with `", "`, and fields that are empty or
    /// whitespace are treated as absent.
    pub fn from_headers(method: Method, headers: &HeaderMap) -> Self {
        RequestConditions {
            method,
            if_match: field(headers, header::IF_MATCH),
            if_none_match: field(headers, header::IF_NONE_MATCH),
            if_modified_since: field(headers, header::IF_MODIFIED_SINCE),
            if_unmodified_since: field(headers, header::IF_UNMODIFIED_SINCE),
            if_range: field(headers, header::IF_RANGE),
            range: field(headers, header::RANGE),
        }
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn range(&self) -> Option<&str> {
        self.range.as_deref()
    }

    fn is_get_or_head(&self) -> bool {
        self.method == Method::GET || self.method == Method::HEAD
    }

    /// 304 for safe retrievals, 412 for everything else.
    fn not_modified_status(&self) -> StatusCode {
        if self.is_get_or_head() {
            StatusCode::NOT_MODIFIED
        } else {
            StatusCode::PRECONDITION_FAILED
        }
    }
}

impl<S> FromRequestParts<S> for RequestConditions
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(RequestConditions::from_headers(parts.method.clone(), &parts.headers))
    }
}

fn field(headers: &HeaderMap, name: HeaderName) -> Option<String> {
    let joined = headers
        .get_all(name)
        .iter()
        .map(|value| String::from_utf8_lossy(value.as_bytes()).into_owned())
        .filter(|value| !value.trim().is_empty())
        .collect::<Vec<_>>()
        .join(", ");

    if joined.is_empty() {
        None
    } else {
        Some(joined)
    }
}

/// Outcome of precondition evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Precondition {
    /// Perform the request. `honor_range` is false when an `If-Range`
    /// validator did not match and the full representation must be sent.
    Proceed { honor_range: bool },
    /// Answer with this status (304 or 412) and no body.
    ShortCircuit(StatusCode),
}

/// Evaluates the conditional request fields against the resource validators
/// in the order RFC 7232 §6 mandates:
///
/// 1. `If-Match`, else `If-Unmodified-Since`
/// 2. `If-None-Match`, else `If-Modified-Since` (GET and HEAD only)
/// 3. `If-Range` (GET with a `Range` field only)
///
/// A field whose value cannot be parsed is skipped.
pub fn evaluate(conditions: &RequestConditions, meta: &FileMeta) -> Precondition {
    let short_circuit =
        check_match(conditions, meta).or_else(|| check_none_match(conditions, meta));
    if let Some(status) = short_circuit {
        debug!(method = %conditions.method, %status, "precondition short-circuit");
        return Precondition::ShortCircuit(status);
    }

    let honor_range = check_if_range(conditions, meta);
    if !honor_range {
        debug!("If-Range validator did not match, ignoring Range");
    }
    Precondition::Proceed { honor_range }
}

fn check_match(conditions: &RequestConditions, meta: &FileMeta) -> Option<StatusCode> {
    let failed = Some(StatusCode::PRECONDITION_FAILED);

    if let Some(value) = &conditions.if_match {
        let list = EntityTagList::parse(value)?;
        if list.is_malformed() {
            return failed;
        }

        // If-Match uses the strong comparison function
        let matched = meta
            .entity_tag()
            .is_some_and(|etag| list.has_any() || list.contains_strong(etag));
        return if matched { None } else { failed };
    }

    let last_modified = meta.last_modified()?;
    let since = parse_http_date(conditions.if_unmodified_since.as_deref()?)?;
    if last_modified > since {
        failed
    } else {
        None
    }
}

fn check_none_match(conditions: &RequestConditions, meta: &FileMeta) -> Option<StatusCode> {
    if let Some(value) = &conditions.if_none_match {
        let list = EntityTagList::parse(value)?;
        if list.is_malformed() {
            return Some(conditions.not_modified_status());
        }

        // If-None-Match uses the weak comparison function
        let matched = meta
            .entity_tag()
            .is_some_and(|etag| list.has_any() || list.contains_weak(etag));
        return if matched { Some(conditions.not_modified_status()) } else { None };
    }

    if !conditions.is_get_or_head() {
        return None;
    }

    let last_modified = meta.last_modified()?;
    let since = parse_http_date(conditions.if_modified_since.as_deref()?)?;
    if last_modified <= since {
        Some(StatusCode::NOT_MODIFIED)
    } else {
        None
    }
}

/// Whether the `Range` field should be honored.
fn check_if_range(conditions: &RequestConditions, meta: &FileMeta) -> bool {
    let (Some(value), Some(_)) = (&conditions.if_range, &conditions.range) else {
        return true;
    };
    if conditions.method != Method::GET {
        return true;
    }

    match parse_if_range(value) {
        Some(IfRange::Date(date)) => {
            meta.last_modified().is_some_and(|last_modified| last_modified <= date)
        }
        // an If-Range entity tag is always compared strongly
        Some(IfRange::EntityTag(tag)) => meta.entity_tag().is_some_and(|etag| etag.strong_eq(&tag)),
        None => true,
    }
}

enum IfRange {
    Date(SystemTime),
    EntityTag(crate::EntityTag),
}

fn parse_if_range(value: &str) -> Option<IfRange> {
    let value = value.trim();
    if value.starts_with('"') || value.starts_with("W/") {
        value.parse().ok().map(IfRange::EntityTag)
    } else {
        parse_http_date(value).map(IfRange::Date)
    }
}

/// Parses an RFC 7231 `HTTP-date` (IMF-fixdate, RFC 850 or asctime form).
pub(crate) fn parse_http_date(value: &str) -> Option<SystemTime> {
    let value = HeaderValue::from_str(value.trim()).ok()?;
    LastModified::decode(&mut iter::once(&value))
        .ok()
        .map(SystemTime::from)
}
