use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};

use crate::EntityTag;

/// Everything but RFC 5987 `attr-char`.
const ATTR_CHAR_ENCODE_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'!')
    .remove(b'#')
    .remove(b'$')
    .remove(b'&')
    .remove(b'+')
    .remove(b'-')
    .remove(b'.')
    .remove(b'^')
    .remove(b'_')
    .remove(b'`')
    .remove(b'|')
    .remove(b'~');

/// Representation metadata of a resumable resource: everything the engine
/// needs besides the bytes themselves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileMeta {
    content_type: String,
    entity_tag: Option<EntityTag>,
    last_modified: Option<SystemTime>,
    download_name: Option<String>,
    inline_name: Option<String>,
}

impl FileMeta {
    /// Metadata with the given MIME type and no validators.
    pub fn new(content_type: impl Into<String>) -> Self {
        FileMeta {
            content_type: content_type.into(),
            entity_tag: None,
            last_modified: None,
            download_name: None,
            inline_name: None,
        }
    }

    /// Metadata with a content type guessed from the file extension of
    /// `path`, falling back to `application/octet-stream`.
    pub fn guess(path: impl AsRef<Path>) -> Self {
        let mime = mime_guess::from_path(path).first_or_octet_stream();
        FileMeta::new(mime.essence_str())
    }

    pub fn with_entity_tag(mut self, entity_tag: EntityTag) -> Self {
        self.entity_tag = Some(entity_tag);
        self
    }

    /// Sets the last modification time, truncated to whole seconds as HTTP
    /// dates cannot carry anything finer.
    pub fn with_last_modified(mut self, last_modified: SystemTime) -> Self {
        self.last_modified = Some(truncate_to_seconds(last_modified));
        self
    }

    /// Serve as `Content-Disposition: attachment` with this file name.
    pub fn with_download_name(mut self, name: impl Into<String>) -> Self {
        self.download_name = Some(name.into());
        self
    }

    /// File name for the `inline` disposition; ignored when a download name
    /// is set.
    pub fn with_inline_name(mut self, name: impl Into<String>) -> Self {
        self.inline_name = Some(name.into());
        self
    }

    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    pub fn entity_tag(&self) -> Option<&EntityTag> {
        self.entity_tag.as_ref()
    }

    pub fn last_modified(&self) -> Option<SystemTime> {
        self.last_modified
    }

    pub fn download_name(&self) -> Option<&str> {
        self.download_name.as_deref()
    }

    pub fn inline_name(&self) -> Option<&str> {
        self.inline_name.as_deref()
    }

    /// The `Content-Disposition` field value for this resource.
    pub fn content_disposition(&self) -> String {
        match (self.download_name(), self.inline_name()) {
            (Some(name), _) if !name.is_empty() => disposition("attachment", Some(name)),
            (_, Some(name)) if !name.trim().is_empty() => disposition("inline", Some(name)),
            _ => disposition("inline", None),
        }
    }
}

fn truncate_to_seconds(time: SystemTime) -> SystemTime {
    match time.duration_since(UNIX_EPOCH) {
        Ok(since) => UNIX_EPOCH + Duration::from_secs(since.as_secs()),
        // HTTP dates cannot express times before the epoch
        Err(_) => UNIX_EPOCH,
    }
}

fn disposition(kind: &str, filename: Option<&str>) -> String {
    let Some(name) = filename else {
        return kind.to_string();
    };

    if name.bytes().all(is_tchar) {
        format!("{kind}; filename={name}")
    } else if name.is_ascii() {
        format!("{kind}; filename=\"{}\"", quote(&ascii_fallback(name)))
    } else {
        // RFC 6266 §4.3: ASCII fallback plus the RFC 5987 encoded name
        format!(
            "{kind}; filename=\"{}\"; filename*=UTF-8''{}",
            quote(&ascii_fallback(name)),
            utf8_percent_encode(name, ATTR_CHAR_ENCODE_SET),
        )
    }
}

/// Replaces characters a quoted-string cannot carry with `_`.
fn ascii_fallback(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii() && !c.is_ascii_control() { c } else { '_' })
        .collect()
}

fn quote(name: &str) -> String {
    name.replace('\\', "\\\\").replace('"', "\\\"")
}

/// RFC 7230 `tchar`.
fn is_tchar(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b"!#$%&'*+-.^_`|~".contains(&b)
}
