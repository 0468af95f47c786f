use std::fmt;
use std::str::FromStr;

/// An entity tag validator, as carried by `ETag`, `If-Match`, `If-None-Match`
/// and `If-Range`.
///
/// The tag text is stored without its surrounding quotes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EntityTag {
    tag: String,
    weak: bool,
}

impl EntityTag {
    /// Construct a strong entity tag from its opaque text (without quotes).
    pub fn strong(tag: impl Into<String>) -> Self {
        EntityTag { tag: tag.into(), weak: false }
    }

    /// Construct a weak entity tag from its opaque text (without quotes).
    pub fn weak(tag: impl Into<String>) -> Self {
        EntityTag { tag: tag.into(), weak: true }
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn is_weak(&self) -> bool {
        self.weak
    }

    /// RFC 7232 §2.3.2 strong comparison: both tags non-weak and the opaque
    /// text identical.
    pub fn strong_eq(&self, other: &EntityTag) -> bool {
        !self.weak && !other.weak && self.tag == other.tag
    }

    /// RFC 7232 §2.3.2 weak comparison: the opaque text identical, weakness
    /// ignored.
    pub fn weak_eq(&self, other: &EntityTag) -> bool {
        self.tag == other.tag
    }
}

impl fmt::Display for EntityTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.weak {
            f.write_str("W/")?;
        }
        write!(f, "\"{}\"", self.tag)
    }
}

/// Error returned when a string is not a single valid entity tag.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid entity tag: {0:?}")]
pub struct InvalidEntityTag(pub String);

impl FromStr for EntityTag {
    type Err = InvalidEntityTag;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match parse_tag(s.trim()) {
            Some((tag, rest)) if rest.trim().is_empty() => Ok(tag),
            _ => Err(InvalidEntityTag(s.to_string())),
        }
    }
}

/// One element of an `If-Match` / `If-None-Match` field value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Candidate {
    Any,
    Tag(EntityTag),
}

/// A parsed `If-Match` / `If-None-Match` field value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct EntityTagList(Vec<Candidate>);

impl EntityTagList {
    /// Parses a comma separated list of entity tags and `*` wildcards. Empty
    /// list elements are skipped; any other syntax error fails the whole list.
    pub(crate) fn parse(value: &str) -> Option<EntityTagList> {
        let mut items = Vec::new();
        let mut rest = value;

        loop {
            rest = rest.trim_start_matches(|c: char| c == ',' || c.is_ascii_whitespace());
            if rest.is_empty() {
                break;
            }

            if let Some(after) = rest.strip_prefix('*') {
                items.push(Candidate::Any);
                rest = after;
            } else {
                let (tag, after) = parse_tag(rest)?;
                items.push(Candidate::Tag(tag));
                rest = after;
            }

            // the next element must be separated by a comma
            let trimmed = rest.trim_start();
            if !trimmed.is_empty() && !trimmed.starts_with(',') {
                return None;
            }
            rest = trimmed;
        }

        if items.is_empty() {
            None
        } else {
            Some(EntityTagList(items))
        }
    }

    pub(crate) fn has_any(&self) -> bool {
        self.0.iter().any(|c| *c == Candidate::Any)
    }

    /// `*` is only valid as the sole member of the list.
    pub(crate) fn is_malformed(&self) -> bool {
        self.0.len() > 1 && self.has_any()
    }

    pub(crate) fn contains_strong(&self, etag: &EntityTag) -> bool {
        self.tags().any(|t| t.strong_eq(etag))
    }

    pub(crate) fn contains_weak(&self, etag: &EntityTag) -> bool {
        self.tags().any(|t| t.weak_eq(etag))
    }

    fn tags(&self) -> impl Iterator<Item = &EntityTag> {
        self.0.iter().filter_map(|c| match c {
            Candidate::Tag(tag) => Some(tag),
            Candidate::Any => None,
        })
    }
}

/// Parses one `entity-tag` from the start of `input`, returning the tag and
/// the unparsed remainder.
///
/// ```text
/// entity-tag = [ weak ] opaque-tag
/// weak       = %x57.2F ; "W/", case-sensitive
/// opaque-tag = DQUOTE *etagc DQUOTE
/// etagc      = %x21 / %x23-7E / obs-text
/// ```
fn parse_tag(input: &str) -> Option<(EntityTag, &str)> {
    let input = input.trim_start();
    let (weak, quoted) = match input.strip_prefix("W/") {
        Some(quoted) => (true, quoted),
        None => (false, input),
    };

    let body = quoted.strip_prefix('"')?;
    let close = body.find('"')?;
    let tag = &body[..close];

    if !tag.bytes().all(is_etagc) {
        return None;
    }

    let entity_tag = EntityTag { tag: tag.to_string(), weak };
    Some((entity_tag, &body[close + 1..]))
}

fn is_etagc(b: u8) -> bool {
    b == 0x21 || (0x23..=0x7e).contains(&b) || b >= 0x80
}
