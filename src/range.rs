//! `Range` header parsing and normalization (RFC 7233 §2.1, §3.1).
//!
//! Resolution never fails: a malformed header, a unit other than `bytes`,
//! or a set of specs that are all unsatisfiable yields an empty
//! [`ResolvedRanges`], which means "serve the full representation".

use std::fmt;

use tracing::trace;

/// An inclusive span of bytes, `from <= to`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    from: u64,
    to: u64,
}

impl ByteRange {
    /// # Panics
    ///
    /// Panics if `from > to`.
    pub fn new(from: u64, to: u64) -> Self {
        assert!(from <= to, "byte range start {from} is past its end {to}");
        ByteRange { from, to }
    }

    /// First byte position.
    pub fn from(&self) -> u64 {
        self.from
    }

    /// Last byte position, inclusive.
    pub fn to(&self) -> u64 {
        self.to
    }

    pub fn len(&self) -> u64 {
        self.to - self.from + 1
    }

    /// Always false: a range covers at least one byte.
    pub fn is_empty(&self) -> bool {
        false
    }

    /// The `Content-Range` field value for this span, e.g. `bytes 0-4/62`.
    pub fn content_range(&self, complete_length: u64) -> String {
        format!("bytes {}-{}/{}", self.from, self.to, complete_length)
    }
}

impl fmt::Display for ByteRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.from, self.to)
    }
}

/// A single `byte-range-spec` or `suffix-byte-range-spec`, before it is
/// checked against the representation length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeSpec {
    /// `first-last`
    FromTo { first: u64, last: u64 },
    /// `first-`
    From { first: u64 },
    /// `-length`
    Suffix { length: u64 },
}

impl RangeSpec {
    /// Clamps this spec to a representation of `content_length` bytes.
    /// Returns `None` when the range is unsatisfiable.
    pub fn normalize(self, content_length: u64) -> Option<ByteRange> {
        let last_index = content_length.checked_sub(1)?;

        match self {
            RangeSpec::FromTo { first, last } if first < content_length => {
                Some(ByteRange::new(first, last.min(last_index)))
            }
            RangeSpec::From { first } if first < content_length => {
                Some(ByteRange::new(first, last_index))
            }
            RangeSpec::Suffix { length } if length > 0 => {
                Some(ByteRange::new(content_length.saturating_sub(length), last_index))
            }
            _ => None,
        }
    }
}

/// Parses a `Range` field value. Returns `None` for anything that is not a
/// syntactically valid `bytes` range set.
///
/// ```text
/// byte-ranges-specifier = bytes-unit "=" byte-range-set
/// byte-range-set  = 1#( byte-range-spec / suffix-byte-range-spec )
/// byte-range-spec = first-byte-pos "-" [ last-byte-pos ]
/// suffix-byte-range-spec = "-" suffix-length
/// ```
pub fn parse_range_header(value: &str) -> Option<Vec<RangeSpec>> {
    let (unit, set) = value.trim().split_once('=')?;
    if !unit.trim().eq_ignore_ascii_case("bytes") {
        return None;
    }

    let mut specs = Vec::new();
    for item in set.split(',') {
        let item = item.trim();
        if item.is_empty() {
            continue;
        }

        let (first, last) = item.split_once('-')?;
        let spec = match (parse_pos(first)?, parse_pos(last)?) {
            (Some(first), Some(last)) if first <= last => RangeSpec::FromTo { first, last },
            (Some(first), None) => RangeSpec::From { first },
            (None, Some(length)) => RangeSpec::Suffix { length },
            // `last < first`, or a lone "-"
            _ => return None,
        };
        specs.push(spec);
    }

    if specs.is_empty() {
        None
    } else {
        Some(specs)
    }
}

/// `Some(None)` for an empty position, `None` if it is not a number.
fn parse_pos(pos: &str) -> Option<Option<u64>> {
    let pos = pos.trim();
    if pos.is_empty() {
        return Some(None);
    }
    if !pos.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    pos.parse().ok().map(Some)
}

/// Sorted, disjoint, non-adjacent byte ranges of one representation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolvedRanges(Vec<ByteRange>);

impl ResolvedRanges {
    /// Sorts `ranges` by start and merges every pair that overlaps or
    /// touches.
    pub fn merge(mut ranges: Vec<ByteRange>) -> Self {
        ranges.sort_by_key(|range| range.from);

        let mut merged: Vec<ByteRange> = Vec::with_capacity(ranges.len());
        for range in ranges {
            match merged.last_mut() {
                Some(current) if range.from <= current.to.saturating_add(1) => {
                    current.to = current.to.max(range.to);
                }
                _ => merged.push(range),
            }
        }

        ResolvedRanges(merged)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn as_slice(&self) -> &[ByteRange] {
        &self.0
    }

    pub fn iter(&self) -> std::slice::Iter<'_, ByteRange> {
        self.0.iter()
    }

    pub fn into_vec(self) -> Vec<ByteRange> {
        self.0
    }
}

impl<'a> IntoIterator for &'a ResolvedRanges {
    type Item = &'a ByteRange;
    type IntoIter = std::slice::Iter<'a, ByteRange>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// Resolves a `Range` field value against a representation of
/// `content_length` bytes.
///
/// Unsatisfiable specs are dropped rather than answered with
/// `416 Range Not Satisfiable`; when none survive the result is empty and
/// the caller serves the whole representation.
pub fn resolve(range: Option<&str>, content_length: u64) -> ResolvedRanges {
    let Some(specs) = range.and_then(parse_range_header) else {
        trace!(?range, "no usable range header");
        return ResolvedRanges::default();
    };

    let satisfiable = specs
        .iter()
        .filter_map(|spec| spec.normalize(content_length))
        .collect();
    let resolved = ResolvedRanges::merge(satisfiable);

    trace!(?specs, content_length, ranges = ?resolved.as_slice(), "resolved range header");
    resolved
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ranges(header: &str, content_length: u64) -> Vec<(u64, u64)> {
        resolve(Some(header), content_length)
            .iter()
            .map(|r| (r.from, r.to))
            .collect()
    }

    #[test]
    fn test_parse_range_header() {
        assert_eq!(
            Some(vec![
                RangeSpec::FromTo { first: 0, last: 0 },
                RangeSpec::From { first: 10 },
                RangeSpec::Suffix { length: 3 },
            ]),
            parse_range_header("bytes=0-0, 10-,-3")
        );
        assert_eq!(
            Some(vec![RangeSpec::FromTo { first: 1, last: 4 }]),
            parse_range_header(" Bytes = 1 - 4 ")
        );
        assert_eq!(
            Some(vec![RangeSpec::From { first: 5 }]),
            parse_range_header("bytes=,5-,")
        );
    }

    #[test]
    fn test_parse_range_header_invalid() {
        assert_eq!(None, parse_range_header(""));
        assert_eq!(None, parse_range_header("bytes"));
        assert_eq!(None, parse_range_header("bytes="));
        assert_eq!(None, parse_range_header("bytes=,"));
        assert_eq!(None, parse_range_header("items=0-5"));
        assert_eq!(None, parse_range_header("bytes=-"));
        assert_eq!(None, parse_range_header("bytes=5-4"));
        assert_eq!(None, parse_range_header("bytes=a-4"));
        assert_eq!(None, parse_range_header("bytes=+1-4"));
        assert_eq!(None, parse_range_header("bytes=0-5,7"));
        assert_eq!(None, parse_range_header("bytes=0-99999999999999999999"));
    }

    #[test]
    fn test_normalize() {
        let from_to = |first, last| RangeSpec::FromTo { first, last }.normalize(62);
        assert_eq!(Some(ByteRange::new(0, 0)), from_to(0, 0));
        assert_eq!(Some(ByteRange::new(50, 61)), from_to(50, 999));
        assert_eq!(None, RangeSpec::FromTo { first: 62, last: 70 }.normalize(62));
        assert_eq!(Some(ByteRange::new(40, 61)), RangeSpec::From { first: 40 }.normalize(62));
        assert_eq!(None, RangeSpec::From { first: 62 }.normalize(62));
        assert_eq!(Some(ByteRange::new(59, 61)), RangeSpec::Suffix { length: 3 }.normalize(62));
        assert_eq!(Some(ByteRange::new(0, 61)), RangeSpec::Suffix { length: 100 }.normalize(62));
        assert_eq!(None, RangeSpec::Suffix { length: 0 }.normalize(62));
    }

    #[test]
    fn test_normalize_empty_representation() {
        assert_eq!(None, RangeSpec::FromTo { first: 0, last: 0 }.normalize(0));
        assert_eq!(None, RangeSpec::From { first: 0 }.normalize(0));
        assert_eq!(None, RangeSpec::Suffix { length: 5 }.normalize(0));
    }

    #[test]
    fn test_resolve_absent_or_malformed() {
        assert!(resolve(None, 62).is_empty());
        assert!(resolve(Some("bytes=5-1"), 62).is_empty());
        assert!(resolve(Some("lines=1-2"), 62).is_empty());
    }

    #[test]
    fn test_resolve_drops_unsatisfiable() {
        assert_eq!(vec![(0, 4)], ranges("bytes=0-4,100-200", 62));
        assert!(resolve(Some("bytes=100-200,62-"), 62).is_empty());
    }

    #[test]
    fn test_resolve_merges_adjacent() {
        assert_eq!(vec![(0, 4), (59, 61)], ranges("bytes=0-0,1-4,-3", 62));
        assert_eq!(vec![(0, 0), (2, 4), (59, 61)], ranges("bytes=0-0,2-4,-3", 62));
    }

    #[test]
    fn test_resolve_merges_overlapping_unsorted() {
        assert_eq!(vec![(5, 30)], ranges("bytes=20-30,5-10,8-25", 62));
        assert_eq!(vec![(0, 999)], ranges("bytes=500-600,601-999,0-", 1000));
        assert_eq!(vec![(500, 999)], ranges("bytes=500-600,601-999", 1000));
        assert_eq!(vec![(500, 999)], ranges("bytes=500-700,601-999", 1000));
    }

    #[test]
    fn test_resolve_contained_range() {
        assert_eq!(vec![(0, 50)], ranges("bytes=0-50,10-20", 62));
    }

    #[test]
    fn test_resolve_idempotent() {
        let header = "bytes=40-,0-0,3-9,-10,8-12";
        assert_eq!(resolve(Some(header), 62), resolve(Some(header), 62));
    }

    #[test]
    fn test_merge_covers_same_bytes() {
        let inputs = [
            "bytes=0-3,2-7,10-12,13-13,-5",
            "bytes=1-1,3-3,5-5,2-2,4-4",
            "bytes=60-,0-100,30-31",
            "bytes=9-9,7-8,-1,58-",
        ];

        for header in inputs {
            let content_length = 62;
            let mut expected = vec![false; content_length as usize];
            for spec in parse_range_header(header).unwrap() {
                if let Some(range) = spec.normalize(content_length) {
                    for i in range.from..=range.to {
                        expected[i as usize] = true;
                    }
                }
            }

            let resolved = resolve(Some(header), content_length);
            let mut covered = vec![false; content_length as usize];
            for range in &resolved {
                for i in range.from..=range.to {
                    covered[i as usize] = true;
                }
            }
            assert_eq!(expected, covered, "{header}");

            for pair in resolved.as_slice().windows(2) {
                assert!(pair[0].to + 1 < pair[1].from, "{header}: {:?}", pair);
            }
        }
    }

    #[test]
    fn test_content_range() {
        assert_eq!("bytes 59-61/62", ByteRange::new(59, 61).content_range(62));
        assert_eq!(3, ByteRange::new(59, 61).len());
        assert!(!ByteRange::new(59, 61).is_empty());
        assert_eq!((59, 61), (ByteRange::new(59, 61).from(), ByteRange::new(59, 61).to()));
        assert_eq!("59-61", ByteRange::new(59, 61).to_string());
    }
}
