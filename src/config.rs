use serde::Deserialize;

const DEFAULT_BUFFER_SIZE: usize = 64 * 1024;
const DEFAULT_BOUNDARY_PREFIX: &str = "NextPart_";

/// Tuning knobs for resumable responses. Every field has a default, so an
/// empty document deserializes to [`ResumeConfig::default`].
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ResumeConfig {
    /// Capacity of each chunk read from the byte source.
    pub buffer_size: usize,
    /// Prefix of the random multipart boundary.
    pub boundary_prefix: String,
}

impl Default for ResumeConfig {
    fn default() -> Self {
        ResumeConfig {
            buffer_size: DEFAULT_BUFFER_SIZE,
            boundary_prefix: DEFAULT_BOUNDARY_PREFIX.to_string(),
        }
    }
}

impl ResumeConfig {
    /// Read chunk size, never zero.
    pub(crate) fn chunk_size(&self) -> usize {
        self.buffer_size.max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deserialize_defaults() {
        let config: ResumeConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(ResumeConfig::default(), config);
        assert_eq!(64 * 1024, config.buffer_size);
        assert_eq!("NextPart_", config.boundary_prefix);
    }

    #[test]
    fn test_deserialize_overrides() {
        let config: ResumeConfig =
            serde_json::from_str(r#"{ "buffer_size": 16, "boundary_prefix": "B_" }"#).unwrap();
        assert_eq!(16, config.buffer_size);
        assert_eq!("B_", config.boundary_prefix);
    }

    #[test]
    fn test_chunk_size_never_zero() {
        let config = ResumeConfig { buffer_size: 0, ..ResumeConfig::default() };
        assert_eq!(1, config.chunk_size());
    }
}
