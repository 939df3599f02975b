//! Error types for policy loading and decoding.

/// Result type alias for policy operations.
pub type Result<T> = std::result::Result<T, ConfigError>;

/// Errors that can occur when loading or decoding a security policy.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read the policy file from disk.
    #[error("failed to read policy file '{path}': {source}")]
    ReadFile {
        /// Path that could not be read.
        path: String,
        /// Underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// The policy file is not valid JSON or does not match the schema.
    #[error("failed to decode policy: {0}")]
    Decode(#[from] serde_json::Error),
}
