//! Codec errors.

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("Cannot encode value of type {kind} at {path}")]
    Unsupported { kind: &'static str, path: String },

    #[error("Wire graph references missing object #{0}")]
    DanglingRef(u32),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
