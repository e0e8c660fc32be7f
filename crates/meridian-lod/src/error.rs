//! Error types for entity construction and content fetching.

/// Construction-time and validation errors. These prevent an entity from
/// being created at all.
#[derive(Debug, thiserror::Error)]
pub enum LodError {
    /// A required construction option was not provided.
    #[error("missing required option `{0}`")]
    MissingOption(&'static str),

    /// A bounding volume is empty, inverted, or not finite.
    #[error("invalid bounding volume for {context}")]
    InvalidBounds { context: String },

    /// A tileset descriptor could not be interpreted.
    #[error("invalid tileset: {0}")]
    InvalidTileset(String),

    /// A hierarchy document could not be interpreted.
    #[error("invalid hierarchy for {node}: {reason}")]
    InvalidHierarchy { node: String, reason: String },

    /// A payload declared a geometry kind this crate does not know.
    #[error("unknown geometry type `{0}`")]
    UnknownGeometry(String),

    /// The content builder rejected decoded geometry.
    #[error("content build failed: {0}")]
    Build(String),
}

/// Errors from the fetch/decode collaborators.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FetchError {
    /// The fetch noticed its cancel token and stopped.
    #[error("fetch aborted")]
    Aborted,

    /// The resource could not be retrieved.
    #[error("fetch of `{url}` failed: {reason}")]
    Failed { url: String, reason: String },

    /// The payload was retrieved but could not be decoded.
    #[error("decode failed: {0}")]
    Decode(String),

    /// Geometry does not fit the binary layout.
    #[error("encode failed: {0}")]
    Encode(String),
}
