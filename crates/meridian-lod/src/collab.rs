//! Contracts of the collaborators the engine consumes: fetching, decoding,
//! and building displayable content.

use glam::DVec3;
use meridian_math::Aabb;
use serde::{Deserialize, Serialize};

use crate::error::{FetchError, LodError};
use crate::request_queue::CancelToken;

/// Kind of primitives a payload carries.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GeometryKind {
    Points,
    Mesh,
    Features,
}

impl GeometryKind {
    /// Four-byte tag identifying the kind in binary payloads.
    #[must_use]
    pub fn tag(self) -> [u8; 4] {
        match self {
            GeometryKind::Points => *b"PNTS",
            GeometryKind::Mesh => *b"MESH",
            GeometryKind::Features => *b"FEAT",
        }
    }

    #[must_use]
    pub fn from_tag(tag: [u8; 4]) -> Option<Self> {
        match &tag {
            b"PNTS" => Some(GeometryKind::Points),
            b"MESH" => Some(GeometryKind::Mesh),
            b"FEAT" => Some(GeometryKind::Features),
            _ => None,
        }
    }

    /// Parse a kind name as it appears in descriptors.
    pub fn parse(name: &str) -> Result<Self, LodError> {
        match name {
            "points" | "pnts" => Ok(GeometryKind::Points),
            "mesh" | "b3dm" | "glb" => Ok(GeometryKind::Mesh),
            "features" | "geojson" => Ok(GeometryKind::Features),
            other => Err(LodError::UnknownGeometry(other.to_string())),
        }
    }
}

/// What the decoder should expect in a payload.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SchemaHint {
    pub kind: GeometryKind,
}

/// Decoded geometry, ready to be turned into displayable content.
#[derive(Clone, Debug, PartialEq)]
pub struct Geometry {
    pub kind: GeometryKind,
    pub primitive_count: u64,
    pub positions: Vec<DVec3>,
}

impl Geometry {
    /// Box enclosing all positions.
    #[must_use]
    pub fn tight_bounds(&self) -> Option<Aabb> {
        Aabb::from_points(self.positions.iter().copied())
    }

    /// Binary layout read by [`crate::memory::SimpleDecoder`]: kind tag,
    /// primitive count (u32 LE), vertex count (u32 LE), then xyz as f32 LE.
    pub fn encode(&self) -> Result<Vec<u8>, FetchError> {
        let primitives = u32::try_from(self.primitive_count).map_err(|_| {
            FetchError::Encode(format!("{} primitives exceed u32", self.primitive_count))
        })?;
        let vertices = u32::try_from(self.positions.len()).map_err(|_| {
            FetchError::Encode(format!("{} vertices exceed u32", self.positions.len()))
        })?;
        let mut out = Vec::with_capacity(12 + self.positions.len() * 12);
        out.extend_from_slice(&self.kind.tag());
        out.extend_from_slice(&primitives.to_le_bytes());
        out.extend_from_slice(&vertices.to_le_bytes());
        for p in &self.positions {
            for c in [p.x, p.y, p.z] {
                out.extend_from_slice(&(c as f32).to_le_bytes());
            }
        }
        Ok(out)
    }
}

/// Retrieves raw resources. Implementations should check `cancel` and return
/// [`FetchError::Aborted`] once it is set.
pub trait Fetcher: Send + Sync {
    fn fetch_binary(&self, url: &str, cancel: &CancelToken) -> Result<Vec<u8>, FetchError>;
    fn fetch_json(&self, url: &str, cancel: &CancelToken) -> Result<serde_json::Value, FetchError>;
}

/// Turns raw bytes into geometry.
pub trait Decoder: Send + Sync {
    fn decode(&self, bytes: &[u8], hint: &SchemaHint) -> Result<Geometry, FetchError>;
}

/// Displayable object owned by a node.
pub trait Content {
    fn primitive_count(&self) -> u64;

    /// Box enclosing the built payload, if the payload knows it.
    fn tight_bounds(&self) -> Option<Aabb>;

    /// Apply display state: shown or hidden, and how many primitives to draw.
    fn set_display(&mut self, displayed: bool, draw_count: u64);

    /// Release all resources held by the content.
    fn dispose(&mut self);
}

/// Builds displayable content from decoded geometry. Runs on the frame thread.
pub trait ContentBuilder {
    fn build(&self, geometry: Geometry) -> Result<Box<dyn Content>, LodError>;
}
