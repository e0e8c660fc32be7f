//! Tree-shape specialization plugged into the generic walker.
//!
//! A [`TreeAdapter`] supplies what differs between point-cloud octrees, tile
//! trees, and feature quadtrees: how SSE is computed, when to subdivide,
//! where children and content come from, and how refinement composes
//! parent and child content.

use glam::DMat4;
use meridian_math::Aabb;

use crate::camera::ViewCamera;
use crate::collab::SchemaHint;
use crate::error::LodError;
use crate::eviction::PointBudget;
use crate::node::{NodeKey, SpatialNode};

/// How child content composes with its parent's.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum Refinement {
    /// Children are drawn on top of the parent.
    Additive,
    /// Children replace the parent once all of them are ready.
    #[default]
    Replace,
}

/// Camera and entity placement used for SSE computation.
#[derive(Clone, Copy)]
pub struct ViewContext<'a> {
    pub camera: &'a dyn ViewCamera,
    pub world: &'a DMat4,
}

impl ViewContext<'_> {
    /// The node's best box placed in world space.
    #[must_use]
    pub fn world_bounds<D>(&self, node: &SpatialNode<D>) -> Aabb {
        node.bounding_volume().transformed(self.world)
    }
}

/// Declaration of a child to create.
#[derive(Clone, Debug)]
pub struct ChildSpec<D> {
    pub key: NodeKey,
    pub bounds: Aabb,
    pub data: D,
}

/// Where a node's content comes from.
#[derive(Clone, Debug, PartialEq)]
pub struct ContentRequest {
    pub url: String,
    pub hint: SchemaHint,
}

/// Where a node's children come from.
#[derive(Debug)]
pub enum ChildSource<D> {
    /// The node has no children.
    Leaf,
    /// Children are known now.
    Ready(Vec<ChildSpec<D>>),
    /// Children are described by a document that must be fetched first.
    Fetch { url: String },
}

/// Per-kind behaviour of a spatial entity.
pub trait TreeAdapter {
    /// Adapter-specific data stored on every node.
    type Data;

    /// Short kind name for logs.
    fn kind_name(&self) -> &'static str;

    /// Screen-space error of `node`; `f64::INFINITY` when it cannot be computed.
    fn screen_space_error(&self, node: &SpatialNode<Self::Data>, view: &ViewContext<'_>) -> f64;

    /// Whether `node` with the given SSE needs more detail than it carries.
    fn should_subdivide(
        &self,
        node: &SpatialNode<Self::Data>,
        view: &ViewContext<'_>,
        sse: f64,
    ) -> bool;

    /// Children of `node`, derived from its data and bounds.
    fn children(&self, node: &SpatialNode<Self::Data>) -> ChildSource<Self::Data>;

    /// Interpret a fetched hierarchy document for `node`.
    fn parse_children(
        &self,
        node: &SpatialNode<Self::Data>,
        document: serde_json::Value,
    ) -> Result<ChildSource<Self::Data>, LodError>;

    /// Content to load for `node`, or `None` if it has nothing to show.
    fn content_request(&self, node: &SpatialNode<Self::Data>) -> Option<ContentRequest>;

    fn refinement(&self, node: &SpatialNode<Self::Data>) -> Refinement;

    /// Keep disposed nodes and their descendants in the tree.
    fn retains_structure(&self) -> bool {
        false
    }

    /// Primitive budget enforced after each walk.
    fn budget(&self) -> Option<PointBudget> {
        None
    }

    /// Narrow walks triggered by node loads to the loaded nodes' common ancestor.
    fn uses_load_hint(&self) -> bool {
        false
    }
}
