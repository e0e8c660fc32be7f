//! Spatial tree nodes: identity, bounds, and the content state machine.
//!
//! Nodes live in a [`SpatialTree`] arena and refer to each other by
//! generational [`NodeId`]s, so a result arriving for a node that has since
//! been removed simply fails to resolve its id.

use std::fmt;
use std::time::{Duration, Instant};

use glam::DVec3;
use meridian_math::Aabb;
use slotmap::SlotMap;

use crate::collab::{Content, Geometry};
use crate::error::LodError;
use crate::request_queue::{CancelToken, JobHandle};

slotmap::new_key_type! {
    /// Generational handle of a node inside its [`SpatialTree`].
    pub struct NodeId;
}

/// Path-like node name: the child index taken at each level below the root.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeName(Vec<u8>);

impl NodeName {
    #[must_use]
    pub fn root() -> Self {
        Self(Vec::new())
    }

    #[must_use]
    pub fn from_indices(indices: &[u8]) -> Self {
        Self(indices.to_vec())
    }

    /// Parse a name written as `r` followed by one digit per level (`r0`, `r073`).
    pub fn parse(text: &str) -> Option<Self> {
        let digits = text.strip_prefix('r')?;
        digits
            .chars()
            .map(|c| c.to_digit(10).filter(|d| *d < 8).map(|d| d as u8))
            .collect::<Option<Vec<u8>>>()
            .map(Self)
    }

    #[must_use]
    pub fn child(&self, index: u8) -> Self {
        let mut indices = self.0.clone();
        indices.push(index);
        Self(indices)
    }

    #[must_use]
    pub fn depth(&self) -> u32 {
        self.0.len() as u32
    }

    pub fn indices(&self) -> &[u8] {
        &self.0
    }

    /// True if `self` is `other` or one of its ancestors.
    #[must_use]
    pub fn is_ancestor_of(&self, other: &NodeName) -> bool {
        other.0.starts_with(&self.0)
    }

    /// Longest shared prefix of two names.
    #[must_use]
    pub fn common_ancestor(&self, other: &NodeName) -> NodeName {
        let shared = self
            .0
            .iter()
            .zip(&other.0)
            .take_while(|(a, b)| a == b)
            .count();
        NodeName(self.0[..shared].to_vec())
    }
}

impl fmt::Display for NodeName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("r")?;
        for index in &self.0 {
            write!(f, "{index}")?;
        }
        Ok(())
    }
}

/// Tile pyramid coordinate.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TileCoord {
    pub depth: u32,
    pub x: u32,
    pub y: u32,
}

impl TileCoord {
    #[must_use]
    pub const fn new(depth: u32, x: u32, y: u32) -> Self {
        Self { depth, x, y }
    }

    /// Quadrant child; bit 0 of `quadrant` selects east, bit 1 north.
    ///
    /// Returns `self` past the deepest addressable level; use
    /// [`Self::checked_child`] where the depth is not bounded by the caller.
    #[must_use]
    pub fn child(&self, quadrant: u8) -> Self {
        self.checked_child(quadrant).unwrap_or(*self)
    }

    /// Quadrant child, or `None` once `x`/`y` no longer fit in a `u32`.
    #[must_use]
    pub fn checked_child(&self, quadrant: u8) -> Option<Self> {
        Some(Self {
            depth: self.depth.checked_add(1)?,
            x: self.x.checked_mul(2)?.checked_add(u32::from(quadrant & 1))?,
            y: self.y.checked_mul(2)?.checked_add(u32::from((quadrant >> 1) & 1))?,
        })
    }

    /// This tile's ancestor at `depth`, or `None` if `depth` is deeper.
    #[must_use]
    pub fn ancestor_at(&self, depth: u32) -> Option<Self> {
        let shift = self.depth.checked_sub(depth)?;
        Some(Self {
            depth,
            x: self.x.checked_shr(shift).unwrap_or(0),
            y: self.y.checked_shr(shift).unwrap_or(0),
        })
    }

    #[must_use]
    pub fn is_ancestor_of(&self, other: &TileCoord) -> bool {
        other.ancestor_at(self.depth) == Some(*self)
    }

    #[must_use]
    pub fn common_ancestor(&self, other: &TileCoord) -> TileCoord {
        let mut depth = self.depth.min(other.depth);
        loop {
            let (a, b) = (self.ancestor_at(depth), other.ancestor_at(depth));
            if a == b || depth == 0 {
                return a.unwrap_or_default();
            }
            depth -= 1;
        }
    }
}

/// Stable identity of a node, used for ancestry tests and job ids.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum NodeKey {
    Path(NodeName),
    Tile(TileCoord),
}

impl NodeKey {
    #[must_use]
    pub fn depth(&self) -> u32 {
        match self {
            NodeKey::Path(name) => name.depth(),
            NodeKey::Tile(coord) => coord.depth,
        }
    }

    /// Ancestor-or-self test. Keys of different shapes are never related.
    #[must_use]
    pub fn is_ancestor_of(&self, other: &NodeKey) -> bool {
        match (self, other) {
            (NodeKey::Path(a), NodeKey::Path(b)) => a.is_ancestor_of(b),
            (NodeKey::Tile(a), NodeKey::Tile(b)) => a.is_ancestor_of(b),
            _ => false,
        }
    }

    #[must_use]
    pub fn common_ancestor(&self, other: &NodeKey) -> Option<NodeKey> {
        match (self, other) {
            (NodeKey::Path(a), NodeKey::Path(b)) => Some(NodeKey::Path(a.common_ancestor(b))),
            (NodeKey::Tile(a), NodeKey::Tile(b)) => Some(NodeKey::Tile(a.common_ancestor(b))),
            _ => None,
        }
    }
}

impl fmt::Display for NodeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeKey::Path(name) => name.fmt(f),
            NodeKey::Tile(c) => write!(f, "{}/{}/{}", c.depth, c.x, c.y),
        }
    }
}

/// Displayable content owned by a node, with its current display settings.
pub struct Materialized {
    pub content: Box<dyn Content>,
    pub displayed: bool,
    /// Primitives drawn when displayed; lowered by the point budget, 0 hides.
    pub draw_count: u64,
}

impl Materialized {
    #[must_use]
    pub fn new(content: Box<dyn Content>) -> Self {
        let draw_count = content.primitive_count();
        Self {
            content,
            displayed: false,
            draw_count,
        }
    }

    /// Primitives currently on screen.
    #[must_use]
    pub fn displayed_count(&self) -> u64 {
        if self.displayed { self.draw_count } else { 0 }
    }

    /// Push display settings down to the content.
    pub fn sync(&mut self) {
        self.content
            .set_display(self.displayed && self.draw_count > 0, self.draw_count);
    }

    pub fn dispose(mut self) {
        self.content.dispose();
    }
}

impl fmt::Debug for Materialized {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Materialized")
            .field("primitives", &self.content.primitive_count())
            .field("displayed", &self.displayed)
            .field("draw_count", &self.draw_count)
            .finish()
    }
}

/// Content life cycle of a node.
#[derive(Debug, Default)]
pub enum NodeState {
    /// No content and nothing in flight.
    #[default]
    Unloaded,
    /// A content job is in flight.
    Requested(JobHandle<Geometry>),
    /// Content is attached.
    Ready(Materialized),
    /// Invisible since `since`; disposed once the grace period elapses.
    /// Carries the content (if any) so revisiting restores it untouched.
    MarkedForDeletion {
        since: Instant,
        content: Option<Materialized>,
    },
    /// Content was disposed; the node may load again.
    Deleted,
}

impl NodeState {
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            NodeState::Unloaded => "unloaded",
            NodeState::Requested(_) => "requested",
            NodeState::Ready(_) => "ready",
            NodeState::MarkedForDeletion { .. } => "marked-for-deletion",
            NodeState::Deleted => "deleted",
        }
    }

    #[must_use]
    pub fn is_requested(&self) -> bool {
        matches!(self, NodeState::Requested(_))
    }

    #[must_use]
    pub fn is_marked(&self) -> bool {
        matches!(self, NodeState::MarkedForDeletion { .. })
    }

    /// Content attached to the node, whether live or awaiting disposal.
    #[must_use]
    pub fn materialized(&self) -> Option<&Materialized> {
        match self {
            NodeState::Ready(m) => Some(m),
            NodeState::MarkedForDeletion { content, .. } => content.as_ref(),
            _ => None,
        }
    }

    pub fn materialized_mut(&mut self) -> Option<&mut Materialized> {
        match self {
            NodeState::Ready(m) => Some(m),
            NodeState::MarkedForDeletion { content, .. } => content.as_mut(),
            _ => None,
        }
    }
}

/// Whether a node's children are known.
#[derive(Debug, Default)]
pub enum ChildrenState {
    #[default]
    Unknown,
    /// A hierarchy job is in flight.
    Requested(JobHandle<serde_json::Value>),
    Known,
}

impl ChildrenState {
    #[must_use]
    pub fn is_known(&self) -> bool {
        matches!(self, ChildrenState::Known)
    }
}

/// Record of the last transient failure, used to throttle retries.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Failure {
    pub at: Instant,
    pub attempts: u32,
}

impl Failure {
    /// Earliest instant a retry is allowed: `base * 2^(attempts-1)`, capped at `max`.
    #[must_use]
    pub fn retry_at(&self, base: Duration, max: Duration) -> Instant {
        let exponent = self.attempts.saturating_sub(1).min(16);
        let delay = base.saturating_mul(1 << exponent).min(max);
        self.at + delay
    }
}

/// One unit of spatial subdivision. `D` is adapter-specific per-node data.
#[derive(Debug)]
pub struct SpatialNode<D> {
    key: NodeKey,
    bounds: Aabb,
    tight_bounds: Option<Aabb>,
    parent: Option<NodeId>,
    children: Vec<NodeId>,
    depth: u32,
    pub(crate) state: NodeState,
    pub(crate) children_state: ChildrenState,
    pub(crate) token: CancelToken,
    pub(crate) failure: Option<Failure>,
    pub(crate) sse: f64,
    pub(crate) visible: bool,
    pub data: D,
}

impl<D> SpatialNode<D> {
    fn new(key: NodeKey, bounds: Aabb, parent: Option<NodeId>, depth: u32, data: D) -> Self {
        Self {
            key,
            bounds,
            tight_bounds: None,
            parent,
            children: Vec::new(),
            depth,
            state: NodeState::Unloaded,
            children_state: ChildrenState::Unknown,
            token: CancelToken::new(),
            failure: None,
            sse: 0.0,
            visible: false,
            data,
        }
    }

    pub fn key(&self) -> &NodeKey {
        &self.key
    }

    /// Best known box: the tight box once content has reported one.
    #[must_use]
    pub fn bounding_volume(&self) -> Aabb {
        self.tight_bounds.unwrap_or(self.bounds)
    }

    #[must_use]
    pub fn loose_bounds(&self) -> Aabb {
        self.bounds
    }

    #[must_use]
    pub fn tight_bounds(&self) -> Option<Aabb> {
        self.tight_bounds
    }

    /// Record a tight box. Accepted only if it lies inside the current best
    /// box, so the box never grows. Returns whether it was accepted.
    ///
    /// Boxes computed from f32 positions may overshoot by a rounding error;
    /// such boxes are accepted and clamped to the current one.
    pub fn set_tight_bounds(&mut self, tight: Aabb) -> bool {
        if !tight.is_valid() {
            return false;
        }
        let current = self.bounding_volume();
        let magnitude = current.min.abs().max(current.max.abs()).max_element().max(1.0);
        let slack = DVec3::splat(f64::from(f32::EPSILON) * magnitude);
        let tolerated = Aabb::from_min_max(current.min - slack, current.max + slack);
        if !tolerated.contains_box(&tight) {
            return false;
        }
        self.tight_bounds = Some(Aabb::from_min_max(
            tight.min.clamp(current.min, current.max),
            tight.max.clamp(current.min, current.max),
        ));
        true
    }

    #[must_use]
    pub fn parent(&self) -> Option<NodeId> {
        self.parent
    }

    pub fn children(&self) -> &[NodeId] {
        &self.children
    }

    #[must_use]
    pub fn depth(&self) -> u32 {
        self.depth
    }

    pub fn state(&self) -> &NodeState {
        &self.state
    }

    pub fn children_state(&self) -> &ChildrenState {
        &self.children_state
    }

    /// SSE computed on the last visit.
    #[must_use]
    pub fn sse(&self) -> f64 {
        self.sse
    }

    /// Whether the node passed the visibility test on its last visit.
    #[must_use]
    pub fn is_visible(&self) -> bool {
        self.visible
    }

    #[must_use]
    pub fn failure(&self) -> Option<Failure> {
        self.failure
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.token
    }

    #[must_use]
    pub fn is_displayed(&self) -> bool {
        matches!(&self.state, NodeState::Ready(m) if m.displayed)
    }
}

/// Arena of nodes rooted at a single node.
#[derive(Debug)]
pub struct SpatialTree<D> {
    nodes: SlotMap<NodeId, SpatialNode<D>>,
    root: NodeId,
}

fn check_bounds(bounds: &Aabb, key: &NodeKey) -> Result<(), LodError> {
    if bounds.is_valid() {
        Ok(())
    } else {
        Err(LodError::InvalidBounds {
            context: format!("node {key}"),
        })
    }
}

impl<D> SpatialTree<D> {
    pub fn new(key: NodeKey, bounds: Aabb, data: D) -> Result<Self, LodError> {
        check_bounds(&bounds, &key)?;
        let mut nodes = SlotMap::with_key();
        let depth = key.depth();
        let root = nodes.insert(SpatialNode::new(key, bounds, None, depth, data));
        Ok(Self { nodes, root })
    }

    #[must_use]
    pub fn root(&self) -> NodeId {
        self.root
    }

    pub fn get(&self, id: NodeId) -> Option<&SpatialNode<D>> {
        self.nodes.get(id)
    }

    pub fn get_mut(&mut self, id: NodeId) -> Option<&mut SpatialNode<D>> {
        self.nodes.get_mut(id)
    }

    #[must_use]
    pub fn contains(&self, id: NodeId) -> bool {
        self.nodes.contains_key(id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (NodeId, &SpatialNode<D>)> {
        self.nodes.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (NodeId, &mut SpatialNode<D>)> {
        self.nodes.iter_mut()
    }

    /// Whether `id` is still linked into the tree: the root, or a node whose
    /// parent exists and lists it as a child.
    #[must_use]
    pub fn is_attached(&self, id: NodeId) -> bool {
        if id == self.root {
            return true;
        }
        self.nodes
            .get(id)
            .and_then(|node| node.parent)
            .and_then(|parent| self.nodes.get(parent))
            .is_some_and(|parent| parent.children.contains(&id))
    }

    /// Append a child under `parent`.
    pub fn add_child(
        &mut self,
        parent: NodeId,
        key: NodeKey,
        bounds: Aabb,
        data: D,
    ) -> Result<NodeId, LodError> {
        check_bounds(&bounds, &key)?;
        let depth = self
            .nodes
            .get(parent)
            .map(|p| p.depth + 1)
            .ok_or_else(|| LodError::InvalidBounds {
                context: format!("node {key} has no parent in the tree"),
            })?;
        let id = self
            .nodes
            .insert(SpatialNode::new(key, bounds, Some(parent), depth, data));
        if let Some(p) = self.nodes.get_mut(parent) {
            p.children.push(id);
        }
        Ok(id)
    }

    /// All descendants of `id` in depth-first order, excluding `id`.
    #[must_use]
    pub fn descendants(&self, id: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut stack: Vec<NodeId> = self
            .nodes
            .get(id)
            .map(|n| n.children.iter().rev().copied().collect())
            .unwrap_or_default();
        while let Some(next) = stack.pop() {
            if let Some(node) = self.nodes.get(next) {
                out.push(next);
                stack.extend(node.children.iter().rev().copied());
            }
        }
        out
    }

    /// Remove every descendant of `id` from the tree and return them.
    pub fn detach_children(&mut self, id: NodeId) -> Vec<SpatialNode<D>> {
        let removed: Vec<_> = self
            .descendants(id)
            .into_iter()
            .filter_map(|child| self.nodes.remove(child))
            .collect();
        if let Some(node) = self.nodes.get_mut(id) {
            node.children.clear();
            node.children_state = ChildrenState::Unknown;
        }
        removed
    }

    /// Find a node by key with a walk guided by ancestry.
    #[must_use]
    pub fn find(&self, key: &NodeKey) -> Option<NodeId> {
        let mut current = self.root;
        loop {
            let node = self.nodes.get(current)?;
            if node.key == *key {
                return Some(current);
            }
            current = node
                .children
                .iter()
                .copied()
                .find(|c| self.nodes.get(*c).is_some_and(|n| n.key.is_ancestor_of(key)))?;
        }
    }
}
