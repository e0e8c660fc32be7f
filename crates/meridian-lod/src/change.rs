//! Tokens describing what changed since the previous frame.

use crate::node::NodeId;

/// Identifier of an entity registered with a frame driver.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityId(pub u32);

impl std::fmt::Display for EntityId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "entity-{}", self.0)
    }
}

/// What triggered a re-evaluation. Walkers only inspect the variant and the
/// ids it carries.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ChangeSource {
    /// The camera moved or its projection changed.
    Camera,
    /// The entity itself changed (options, visibility).
    Entity(EntityId),
    /// A node of an entity finished loading content or children.
    NodeLoaded { entity: EntityId, node: NodeId },
    /// Styling of an entity changed.
    Style(EntityId),
    /// Something changed but the origin is unknown.
    Unspecified,
}

impl ChangeSource {
    /// Whether this change can flip the visibility of any node of `entity`.
    #[must_use]
    pub fn forces_full_walk(&self, entity: EntityId) -> bool {
        match self {
            ChangeSource::Camera | ChangeSource::Unspecified => true,
            ChangeSource::Entity(id) => *id == entity,
            ChangeSource::NodeLoaded { .. } | ChangeSource::Style(_) => false,
        }
    }

    /// The loaded node, when this change is a load of one of `entity`'s nodes.
    #[must_use]
    pub fn loaded_node(&self, entity: EntityId) -> Option<NodeId> {
        match self {
            ChangeSource::NodeLoaded { entity: e, node } if *e == entity => Some(*node),
            _ => None,
        }
    }
}
