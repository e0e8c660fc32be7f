//! Adaptive level-of-detail engine for hierarchical geospatial data.
//!
//! Point-cloud octrees, 3D tile trees, and feature quadtrees share one walk:
//! each frame nodes are tested against the camera, refined or collapsed by
//! screen-space error, loaded through a prioritized request queue, and
//! evicted after a grace period once they leave the view.

pub mod adapter;
pub mod adapters;
pub mod camera;
pub mod change;
pub mod collab;
pub mod diagnostics;
pub mod driver;
pub mod error;
pub mod eviction;
pub mod memory;
pub mod node;
pub mod operation_counter;
pub mod request_queue;
pub mod walker;

#[cfg(test)]
mod test_support;

pub use adapter::{ChildSource, ChildSpec, ContentRequest, Refinement, TreeAdapter, ViewContext};
pub use adapters::features::{FeatureSource, feature_entity};
pub use adapters::point_cloud::{PointCloudSource, point_cloud_entity};
pub use adapters::tiles3d::{TilesetDocument, tileset_entity};
pub use camera::ViewCamera;
pub use change::{ChangeSource, EntityId};
pub use collab::{Content, ContentBuilder, Decoder, Fetcher, Geometry, GeometryKind, SchemaHint};
pub use diagnostics::{Diagnostics, NoopDiagnostics, TracingDiagnostics};
pub use driver::{FrameDriver, FrameStats};
pub use error::{FetchError, LodError};
pub use eviction::{BudgetStrategy, CleanupList, PointBudget, apply_point_budget};
pub use node::{NodeId, NodeKey, NodeName, NodeState, SpatialNode, SpatialTree, TileCoord};
pub use operation_counter::{OperationCounter, OperationGuard};
pub use request_queue::{
    CancelToken, Job, JobError, JobHandle, JobOutcome, PriorityRequestQueue, QueueStats,
};
pub use walker::{DistanceRange, EntityOptions, EntityServices, FrameContext, LodEntity, SpatialEntity};
