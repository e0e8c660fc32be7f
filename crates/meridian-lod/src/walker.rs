//! The per-frame LOD walk over one entity's spatial tree.
//!
//! Every frame the driver asks the entity for roots with
//! [`LodEntity::pre_update`], calls [`LodEntity::update`] on each returned
//! node (parents before children), then lets the entity enforce eviction in
//! [`LodEntity::post_update`]. The walk never blocks: content and hierarchy
//! loads go through the shared [`PriorityRequestQueue`] and are picked up by
//! [`LodEntity::process_completions`] in a later frame.

use std::sync::Arc;
use std::time::{Duration, Instant};

use glam::DMat4;
use meridian_config::{Config, QueueConfig};

use crate::adapter::{ChildSource, ContentRequest, Refinement, TreeAdapter, ViewContext};
use crate::camera::ViewCamera;
use crate::change::{ChangeSource, EntityId};
use crate::collab::{ContentBuilder, Decoder, Fetcher, Geometry};
use crate::diagnostics::{Diagnostics, NoopDiagnostics};
use crate::eviction::{BudgetCandidate, CleanupList, PointBudget, apply_point_budget};
use crate::node::{ChildrenState, Failure, Materialized, NodeId, NodeKey, NodeState, SpatialTree};
use crate::operation_counter::OperationCounter;
use crate::request_queue::{Job, JobError, JobOutcome, PriorityRequestQueue};

/// Lower bound on the distance used to derive request priorities.
pub const MIN_PRIORITY_DISTANCE: f64 = 1e-3;

/// Per-entity walk settings.
#[derive(Clone, Debug, PartialEq)]
pub struct EntityOptions {
    /// Grace period between a node going invisible and its disposal.
    pub cleanup_delay: Duration,
    /// Nodes shallower than this never request content and always subdivide.
    pub min_level: u32,
    /// Nodes at this depth never subdivide.
    pub max_level: Option<u32>,
    pub retry_delay: Duration,
    pub max_retry_delay: Duration,
    /// Placement of the entity in the world.
    pub world: DMat4,
}

impl Default for EntityOptions {
    fn default() -> Self {
        Self {
            cleanup_delay: Duration::from_secs(1),
            min_level: 0,
            max_level: None,
            retry_delay: Duration::from_secs(2),
            max_retry_delay: Duration::from_secs(30),
            world: DMat4::IDENTITY,
        }
    }
}

impl EntityOptions {
    #[must_use]
    pub fn point_cloud(config: &Config) -> Self {
        let pc = &config.point_cloud;
        Self {
            cleanup_delay: Duration::from_millis(pc.cleanup_delay_ms),
            min_level: pc.min_level,
            max_level: pc.max_depth,
            ..Self::default()
        }
        .with_retry(&config.queue)
    }

    #[must_use]
    pub fn tiles(config: &Config) -> Self {
        let tiles = &config.tiles;
        Self {
            cleanup_delay: Duration::from_millis(tiles.cleanup_delay_ms),
            min_level: tiles.min_level,
            max_level: tiles.max_level,
            ..Self::default()
        }
        .with_retry(&config.queue)
    }

    #[must_use]
    pub fn features(config: &Config) -> Self {
        let features = &config.features;
        Self {
            cleanup_delay: Duration::from_millis(features.cleanup_delay_ms),
            min_level: features.min_level,
            max_level: Some(features.max_level),
            ..Self::default()
        }
        .with_retry(&config.queue)
    }

    #[must_use]
    pub fn with_retry(mut self, queue: &QueueConfig) -> Self {
        self.retry_delay = Duration::from_millis(queue.retry_delay_ms);
        self.max_retry_delay = Duration::from_millis(queue.max_retry_delay_ms);
        self
    }

    #[must_use]
    pub fn with_world(mut self, world: DMat4) -> Self {
        self.world = world;
        self
    }

    fn allows_content(&self, depth: u32) -> bool {
        depth >= self.min_level && self.max_level.is_none_or(|max| depth <= max)
    }
}

/// Shared collaborators an entity issues work through.
#[derive(Clone)]
pub struct EntityServices {
    pub queue: Arc<PriorityRequestQueue>,
    pub fetcher: Arc<dyn Fetcher>,
    pub decoder: Arc<dyn Decoder>,
    pub builder: Arc<dyn ContentBuilder>,
    pub diagnostics: Arc<dyn Diagnostics>,
}

impl EntityServices {
    pub fn new(
        queue: Arc<PriorityRequestQueue>,
        fetcher: Arc<dyn Fetcher>,
        decoder: Arc<dyn Decoder>,
        builder: Arc<dyn ContentBuilder>,
    ) -> Self {
        Self {
            queue,
            fetcher,
            decoder,
            builder,
            diagnostics: Arc::new(NoopDiagnostics),
        }
    }

    #[must_use]
    pub fn with_diagnostics(mut self, diagnostics: Arc<dyn Diagnostics>) -> Self {
        self.diagnostics = diagnostics;
        self
    }
}

/// Inputs of one frame.
#[derive(Clone, Copy)]
pub struct FrameContext<'a> {
    pub camera: &'a dyn ViewCamera,
    pub now: Instant,
}

/// Near/far distances of visited nodes, for clipping-plane setup.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct DistanceRange {
    pub min: f64,
    pub max: f64,
}

impl Default for DistanceRange {
    fn default() -> Self {
        Self {
            min: f64::INFINITY,
            max: 0.0,
        }
    }
}

impl DistanceRange {
    /// Widen the range with a sphere at `distance` of the given radius.
    pub fn include(&mut self, distance: f64, radius: f64) {
        self.min = self.min.min(distance - radius);
        self.max = self.max.max(distance + radius);
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.min > self.max
    }
}

/// Object-safe face of an entity, driven by [`crate::driver::FrameDriver`].
pub trait LodEntity {
    fn id(&self) -> EntityId;

    /// Collect finished jobs and attach their results.
    fn process_completions(&mut self, now: Instant) -> Vec<ChangeSource>;

    /// Roots to walk this frame given what changed.
    fn pre_update(&mut self, ctx: &FrameContext<'_>, changes: &[ChangeSource]) -> Vec<NodeId>;

    /// Evaluate one node and return the children to evaluate next.
    fn update(&mut self, ctx: &FrameContext<'_>, node: NodeId) -> Vec<NodeId>;

    /// Dispose expired content and enforce the primitive budget.
    fn post_update(&mut self, ctx: &FrameContext<'_>);

    fn loading(&self) -> bool;

    fn progress(&self) -> f64;

    fn distance_range(&self) -> DistanceRange;

    /// Primitives currently drawn.
    fn displayed_primitives(&self) -> u64;

    fn set_visible(&mut self, visible: bool);

    fn is_visible(&self) -> bool;
}

/// Generic LOD entity: a spatial tree walked with tree-specific behaviour
/// from its adapter.
pub struct SpatialEntity<A: TreeAdapter> {
    id: EntityId,
    adapter: A,
    tree: SpatialTree<A::Data>,
    options: EntityOptions,
    services: EntityServices,
    counter: Arc<OperationCounter>,
    /// Nodes with a content job registered on the counter.
    pending_content: Vec<NodeId>,
    /// Nodes with a hierarchy job registered on the counter.
    pending_hierarchy: Vec<NodeId>,
    cleanup: CleanupList,
    distance: DistanceRange,
    /// Only nodes related to this key are walked this frame.
    hint: Option<NodeKey>,
    visible: bool,
}

impl<A: TreeAdapter> SpatialEntity<A> {
    pub fn new(
        id: EntityId,
        adapter: A,
        tree: SpatialTree<A::Data>,
        options: EntityOptions,
        services: EntityServices,
    ) -> Self {
        tracing::debug!(entity = %id, kind = adapter.kind_name(), "entity created");
        Self {
            id,
            adapter,
            tree,
            cleanup: CleanupList::new(options.cleanup_delay),
            options,
            services,
            counter: Arc::new(OperationCounter::new()),
            pending_content: Vec::new(),
            pending_hierarchy: Vec::new(),
            distance: DistanceRange::default(),
            hint: None,
            visible: true,
        }
    }

    pub fn tree(&self) -> &SpatialTree<A::Data> {
        &self.tree
    }

    pub fn adapter(&self) -> &A {
        &self.adapter
    }

    pub fn adapter_mut(&mut self) -> &mut A {
        &mut self.adapter
    }

    pub fn options(&self) -> &EntityOptions {
        &self.options
    }

    pub fn cleanup(&self) -> &CleanupList {
        &self.cleanup
    }

    pub fn counter(&self) -> &Arc<OperationCounter> {
        &self.counter
    }

    fn job_id(&self, key: &NodeKey) -> String {
        format!("{}:{}", self.id, key)
    }

    fn record_failure(failure: &mut Option<Failure>, now: Instant) {
        let attempts = failure.map_or(0, |f| f.attempts) + 1;
        *failure = Some(Failure { at: now, attempts });
    }

    fn retry_blocked(&self, failure: Option<Failure>, now: Instant) -> bool {
        failure.is_some_and(|f| {
            now < f.retry_at(self.options.retry_delay, self.options.max_retry_delay)
        })
    }

    fn poll_content(&mut self, now: Instant, changes: &mut Vec<ChangeSource>) {
        for id in std::mem::take(&mut self.pending_content) {
            let outcome = match self.tree.get(id).map(|n| &n.state) {
                Some(NodeState::Requested(handle)) => match handle.try_take() {
                    Some(outcome) => outcome,
                    None => {
                        self.pending_content.push(id);
                        continue;
                    }
                },
                // The node left the requested state; its job no longer counts.
                _ => {
                    self.counter.decrement();
                    continue;
                }
            };
            self.counter.decrement();
            if self.attach_content(id, outcome, now) {
                changes.push(ChangeSource::NodeLoaded {
                    entity: self.id,
                    node: id,
                });
            }
        }
    }

    fn attach_content(&mut self, id: NodeId, outcome: JobOutcome<Geometry>, now: Instant) -> bool {
        let attached = self.tree.is_attached(id);
        let Some(node) = self.tree.get_mut(id) else {
            return false;
        };
        node.state = NodeState::Unloaded;
        match outcome {
            Ok(_) if !attached => {
                tracing::debug!(entity = %self.id, node = %node.key(), "discarding content of a detached node");
                false
            }
            Ok(geometry) => match self.services.builder.build(geometry) {
                Ok(content) => {
                    if let Some(tight) = content.tight_bounds() {
                        if !node.set_tight_bounds(tight) {
                            tracing::debug!(
                                entity = %self.id,
                                node = %node.key(),
                                "content extends past node bounds, keeping loose box"
                            );
                        }
                    }
                    let materialized = Materialized::new(content);
                    self.services.diagnostics.content_attached(
                        self.id,
                        node.key(),
                        materialized.content.primitive_count(),
                    );
                    node.state = NodeState::Ready(materialized);
                    node.failure = None;
                    true
                }
                Err(err) => {
                    tracing::warn!(entity = %self.id, node = %node.key(), %err, "content build failed");
                    Self::record_failure(&mut node.failure, now);
                    false
                }
            },
            Err(JobError::Cancelled) => {
                tracing::trace!(entity = %self.id, node = %node.key(), "content request cancelled");
                false
            }
            Err(JobError::Failed(reason)) => {
                tracing::warn!(entity = %self.id, node = %node.key(), %reason, "content request failed");
                Self::record_failure(&mut node.failure, now);
                false
            }
        }
    }

    fn poll_hierarchy(&mut self, now: Instant, changes: &mut Vec<ChangeSource>) {
        for id in std::mem::take(&mut self.pending_hierarchy) {
            let outcome = match self.tree.get(id).map(|n| &n.children_state) {
                Some(ChildrenState::Requested(handle)) => match handle.try_take() {
                    Some(outcome) => outcome,
                    None => {
                        self.pending_hierarchy.push(id);
                        continue;
                    }
                },
                _ => {
                    self.counter.decrement();
                    continue;
                }
            };
            self.counter.decrement();
            if self.attach_children(id, outcome, now) {
                changes.push(ChangeSource::NodeLoaded {
                    entity: self.id,
                    node: id,
                });
            }
        }
    }

    fn attach_children(
        &mut self,
        id: NodeId,
        outcome: JobOutcome<serde_json::Value>,
        now: Instant,
    ) -> bool {
        let Some(node) = self.tree.get_mut(id) else {
            return false;
        };
        node.children_state = ChildrenState::Unknown;
        let document = match outcome {
            Ok(document) => document,
            Err(JobError::Cancelled) => {
                tracing::trace!(entity = %self.id, node = %node.key(), "hierarchy request cancelled");
                return false;
            }
            Err(JobError::Failed(reason)) => {
                tracing::warn!(entity = %self.id, node = %node.key(), %reason, "hierarchy request failed");
                Self::record_failure(&mut node.failure, now);
                return false;
            }
        };

        match self.adapter.parse_children(node, document) {
            Ok(ChildSource::Ready(specs)) => {
                self.insert_children(id, specs);
                true
            }
            Ok(ChildSource::Leaf) => {
                node.children_state = ChildrenState::Known;
                true
            }
            Ok(ChildSource::Fetch { url }) => {
                tracing::warn!(entity = %self.id, node = %node.key(), %url, "hierarchy document refers to another document, treating node as a leaf");
                node.children_state = ChildrenState::Known;
                false
            }
            Err(err) => {
                tracing::warn!(entity = %self.id, node = %node.key(), %err, "invalid hierarchy document, treating node as a leaf");
                node.children_state = ChildrenState::Known;
                false
            }
        }
    }

    fn insert_children(&mut self, id: NodeId, specs: Vec<crate::adapter::ChildSpec<A::Data>>) {
        for spec in specs {
            let key = spec.key.clone();
            if let Err(err) = self.tree.add_child(id, spec.key, spec.bounds, spec.data) {
                tracing::warn!(entity = %self.id, child = %key, %err, "skipping invalid child");
            }
        }
        if let Some(node) = self.tree.get_mut(id) {
            node.children_state = ChildrenState::Known;
        }
    }

    /// Known children of `id`, creating or requesting them if needed.
    /// `None` while a hierarchy job is in flight.
    fn ensure_children(&mut self, id: NodeId, priority: f64, now: Instant) -> Option<Vec<NodeId>> {
        let blocked = self.retry_blocked(self.tree.get(id)?.failure, now);
        let node = self.tree.get_mut(id)?;
        match node.children_state {
            ChildrenState::Known => return Some(node.children().to_vec()),
            ChildrenState::Requested(_) => return None,
            ChildrenState::Unknown if blocked => return None,
            ChildrenState::Unknown => {}
        }

        match self.adapter.children(node) {
            ChildSource::Leaf => {
                node.children_state = ChildrenState::Known;
                Some(Vec::new())
            }
            ChildSource::Ready(specs) => {
                self.insert_children(id, specs);
                self.tree.get(id).map(|n| n.children().to_vec())
            }
            ChildSource::Fetch { url } => {
                let fetcher = Arc::clone(&self.services.fetcher);
                let job_id = format!("{}:{}#hierarchy", self.id, node.key());
                let job = Job::new(job_id, priority, move |cancel| {
                    Ok(fetcher.fetch_json(&url, cancel)?)
                });
                node.children_state = ChildrenState::Requested(self.services.queue.enqueue(job));
                self.counter.increment();
                self.pending_hierarchy.push(id);
                None
            }
        }
    }

    /// Enqueue the content job of `id` unless it has content, a job in
    /// flight, nothing to load, or a pending retry delay.
    fn request_content(&mut self, id: NodeId, priority: f64, now: Instant) {
        let job_id = match self.tree.get(id) {
            Some(node) if matches!(node.state, NodeState::Unloaded | NodeState::Deleted) => {
                if self.retry_blocked(node.failure, now) {
                    return;
                }
                self.job_id(node.key())
            }
            _ => return,
        };
        let Some(node) = self.tree.get_mut(id) else {
            return;
        };
        let Some(ContentRequest { url, hint }) = self.adapter.content_request(node) else {
            return;
        };

        let fetcher = Arc::clone(&self.services.fetcher);
        let decoder = Arc::clone(&self.services.decoder);
        let job = Job::new(job_id, priority, move |cancel| {
            let bytes = fetcher.fetch_binary(&url, cancel)?;
            if cancel.is_cancelled() {
                return Err(JobError::Cancelled);
            }
            Ok(decoder.decode(&bytes, &hint)?)
        })
        .with_token(node.token.clone());

        node.state = NodeState::Requested(self.services.queue.enqueue(job));
        self.counter.increment();
        self.pending_content.push(id);
        self.services
            .diagnostics
            .content_requested(self.id, node.key(), priority);
    }

    fn set_displayed(&mut self, id: NodeId, displayed: bool) {
        if let Some(NodeState::Ready(m)) = self.tree.get_mut(id).map(|n| &mut n.state) {
            m.displayed = displayed;
        }
    }

    /// Bring a node back to life after it was marked: restore its content,
    /// drop it from the cleanup list, and re-arm its cancel token.
    fn revive(&mut self, id: NodeId) {
        let Some(node) = self.tree.get_mut(id) else {
            return;
        };
        node.token.reset();
        if node.state.is_marked() {
            node.state = match std::mem::take(&mut node.state) {
                NodeState::MarkedForDeletion {
                    content: Some(m), ..
                } => NodeState::Ready(m),
                _ => NodeState::Unloaded,
            };
            self.cleanup.remove(id);
        }
    }

    /// Hide a node, cancel its pending work, and schedule its disposal.
    /// Marking an already marked node keeps its original timestamp.
    fn mark_for_deletion(&mut self, id: NodeId, now: Instant) {
        let retains = self.adapter.retains_structure();
        let Some(node) = self.tree.get_mut(id) else {
            return;
        };
        node.visible = false;
        node.token.cancel();
        let has_children = !node.children().is_empty();
        node.state = match std::mem::take(&mut node.state) {
            NodeState::Ready(mut m) => {
                m.displayed = false;
                m.sync();
                self.cleanup.push(id, now);
                NodeState::MarkedForDeletion {
                    since: now,
                    content: Some(m),
                }
            }
            NodeState::Requested(_) => NodeState::Unloaded,
            NodeState::Unloaded | NodeState::Deleted if has_children && !retains => {
                self.cleanup.push(id, now);
                NodeState::MarkedForDeletion {
                    since: now,
                    content: None,
                }
            }
            other => other,
        };
    }

    /// Mark `id` and, if it was live, its whole subtree.
    fn mark_subtree(&mut self, id: NodeId, now: Instant) {
        let Some(was_live) = self.tree.get(id).map(|n| n.visible) else {
            return;
        };
        self.mark_for_deletion(id, now);
        if was_live {
            for descendant in self.tree.descendants(id) {
                self.mark_for_deletion(descendant, now);
            }
        }
    }

    /// Show the node's own content and retire everything below it.
    fn collapse(&mut self, id: NodeId, now: Instant) {
        self.set_displayed(id, true);
        let children = self
            .tree
            .get(id)
            .map(|n| n.children().to_vec())
            .unwrap_or_default();
        for child in children {
            self.mark_subtree(child, now);
        }
    }

    /// Whether replacing the parent by `children` leaves no visible hole.
    fn children_ready(&self, children: &[NodeId], ctx: &FrameContext<'_>) -> bool {
        children.iter().all(|child| {
            let Some(node) = self.tree.get(*child) else {
                return true;
            };
            matches!(node.state, NodeState::Ready(_))
                || !ctx
                    .camera
                    .is_box_visible(&node.bounding_volume(), &self.options.world)
                || !self.options.allows_content(node.depth())
                || self.adapter.content_request(node).is_none()
        })
    }

    /// Start loading visible children of a node waiting to be replaced.
    fn prefetch_children(&mut self, children: &[NodeId], ctx: &FrameContext<'_>) {
        let world = self.options.world;
        for child in children {
            let Some(node) = self.tree.get(*child) else {
                continue;
            };
            if !ctx.camera.is_box_visible(&node.bounding_volume(), &world)
                || !self.options.allows_content(node.depth())
            {
                continue;
            }
            let view = ViewContext {
                camera: ctx.camera,
                world: &world,
            };
            let sse = self.adapter.screen_space_error(node, &view);
            let center = view.world_bounds(node).center();
            let priority = sse / ctx.camera.distance_to_point(center).max(MIN_PRIORITY_DISTANCE);
            self.revive(*child);
            if let Some(node) = self.tree.get_mut(*child) {
                node.sse = sse;
            }
            self.request_content(*child, priority, ctx.now);
        }
    }

    /// Dispose a node whose grace period elapsed. Roots are never disposed.
    fn dispose(&mut self, id: NodeId) {
        if id == self.tree.root() {
            return;
        }
        let Some(node) = self.tree.get_mut(id) else {
            return;
        };
        match std::mem::take(&mut node.state) {
            NodeState::MarkedForDeletion { content, .. } => {
                if let Some(m) = content {
                    m.dispose();
                }
                node.state = NodeState::Deleted;
                self.services.diagnostics.node_disposed(self.id, node.key());
                tracing::trace!(entity = %self.id, node = %node.key(), "node disposed");
            }
            other => {
                node.state = other;
                return;
            }
        }

        if !self.adapter.retains_structure() {
            for mut removed in self.tree.detach_children(id) {
                if let Some(m) = removed.state.materialized_mut() {
                    m.content.dispose();
                }
            }
            let tree = &self.tree;
            self.cleanup.retain(|n| tree.contains(n));
        }
    }

    fn enforce_budget(&mut self, budget: PointBudget) {
        let mut candidates = Vec::new();
        for (id, node) in self.tree.iter_mut() {
            if let NodeState::Ready(m) = &mut node.state {
                m.draw_count = m.content.primitive_count();
                if m.displayed {
                    candidates.push(BudgetCandidate {
                        node: id,
                        count: m.draw_count,
                        sse: node.sse,
                    });
                }
            }
        }
        for (id, count) in apply_point_budget(&candidates, budget.limit, budget.strategy) {
            if let Some(NodeState::Ready(m)) = self.tree.get_mut(id).map(|n| &mut n.state) {
                m.draw_count = count;
            }
        }
        self.services
            .diagnostics
            .budget_applied(self.id, self.displayed_primitives(), budget.limit);
    }

    fn hide_subtree(&mut self, id: NodeId) {
        self.set_displayed(id, false);
        for descendant in self.tree.descendants(id) {
            self.set_displayed(descendant, false);
        }
    }

    fn hide_all(&mut self) {
        for (_, node) in self.tree.iter_mut() {
            node.token.cancel();
            if let Some(m) = node.state.materialized_mut() {
                m.displayed = false;
            }
        }
    }

    /// Whether any change concerns this entity.
    fn is_concerned(&self, changes: &[ChangeSource]) -> bool {
        changes.iter().any(|c| {
            c.forces_full_walk(self.id)
                || *c == ChangeSource::Style(self.id)
                || c.loaded_node(self.id).is_some()
        })
    }

    /// Common ancestor of the nodes whose load triggered this frame, when
    /// nothing else requires a full walk.
    fn load_hint(&self, changes: &[ChangeSource]) -> Option<NodeKey> {
        if !self.adapter.uses_load_hint()
            || changes.is_empty()
            || changes
                .iter()
                .any(|c| c.forces_full_walk(self.id) || *c == ChangeSource::Style(self.id))
        {
            return None;
        }
        changes
            .iter()
            .filter_map(|c| c.loaded_node(self.id))
            .filter_map(|id| self.tree.get(id).map(|n| n.key().clone()))
            .reduce(|a, b| a.common_ancestor(&b).unwrap_or(a))
    }
}

impl<A: TreeAdapter> LodEntity for SpatialEntity<A> {
    fn id(&self) -> EntityId {
        self.id
    }

    fn process_completions(&mut self, now: Instant) -> Vec<ChangeSource> {
        let mut changes = Vec::new();
        self.poll_content(now, &mut changes);
        self.poll_hierarchy(now, &mut changes);
        changes
    }

    fn pre_update(&mut self, _ctx: &FrameContext<'_>, changes: &[ChangeSource]) -> Vec<NodeId> {
        self.hint = None;
        if !changes.is_empty() {
            self.distance = DistanceRange::default();
        }
        if !self.is_concerned(changes) {
            return Vec::new();
        }
        if !self.visible {
            self.hide_all();
            return Vec::new();
        }
        self.hint = self.load_hint(changes);
        vec![self.tree.root()]
    }

    fn update(&mut self, ctx: &FrameContext<'_>, id: NodeId) -> Vec<NodeId> {
        let world = self.options.world;
        let view = ViewContext {
            camera: ctx.camera,
            world: &world,
        };
        let Some(node) = self.tree.get(id) else {
            return Vec::new();
        };
        let off_hint = self
            .hint
            .as_ref()
            .is_some_and(|hint| !node.key().is_ancestor_of(hint) && !hint.is_ancestor_of(node.key()));
        if off_hint {
            return Vec::new();
        }

        if !ctx.camera.is_box_visible(&node.bounding_volume(), &world) {
            self.mark_subtree(id, ctx.now);
            return Vec::new();
        }

        let depth = node.depth();
        let sse = self.adapter.screen_space_error(node, &view);
        let wants_detail = self.adapter.should_subdivide(node, &view, sse);
        let refinement = self.adapter.refinement(node);
        let sphere = view.world_bounds(node).bounding_sphere();
        let distance = ctx.camera.distance_to_point(sphere.center);
        self.services
            .diagnostics
            .node_visited(self.id, node.key(), sse);

        self.revive(id);
        if let Some(node) = self.tree.get_mut(id) {
            node.sse = sse;
            node.visible = true;
        }
        self.distance.include(distance, sphere.radius);

        let priority = sse / distance.max(MIN_PRIORITY_DISTANCE);
        if self.options.allows_content(depth) {
            self.request_content(id, priority, ctx.now);
        }

        let subdivide = self.options.max_level.is_none_or(|max| depth < max)
            && (wants_detail || depth < self.options.min_level);
        if !subdivide {
            self.collapse(id, ctx.now);
            return Vec::new();
        }

        let children = match self.ensure_children(id, priority, ctx.now) {
            Some(children) if !children.is_empty() => children,
            _ => {
                self.set_displayed(id, true);
                return Vec::new();
            }
        };

        let has_content = self
            .tree
            .get(id)
            .is_some_and(|n| matches!(n.state, NodeState::Ready(_)));
        match refinement {
            Refinement::Additive => {
                self.set_displayed(id, true);
                children
            }
            Refinement::Replace if !has_content || self.children_ready(&children, ctx) => {
                self.set_displayed(id, false);
                children
            }
            Refinement::Replace => {
                self.set_displayed(id, true);
                for child in &children {
                    self.hide_subtree(*child);
                }
                self.prefetch_children(&children, ctx);
                Vec::new()
            }
        }
    }

    fn post_update(&mut self, ctx: &FrameContext<'_>) {
        for id in self.cleanup.drain_expired(ctx.now) {
            self.dispose(id);
        }
        if let Some(budget) = self.adapter.budget() {
            self.enforce_budget(budget);
        }
        for (_, node) in self.tree.iter_mut() {
            if let Some(m) = node.state.materialized_mut() {
                m.sync();
            }
        }
    }

    fn loading(&self) -> bool {
        self.counter.loading()
    }

    fn progress(&self) -> f64 {
        self.counter.progress()
    }

    fn distance_range(&self) -> DistanceRange {
        self.distance
    }

    fn displayed_primitives(&self) -> u64 {
        self.tree
            .iter()
            .filter_map(|(_, n)| match &n.state {
                NodeState::Ready(m) => Some(m.displayed_count()),
                _ => None,
            })
            .sum()
    }

    fn set_visible(&mut self, visible: bool) {
        self.visible = visible;
    }

    fn is_visible(&self) -> bool {
        self.visible
    }
}
