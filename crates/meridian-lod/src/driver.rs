//! Per-frame orchestration of every LOD entity.
//!
//! The driver collects change sources between frames, then on each
//! [`tick`](FrameDriver::tick) gives every entity the chance to absorb finished
//! jobs, walks its tree parents-first, lets it evict and enforce budgets, and
//! finally starts queued jobs.

use std::sync::Arc;
use std::time::Instant;

use crate::camera::ViewCamera;
use crate::change::{ChangeSource, EntityId};
use crate::request_queue::PriorityRequestQueue;
use crate::walker::{DistanceRange, FrameContext, LodEntity};

/// Summary of one frame.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FrameStats {
    pub frame: u64,
    pub nodes_visited: usize,
    pub displayed_primitives: u64,
    pub loading: bool,
    /// Mean progress of all entities, 1.0 when nothing loads.
    pub progress: f64,
    /// Closest and farthest distance of anything visible; `near > far` when
    /// nothing was visited.
    pub near: f64,
    pub far: f64,
    /// Jobs waiting to start across all queues.
    pub pending_jobs: usize,
}

/// Owns the entities and the queues they share.
pub struct FrameDriver {
    entities: Vec<Box<dyn LodEntity>>,
    queues: Vec<Arc<PriorityRequestQueue>>,
    changes: Vec<ChangeSource>,
    next_id: u32,
    frame: u64,
}

impl FrameDriver {
    pub fn new(queue: Arc<PriorityRequestQueue>) -> Self {
        Self {
            entities: Vec::new(),
            queues: vec![queue],
            changes: Vec::new(),
            next_id: 1,
            frame: 0,
        }
    }

    /// Reserve an id for an entity about to be built.
    pub fn allocate_id(&mut self) -> EntityId {
        let id = EntityId(self.next_id);
        self.next_id += 1;
        id
    }

    /// Take ownership of `entity` and schedule its first walk.
    pub fn add_entity(&mut self, entity: Box<dyn LodEntity>) {
        let id = entity.id();
        self.next_id = self.next_id.max(id.0.saturating_add(1));
        tracing::debug!(entity = %id, "entity added");
        self.changes.push(ChangeSource::Entity(id));
        self.entities.push(entity);
    }

    pub fn remove_entity(&mut self, id: EntityId) -> Option<Box<dyn LodEntity>> {
        let index = self.entities.iter().position(|e| e.id() == id)?;
        Some(self.entities.remove(index))
    }

    /// Pump `queue` at the end of every frame too. Adding the same queue
    /// twice has no effect.
    pub fn add_queue(&mut self, queue: Arc<PriorityRequestQueue>) {
        if !self.queues.iter().any(|q| Arc::ptr_eq(q, &queue)) {
            self.queues.push(queue);
        }
    }

    /// Record a change to be handled by the next frame.
    pub fn notify_change(&mut self, change: ChangeSource) {
        self.changes.push(change);
    }

    /// Show or hide an entity. Returns `false` if no such entity exists.
    pub fn set_entity_visible(&mut self, id: EntityId, visible: bool) -> bool {
        let Some(entity) = self.entities.iter_mut().find(|e| e.id() == id) else {
            return false;
        };
        entity.set_visible(visible);
        self.changes.push(ChangeSource::Entity(id));
        true
    }

    #[must_use]
    pub fn entity(&self, id: EntityId) -> Option<&dyn LodEntity> {
        self.entities
            .iter()
            .find(|e| e.id() == id)
            .map(|e| e.as_ref())
    }

    pub fn entities(&self) -> impl Iterator<Item = &dyn LodEntity> {
        self.entities.iter().map(|e| e.as_ref())
    }

    /// Number of frames run so far.
    #[must_use]
    pub fn frame(&self) -> u64 {
        self.frame
    }

    /// Run one frame.
    pub fn tick(&mut self, camera: &dyn ViewCamera, now: Instant) -> FrameStats {
        let mut changes = std::mem::take(&mut self.changes);
        for entity in &mut self.entities {
            changes.extend(entity.process_completions(now));
        }

        let ctx = FrameContext { camera, now };
        let mut nodes_visited = 0;
        let mut stack = Vec::new();
        for entity in &mut self.entities {
            stack.extend(entity.pre_update(&ctx, &changes).into_iter().rev());
            while let Some(id) = stack.pop() {
                nodes_visited += 1;
                stack.extend(entity.update(&ctx, id).into_iter().rev());
            }
            entity.post_update(&ctx);
        }

        for queue in &self.queues {
            queue.pump();
        }

        let stats = self.stats(nodes_visited);
        self.frame += 1;
        tracing::debug!(
            frame = stats.frame,
            changes = changes.len(),
            visited = stats.nodes_visited,
            displayed = stats.displayed_primitives,
            pending = stats.pending_jobs,
            "frame done"
        );
        stats
    }

    fn stats(&self, nodes_visited: usize) -> FrameStats {
        let mut range = DistanceRange::default();
        let mut progress = 0.0;
        for entity in &self.entities {
            let r = entity.distance_range();
            if !r.is_empty() {
                range.min = range.min.min(r.min);
                range.max = range.max.max(r.max);
            }
            progress += entity.progress();
        }
        FrameStats {
            frame: self.frame,
            nodes_visited,
            displayed_primitives: self.entities.iter().map(|e| e.displayed_primitives()).sum(),
            loading: self.entities.iter().any(|e| e.loading()),
            progress: if self.entities.is_empty() {
                1.0
            } else {
                progress / self.entities.len() as f64
            },
            near: range.min,
            far: range.max,
            pending_jobs: self.queues.iter().map(|q| q.len()).sum(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::features::{FeatureSource, feature_entity};
    use crate::collab::{Fetcher, Geometry, GeometryKind};
    use crate::memory::{MemoryFetcher, RetainedBuilder, SimpleDecoder};
    use crate::node::NodeId;
    use crate::request_queue::Job;
    use crate::test_support::StaticCamera;
    use crate::walker::EntityServices;
    use glam::{DVec2, DVec3};
    use meridian_config::Config;
    use meridian_math::{Aabb, Extent};
    use slotmap::SlotMap;
    use std::sync::Mutex;
    use std::time::Duration;

    /// Entity with a fixed two-level tree that logs every call it receives.
    struct RecordingEntity {
        id: EntityId,
        root: NodeId,
        child: NodeId,
        log: Arc<Mutex<Vec<String>>>,
        visible: bool,
    }

    impl RecordingEntity {
        fn new(id: EntityId, log: Arc<Mutex<Vec<String>>>) -> Self {
            let mut keys = SlotMap::<NodeId, ()>::with_key();
            Self {
                id,
                root: keys.insert(()),
                child: keys.insert(()),
                log,
                visible: true,
            }
        }

        fn push(&self, event: String) {
            self.log.lock().unwrap().push(event);
        }
    }

    impl LodEntity for RecordingEntity {
        fn id(&self) -> EntityId {
            self.id
        }

        fn process_completions(&mut self, _now: Instant) -> Vec<ChangeSource> {
            self.push("completions".to_string());
            Vec::new()
        }

        fn pre_update(&mut self, _ctx: &FrameContext<'_>, changes: &[ChangeSource]) -> Vec<NodeId> {
            self.push(format!("pre {}", changes.len()));
            vec![self.root]
        }

        fn update(&mut self, _ctx: &FrameContext<'_>, node: NodeId) -> Vec<NodeId> {
            if node == self.root {
                self.push("update root".to_string());
                vec![self.child]
            } else {
                self.push("update child".to_string());
                Vec::new()
            }
        }

        fn post_update(&mut self, _ctx: &FrameContext<'_>) {
            self.push("post".to_string());
        }

        fn loading(&self) -> bool {
            false
        }

        fn progress(&self) -> f64 {
            1.0
        }

        fn distance_range(&self) -> DistanceRange {
            DistanceRange { min: 5.0, max: 50.0 }
        }

        fn displayed_primitives(&self) -> u64 {
            7
        }

        fn set_visible(&mut self, visible: bool) {
            self.visible = visible;
        }

        fn is_visible(&self) -> bool {
            self.visible
        }
    }

    fn camera() -> StaticCamera {
        StaticCamera::seeing(Aabb::new(DVec3::splat(-100.0), DVec3::splat(100.0)))
    }

    /// Completions, walk, post-update and queue pumping happen in that order.
    #[test]
    fn test_tick_phases_in_order() {
        let queue = Arc::new(PriorityRequestQueue::inline());
        let mut driver = FrameDriver::new(Arc::clone(&queue));
        let log = Arc::new(Mutex::new(Vec::new()));
        let id = driver.allocate_id();
        driver.add_entity(Box::new(RecordingEntity::new(id, Arc::clone(&log))));

        let seen = Arc::new(Mutex::new(Vec::new()));
        let (job_log, entity_log) = (Arc::clone(&seen), Arc::clone(&log));
        let _handle = queue.enqueue(Job::new("probe", 1.0, move |_| {
            job_log.lock().unwrap().push(entity_log.lock().unwrap().len());
            Ok(())
        }));

        let stats = driver.tick(&camera(), Instant::now());
        assert_eq!(
            *log.lock().unwrap(),
            vec!["completions", "pre 1", "update root", "update child", "post"]
        );
        // The job ran after the entity's five phases.
        assert_eq!(*seen.lock().unwrap(), vec![5]);
        assert_eq!(stats.nodes_visited, 2);
        assert_eq!(stats.displayed_primitives, 7);
        assert_eq!((stats.near, stats.far), (5.0, 50.0));
        assert_eq!(driver.frame(), 1);
    }

    /// Changes are delivered to exactly one frame.
    #[test]
    fn test_changes_consumed_by_next_frame() {
        let mut driver = FrameDriver::new(Arc::new(PriorityRequestQueue::inline()));
        let log = Arc::new(Mutex::new(Vec::new()));
        let id = driver.allocate_id();
        driver.add_entity(Box::new(RecordingEntity::new(id, Arc::clone(&log))));
        driver.notify_change(ChangeSource::Camera);

        let now = Instant::now();
        driver.tick(&camera(), now);
        driver.tick(&camera(), now + Duration::from_millis(16));
        let log = log.lock().unwrap();
        let pre: Vec<_> = log.iter().filter(|e| e.starts_with("pre")).collect();
        assert_eq!(pre, vec!["pre 2", "pre 0"]);
    }

    #[test]
    fn test_entity_registry() {
        let queue = Arc::new(PriorityRequestQueue::inline());
        let mut driver = FrameDriver::new(Arc::clone(&queue));
        driver.add_queue(Arc::clone(&queue));
        assert_eq!(driver.queues.len(), 1);

        let log = Arc::new(Mutex::new(Vec::new()));
        driver.add_entity(Box::new(RecordingEntity::new(EntityId(9), log)));
        assert_eq!(driver.allocate_id(), EntityId(10));

        assert!(driver.set_entity_visible(EntityId(9), false));
        assert!(!driver.entity(EntityId(9)).unwrap().is_visible());
        assert!(!driver.set_entity_visible(EntityId(3), false));
        assert!(driver.remove_entity(EntityId(9)).is_some());
        assert_eq!(driver.entities().count(), 0);

        let stats = driver.tick(&camera(), Instant::now());
        assert_eq!(stats.progress, 1.0);
        assert!(stats.near > stats.far);
    }

    /// A feature layer driven for a few frames settles with content displayed
    /// and nothing left loading.
    #[test]
    fn test_feature_layer_settles() {
        let fetcher = Arc::new(MemoryFetcher::new());
        let geometry = Geometry {
            kind: GeometryKind::Features,
            primitive_count: 12,
            positions: Vec::new(),
        };
        fetcher.insert_geometry("mem://layer/0/0/0.bin", &geometry);

        let queue = Arc::new(PriorityRequestQueue::inline());
        let mut driver = FrameDriver::new(Arc::clone(&queue));
        let services = EntityServices::new(
            Arc::clone(&queue),
            Arc::clone(&fetcher) as Arc<dyn Fetcher>,
            Arc::new(SimpleDecoder),
            Arc::new(RetainedBuilder::new()),
        );
        let source = FeatureSource {
            base_url: "mem://layer".to_string(),
            extent: Extent::new(-50.0, -50.0, 50.0, 50.0),
            min_z: 0.0,
            max_z: 1.0,
        };
        let id = driver.allocate_id();
        let entity = feature_entity(id, &source, &Config::default(), services).unwrap();
        driver.add_entity(Box::new(entity));

        let mut camera = camera();
        camera.projected = Some(DVec2::new(60.0, 60.0));
        let t0 = Instant::now();
        let first = driver.tick(&camera, t0);
        assert!(first.loading || first.displayed_primitives == 0);

        let stats = driver.tick(&camera, t0 + Duration::from_millis(16));
        assert_eq!(stats.displayed_primitives, 12);
        assert!(!stats.loading);
        assert_eq!(stats.progress, 1.0);
        assert!(stats.near <= stats.far);
        assert_eq!(stats.pending_jobs, 0);
    }
}
