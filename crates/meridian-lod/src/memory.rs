//! In-memory collaborators used by the simulator and tests.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use meridian_math::Aabb;
use rustc_hash::FxHashMap;

use crate::collab::{Content, ContentBuilder, Decoder, Fetcher, Geometry, GeometryKind, SchemaHint};
use crate::error::{FetchError, LodError};
use crate::request_queue::CancelToken;

#[derive(Default)]
struct Store {
    /// Encoded payloads; an encode failure is served as the fetch result.
    binaries: FxHashMap<String, Result<Vec<u8>, FetchError>>,
    documents: FxHashMap<String, serde_json::Value>,
    /// Remaining injected failures per url.
    failures: FxHashMap<String, u32>,
    /// Number of fetches per url, including failed ones.
    requests: FxHashMap<String, u32>,
}

/// Fetcher serving resources from memory, with optional latency and
/// injected failures.
#[derive(Default)]
pub struct MemoryFetcher {
    store: Mutex<Store>,
    latency: Duration,
}

impl MemoryFetcher {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every fetch by `latency`, aborting early if cancelled.
    #[must_use]
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    fn lock(&self) -> MutexGuard<'_, Store> {
        self.store.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn insert_binary(&self, url: impl Into<String>, bytes: Vec<u8>) {
        self.lock().binaries.insert(url.into(), Ok(bytes));
    }

    pub fn insert_geometry(&self, url: impl Into<String>, geometry: &Geometry) {
        self.lock().binaries.insert(url.into(), geometry.encode());
    }

    pub fn insert_json(&self, url: impl Into<String>, value: serde_json::Value) {
        self.lock().documents.insert(url.into(), value);
    }

    /// Make the next `times` fetches of `url` fail.
    pub fn fail_next(&self, url: impl Into<String>, times: u32) {
        self.lock().failures.insert(url.into(), times);
    }

    /// How many times `url` has been fetched.
    #[must_use]
    pub fn request_count(&self, url: &str) -> u32 {
        self.lock().requests.get(url).copied().unwrap_or(0)
    }

    #[must_use]
    pub fn total_requests(&self) -> u32 {
        self.lock().requests.values().sum()
    }

    fn wait(&self, cancel: &CancelToken) -> Result<(), FetchError> {
        if self.latency.is_zero() {
            return Ok(());
        }
        let deadline = Instant::now() + self.latency;
        let step = self.latency.min(Duration::from_millis(2));
        while Instant::now() < deadline {
            if cancel.is_cancelled() {
                return Err(FetchError::Aborted);
            }
            std::thread::sleep(step);
        }
        Ok(())
    }

    fn begin(&self, url: &str, cancel: &CancelToken) -> Result<(), FetchError> {
        if cancel.is_cancelled() {
            return Err(FetchError::Aborted);
        }
        {
            let mut store = self.lock();
            *store.requests.entry(url.to_string()).or_insert(0) += 1;
        }
        self.wait(cancel)?;
        let mut store = self.lock();
        let remaining = store.failures.get_mut(url).filter(|r| **r > 0);
        if let Some(remaining) = remaining {
            *remaining -= 1;
            return Err(FetchError::Failed {
                url: url.to_string(),
                reason: "injected failure".to_string(),
            });
        }
        Ok(())
    }

    fn not_found(url: &str) -> FetchError {
        FetchError::Failed {
            url: url.to_string(),
            reason: "not found".to_string(),
        }
    }
}

impl Fetcher for MemoryFetcher {
    fn fetch_binary(&self, url: &str, cancel: &CancelToken) -> Result<Vec<u8>, FetchError> {
        self.begin(url, cancel)?;
        self.lock()
            .binaries
            .get(url)
            .cloned()
            .unwrap_or_else(|| Err(Self::not_found(url)))
    }

    fn fetch_json(&self, url: &str, cancel: &CancelToken) -> Result<serde_json::Value, FetchError> {
        self.begin(url, cancel)?;
        self.lock()
            .documents
            .get(url)
            .cloned()
            .ok_or_else(|| Self::not_found(url))
    }
}

/// Decoder for the layout written by [`Geometry::encode`].
#[derive(Debug, Default, Clone, Copy)]
pub struct SimpleDecoder;

fn read_u32(bytes: &[u8], offset: usize) -> Result<u32, FetchError> {
    bytes
        .get(offset..offset + 4)
        .and_then(|b| b.try_into().ok())
        .map(u32::from_le_bytes)
        .ok_or_else(|| FetchError::Decode(format!("truncated header at byte {offset}")))
}

impl Decoder for SimpleDecoder {
    fn decode(&self, bytes: &[u8], hint: &SchemaHint) -> Result<Geometry, FetchError> {
        let tag: [u8; 4] = bytes
            .get(..4)
            .and_then(|b| b.try_into().ok())
            .ok_or_else(|| FetchError::Decode("missing geometry tag".to_string()))?;
        let kind = GeometryKind::from_tag(tag).ok_or_else(|| {
            FetchError::Decode(format!("unknown geometry tag {:?}", String::from_utf8_lossy(&tag)))
        })?;
        if kind != hint.kind {
            return Err(FetchError::Decode(format!(
                "expected {:?} payload, found {kind:?}",
                hint.kind
            )));
        }
        let primitive_count = u64::from(read_u32(bytes, 4)?);
        let vertex_count = read_u32(bytes, 8)? as usize;

        let body = &bytes[12..];
        if body.len() != vertex_count * 12 {
            return Err(FetchError::Decode(format!(
                "expected {} vertex bytes, found {}",
                vertex_count * 12,
                body.len()
            )));
        }
        let positions = body
            .chunks_exact(12)
            .map(|v| {
                let c = |i: usize| f64::from(f32::from_le_bytes([v[i], v[i + 1], v[i + 2], v[i + 3]]));
                glam::DVec3::new(c(0), c(4), c(8))
            })
            .collect();

        Ok(Geometry {
            kind,
            primitive_count,
            positions,
        })
    }
}

/// Counters shared by a [`RetainedBuilder`] and the content it built.
#[derive(Debug, Default)]
pub struct BuildStats {
    pub built: AtomicU64,
    pub disposed: AtomicU64,
}

impl BuildStats {
    /// Content built and not yet disposed.
    #[must_use]
    pub fn live(&self) -> u64 {
        self.built
            .load(Ordering::Relaxed)
            .saturating_sub(self.disposed.load(Ordering::Relaxed))
    }
}

/// CPU-side content keeping its geometry and display state.
#[derive(Debug)]
pub struct RetainedContent {
    geometry: Geometry,
    tight: Option<Aabb>,
    displayed: bool,
    draw_count: u64,
    disposed: bool,
    stats: Arc<BuildStats>,
}

impl RetainedContent {
    #[must_use]
    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    #[must_use]
    pub fn is_displayed(&self) -> bool {
        self.displayed
    }

    #[must_use]
    pub fn draw_count(&self) -> u64 {
        self.draw_count
    }
}

impl Content for RetainedContent {
    fn primitive_count(&self) -> u64 {
        self.geometry.primitive_count
    }

    fn tight_bounds(&self) -> Option<Aabb> {
        self.tight
    }

    fn set_display(&mut self, displayed: bool, draw_count: u64) {
        self.displayed = displayed;
        self.draw_count = draw_count.min(self.geometry.primitive_count);
    }

    fn dispose(&mut self) {
        if !self.disposed {
            self.disposed = true;
            self.geometry.positions = Vec::new();
            self.stats.disposed.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Builder producing [`RetainedContent`].
#[derive(Debug, Default, Clone)]
pub struct RetainedBuilder {
    stats: Arc<BuildStats>,
}

impl RetainedBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn stats(&self) -> Arc<BuildStats> {
        Arc::clone(&self.stats)
    }
}

impl ContentBuilder for RetainedBuilder {
    fn build(&self, geometry: Geometry) -> Result<Box<dyn Content>, LodError> {
        if geometry.primitive_count > 0 && geometry.positions.is_empty() {
            return Err(LodError::Build(format!(
                "{:?} geometry declares {} primitives but has no positions",
                geometry.kind, geometry.primitive_count
            )));
        }
        self.stats.built.fetch_add(1, Ordering::Relaxed);
        Ok(Box::new(RetainedContent {
            tight: geometry.tight_bounds(),
            geometry,
            displayed: false,
            draw_count: 0,
            disposed: false,
            stats: Arc::clone(&self.stats),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::DVec3;

    fn points() -> Geometry {
        Geometry {
            kind: GeometryKind::Points,
            primitive_count: 3,
            positions: vec![DVec3::ZERO, DVec3::new(1.0, 2.0, 3.0), DVec3::new(-1.0, 0.5, 2.0)],
        }
    }

    #[test]
    fn test_decode_encoded_points() {
        let hint = SchemaHint {
            kind: GeometryKind::Points,
        };
        let decoded = SimpleDecoder.decode(&points().encode().unwrap(), &hint).unwrap();
        assert_eq!(decoded, points());
        assert_eq!(
            decoded.tight_bounds(),
            Some(Aabb::new(DVec3::new(-1.0, 0.0, 0.0), DVec3::new(1.0, 2.0, 3.0)))
        );
    }

    #[test]
    fn test_decode_rejects_mismatched_kind_and_truncation() {
        let hint = SchemaHint {
            kind: GeometryKind::Mesh,
        };
        assert!(matches!(
            SimpleDecoder.decode(&points().encode().unwrap(), &hint),
            Err(FetchError::Decode(_))
        ));
        let mut bytes = points().encode().unwrap();
        bytes.truncate(20);
        let hint = SchemaHint {
            kind: GeometryKind::Points,
        };
        assert!(matches!(SimpleDecoder.decode(&bytes, &hint), Err(FetchError::Decode(_))));
        assert!(matches!(SimpleDecoder.decode(b"XY", &hint), Err(FetchError::Decode(_))));
    }

    #[test]
    fn test_fetcher_failure_injection_and_counts() {
        let fetcher = MemoryFetcher::new();
        fetcher.insert_geometry("a.bin", &points());
        fetcher.fail_next("a.bin", 1);
        let token = CancelToken::new();

        assert!(matches!(
            fetcher.fetch_binary("a.bin", &token),
            Err(FetchError::Failed { .. })
        ));
        assert!(fetcher.fetch_binary("a.bin", &token).is_ok());
        assert!(fetcher.fetch_json("missing.json", &token).is_err());
        assert_eq!(fetcher.request_count("a.bin"), 2);
        assert_eq!(fetcher.total_requests(), 3);
    }

    /// A count the binary layout cannot hold is reported, not truncated.
    #[test]
    fn test_oversized_geometry_fails_to_encode() {
        let huge = Geometry {
            primitive_count: u64::from(u32::MAX) + 1,
            ..points()
        };
        assert!(matches!(huge.encode(), Err(FetchError::Encode(_))));

        let fetcher = MemoryFetcher::new();
        fetcher.insert_geometry("huge.bin", &huge);
        assert!(matches!(
            fetcher.fetch_binary("huge.bin", &CancelToken::new()),
            Err(FetchError::Encode(_))
        ));
    }

    #[test]
    fn test_fetcher_aborts_when_cancelled() {
        let fetcher = MemoryFetcher::new();
        fetcher.insert_json("h.json", serde_json::json!({}));
        let token = CancelToken::new();
        token.cancel();
        assert_eq!(fetcher.fetch_json("h.json", &token), Err(FetchError::Aborted));
        assert_eq!(fetcher.request_count("h.json"), 0);
    }

    #[test]
    fn test_builder_tracks_disposal() {
        let builder = RetainedBuilder::new();
        let mut content = builder.build(points()).unwrap();
        assert_eq!(builder.stats().live(), 1);
        content.set_display(true, 10);
        content.dispose();
        content.dispose();
        assert_eq!(builder.stats().disposed.load(Ordering::Relaxed), 1);
        assert_eq!(builder.stats().live(), 0);
    }
}
