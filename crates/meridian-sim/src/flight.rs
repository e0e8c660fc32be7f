//! Scripted camera path flown by the simulator.

use glam::{DVec2, DVec3};
use meridian_math::PerspectiveCamera;

/// A camera pose along the path.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Waypoint {
    pub position: DVec3,
    pub target: DVec3,
}

/// Piecewise-linear flight through waypoints, spread over `frames` frames.
pub struct Flight {
    waypoints: Vec<Waypoint>,
    frames: u32,
    template: PerspectiveCamera,
}

impl Flight {
    pub fn new(waypoints: Vec<Waypoint>, frames: u32, viewport: DVec2) -> Self {
        Self {
            waypoints,
            frames: frames.max(1),
            template: PerspectiveCamera::new(60f64.to_radians(), viewport, 1.0, 100_000.0),
        }
    }

    /// Descend from high above the dataset into a low pass over its
    /// north-east corner.
    pub fn survey(center: DVec3, size: f64, frames: u32) -> Self {
        let waypoints = vec![
            Waypoint {
                position: center + DVec3::new(-size, -size, size * 1.5),
                target: center,
            },
            Waypoint {
                position: center + DVec3::new(-size * 0.25, -size * 0.25, size * 0.4),
                target: center + DVec3::new(size * 0.1, size * 0.1, 0.0),
            },
            Waypoint {
                position: center + DVec3::new(size * 0.2, size * 0.2, size * 0.15),
                target: center + DVec3::new(size * 0.45, size * 0.45, 0.0),
            },
        ];
        Self::new(waypoints, frames, DVec2::new(1280.0, 720.0))
    }

    /// Pose at `frame`, clamped to the last waypoint.
    pub fn waypoint_at(&self, frame: u32) -> Option<Waypoint> {
        let (first, rest) = self.waypoints.split_first()?;
        if rest.is_empty() {
            return Some(*first);
        }
        let segments = self.waypoints.len() - 1;
        let t = f64::from(frame.min(self.frames)) / f64::from(self.frames) * segments as f64;
        let index = (t.floor() as usize).min(segments - 1);
        let local = t - index as f64;
        let (a, b) = (self.waypoints[index], self.waypoints[index + 1]);
        Some(Waypoint {
            position: a.position.lerp(b.position, local),
            target: a.target.lerp(b.target, local),
        })
    }

    pub fn camera_at(&self, frame: u32) -> PerspectiveCamera {
        let mut camera = self.template.clone();
        if let Some(pose) = self.waypoint_at(frame) {
            camera.look_at(pose.position, pose.target, DVec3::Z);
        }
        camera
    }
}
