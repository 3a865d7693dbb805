// Position/orientation model for the controlled entity.

use serde::{Deserialize, Serialize};

/// A point in world space.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Vec3 {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Vec3 {
    pub const fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    /// Euclidean distance over all three axes.
    pub fn distance_to(&self, other: &Vec3) -> f64 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        let dz = self.z - other.z;
        (dx * dx + dy * dy + dz * dz).sqrt()
    }

    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite() && self.z.is_finite()
    }
}

/// Last-known spatial state plus the patrol anchor.
///
/// Lives for the whole process, across reconnects. The anchor is written only
/// by [`PositionState::seed`], and only the first time it is called.
#[derive(Debug, Clone, Default)]
pub struct PositionState {
    pub position: Vec3,
    pub pitch: f64,
    pub yaw: f64,
    anchor: Option<Vec3>,
}

impl PositionState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take a peer-supplied position. Returns true if this call recorded the anchor.
    pub fn seed(&mut self, position: Vec3) -> bool {
        self.position = position;
        if self.anchor.is_none() {
            self.anchor = Some(position);
            return true;
        }
        false
    }

    pub fn anchor(&self) -> Option<Vec3> {
        self.anchor
    }

    /// Distance from the current position to the anchor, if one is recorded.
    pub fn distance_from_anchor(&self) -> Option<f64> {
        self.anchor.map(|a| self.position.distance_to(&a))
    }

    /// Move to a planned position and heading.
    pub fn apply(&mut self, position: Vec3, pitch: f64, yaw: f64) {
        self.position = position;
        self.pitch = pitch;
        self.yaw = yaw;
    }
}
