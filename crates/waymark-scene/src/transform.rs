//! Local-space transform values shared by live nodes and baked records.

use serde::{Deserialize, Serialize};

/// Tolerance used by [`Transform::approx_eq`].
pub const TRANSFORM_EPSILON: f32 = 1e-4;

/// A plain 3-component vector.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Vec3 {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Vec3 {
    pub const ZERO: Vec3 = Vec3::new(0.0, 0.0, 0.0);
    pub const ONE: Vec3 = Vec3::new(1.0, 1.0, 1.0);

    pub const fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }

    fn approx_eq(self, other: Vec3, eps: f32) -> bool {
        (self.x - other.x).abs() <= eps
            && (self.y - other.y).abs() <= eps
            && (self.z - other.z).abs() <= eps
    }
}

/// Local position, Euler rotation (degrees) and scale of a node.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Transform {
    pub position: Vec3,
    pub rotation: Vec3,
    pub scale: Vec3,
}

impl Transform {
    pub const IDENTITY: Transform = Transform {
        position: Vec3::ZERO,
        rotation: Vec3::ZERO,
        scale: Vec3::ONE,
    };

    /// Identity rotation and scale at `position`.
    pub fn from_position(position: Vec3) -> Self {
        Self {
            position,
            ..Self::IDENTITY
        }
    }

    /// Component-wise comparison within [`TRANSFORM_EPSILON`].
    ///
    /// The apply layer uses this to decide whether a write is a no-op.
    pub fn approx_eq(&self, other: &Transform) -> bool {
        self.position.approx_eq(other.position, TRANSFORM_EPSILON)
            && self.rotation.approx_eq(other.rotation, TRANSFORM_EPSILON)
            && self.scale.approx_eq(other.scale, TRANSFORM_EPSILON)
    }
}

impl Default for Transform {
    fn default() -> Self {
        Self::IDENTITY
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn approx_eq_tolerates_float_noise() {
        let a = Transform::from_position(Vec3::new(1.0, 2.0, 3.0));
        let mut b = a;
        b.position.x += 0.00001;
        assert!(a.approx_eq(&b));

        b.scale.z = 2.0;
        assert!(!a.approx_eq(&b));
    }

    #[test]
    fn default_is_identity() {
        assert_eq!(Transform::default(), Transform::IDENTITY);
        assert_eq!(Transform::IDENTITY.scale, Vec3::ONE);
    }
}
