use glam::Vec3A;

/// Result of testing one volume against another.
///
/// `Contains` means the *first* operand fully contains the second.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Containment {
    Disjoint,
    Intersects,
    Contains,
}

/// Axis-aligned bounding box in center/half-extents form.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Aabb {
    pub center: Vec3A,
    pub extents: Vec3A,
}

impl Aabb {
    pub const ZERO: Self = Self {
        center: Vec3A::ZERO,
        extents: Vec3A::ZERO,
    };

    pub fn new(center: Vec3A, extents: Vec3A) -> Self {
        Self { center, extents }
    }

    pub fn from_min_max(min: Vec3A, max: Vec3A) -> Self {
        Self {
            center: (min + max) * 0.5,
            extents: (max - min) * 0.5,
        }
    }

    pub fn min(&self) -> Vec3A {
        self.center - self.extents
    }

    pub fn max(&self) -> Vec3A {
        self.center + self.extents
    }

    /// Smallest AABB enclosing both operands.
    pub fn union(&self, other: &Aabb) -> Aabb {
        Aabb::from_min_max(self.min().min(other.min()), self.max().max(other.max()))
    }

    pub fn surface_area(&self) -> f32 {
        let e = self.extents;
        8.0 * (e.x * e.y + e.y * e.z + e.z * e.x)
    }

    pub fn contains_point(&self, p: Vec3A) -> bool {
        let d = (p - self.center).abs();
        d.cmple(self.extents).all()
    }

    /// Classifies `other` against `self`: disjoint, overlapping, or fully
    /// contained in `self`.
    pub fn classify(&self, other: &Aabb) -> Containment {
        let d = (other.center - self.center).abs();
        if d.cmpgt(self.extents + other.extents).any() {
            return Containment::Disjoint;
        }
        if (d + other.extents).cmple(self.extents).all() {
            return Containment::Contains;
        }
        Containment::Intersects
    }

    pub fn intersects(&self, other: &Aabb) -> bool {
        self.classify(other) != Containment::Disjoint
    }
}
