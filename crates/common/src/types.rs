use glam::{Quat, Vec3};
use serde::{Deserialize, Serialize};

/// Edge length of one world cell in world units.
///
/// Content is authored against this grid; changing it invalidates every
/// baked cell artifact, so it is a constant rather than a config option.
pub const CELL_SIZE: f32 = 117.0;

/// A 2D cell coordinate in the world grid (vertical axis is not partitioned).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CellCoord {
    pub x: i32,
    pub y: i32,
}

impl CellCoord {
    pub fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }

    /// Convert a world position to the cell containing it.
    pub fn from_position(pos: Vec3) -> Self {
        Self {
            x: (pos.x / CELL_SIZE).floor() as i32,
            y: (pos.z / CELL_SIZE).floor() as i32,
        }
    }

    /// World-space center of this cell at ground height zero.
    pub fn center(&self) -> Vec3 {
        Vec3::new(
            (self.x as f32 + 0.5) * CELL_SIZE,
            0.0,
            (self.y as f32 + 0.5) * CELL_SIZE,
        )
    }

    /// Euclidean distance from a world position to this cell's center,
    /// measured in the ground plane.
    pub fn distance_to(&self, pos: Vec3) -> f32 {
        let c = self.center();
        let dx = c.x - pos.x;
        let dz = c.z - pos.z;
        (dx * dx + dz * dz).sqrt()
    }

    /// Chebyshev distance in cells to another coordinate.
    pub fn grid_distance(&self, other: CellCoord) -> i32 {
        (self.x - other.x).abs().max((self.y - other.y).abs())
    }
}

impl std::fmt::Display for CellCoord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({}, {})", self.x, self.y)
    }
}

/// Distance-based fidelity band. Ordered by increasing distance and
/// decreasing fidelity; a cell is represented by at most one tier at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Tier {
    Near,
    Mid,
    Far,
    Horizon,
}

impl Tier {
    /// Tiers that carry a per-cell representation. Horizon is excluded:
    /// it is rendered by the terrain clipmap, not by per-cell loads.
    pub const LOADABLE: [Tier; 3] = [Tier::Near, Tier::Mid, Tier::Far];

    /// Priority weight used when ordering load requests across tiers.
    pub fn weight(self) -> f32 {
        match self {
            Tier::Near => 1.0,
            Tier::Mid => 0.5,
            Tier::Far => 0.25,
            Tier::Horizon => 0.0,
        }
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Tier::Near => "near",
            Tier::Mid => "mid",
            Tier::Far => "far",
            Tier::Horizon => "horizon",
        };
        f.write_str(s)
    }
}

/// Spatial transform: position, rotation, scale.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Transform {
    pub position: Vec3,
    pub rotation: Quat,
    pub scale: Vec3,
}

impl Default for Transform {
    fn default() -> Self {
        Self {
            position: Vec3::ZERO,
            rotation: Quat::IDENTITY,
            scale: Vec3::ONE,
        }
    }
}

/// Identifier of one placed reference in the world database.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RefId(pub u64);

/// Identifier of a base object prototype.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PrototypeId(pub u64);

/// Variant of a converted asset (e.g. LOD or material permutation).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct VariantId(pub u32);

impl VariantId {
    pub const BASE: VariantId = VariantId(0);
}

/// What kind of scene node a record resolves to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeKind {
    Object,
    Light,
    Actor,
}

/// One placed object in a cell. Read-only input owned by the world
/// database; the streaming engine never mutates these.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlacementRecord {
    pub reference_id: RefId,
    pub base_object_id: PrototypeId,
    pub transform: Transform,
}

/// Description of a base object prototype from the world database.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrototypeDescription {
    pub id: PrototypeId,
    /// Archive path of the source asset.
    pub source_path: String,
    pub variant: VariantId,
    pub kind: NodeKind,
    /// Marked for pool pre-warming at startup.
    pub common: bool,
}

/// A converted, scene-graph-ready representation of an asset.
///
/// Geometry payloads are opaque to the streaming engine; it only needs
/// identity, node kind, and an approximate size for cache accounting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SceneDescription {
    pub name: String,
    pub kind: NodeKind,
    pub vertex_count: u32,
    pub index_count: u32,
    /// Approximate in-memory size in bytes, used for cache budgets.
    pub approx_bytes: usize,
}

impl SceneDescription {
    /// A visibly wrong stand-in used when an asset is missing or corrupt.
    pub fn placeholder(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: NodeKind::Object,
            vertex_count: 8,
            index_count: 36,
            approx_bytes: 256,
        }
    }
}
