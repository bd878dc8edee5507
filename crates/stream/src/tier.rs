use glam::{Vec2, Vec3};

use farfield_common::{CellCoord, Tier};

use crate::config::StreamConfig;

/// The viewer's position and facing for one frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Viewpoint {
    pub position: Vec3,
    pub forward: Vec3,
}

impl Viewpoint {
    pub fn new(position: Vec3, forward: Vec3) -> Self {
        Self { position, forward }
    }

    pub fn cell(&self) -> CellCoord {
        CellCoord::from_position(self.position)
    }
}

/// Ground-plane view cone used to cull MID and FAR cells.
///
/// Deliberately generous: a cell is kept if its center lies within the
/// cone or within one cell length of the viewer, so turning in place does
/// not immediately drop content at the viewer's feet.
#[derive(Debug, Clone, Copy)]
pub struct Frustum {
    position: Vec2,
    forward: Vec2,
    cos_half_angle: f32,
}

impl Frustum {
    pub fn new(viewpoint: &Viewpoint, half_angle_deg: f32) -> Self {
        let forward = Vec2::new(viewpoint.forward.x, viewpoint.forward.z);
        let forward = if forward.length_squared() > 1e-6 {
            forward.normalize()
        } else {
            Vec2::new(0.0, 1.0)
        };
        Self {
            position: Vec2::new(viewpoint.position.x, viewpoint.position.z),
            forward,
            cos_half_angle: half_angle_deg.to_radians().cos(),
        }
    }

    pub fn contains(&self, cell: CellCoord) -> bool {
        let center = cell.center();
        let to_cell = Vec2::new(center.x, center.z) - self.position;
        let dist = to_cell.length();
        if dist < farfield_common::CELL_SIZE {
            return true;
        }
        let dir = to_cell / dist;
        dir.dot(self.forward) >= self.cos_half_angle
    }
}

/// Cells admitted per tier, each list sorted ascending by distance and
/// truncated to the tier's hard cap.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TierSets {
    pub near: Vec<CellCoord>,
    pub mid: Vec<CellCoord>,
    pub far: Vec<CellCoord>,
}

impl TierSets {
    pub fn cells(&self, tier: Tier) -> &[CellCoord] {
        match tier {
            Tier::Near => &self.near,
            Tier::Mid => &self.mid,
            Tier::Far => &self.far,
            Tier::Horizon => &[],
        }
    }

    /// Iterate (cell, tier) pairs across all loadable tiers.
    pub fn iter(&self) -> impl Iterator<Item = (CellCoord, Tier)> + '_ {
        Tier::LOADABLE
            .into_iter()
            .flat_map(move |tier| self.cells(tier).iter().map(move |&c| (c, tier)))
    }

    /// The tier a cell is admitted at, if any. Bands are disjoint by
    /// construction, so this is unique.
    pub fn tier_of(&self, cell: CellCoord) -> Option<Tier> {
        for tier in Tier::LOADABLE {
            if self.cells(tier).contains(&cell) {
                return Some(tier);
            }
        }
        None
    }
}

/// Computes which cells belong to which tier for a viewpoint.
///
/// Recomputation is skipped while the viewpoint stays within the
/// hysteresis margin of the last computed position; callers get the
/// cached sets back, so a cell on a band edge cannot flap between tiers
/// from sub-margin jitter.
pub struct TierManager {
    last: Option<(Vec3, TierSets)>,
}

impl TierManager {
    pub fn new() -> Self {
        Self { last: None }
    }

    /// Drop the cached result so the next compute runs fully (used when
    /// the config changes or a session resets).
    pub fn invalidate(&mut self) {
        self.last = None;
    }

    pub fn compute_visible(&mut self, viewpoint: &Viewpoint, config: &StreamConfig) -> TierSets {
        if let Some((last_pos, sets)) = &self.last {
            if last_pos.distance(viewpoint.position) < config.hysteresis_margin {
                return sets.clone();
            }
        }

        let _span = tracing::debug_span!("compute_visible").entered();
        let sets = Self::compute(viewpoint, config);
        self.last = Some((viewpoint.position, sets.clone()));
        sets
    }

    fn compute(viewpoint: &Viewpoint, config: &StreamConfig) -> TierSets {
        let frustum = Frustum::new(viewpoint, config.frustum_half_angle_deg);
        let center = viewpoint.cell();
        let pos = viewpoint.position;

        // NEAR: a full square of cells around the viewer, facing ignored.
        let mut near = Vec::new();
        let r = config.near_radius_cells.clamp(0, MAX_ENUM_RADIUS);
        for dx in -r..=r {
            for dy in -r..=r {
                near.push(CellCoord::new(center.x + dx, center.y + dy));
            }
        }
        sort_and_cap(&mut near, pos, config.near_cap);

        // MID and FAR: distance-banded rings, frustum-filtered. The ring
        // walk terminates as soon as the cap is provably filled, so an
        // absurd distance setting cannot make a frame enumerate tens of
        // thousands of cells.
        let mid = banded_cells(
            center,
            pos,
            &frustum,
            |cell| {
                cell.grid_distance(center) > r && cell.distance_to(pos) <= config.mid_distance
            },
            config.mid_distance,
            config.mid_cap,
        );
        let far = banded_cells(
            center,
            pos,
            &frustum,
            |cell| {
                let d = cell.distance_to(pos);
                cell.grid_distance(center) > r && d > config.mid_distance && d <= config.far_distance
            },
            config.far_distance,
            config.far_cap,
        );

        tracing::trace!(
            near = near.len(),
            mid = mid.len(),
            far = far.len(),
            "tier sets computed"
        );
        TierSets { near, mid, far }
    }
}

impl Default for TierManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Enumeration never walks past this many rings, no matter the config.
const MAX_ENUM_RADIUS: i32 = 64;

/// Walk square rings outward from the center, admitting band members,
/// until the cap is provably filled or the band's outer ring is reached.
///
/// Any cell in ring j has a center at least (j - 1) cell lengths from the
/// viewer, so once `cap` cells are collected and the next ring's floor
/// distance exceeds the current cap-th nearest, no later ring can improve
/// the result and the walk stops.
fn banded_cells(
    center: CellCoord,
    pos: Vec3,
    frustum: &Frustum,
    admit: impl Fn(CellCoord) -> bool,
    outer_distance: f32,
    cap: usize,
) -> Vec<CellCoord> {
    let cell_size = farfield_common::CELL_SIZE;
    let max_radius =
        ((outer_distance / cell_size).ceil() as i32 + 1).clamp(0, MAX_ENUM_RADIUS);

    let mut cells = Vec::new();
    for k in 0..=max_radius {
        for cell in ring_cells(center, k) {
            if admit(cell) && frustum.contains(cell) {
                cells.push(cell);
            }
        }
        if cells.len() >= cap {
            sort_and_cap(&mut cells, pos, cap);
            let worst = cells
                .last()
                .map_or(f32::MAX, |c| c.distance_to(pos));
            let next_ring_floor = k as f32 * cell_size;
            if next_ring_floor > worst {
                return cells;
            }
        }
    }
    sort_and_cap(&mut cells, pos, cap);
    cells
}

/// Cells at exactly Chebyshev distance `k` from the center.
fn ring_cells(center: CellCoord, k: i32) -> Vec<CellCoord> {
    if k == 0 {
        return vec![center];
    }
    let mut out = Vec::with_capacity((8 * k) as usize);
    for dx in -k..=k {
        out.push(CellCoord::new(center.x + dx, center.y - k));
        out.push(CellCoord::new(center.x + dx, center.y + k));
    }
    for dy in (-k + 1)..k {
        out.push(CellCoord::new(center.x - k, center.y + dy));
        out.push(CellCoord::new(center.x + k, center.y + dy));
    }
    out
}

fn sort_and_cap(cells: &mut Vec<CellCoord>, pos: Vec3, cap: usize) {
    cells.sort_by(|a, b| a.distance_to(pos).total_cmp(&b.distance_to(pos)));
    cells.truncate(cap);
}
