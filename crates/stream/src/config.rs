use std::time::Duration;

use serde::{Deserialize, Serialize};

/// All tuning knobs for the streaming engine, with defaults that fit a
/// mid-range machine. Everything is a named option; nothing requires a
/// code change to adjust.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// NEAR band: cells within this Chebyshev radius of the viewpoint cell.
    /// NEAR ignores the frustum so content behind the viewer never pops.
    pub near_radius_cells: i32,
    /// Outer edge of the MID band, in world units from the viewpoint.
    pub mid_distance: f32,
    /// Outer edge of the FAR band, in world units. Beyond this is HORIZON,
    /// which carries no per-cell load.
    pub far_distance: f32,

    /// Hard per-tier admission caps. Load-bearing: enumeration is
    /// truncated to these no matter how wide the distance bands are set.
    pub near_cap: usize,
    pub mid_cap: usize,
    pub far_cap: usize,

    /// Viewpoint movement below this distance reuses the previous tier
    /// computation, so a cell sitting on a band edge does not flap.
    pub hysteresis_margin: f32,

    /// Half-angle of the view cone used to filter MID and FAR cells.
    pub frustum_half_angle_deg: f32,

    /// Per-frame budget for draining background completions.
    pub drain_budget: Duration,
    /// Per-frame budget for progressive NEAR instantiation. A budget in
    /// time, not object count: placements vary wildly in cost.
    pub instantiate_budget: Duration,

    /// Placements of one prototype in one cell at or above this count are
    /// collapsed into a single instanced draw representation.
    pub batching_threshold: usize,

    /// Free instances created per common prototype at startup.
    pub pool_prewarm_per_prototype: usize,
    /// Global cap on pooled live instances.
    pub pool_max_live_instances: usize,

    /// Converted-asset cache ceilings.
    pub cache_max_entries: usize,
    pub cache_max_bytes: usize,

    /// Byte budget for each archive's raw-byte cache.
    pub archive_cache_bytes: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            near_radius_cells: 2,
            mid_distance: 1_200.0,
            far_distance: 3_000.0,
            near_cap: 50,
            mid_cap: 100,
            far_cap: 200,
            hysteresis_margin: 40.0,
            frustum_half_angle_deg: 70.0,
            drain_budget: Duration::from_millis(2),
            instantiate_budget: Duration::from_millis(3),
            batching_threshold: 10,
            pool_prewarm_per_prototype: 8,
            pool_max_live_instances: 4096,
            cache_max_entries: 1024,
            cache_max_bytes: 256 * 1024 * 1024,
            archive_cache_bytes: 64 * 1024 * 1024,
        }
    }
}
