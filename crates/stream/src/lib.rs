//! Tiered streaming for a continuous open world.
//!
//! The world grid is split into distance bands around the viewpoint:
//! NEAR cells carry full per-placement content, MID cells a pre-merged
//! mesh, FAR cells impostor billboards, and the HORIZON nothing at all.
//! [`StreamingCoordinator::set_viewpoint`] runs the whole machine once
//! per frame; everything slow happens on background workers, and only
//! the frame step touches the scene graph, the object pool, or the
//! terrain engine.

mod cell;
mod config;
mod coordinator;
mod distant;
mod error;
mod registry;
mod scene;
mod tier;
mod world;

pub use cell::{CellManager, CellPhase, InstantiateReport, ResolvedPlacement};
pub use config::StreamConfig;
pub use coordinator::{StreamContext, StreamStats, StreamingCoordinator};
pub use distant::{load_distant, DistantCellManager, DistantData, DistantStats};
pub use error::{LogLimiter, StreamError};
pub use registry::{Constructor, ConstructorInput, NodeFactory};
pub use scene::{NodeHandle, NodePayload, RecordedNode, RecordingSceneGraph, SceneGraph};
pub use tier::{Frustum, TierManager, TierSets, Viewpoint};
pub use world::{
    terrain_control_path, terrain_heightmap_path, NullTerrainEngine, StaticWorldDatabase,
    TerrainEngine, WorldDatabase,
};

pub fn crate_info() -> &'static str {
    "farfield-stream v0.1.0"
}
