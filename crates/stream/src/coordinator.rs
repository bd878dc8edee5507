use std::collections::HashMap;
use std::sync::Arc;

use farfield_archive::{ArchiveError, ArchiveSet};
use farfield_assets::{
    AssetCache, AssetDecoder, AssetKey, BakedStore, CacheStats, ObjectPool, PoolConfig,
};
use farfield_common::{CellCoord, PrototypeDescription, SceneDescription, Tier};
use farfield_sched::{BackgroundScheduler, CancelFlag, TaskId};

use crate::cell::{CellManager, CellPhase, ResolvedPlacement};
use crate::config::StreamConfig;
use crate::distant::{load_distant, DistantCellManager, DistantData, DistantStats};
use crate::error::{LogLimiter, StreamError};
use crate::registry::NodeFactory;
use crate::scene::SceneGraph;
use crate::tier::{Frustum, TierManager, TierSets, Viewpoint};
use crate::world::{terrain_control_path, terrain_heightmap_path, TerrainEngine, WorldDatabase};

/// Everything the streaming engine needs from its host, bundled into one
/// explicit context instead of process-wide statics. The worker-visible
/// services are shared via `Arc` so load jobs can hold them across frames.
pub struct StreamContext {
    pub config: StreamConfig,
    pub db: Arc<dyn WorldDatabase>,
    pub archives: Arc<ArchiveSet>,
    pub baked: Arc<BakedStore>,
    pub decoder: Arc<dyn AssetDecoder>,
    pub cache: Arc<AssetCache>,
}

impl StreamContext {
    pub fn new(
        config: StreamConfig,
        db: Arc<dyn WorldDatabase>,
        archives: Arc<ArchiveSet>,
        baked: Arc<BakedStore>,
        decoder: Arc<dyn AssetDecoder>,
    ) -> Self {
        let cache = Arc::new(AssetCache::new(
            config.cache_max_entries,
            config.cache_max_bytes,
        ));
        Self {
            config,
            db,
            archives,
            baked,
            decoder,
            cache,
        }
    }
}

/// Result of one background load task.
enum LoadOutcome {
    Near {
        resolved: Vec<ResolvedPlacement>,
        terrain: Option<TerrainRaster>,
    },
    Distant {
        data: Result<DistantData, StreamError>,
    },
}

/// Archived terrain rasters for one cell, extracted off-thread and handed
/// to the terrain engine on the main thread.
struct TerrainRaster {
    heightmap: Arc<Vec<u8>>,
    control_map: Arc<Vec<u8>>,
}

/// Aggregate counters reported by [`StreamingCoordinator::stats`].
#[derive(Debug, Clone, Copy, Default)]
pub struct StreamStats {
    pub near_loaded: usize,
    pub near_loading: usize,
    pub near_instantiating: usize,
    pub mid: DistantStats,
    pub far: DistantStats,
    pub queue_depth: usize,
    pub pending_tasks: usize,
    pub tasks_submitted: u64,
    pub placeholders: u64,
    pub stale_discards: u64,
    pub frames: u64,
    pub cache: CacheStats,
    pub pool_reuses: u64,
    pub pool_cold_creates: u64,
}

/// Drives the whole engine from one `set_viewpoint` call per frame.
///
/// The frame step: recompute tier sets, drain worker completions under the
/// drain budget, request loads for newly admitted cells in priority order,
/// reconcile tracked cells against the wanted sets (cancelling and tearing
/// down what left), then advance NEAR instantiation under its own budget.
///
/// During a tier hand-off a cell may briefly carry both representations,
/// never none: the outgoing tier is detached by the first reconcile that
/// observes the incoming tier as resident.
pub struct StreamingCoordinator {
    ctx: StreamContext,
    tiers: TierManager,
    near: CellManager,
    mid: DistantCellManager,
    far: DistantCellManager,
    pool: ObjectPool,
    factory: NodeFactory,
    terrain: Option<Box<dyn TerrainEngine>>,
    sched: BackgroundScheduler<LoadOutcome>,
    in_flight: HashMap<(CellCoord, Tier), TaskId>,
    task_index: HashMap<TaskId, (CellCoord, Tier)>,
    limiter: LogLimiter,
    tasks_submitted: u64,
    placeholders: u64,
    stale_discards: u64,
    frames: u64,
}

impl StreamingCoordinator {
    pub fn new(ctx: StreamContext) -> Self {
        Self::with_scheduler(ctx, BackgroundScheduler::new())
    }

    /// Explicit worker count, mainly for tests.
    pub fn with_workers(ctx: StreamContext, workers: usize) -> Self {
        Self::with_scheduler(ctx, BackgroundScheduler::with_workers(workers))
    }

    fn with_scheduler(ctx: StreamContext, sched: BackgroundScheduler<LoadOutcome>) -> Self {
        let mut pool = ObjectPool::new(PoolConfig {
            prewarm_per_prototype: ctx.config.pool_prewarm_per_prototype,
            max_live_instances: ctx.config.pool_max_live_instances,
        });
        pool.prewarm(ctx.db.common_prototypes());

        let batching_threshold = ctx.config.batching_threshold;
        Self {
            ctx,
            tiers: TierManager::new(),
            near: CellManager::new(batching_threshold),
            mid: DistantCellManager::new(Tier::Mid),
            far: DistantCellManager::new(Tier::Far),
            pool,
            factory: NodeFactory::with_defaults(),
            terrain: None,
            sched,
            in_flight: HashMap::new(),
            task_index: HashMap::new(),
            limiter: LogLimiter::default(),
            tasks_submitted: 0,
            placeholders: 0,
            stale_discards: 0,
            frames: 0,
        }
    }

    /// Replace the node factory, e.g. to register extra record kinds.
    pub fn set_factory(&mut self, factory: NodeFactory) {
        self.factory = factory;
    }

    /// Install a terrain backend. Cells whose archives carry terrain
    /// rasters get them imported when the cell's load is accepted.
    pub fn set_terrain_engine(&mut self, terrain: Box<dyn TerrainEngine>) {
        self.terrain = Some(terrain);
    }

    /// Run one frame step for the given viewpoint.
    pub fn set_viewpoint(&mut self, viewpoint: Viewpoint, graph: &mut dyn SceneGraph) {
        let _span = tracing::info_span!("frame_step", frame = self.frames).entered();
        self.frames += 1;

        let sets = self.tiers.compute_visible(&viewpoint, &self.ctx.config);
        self.drain_completions(graph);
        self.request_missing(&viewpoint, &sets);
        self.reconcile(&sets, graph);

        let report = self.near.step_instantiate(
            self.ctx.config.instantiate_budget,
            &mut self.pool,
            &self.ctx.cache,
            &self.factory,
            graph,
            &mut self.limiter,
        );
        self.placeholders += report.placeholders as u64;
    }

    /// Tasks submitted but not yet delivered back.
    pub fn pending_tasks(&self) -> usize {
        self.sched.pending_count()
    }

    /// True when nothing is loading or instantiating anywhere.
    pub fn is_idle(&self) -> bool {
        if self.sched.pending_count() > 0 {
            return false;
        }
        let stats = self.stats_inner();
        stats.near_loading == 0
            && stats.near_instantiating == 0
            && stats.mid.loading == 0
            && stats.far.loading == 0
    }

    pub fn stats(&self) -> StreamStats {
        self.stats_inner()
    }

    fn stats_inner(&self) -> StreamStats {
        let mut near_loaded = 0;
        let mut near_loading = 0;
        let mut near_instantiating = 0;
        for cell in self.near.tracked_cells() {
            match self.near.phase(cell) {
                Some(CellPhase::Loaded) => near_loaded += 1,
                Some(CellPhase::Loading) => near_loading += 1,
                Some(CellPhase::Instantiating) => near_instantiating += 1,
                None => {}
            }
        }
        let (pool_reuses, pool_cold_creates) = self.pool.stats();
        StreamStats {
            near_loaded,
            near_loading,
            near_instantiating,
            mid: self.mid.stats(),
            far: self.far.stats(),
            queue_depth: self.sched.queue_depth(),
            pending_tasks: self.sched.pending_count(),
            tasks_submitted: self.tasks_submitted,
            placeholders: self.placeholders,
            stale_discards: self.stale_discards,
            frames: self.frames,
            cache: self.ctx.cache.stats(),
            pool_reuses,
            pool_cold_creates,
        }
    }

    fn drain_completions(&mut self, graph: &mut dyn SceneGraph) {
        for completion in self.sched.poll_completed(self.ctx.config.drain_budget) {
            let Some(key) = self.task_index.remove(&completion.task_id) else {
                continue;
            };
            if self.in_flight.get(&key) == Some(&completion.task_id) {
                self.in_flight.remove(&key);
            }
            if completion.stale {
                self.stale_discards += 1;
                continue;
            }
            let (cell, tier) = key;
            match completion.result {
                Ok(LoadOutcome::Near { resolved, terrain }) => {
                    if !self.near.on_cell_loaded(cell, resolved) {
                        self.stale_discards += 1;
                    } else if let (Some(engine), Some(raster)) =
                        (self.terrain.as_deref_mut(), terrain)
                    {
                        engine.import_region(cell, &raster.heightmap, &raster.control_map);
                    }
                }
                Ok(LoadOutcome::Distant { data }) => {
                    let data = match data {
                        Ok(data) => data,
                        Err(err) => {
                            let reason = err.to_string();
                            if self.limiter.should_log(&reason) {
                                tracing::warn!(%cell, %tier, %reason, "distant load failed, cell skipped");
                            }
                            DistantData::Empty
                        }
                    };
                    let accepted = match tier {
                        Tier::Mid => self.mid.on_cell_loaded(cell, data, graph),
                        Tier::Far => self.far.on_cell_loaded(cell, data, graph),
                        Tier::Near | Tier::Horizon => false,
                    };
                    if !accepted {
                        self.stale_discards += 1;
                    }
                }
                Err(err) => {
                    // Worker panic or cancelled in queue. Settle the cell as
                    // loaded-with-nothing so it is not re-requested forever.
                    let reason = format!("task failed: {err}");
                    if self.limiter.should_log(&reason) {
                        tracing::warn!(%cell, %tier, %reason, "load task failed");
                    }
                    match tier {
                        Tier::Near => {
                            self.near.on_cell_loaded(cell, Vec::new());
                        }
                        Tier::Mid => {
                            self.mid.on_cell_loaded(cell, DistantData::Empty, graph);
                        }
                        Tier::Far => {
                            self.far.on_cell_loaded(cell, DistantData::Empty, graph);
                        }
                        Tier::Horizon => {}
                    }
                }
            }
        }
    }

    fn request_missing(&mut self, viewpoint: &Viewpoint, sets: &TierSets) {
        let frustum = Frustum::new(viewpoint, self.ctx.config.frustum_half_angle_deg);
        for (cell, tier) in sets.iter() {
            let fresh = match tier {
                Tier::Near => self.near.begin_loading(cell),
                Tier::Mid => self.mid.begin_loading(cell),
                Tier::Far => self.far.begin_loading(cell),
                Tier::Horizon => false,
            };
            if !fresh {
                continue;
            }
            let priority = load_priority(cell, tier, viewpoint, &frustum);
            let task_id = self.submit_load(cell, tier, priority);
            self.in_flight.insert((cell, tier), task_id);
            self.task_index.insert(task_id, (cell, tier));
            self.tasks_submitted += 1;
            tracing::debug!(%cell, %tier, priority, "load requested");
        }
    }

    fn submit_load(&self, cell: CellCoord, tier: Tier, priority: f32) -> TaskId {
        match tier {
            Tier::Near => {
                let db = Arc::clone(&self.ctx.db);
                let cache = Arc::clone(&self.ctx.cache);
                let archives = Arc::clone(&self.ctx.archives);
                let baked = Arc::clone(&self.ctx.baked);
                let decoder = Arc::clone(&self.ctx.decoder);
                self.sched.submit(priority, move |cancel| LoadOutcome::Near {
                    resolved: resolve_cell(&*db, &cache, &archives, &baked, &*decoder, cell, cancel),
                    terrain: fetch_terrain(&archives, cell),
                })
            }
            _ => {
                let db = Arc::clone(&self.ctx.db);
                let baked = Arc::clone(&self.ctx.baked);
                self.sched.submit(priority, move |_| LoadOutcome::Distant {
                    data: load_distant(tier, cell, &*db, &baked),
                })
            }
        }
    }

    fn reconcile(&mut self, sets: &TierSets, graph: &mut dyn SceneGraph) {
        // NEAR cells that left the band. When the cell is still wanted at a
        // coarser tier, its NEAR representation stays up until that coarser
        // tier has settled; a cell gone entirely is torn down at once.
        for cell in self.near.tracked_cells() {
            match sets.tier_of(cell) {
                Some(Tier::Near) => {}
                Some(coarser @ (Tier::Mid | Tier::Far)) => {
                    let settled = match coarser {
                        Tier::Mid => self.mid.is_resident(cell),
                        _ => self.far.is_resident(cell),
                    };
                    if settled {
                        self.near.unload(cell, &mut self.pool, &self.ctx.cache, graph);
                    } else if self.near.phase(cell) == Some(CellPhase::Loading) {
                        // Nothing attached yet, so nothing worth keeping.
                        self.cancel_load(cell, Tier::Near);
                        self.near.abandon_loading(cell);
                    }
                }
                None | Some(Tier::Horizon) => {
                    self.cancel_load(cell, Tier::Near);
                    self.near.unload(cell, &mut self.pool, &self.ctx.cache, graph);
                }
            }
        }

        // MID: torn down on approach only once NEAR is fully instantiated.
        for cell in self.mid.tracked_cells() {
            match sets.tier_of(cell) {
                Some(Tier::Mid) => {}
                Some(Tier::Near) => {
                    if self.near.is_loaded(cell) {
                        self.mid.unload(cell, graph);
                    } else if !self.mid.is_resident(cell) {
                        self.cancel_load(cell, Tier::Mid);
                        self.mid.abandon_loading(cell);
                    }
                }
                Some(Tier::Far) => {
                    if self.far.is_resident(cell) {
                        self.mid.unload(cell, graph);
                    } else if !self.mid.is_resident(cell) {
                        self.cancel_load(cell, Tier::Mid);
                        self.mid.abandon_loading(cell);
                    }
                }
                None | Some(Tier::Horizon) => {
                    self.cancel_load(cell, Tier::Mid);
                    self.mid.unload(cell, graph);
                }
            }
        }

        // FAR: same policy against MID.
        for cell in self.far.tracked_cells() {
            match sets.tier_of(cell) {
                Some(Tier::Far) => {}
                Some(Tier::Near | Tier::Mid) => {
                    let finer_settled = self.near.is_loaded(cell) || self.mid.is_resident(cell);
                    if finer_settled {
                        self.far.unload(cell, graph);
                    } else if !self.far.is_resident(cell) {
                        self.cancel_load(cell, Tier::Far);
                        self.far.abandon_loading(cell);
                    }
                }
                None | Some(Tier::Horizon) => {
                    self.cancel_load(cell, Tier::Far);
                    self.far.unload(cell, graph);
                }
            }
        }
    }

    fn cancel_load(&mut self, cell: CellCoord, tier: Tier) {
        if let Some(task_id) = self.in_flight.remove(&(cell, tier)) {
            self.sched.cancel(task_id);
        }
    }
}

/// Higher runs first: tier weight dominates, then in-frustum cells beat
/// out-of-frustum ones, then nearer beats farther.
fn load_priority(cell: CellCoord, tier: Tier, viewpoint: &Viewpoint, frustum: &Frustum) -> f32 {
    let mut priority = tier.weight() * 10_000.0;
    if frustum.contains(cell) {
        priority += 1_000.0;
    }
    priority - cell.distance_to(viewpoint.position)
}

/// Worker-side resolution of one NEAR cell: look up placements, resolve
/// each prototype's scene description through cache, baked store, then
/// archive + decoder. Per-placement failures are carried in the result so
/// the main thread can substitute placeholders.
fn resolve_cell(
    db: &dyn WorldDatabase,
    cache: &AssetCache,
    archives: &ArchiveSet,
    baked: &BakedStore,
    decoder: &dyn AssetDecoder,
    cell: CellCoord,
    cancel: &CancelFlag,
) -> Vec<ResolvedPlacement> {
    let records = db.get_placements(cell);
    let mut out = Vec::with_capacity(records.len());
    for record in records {
        // The completion is already stale; stop doing work for it.
        if cancel.is_cancelled() {
            break;
        }
        let Some(prototype) = db.get_prototype(record.base_object_id) else {
            out.push(ResolvedPlacement {
                scene: Err(StreamError::NotFound(format!(
                    "prototype {}",
                    record.base_object_id.0
                ))),
                record,
                prototype: None,
            });
            continue;
        };
        let scene = resolve_scene(cache, archives, baked, decoder, &prototype);
        out.push(ResolvedPlacement {
            record,
            prototype: Some(prototype),
            scene,
        });
    }
    out
}

/// Both rasters must be present; a cell without archived terrain is a
/// silent skip, same as a cell without baked artifacts.
fn fetch_terrain(archives: &ArchiveSet, cell: CellCoord) -> Option<TerrainRaster> {
    let heightmap = archives.extract(&terrain_heightmap_path(cell)).ok()?;
    let control_map = archives.extract(&terrain_control_path(cell)).ok()?;
    Some(TerrainRaster {
        heightmap,
        control_map,
    })
}

fn resolve_scene(
    cache: &AssetCache,
    archives: &ArchiveSet,
    baked: &BakedStore,
    decoder: &dyn AssetDecoder,
    prototype: &PrototypeDescription,
) -> Result<Arc<SceneDescription>, StreamError> {
    let key = AssetKey::new(prototype.source_path.clone(), prototype.variant);
    if let Some(scene) = cache.get(&key) {
        return Ok(scene);
    }

    // Baked fast path. A corrupt baked entry falls back to live conversion.
    match baked.load_geometry(&prototype.source_path, prototype.variant) {
        Ok(Some(scene)) => {
            let scene = Arc::new(scene);
            cache.insert(key, Arc::clone(&scene));
            return Ok(scene);
        }
        Ok(None) => {}
        Err(err) => {
            tracing::debug!(path = %prototype.source_path, %err, "baked geometry unreadable");
        }
    }

    let bytes = archives.extract(&prototype.source_path).map_err(|e| match e {
        ArchiveError::NotFound(path) => StreamError::NotFound(path),
        other => StreamError::Decode(other.to_string()),
    })?;
    let scene = decoder
        .decode(&bytes, prototype.variant)
        .map_err(|e| StreamError::Decode(e.to_string()))?;
    let scene = Arc::new(scene);
    cache.insert(key, Arc::clone(&scene));
    Ok(scene)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scene::{NodePayload, RecordingSceneGraph};
    use crate::world::StaticWorldDatabase;
    use farfield_archive::ArchiveBuilder;
    use farfield_assets::{MergedMeshArtifact, SyntheticDecoder};
    use farfield_common::{
        NodeKind, PlacementRecord, PrototypeId, RefId, Transform, VariantId, CELL_SIZE,
    };
    use glam::Vec3;
    use std::time::{Duration, Instant};

    fn proto(id: u64, path: &str) -> PrototypeDescription {
        PrototypeDescription {
            id: PrototypeId(id),
            source_path: path.into(),
            variant: VariantId::BASE,
            kind: NodeKind::Object,
            common: false,
        }
    }

    fn place(db: &mut StaticWorldDatabase, cell: CellCoord, reference: u64, proto_id: u64) {
        db.place(
            cell,
            PlacementRecord {
                reference_id: RefId(reference),
                base_object_id: PrototypeId(proto_id),
                transform: Transform {
                    position: cell.center(),
                    ..Transform::default()
                },
            },
        );
    }

    struct World {
        coordinator: StreamingCoordinator,
        graph: RecordingSceneGraph,
        _tmp: tempfile::TempDir,
    }

    /// A small world: one placement per cell in a square around the
    /// origin, all referencing one healthy archived asset.
    fn small_world(config: StreamConfig) -> World {
        let tmp = tempfile::tempdir().unwrap();

        let mut builder = ArchiveBuilder::new();
        builder.add("meshes/rock.bin", b"object:100:240".to_vec());
        builder.add("meshes/bad.bin", b"!corrupt".to_vec());
        let archive_path = tmp.path().join("world.farc");
        builder.write_to(&archive_path).unwrap();

        let mut db = StaticWorldDatabase::new();
        db.add_prototype(proto(1, "meshes/rock.bin"));
        db.add_prototype(proto(2, "meshes/bad.bin"));
        let mut next_ref = 0;
        for x in -8..=8 {
            for y in -8..=8 {
                next_ref += 1;
                place(&mut db, CellCoord::new(x, y), next_ref, 1);
            }
        }

        // Merged meshes for the whole authored region so MID has content.
        let baked = BakedStore::open(tmp.path().join("baked")).unwrap();
        for x in -8..=8 {
            for y in -8..=8 {
                baked
                    .bake_merged_mesh(&MergedMeshArtifact {
                        cell: CellCoord::new(x, y),
                        scene: SceneDescription::placeholder("merged"),
                        source_placements: 1,
                    })
                    .unwrap();
            }
        }

        let ctx = StreamContext::new(
            config,
            Arc::new(db),
            Arc::new(ArchiveSet::open_all(&[&archive_path]).unwrap()),
            Arc::new(baked),
            Arc::new(SyntheticDecoder),
        );
        World {
            coordinator: StreamingCoordinator::with_workers(ctx, 2),
            graph: RecordingSceneGraph::new(),
            _tmp: tmp,
        }
    }

    fn origin_viewpoint() -> Viewpoint {
        Viewpoint::new(
            Vec3::new(CELL_SIZE * 0.5, 0.0, CELL_SIZE * 0.5),
            Vec3::new(0.0, 0.0, 1.0),
        )
    }

    fn run_until_idle(world: &mut World, viewpoint: Viewpoint) {
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            world.coordinator.set_viewpoint(viewpoint, &mut world.graph);
            if world.coordinator.is_idle() {
                // One more step so settled tier transitions finalize.
                world.coordinator.set_viewpoint(viewpoint, &mut world.graph);
                return;
            }
            assert!(Instant::now() < deadline, "streaming never settled");
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn near_band_fully_loads_around_viewpoint() {
        let mut world = small_world(StreamConfig::default());
        run_until_idle(&mut world, origin_viewpoint());

        let stats = world.coordinator.stats();
        // Radius 2 NEAR band: the full 5x5 block.
        assert_eq!(stats.near_loaded, 25);
        assert_eq!(stats.placeholders, 0);
        for x in -2..=2 {
            for y in -2..=2 {
                let cell = CellCoord::new(x, y);
                assert_eq!(world.graph.attached_tiers(cell), vec![Tier::Near]);
            }
        }
    }

    #[test]
    fn repeated_frames_do_not_resubmit_requests() {
        let mut world = small_world(StreamConfig::default());
        let vp = origin_viewpoint();
        world.coordinator.set_viewpoint(vp, &mut world.graph);
        let submitted = world.coordinator.stats().tasks_submitted;
        assert!(submitted > 0);

        for _ in 0..5 {
            world.coordinator.set_viewpoint(vp, &mut world.graph);
        }
        assert_eq!(world.coordinator.stats().tasks_submitted, submitted);
    }

    #[test]
    fn no_cell_is_represented_at_two_tiers_after_a_frame() {
        let mut world = small_world(StreamConfig::default());
        let vp = origin_viewpoint();
        run_until_idle(&mut world, vp);

        // Walk forward several cells so NEAR/MID membership shifts.
        let moved = Viewpoint::new(vp.position + Vec3::new(0.0, 0.0, CELL_SIZE * 4.0), vp.forward);
        run_until_idle(&mut world, moved);

        for (_, node) in world.graph.nodes() {
            assert_eq!(
                world.graph.attached_tiers(node.cell).len(),
                1,
                "cell {} attached at multiple tiers",
                node.cell
            );
        }
    }

    #[test]
    fn corrupt_asset_becomes_placeholder_and_session_continues() {
        let mut world = small_world(StreamConfig::default());
        // Rebuild the world with one corrupt placement added at (0, 1).
        let cell = CellCoord::new(0, 1);
        let mut db = StaticWorldDatabase::new();
        db.add_prototype(proto(1, "meshes/rock.bin"));
        db.add_prototype(proto(2, "meshes/bad.bin"));
        let mut next_ref = 0;
        for x in -4..=4 {
            for y in -4..=4 {
                next_ref += 1;
                place(&mut db, CellCoord::new(x, y), next_ref, 1);
            }
        }
        place(&mut db, cell, 9_000, 2);

        let archives = Arc::clone(&world.coordinator.ctx.archives);
        let baked = Arc::clone(&world.coordinator.ctx.baked);
        let ctx = StreamContext::new(
            StreamConfig::default(),
            Arc::new(db),
            archives,
            baked,
            Arc::new(SyntheticDecoder),
        );
        world.coordinator = StreamingCoordinator::with_workers(ctx, 2);
        world.graph = RecordingSceneGraph::new();

        run_until_idle(&mut world, origin_viewpoint());
        let stats = world.coordinator.stats();
        assert_eq!(stats.placeholders, 1);
        assert_eq!(stats.near_loaded, 25);

        let placeholders = world
            .graph
            .nodes_in_cell(cell)
            .into_iter()
            .filter(|n| matches!(n.payload, NodePayload::Placeholder { reference } if reference == RefId(9_000)))
            .count();
        assert_eq!(placeholders, 1);
    }

    #[test]
    fn dense_cell_collapses_into_single_instanced_node() {
        let tmp = tempfile::tempdir().unwrap();
        let mut builder = ArchiveBuilder::new();
        builder.add("meshes/tree.bin", b"object:50:120".to_vec());
        let archive_path = tmp.path().join("world.farc");
        builder.write_to(&archive_path).unwrap();

        let mut db = StaticWorldDatabase::new();
        db.add_prototype(proto(1, "meshes/tree.bin"));
        let cell = CellCoord::new(0, 0);
        for n in 0..15 {
            place(&mut db, cell, n, 1);
        }

        let config = StreamConfig {
            near_radius_cells: 0,
            batching_threshold: 10,
            ..StreamConfig::default()
        };
        let ctx = StreamContext::new(
            config,
            Arc::new(db),
            Arc::new(ArchiveSet::open_all(&[&archive_path]).unwrap()),
            Arc::new(BakedStore::open(tmp.path().join("baked")).unwrap()),
            Arc::new(SyntheticDecoder),
        );
        let mut world = World {
            coordinator: StreamingCoordinator::with_workers(ctx, 1),
            graph: RecordingSceneGraph::new(),
            _tmp: tmp,
        };

        run_until_idle(&mut world, origin_viewpoint());
        let nodes = world.graph.nodes_in_cell(cell);
        assert_eq!(nodes.len(), 1);
        match &nodes[0].payload {
            NodePayload::Batch { transforms, .. } => assert_eq!(transforms.len(), 15),
            other => panic!("expected one instanced batch, got {other:?}"),
        }
        // No pooled instances were consumed for the batch.
        let stats = world.coordinator.stats();
        assert_eq!(stats.pool_reuses, 0);
        assert_eq!(stats.pool_cold_creates, 0);
    }

    #[test]
    fn accepted_near_loads_feed_the_terrain_engine() {
        struct SharedTerrain(Arc<std::sync::Mutex<Vec<CellCoord>>>);
        impl TerrainEngine for SharedTerrain {
            fn import_region(&mut self, region: CellCoord, heightmap: &[u8], control_map: &[u8]) {
                assert_eq!(heightmap, b"hgt");
                assert_eq!(control_map, b"ctl");
                self.0.lock().unwrap().push(region);
            }
        }

        let tmp = tempfile::tempdir().unwrap();
        let mut builder = ArchiveBuilder::new();
        builder.add("meshes/rock.bin", b"object:100:240".to_vec());
        // Rasters for two of the 25 NEAR cells; the rest have none.
        for cell in [CellCoord::new(0, 0), CellCoord::new(1, 1)] {
            builder.add(terrain_heightmap_path(cell), b"hgt".to_vec());
            builder.add(terrain_control_path(cell), b"ctl".to_vec());
        }
        let archive_path = tmp.path().join("world.farc");
        builder.write_to(&archive_path).unwrap();

        let mut db = StaticWorldDatabase::new();
        db.add_prototype(proto(1, "meshes/rock.bin"));
        let mut next_ref = 0;
        for x in -2..=2 {
            for y in -2..=2 {
                next_ref += 1;
                place(&mut db, CellCoord::new(x, y), next_ref, 1);
            }
        }

        let ctx = StreamContext::new(
            StreamConfig::default(),
            Arc::new(db),
            Arc::new(ArchiveSet::open_all(&[&archive_path]).unwrap()),
            Arc::new(BakedStore::open(tmp.path().join("baked")).unwrap()),
            Arc::new(SyntheticDecoder),
        );
        let mut world = World {
            coordinator: StreamingCoordinator::with_workers(ctx, 2),
            graph: RecordingSceneGraph::new(),
            _tmp: tmp,
        };
        let imported = Arc::new(std::sync::Mutex::new(Vec::new()));
        world
            .coordinator
            .set_terrain_engine(Box::new(SharedTerrain(Arc::clone(&imported))));

        run_until_idle(&mut world, origin_viewpoint());

        let mut imported = imported.lock().unwrap().clone();
        imported.sort_by_key(|c: &CellCoord| (c.x, c.y));
        assert_eq!(imported, vec![CellCoord::new(0, 0), CellCoord::new(1, 1)]);
    }

    #[test]
    fn teleport_discards_work_without_touching_the_scene() {
        let mut world = small_world(StreamConfig::default());
        let vp = origin_viewpoint();
        // Submit a burst of loads, then leave before any can be consumed.
        world.coordinator.set_viewpoint(vp, &mut world.graph);

        let far_away = Viewpoint::new(
            Vec3::new(CELL_SIZE * 1_000.0, 0.0, CELL_SIZE * 1_000.0),
            vp.forward,
        );
        run_until_idle(&mut world, far_away);

        // Nothing from the abandoned origin neighborhood is attached.
        for x in -2..=2 {
            for y in -2..=2 {
                assert!(world.graph.attached_tiers(CellCoord::new(x, y)).is_empty());
            }
        }
        let stats = world.coordinator.stats();
        assert!(stats.stale_discards > 0);
    }

    #[test]
    fn load_priority_prefers_near_then_frustum_then_distance() {
        let vp = origin_viewpoint();
        let frustum = Frustum::new(&vp, 70.0);
        let near_cell = CellCoord::new(0, 1);
        let mid_ahead = CellCoord::new(0, 6);
        let mid_behind = CellCoord::new(0, -6);

        let p_near = load_priority(near_cell, Tier::Near, &vp, &frustum);
        let p_ahead = load_priority(mid_ahead, Tier::Mid, &vp, &frustum);
        let p_behind = load_priority(mid_behind, Tier::Mid, &vp, &frustum);
        assert!(p_near > p_ahead);
        assert!(p_ahead > p_behind);
    }

    #[test]
    fn resolve_scene_populates_cache_once() {
        let tmp = tempfile::tempdir().unwrap();
        let mut builder = ArchiveBuilder::new();
        builder.add("meshes/rock.bin", b"object:100:240".to_vec());
        let archive_path = tmp.path().join("a.farc");
        builder.write_to(&archive_path).unwrap();

        let archives = ArchiveSet::open_all(&[&archive_path]).unwrap();
        let baked = BakedStore::open(tmp.path().join("baked")).unwrap();
        let cache = AssetCache::new(16, 1 << 20);
        let prototype = proto(1, "meshes/rock.bin");

        let first = resolve_scene(&cache, &archives, &baked, &SyntheticDecoder, &prototype).unwrap();
        let second = resolve_scene(&cache, &archives, &baked, &SyntheticDecoder, &prototype).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
    }
}
