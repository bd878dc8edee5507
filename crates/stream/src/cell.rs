use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use farfield_assets::{AssetCache, AssetKey, ObjectPool, PooledInstance};
use farfield_common::{
    CellCoord, PlacementRecord, PrototypeDescription, SceneDescription, Tier, Transform,
};

use crate::error::{LogLimiter, StreamError};
use crate::registry::{ConstructorInput, NodeFactory};
use crate::scene::{NodeHandle, NodePayload, SceneGraph};

/// One placement after worker-side resolution. The worker looks up the
/// prototype and converts the asset; instantiation on the main thread
/// only consumes the result.
#[derive(Debug, Clone)]
pub struct ResolvedPlacement {
    pub record: PlacementRecord,
    pub prototype: Option<PrototypeDescription>,
    pub scene: Result<Arc<SceneDescription>, StreamError>,
}

/// One unit of main-thread instantiation work.
#[derive(Debug, Clone)]
enum InstantiateItem {
    Single(ResolvedPlacement),
    /// Many placements of one prototype collapsed into one instanced draw.
    Batch {
        prototype: PrototypeDescription,
        scene: Arc<SceneDescription>,
        transforms: Vec<Transform>,
    },
}

/// Bookkeeping for one attached node, so teardown can undo everything the
/// attach did: detach the node, return the instance, unpin the asset.
struct AttachedRef {
    node: NodeHandle,
    instance: Option<PooledInstance>,
    cache_key: Option<AssetKey>,
}

enum CellState {
    /// Load task submitted, data not back yet.
    Loading,
    /// Data arrived; instantiation proceeds a few items per frame.
    Instantiating {
        queue: VecDeque<InstantiateItem>,
        attached: Vec<AttachedRef>,
    },
    Loaded {
        attached: Vec<AttachedRef>,
    },
}

/// Externally visible lifecycle phase of a tracked cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CellPhase {
    Loading,
    Instantiating,
    Loaded,
}

/// Per-frame instantiation counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InstantiateReport {
    pub items: usize,
    pub placeholders: usize,
    pub cells_completed: usize,
}

/// Owns the lifecycle of NEAR cells: Loading, then progressive
/// instantiation under a per-frame time budget, then Loaded.
///
/// Main-thread only. Workers hand resolved placement data in through
/// [`CellManager::on_cell_loaded`]; everything that touches the scene
/// graph or the object pool happens here.
pub struct CellManager {
    cells: HashMap<CellCoord, CellState>,
    batching_threshold: usize,
}

impl CellManager {
    pub fn new(batching_threshold: usize) -> Self {
        Self {
            cells: HashMap::new(),
            batching_threshold,
        }
    }

    /// Mark a cell as having an in-flight load. Returns false if the cell
    /// is already tracked, so the same cell is never requested twice.
    pub fn begin_loading(&mut self, cell: CellCoord) -> bool {
        if self.cells.contains_key(&cell) {
            return false;
        }
        self.cells.insert(cell, CellState::Loading);
        true
    }

    /// Forget a cell whose load was cancelled before any data arrived.
    pub fn abandon_loading(&mut self, cell: CellCoord) {
        if matches!(self.cells.get(&cell), Some(CellState::Loading)) {
            self.cells.remove(&cell);
        }
    }

    pub fn phase(&self, cell: CellCoord) -> Option<CellPhase> {
        self.cells.get(&cell).map(|state| match state {
            CellState::Loading => CellPhase::Loading,
            CellState::Instantiating { .. } => CellPhase::Instantiating,
            CellState::Loaded { .. } => CellPhase::Loaded,
        })
    }

    pub fn is_tracked(&self, cell: CellCoord) -> bool {
        self.cells.contains_key(&cell)
    }

    pub fn is_loaded(&self, cell: CellCoord) -> bool {
        matches!(self.cells.get(&cell), Some(CellState::Loaded { .. }))
    }

    pub fn tracked_cells(&self) -> Vec<CellCoord> {
        let mut cells: Vec<CellCoord> = self.cells.keys().copied().collect();
        cells.sort_by_key(|c| (c.x, c.y));
        cells
    }

    /// Accept resolved placement data for a cell and queue it for
    /// instantiation. Ignored unless the cell is still in Loading: data
    /// for a cell torn down in the meantime is stale and dropped here.
    pub fn on_cell_loaded(&mut self, cell: CellCoord, resolved: Vec<ResolvedPlacement>) -> bool {
        if !matches!(self.cells.get(&cell), Some(CellState::Loading)) {
            return false;
        }
        let queue = self.build_queue(resolved);
        tracing::debug!(?cell, items = queue.len(), "cell data ready");
        let state = if queue.is_empty() {
            CellState::Loaded {
                attached: Vec::new(),
            }
        } else {
            CellState::Instantiating {
                queue,
                attached: Vec::new(),
            }
        };
        self.cells.insert(cell, state);
        true
    }

    /// Run progressive instantiation across all cells in the Instantiating
    /// phase, stopping when the time budget elapses. At least one item is
    /// processed per call so a tiny budget still makes progress.
    pub fn step_instantiate(
        &mut self,
        budget: Duration,
        pool: &mut ObjectPool,
        cache: &AssetCache,
        factory: &NodeFactory,
        graph: &mut dyn SceneGraph,
        limiter: &mut LogLimiter,
    ) -> InstantiateReport {
        let deadline = Instant::now() + budget;
        let mut report = InstantiateReport::default();

        let mut pending: Vec<CellCoord> = self
            .cells
            .iter()
            .filter(|(_, s)| matches!(s, CellState::Instantiating { .. }))
            .map(|(c, _)| *c)
            .collect();
        pending.sort_by_key(|c| (c.x, c.y));

        'cells: for cell in pending {
            loop {
                let Some(CellState::Instantiating { queue, attached }) = self.cells.get_mut(&cell)
                else {
                    break;
                };
                let Some(item) = queue.pop_front() else {
                    let attached = std::mem::take(attached);
                    self.cells.insert(cell, CellState::Loaded { attached });
                    report.cells_completed += 1;
                    tracing::debug!(?cell, "cell fully instantiated");
                    break;
                };
                let was_placeholder =
                    Self::instantiate_item(cell, item, pool, cache, factory, graph, limiter, attached);
                report.items += 1;
                if was_placeholder {
                    report.placeholders += 1;
                }
                if report.items > 0 && Instant::now() >= deadline {
                    break 'cells;
                }
            }
        }
        report
    }

    /// Tear down a cell in any phase: detach its nodes, return instances
    /// to the pool, unpin cached assets, forget it.
    pub fn unload(
        &mut self,
        cell: CellCoord,
        pool: &mut ObjectPool,
        cache: &AssetCache,
        graph: &mut dyn SceneGraph,
    ) -> bool {
        let Some(state) = self.cells.remove(&cell) else {
            return false;
        };
        let attached = match state {
            CellState::Loading => Vec::new(),
            CellState::Instantiating { attached, .. } | CellState::Loaded { attached } => attached,
        };
        for entry in attached {
            graph.detach(entry.node);
            if let Some(instance) = entry.instance {
                pool.release(instance);
            }
            if let Some(key) = entry.cache_key {
                cache.unpin(&key);
            }
        }
        tracing::debug!(?cell, "cell unloaded");
        true
    }

    fn build_queue(&self, resolved: Vec<ResolvedPlacement>) -> VecDeque<InstantiateItem> {
        // Count usable placements per prototype; groups at or above the
        // threshold collapse into one instanced item.
        let mut counts: HashMap<u64, usize> = HashMap::new();
        for r in &resolved {
            if let (Some(proto), Ok(_)) = (&r.prototype, &r.scene) {
                *counts.entry(proto.id.0).or_default() += 1;
            }
        }

        let mut batches: HashMap<u64, (PrototypeDescription, Arc<SceneDescription>, Vec<Transform>)> =
            HashMap::new();
        let mut queue = VecDeque::new();
        for r in resolved {
            match (r.prototype, r.scene) {
                (Some(proto), Ok(scene))
                    if counts.get(&proto.id.0).copied().unwrap_or(0) >= self.batching_threshold =>
                {
                    let id = proto.id.0;
                    batches
                        .entry(id)
                        .or_insert_with(|| (proto, scene, Vec::new()))
                        .2
                        .push(r.record.transform);
                }
                (prototype, scene) => queue.push_back(InstantiateItem::Single(ResolvedPlacement {
                    record: r.record,
                    prototype,
                    scene,
                })),
            }
        }

        let mut batch_items: Vec<(u64, InstantiateItem)> = batches
            .into_iter()
            .map(|(id, (prototype, scene, transforms))| {
                (
                    id,
                    InstantiateItem::Batch {
                        prototype,
                        scene,
                        transforms,
                    },
                )
            })
            .collect();
        batch_items.sort_by_key(|(id, _)| *id);
        for (_, item) in batch_items {
            queue.push_back(item);
        }
        queue
    }

    /// Returns true when the item degraded to a placeholder.
    #[allow(clippy::too_many_arguments)]
    fn instantiate_item(
        cell: CellCoord,
        item: InstantiateItem,
        pool: &mut ObjectPool,
        cache: &AssetCache,
        factory: &NodeFactory,
        graph: &mut dyn SceneGraph,
        limiter: &mut LogLimiter,
        attached: &mut Vec<AttachedRef>,
    ) -> bool {
        match item {
            InstantiateItem::Single(resolved) => {
                let record = resolved.record;
                match (resolved.prototype, resolved.scene) {
                    (Some(proto), Ok(scene)) => {
                        let instance = pool.acquire(proto.id);
                        let input = ConstructorInput {
                            record: &record,
                            prototype: &proto,
                            scene: &scene,
                            instance: instance.handle,
                        };
                        match factory.construct(&input) {
                            Some(payload) => {
                                let node = graph.attach(cell, Tier::Near, payload, record.transform);
                                let key = AssetKey::new(proto.source_path.clone(), proto.variant);
                                cache.pin(&key);
                                attached.push(AttachedRef {
                                    node,
                                    instance: Some(instance),
                                    cache_key: Some(key),
                                });
                                false
                            }
                            None => {
                                pool.release(instance);
                                if limiter.should_log(&format!("kind:{:?}", proto.kind)) {
                                    tracing::warn!(
                                        kind = ?proto.kind,
                                        "no constructor registered, placeholder substituted"
                                    );
                                }
                                let node = graph.attach(
                                    cell,
                                    Tier::Near,
                                    NodePayload::Placeholder {
                                        reference: record.reference_id,
                                    },
                                    record.transform,
                                );
                                attached.push(AttachedRef {
                                    node,
                                    instance: None,
                                    cache_key: None,
                                });
                                true
                            }
                        }
                    }
                    (_, scene) => {
                        let reason = match scene {
                            Err(err) => err.to_string(),
                            Ok(_) => {
                                StreamError::NotFound(format!("prototype {:?}", record.base_object_id))
                                    .to_string()
                            }
                        };
                        if limiter.should_log(&reason) {
                            tracing::warn!(
                                reference = ?record.reference_id,
                                %reason,
                                "placement failed, placeholder substituted"
                            );
                        }
                        let node = graph.attach(
                            cell,
                            Tier::Near,
                            NodePayload::Placeholder {
                                reference: record.reference_id,
                            },
                            record.transform,
                        );
                        attached.push(AttachedRef {
                            node,
                            instance: None,
                            cache_key: None,
                        });
                        true
                    }
                }
            }
            InstantiateItem::Batch {
                prototype,
                scene,
                transforms,
            } => {
                let count = transforms.len();
                let node = graph.attach(
                    cell,
                    Tier::Near,
                    NodePayload::Batch {
                        prototype: prototype.id,
                        scene: (*scene).clone(),
                        transforms,
                    },
                    Transform::default(),
                );
                let key = AssetKey::new(prototype.source_path.clone(), prototype.variant);
                cache.pin(&key);
                attached.push(AttachedRef {
                    node,
                    instance: None,
                    cache_key: Some(key),
                });
                tracing::trace!(?cell, prototype = ?prototype.id, count, "batched placements");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scene::RecordingSceneGraph;
    use farfield_assets::PoolConfig;
    use farfield_common::{NodeKind, PrototypeId, RefId, VariantId};

    fn proto(id: u64) -> PrototypeDescription {
        PrototypeDescription {
            id: PrototypeId(id),
            source_path: format!("meshes/{id}.bin"),
            variant: VariantId::BASE,
            kind: NodeKind::Object,
            common: false,
        }
    }

    fn resolved(reference: u64, proto_id: u64) -> ResolvedPlacement {
        ResolvedPlacement {
            record: PlacementRecord {
                reference_id: RefId(reference),
                base_object_id: PrototypeId(proto_id),
                transform: Transform::default(),
            },
            prototype: Some(proto(proto_id)),
            scene: Ok(Arc::new(SceneDescription::placeholder("s"))),
        }
    }

    fn failed(reference: u64) -> ResolvedPlacement {
        ResolvedPlacement {
            record: PlacementRecord {
                reference_id: RefId(reference),
                base_object_id: PrototypeId(999),
                transform: Transform::default(),
            },
            prototype: None,
            scene: Err(StreamError::NotFound("meshes/999.bin".into())),
        }
    }

    struct Fixture {
        manager: CellManager,
        pool: ObjectPool,
        cache: AssetCache,
        factory: NodeFactory,
        graph: RecordingSceneGraph,
        limiter: LogLimiter,
    }

    impl Fixture {
        fn new(batching_threshold: usize) -> Self {
            Self {
                manager: CellManager::new(batching_threshold),
                pool: ObjectPool::new(PoolConfig::default()),
                cache: AssetCache::new(64, 1 << 20),
                factory: NodeFactory::with_defaults(),
                graph: RecordingSceneGraph::new(),
                limiter: LogLimiter::default(),
            }
        }

        fn step(&mut self, budget: Duration) -> InstantiateReport {
            self.manager.step_instantiate(
                budget,
                &mut self.pool,
                &self.cache,
                &self.factory,
                &mut self.graph,
                &mut self.limiter,
            )
        }
    }

    #[test]
    fn load_instantiate_unload_cycle() {
        let mut fx = Fixture::new(100);
        let cell = CellCoord::new(0, 0);
        assert!(fx.manager.begin_loading(cell));
        assert!(!fx.manager.begin_loading(cell));

        assert!(fx
            .manager
            .on_cell_loaded(cell, vec![resolved(1, 1), resolved(2, 2)]));
        assert_eq!(fx.manager.phase(cell), Some(CellPhase::Instantiating));

        let report = fx.step(Duration::from_secs(1));
        assert_eq!(report.items, 2);
        assert_eq!(report.cells_completed, 1);
        assert!(fx.manager.is_loaded(cell));
        assert_eq!(fx.graph.live_count(), 2);

        assert!(fx.manager.unload(cell, &mut fx.pool, &fx.cache, &mut fx.graph));
        assert_eq!(fx.graph.live_count(), 0);
        assert!(!fx.manager.is_tracked(cell));
        // Instances went back to the pool free lists.
        assert_eq!(fx.pool.free_count(PrototypeId(1)), 1);
        assert_eq!(fx.pool.free_count(PrototypeId(2)), 1);
    }

    #[test]
    fn data_for_untracked_cell_is_dropped() {
        let mut fx = Fixture::new(100);
        let cell = CellCoord::new(3, 3);
        assert!(!fx.manager.on_cell_loaded(cell, vec![resolved(1, 1)]));
        assert!(!fx.manager.is_tracked(cell));
    }

    #[test]
    fn zero_budget_still_makes_progress() {
        let mut fx = Fixture::new(100);
        let cell = CellCoord::new(0, 0);
        fx.manager.begin_loading(cell);
        fx.manager
            .on_cell_loaded(cell, vec![resolved(1, 1), resolved(2, 1), resolved(3, 1)]);

        let report = fx.step(Duration::ZERO);
        assert!(report.items >= 1);
        assert!(report.items < 3 || fx.manager.is_loaded(cell));
    }

    #[test]
    fn failed_placements_become_placeholders() {
        let mut fx = Fixture::new(100);
        let cell = CellCoord::new(0, 0);
        fx.manager.begin_loading(cell);
        fx.manager
            .on_cell_loaded(cell, vec![resolved(1, 1), failed(2), failed(3)]);
        let report = fx.step(Duration::from_secs(1));
        assert_eq!(report.items, 3);
        assert_eq!(report.placeholders, 2);

        let placeholders = fx
            .graph
            .nodes_in_cell(cell)
            .into_iter()
            .filter(|n| matches!(n.payload, NodePayload::Placeholder { .. }))
            .count();
        assert_eq!(placeholders, 2);
        // The same missing path logs once, not once per placement.
        assert_eq!(fx.limiter.unique_failures(), 1);
    }

    #[test]
    fn repeated_prototypes_collapse_into_one_batch() {
        let mut fx = Fixture::new(3);
        let cell = CellCoord::new(1, 1);
        fx.manager.begin_loading(cell);
        let mut placements: Vec<ResolvedPlacement> =
            (0..5).map(|n| resolved(n, 7)).collect();
        placements.push(resolved(100, 8));
        fx.manager.on_cell_loaded(cell, placements);

        fx.step(Duration::from_secs(1));
        let nodes = fx.graph.nodes_in_cell(cell);
        // One batch node for prototype 7, one object node for prototype 8.
        assert_eq!(nodes.len(), 2);
        let batch = nodes
            .iter()
            .find_map(|n| match &n.payload {
                NodePayload::Batch { transforms, .. } => Some(transforms.len()),
                _ => None,
            })
            .unwrap();
        assert_eq!(batch, 5);
    }

    #[test]
    fn unload_mid_instantiation_cleans_partial_state() {
        let mut fx = Fixture::new(100);
        let cell = CellCoord::new(0, 0);
        fx.manager.begin_loading(cell);
        fx.manager
            .on_cell_loaded(cell, vec![resolved(1, 1), resolved(2, 1), resolved(3, 1)]);
        // A zero budget attaches at least one but not all.
        fx.step(Duration::ZERO);
        let live_before = fx.graph.live_count();
        assert!(live_before >= 1);

        fx.manager.unload(cell, &mut fx.pool, &fx.cache, &mut fx.graph);
        assert_eq!(fx.graph.live_count(), 0);
        assert_eq!(fx.pool.free_count(PrototypeId(1)), live_before);
    }

    #[test]
    fn pinned_assets_survive_until_unload() {
        let mut fx = Fixture::new(100);
        fx.cache = AssetCache::new(1, 1 << 20);
        let key = AssetKey::new("meshes/1.bin", VariantId::BASE);
        fx.cache
            .insert(key.clone(), Arc::new(SceneDescription::placeholder("s")));

        let cell = CellCoord::new(0, 0);
        fx.manager.begin_loading(cell);
        fx.manager.on_cell_loaded(cell, vec![resolved(1, 1)]);
        fx.step(Duration::from_secs(1));

        // Attached, so pinned: churn cannot evict it.
        fx.cache.insert(
            AssetKey::new("meshes/other.bin", VariantId::BASE),
            Arc::new(SceneDescription::placeholder("s")),
        );
        assert!(fx.cache.contains(&key));

        fx.manager.unload(cell, &mut fx.pool, &fx.cache, &mut fx.graph);
        fx.cache.insert(
            AssetKey::new("meshes/third.bin", VariantId::BASE),
            Arc::new(SceneDescription::placeholder("s")),
        );
        assert!(!fx.cache.contains(&key));
    }

    #[test]
    fn empty_cell_goes_straight_to_loaded() {
        let mut fx = Fixture::new(100);
        let cell = CellCoord::new(9, 9);
        fx.manager.begin_loading(cell);
        fx.manager.on_cell_loaded(cell, Vec::new());
        assert!(fx.manager.is_loaded(cell));
    }
}
