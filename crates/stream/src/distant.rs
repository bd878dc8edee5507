use std::collections::HashMap;

use farfield_assets::{BakedStore, ImpostorArtifact};
use farfield_common::{CellCoord, Tier, Transform};

use crate::error::StreamError;
use crate::scene::{NodeHandle, NodePayload, SceneGraph};
use crate::world::WorldDatabase;

/// What a distant-tier load produced for one cell.
#[derive(Debug, Clone, PartialEq)]
pub enum DistantData {
    /// Pre-merged MID mesh.
    Merged(farfield_assets::MergedMeshArtifact),
    /// FAR impostors, one per distinct prototype present in the cell.
    Impostors(Vec<ImpostorArtifact>),
    /// No baked artifact exists. Remembered so the cell is not requested
    /// again every frame.
    Empty,
}

enum DistantState {
    Loading,
    Attached(NodeHandle),
    Empty,
}

/// Occupancy counters for one distant tier.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DistantStats {
    pub loading: usize,
    pub attached: usize,
    pub empty: usize,
}

/// Tracks one distant tier's cells: MID merged meshes or FAR impostors.
///
/// Distant cells have a much simpler lifecycle than NEAR: one artifact
/// read off-thread, one attach, one detach. Cells with no baked artifact
/// park in Empty so repeated tier computations do not re-request them.
pub struct DistantCellManager {
    tier: Tier,
    cells: HashMap<CellCoord, DistantState>,
}

impl DistantCellManager {
    pub fn new(tier: Tier) -> Self {
        Self {
            tier,
            cells: HashMap::new(),
        }
    }

    pub fn tier(&self) -> Tier {
        self.tier
    }

    /// Returns false if the cell is already tracked.
    pub fn begin_loading(&mut self, cell: CellCoord) -> bool {
        if self.cells.contains_key(&cell) {
            return false;
        }
        self.cells.insert(cell, DistantState::Loading);
        true
    }

    /// Forget a cell whose load was cancelled before data arrived.
    pub fn abandon_loading(&mut self, cell: CellCoord) {
        if matches!(self.cells.get(&cell), Some(DistantState::Loading)) {
            self.cells.remove(&cell);
        }
    }

    pub fn is_tracked(&self, cell: CellCoord) -> bool {
        self.cells.contains_key(&cell)
    }

    /// True once the cell has settled: artifact attached, or confirmed to
    /// have none. Loading cells are not resident yet.
    pub fn is_resident(&self, cell: CellCoord) -> bool {
        matches!(
            self.cells.get(&cell),
            Some(DistantState::Attached(_) | DistantState::Empty)
        )
    }

    pub fn tracked_cells(&self) -> Vec<CellCoord> {
        let mut cells: Vec<CellCoord> = self.cells.keys().copied().collect();
        cells.sort_by_key(|c| (c.x, c.y));
        cells
    }

    pub fn stats(&self) -> DistantStats {
        let mut stats = DistantStats::default();
        for state in self.cells.values() {
            match state {
                DistantState::Loading => stats.loading += 1,
                DistantState::Attached(_) => stats.attached += 1,
                DistantState::Empty => stats.empty += 1,
            }
        }
        stats
    }

    /// Accept loaded data for a cell and attach it. Ignored unless the
    /// cell is still Loading.
    pub fn on_cell_loaded(
        &mut self,
        cell: CellCoord,
        data: DistantData,
        graph: &mut dyn SceneGraph,
    ) -> bool {
        if !matches!(self.cells.get(&cell), Some(DistantState::Loading)) {
            return false;
        }
        let state = match data {
            DistantData::Empty => DistantState::Empty,
            DistantData::Merged(artifact) => {
                let node = graph.attach(
                    cell,
                    self.tier,
                    NodePayload::MergedMesh {
                        scene: artifact.scene,
                    },
                    cell_transform(cell),
                );
                DistantState::Attached(node)
            }
            DistantData::Impostors(impostors) => {
                if impostors.is_empty() {
                    DistantState::Empty
                } else {
                    let node = graph.attach(
                        cell,
                        self.tier,
                        NodePayload::Impostors {
                            count: impostors.len(),
                        },
                        cell_transform(cell),
                    );
                    DistantState::Attached(node)
                }
            }
        };
        self.cells.insert(cell, state);
        true
    }

    /// Detach and forget a cell in any state.
    pub fn unload(&mut self, cell: CellCoord, graph: &mut dyn SceneGraph) -> bool {
        let Some(state) = self.cells.remove(&cell) else {
            return false;
        };
        if let DistantState::Attached(node) = state {
            graph.detach(node);
        }
        true
    }
}

fn cell_transform(cell: CellCoord) -> Transform {
    Transform {
        position: cell.center(),
        ..Transform::default()
    }
}

/// Worker-side artifact load for a distant cell. MID reads the cell's
/// merged mesh; FAR reads one impostor per distinct prototype placed in
/// the cell. A missing artifact is Empty, not an error.
pub fn load_distant(
    tier: Tier,
    cell: CellCoord,
    db: &dyn WorldDatabase,
    baked: &BakedStore,
) -> Result<DistantData, StreamError> {
    match tier {
        Tier::Mid => match baked
            .load_merged_mesh(cell)
            .map_err(|e| StreamError::Decode(e.to_string()))?
        {
            Some(artifact) => Ok(DistantData::Merged(artifact)),
            None => Ok(DistantData::Empty),
        },
        Tier::Far => {
            let mut prototype_ids: Vec<_> = db
                .get_placements(cell)
                .iter()
                .map(|r| r.base_object_id)
                .collect();
            prototype_ids.sort();
            prototype_ids.dedup();

            let mut impostors = Vec::new();
            for id in prototype_ids {
                if let Some(artifact) = baked
                    .load_impostor(id)
                    .map_err(|e| StreamError::Decode(e.to_string()))?
                {
                    impostors.push(artifact);
                }
            }
            if impostors.is_empty() {
                Ok(DistantData::Empty)
            } else {
                Ok(DistantData::Impostors(impostors))
            }
        }
        Tier::Near | Tier::Horizon => Ok(DistantData::Empty),
    }
}
