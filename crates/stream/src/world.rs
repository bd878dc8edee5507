use std::collections::HashMap;

use farfield_common::{CellCoord, PlacementRecord, PrototypeDescription, PrototypeId};

/// Read-only placement queries against the world database.
///
/// Implementations are called from worker threads during cell loads and
/// must be `Send + Sync`. The streaming engine never mutates records.
pub trait WorldDatabase: Send + Sync {
    fn get_placements(&self, cell: CellCoord) -> Vec<PlacementRecord>;
    fn get_prototype(&self, id: PrototypeId) -> Option<PrototypeDescription>;

    /// Prototypes flagged common, used to pre-warm the object pool.
    fn common_prototypes(&self) -> Vec<PrototypeId>;
}

/// Terrain import surface. Raster data is produced off-thread; the import
/// itself must run on the main thread.
///
/// The coordinator pulls a cell's rasters out of the archives alongside its
/// placements and hands them over once the cell's load is accepted. Cells
/// without archived rasters are skipped silently.
pub trait TerrainEngine {
    fn import_region(&mut self, region: CellCoord, heightmap: &[u8], control_map: &[u8]);
}

/// Archive path of a cell's heightmap raster.
pub fn terrain_heightmap_path(cell: CellCoord) -> String {
    format!("terrain/{}_{}.hgt", cell.x, cell.y)
}

/// Archive path of a cell's surface control map.
pub fn terrain_control_path(cell: CellCoord) -> String {
    format!("terrain/{}_{}.ctl", cell.x, cell.y)
}

/// Simple in-memory world database for tests and the headless driver.
#[derive(Debug, Default)]
pub struct StaticWorldDatabase {
    placements: HashMap<CellCoord, Vec<PlacementRecord>>,
    prototypes: HashMap<PrototypeId, PrototypeDescription>,
}

impl StaticWorldDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_prototype(&mut self, proto: PrototypeDescription) {
        self.prototypes.insert(proto.id, proto);
    }

    pub fn place(&mut self, cell: CellCoord, record: PlacementRecord) {
        self.placements.entry(cell).or_default().push(record);
    }

    pub fn cell_count(&self) -> usize {
        self.placements.len()
    }

    pub fn placement_count(&self) -> usize {
        self.placements.values().map(Vec::len).sum()
    }
}

impl WorldDatabase for StaticWorldDatabase {
    fn get_placements(&self, cell: CellCoord) -> Vec<PlacementRecord> {
        self.placements.get(&cell).cloned().unwrap_or_default()
    }

    fn get_prototype(&self, id: PrototypeId) -> Option<PrototypeDescription> {
        self.prototypes.get(&id).cloned()
    }

    fn common_prototypes(&self) -> Vec<PrototypeId> {
        let mut ids: Vec<PrototypeId> = self
            .prototypes
            .values()
            .filter(|p| p.common)
            .map(|p| p.id)
            .collect();
        ids.sort();
        ids
    }
}

/// Terrain engine that counts imports; used where no real terrain backend
/// is wired up.
#[derive(Debug, Default)]
pub struct NullTerrainEngine {
    pub imported_regions: Vec<CellCoord>,
}

impl TerrainEngine for NullTerrainEngine {
    fn import_region(&mut self, region: CellCoord, _heightmap: &[u8], _control_map: &[u8]) {
        self.imported_regions.push(region);
    }
}
