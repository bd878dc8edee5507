//! Shared types for the farfield streaming engine.
//!
//! Everything here is a plain value type: cell coordinates, tier bands,
//! placement records, and the converted scene descriptions handed between
//! crates. No I/O, no locks.

mod types;

pub use types::{
    CELL_SIZE, CellCoord, NodeKind, PlacementRecord, PrototypeDescription, PrototypeId, RefId,
    SceneDescription, Tier, Transform, VariantId,
};

pub fn crate_info() -> &'static str {
    "farfield-common v0.1.0"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crate_loads() {
        assert!(crate_info().contains("common"));
    }
}
