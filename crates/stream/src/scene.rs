use std::collections::HashMap;

use farfield_assets::InstanceHandle;
use farfield_common::{CellCoord, PrototypeId, RefId, SceneDescription, Tier, Transform};

/// Handle to one attached scene node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeHandle(pub u64);

/// What an attachment represents.
#[derive(Debug, Clone, PartialEq)]
pub enum NodePayload {
    /// One pooled instance of a prototype.
    Object {
        instance: InstanceHandle,
        prototype: PrototypeId,
        scene: SceneDescription,
    },
    /// One GPU-instanced draw covering many placements of one prototype.
    Batch {
        prototype: PrototypeId,
        scene: SceneDescription,
        transforms: Vec<Transform>,
    },
    /// Visible stand-in for a missing or corrupt asset.
    Placeholder { reference: RefId },
    /// Pre-merged MID-tier cell mesh.
    MergedMesh { scene: SceneDescription },
    /// FAR-tier impostor billboards for one cell.
    Impostors { count: usize },
}

/// The render-side attachment surface.
///
/// Main thread only: implementations mutate live render state. Background
/// work produces data; only the frame step attaches or detaches.
pub trait SceneGraph {
    fn attach(
        &mut self,
        cell: CellCoord,
        tier: Tier,
        payload: NodePayload,
        transform: Transform,
    ) -> NodeHandle;

    fn detach(&mut self, handle: NodeHandle);
}

/// A node held by [`RecordingSceneGraph`].
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedNode {
    pub cell: CellCoord,
    pub tier: Tier,
    pub payload: NodePayload,
    pub transform: Transform,
}

/// In-memory scene graph used by tests and the headless driver.
///
/// Records every live attachment so invariants (single tier per cell, no
/// stale attachments) can be asserted from outside.
#[derive(Debug, Default)]
pub struct RecordingSceneGraph {
    nodes: HashMap<NodeHandle, RecordedNode>,
    next: u64,
    pub attach_count: u64,
    pub detach_count: u64,
}

impl RecordingSceneGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn nodes(&self) -> impl Iterator<Item = (&NodeHandle, &RecordedNode)> {
        self.nodes.iter()
    }

    pub fn node(&self, handle: NodeHandle) -> Option<&RecordedNode> {
        self.nodes.get(&handle)
    }

    pub fn live_count(&self) -> usize {
        self.nodes.len()
    }

    /// Tiers currently attached for a cell. The cross-tier invariant says
    /// this has at most one element between frame steps.
    pub fn attached_tiers(&self, cell: CellCoord) -> Vec<Tier> {
        let mut tiers: Vec<Tier> = self
            .nodes
            .values()
            .filter(|n| n.cell == cell)
            .map(|n| n.tier)
            .collect();
        tiers.sort();
        tiers.dedup();
        tiers
    }

    pub fn nodes_in_cell(&self, cell: CellCoord) -> Vec<&RecordedNode> {
        self.nodes.values().filter(|n| n.cell == cell).collect()
    }
}

impl SceneGraph for RecordingSceneGraph {
    fn attach(
        &mut self,
        cell: CellCoord,
        tier: Tier,
        payload: NodePayload,
        transform: Transform,
    ) -> NodeHandle {
        self.next += 1;
        let handle = NodeHandle(self.next);
        self.nodes.insert(
            handle,
            RecordedNode {
                cell,
                tier,
                payload,
                transform,
            },
        );
        self.attach_count += 1;
        handle
    }

    fn detach(&mut self, handle: NodeHandle) {
        if self.nodes.remove(&handle).is_none() {
            tracing::warn!(?handle, "detach of unknown node");
        }
        self.detach_count += 1;
    }
}
