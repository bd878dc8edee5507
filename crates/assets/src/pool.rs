use std::collections::HashMap;

use farfield_common::{PrototypeId, Transform};

/// Handle to one live scene instance cloned from a prototype.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstanceHandle(pub u64);

/// A reusable instance tracked by the pool.
///
/// Exactly one owner at a time: the pool while free, the acquiring cell
/// manager while in use. Released instances are reset before reuse.
#[derive(Debug, Clone, PartialEq)]
pub struct PooledInstance {
    pub prototype_id: PrototypeId,
    pub handle: InstanceHandle,
    pub transform: Transform,
    pub visible: bool,
    /// Per-instance material override; cleared on release.
    pub material_override: Option<String>,
    /// False for cold-path instances created past the global cap; those
    /// are dropped on release instead of returning to the free list.
    pub pooled: bool,
}

impl PooledInstance {
    fn reset(&mut self) {
        self.transform = Transform::default();
        self.visible = true;
        self.material_override = None;
    }
}

/// Pool sizing options.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Free instances created per prototype during pre-warm.
    pub prewarm_per_prototype: usize,
    /// Hard cap on total live instances (free + in use). Past the cap,
    /// acquire degrades to unpooled cold-path instances.
    pub max_live_instances: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            prewarm_per_prototype: 8,
            max_live_instances: 4096,
        }
    }
}

/// Reusable instance cache keyed by prototype identity.
///
/// Main-thread only: instances reference live scene state, so the pool is
/// never shared across threads.
pub struct ObjectPool {
    config: PoolConfig,
    free: HashMap<PrototypeId, Vec<PooledInstance>>,
    next_handle: u64,
    live: usize,
    reuses: u64,
    cold_creates: u64,
}

impl ObjectPool {
    pub fn new(config: PoolConfig) -> Self {
        Self {
            config,
            free: HashMap::new(),
            next_handle: 1,
            live: 0,
            reuses: 0,
            cold_creates: 0,
        }
    }

    /// Pre-create free instances for prototypes marked common, so first
    /// use in a hot cell does not pay the clone cost.
    pub fn prewarm(&mut self, prototypes: impl IntoIterator<Item = PrototypeId>) {
        for id in prototypes {
            for _ in 0..self.config.prewarm_per_prototype {
                if self.live >= self.config.max_live_instances {
                    tracing::warn!("instance cap reached during pre-warm");
                    return;
                }
                let instance = self.clone_from_prototype(id, true);
                self.free.entry(id).or_default().push(instance);
            }
        }
    }

    /// Get an instance of the given prototype.
    ///
    /// Reuses a free instance when one exists (reset to neutral state);
    /// otherwise clones a new one. At the live-instance cap the clone is
    /// unpooled: correct, but not retained on release.
    pub fn acquire(&mut self, prototype_id: PrototypeId) -> PooledInstance {
        if let Some(mut instance) = self.free.get_mut(&prototype_id).and_then(Vec::pop) {
            instance.reset();
            self.reuses += 1;
            return instance;
        }
        let pooled = self.live < self.config.max_live_instances;
        if !pooled {
            tracing::debug!(?prototype_id, "instance cap reached, unpooled acquire");
        }
        self.cold_creates += 1;
        self.clone_from_prototype(prototype_id, pooled)
    }

    /// Return an instance to the pool. Unpooled instances are destroyed.
    pub fn release(&mut self, mut instance: PooledInstance) {
        if !instance.pooled {
            return;
        }
        instance.reset();
        self.free.entry(instance.prototype_id).or_default().push(instance);
    }

    /// Free instances currently held for a prototype.
    pub fn free_count(&self, prototype_id: PrototypeId) -> usize {
        self.free.get(&prototype_id).map_or(0, Vec::len)
    }

    /// Total instances ever created and still tracked against the cap.
    pub fn live_count(&self) -> usize {
        self.live
    }

    /// (pool reuses, cold-path creations).
    pub fn stats(&self) -> (u64, u64) {
        (self.reuses, self.cold_creates)
    }

    fn clone_from_prototype(&mut self, prototype_id: PrototypeId, pooled: bool) -> PooledInstance {
        let handle = InstanceHandle(self.next_handle);
        self.next_handle += 1;
        if pooled {
            self.live += 1;
        }
        PooledInstance {
            prototype_id,
            handle,
            transform: Transform::default(),
            visible: true,
            material_override: None,
            pooled,
        }
    }
}
