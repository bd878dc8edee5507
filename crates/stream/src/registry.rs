use std::collections::HashMap;

use farfield_assets::InstanceHandle;
use farfield_common::{NodeKind, PlacementRecord, PrototypeDescription, SceneDescription};

use crate::scene::NodePayload;

/// Everything a constructor needs to build a node payload for one
/// resolved placement.
pub struct ConstructorInput<'a> {
    pub record: &'a PlacementRecord,
    pub prototype: &'a PrototypeDescription,
    pub scene: &'a SceneDescription,
    pub instance: InstanceHandle,
}

pub type Constructor = Box<dyn Fn(&ConstructorInput<'_>) -> NodePayload + Send + Sync>;

/// Registered-factory map from record kind to node constructor.
///
/// Populated at startup; adding a record kind means registering a new
/// constructor, not editing a switch. An unregistered kind resolves to
/// `None` and the caller substitutes a placeholder.
pub struct NodeFactory {
    constructors: HashMap<NodeKind, Constructor>,
}

impl NodeFactory {
    /// Empty factory with nothing registered.
    pub fn new() -> Self {
        Self {
            constructors: HashMap::new(),
        }
    }

    /// Factory with the built-in object, light, and actor constructors.
    pub fn with_defaults() -> Self {
        let mut factory = Self::new();
        for kind in [NodeKind::Object, NodeKind::Light, NodeKind::Actor] {
            factory.register(
                kind,
                Box::new(|input: &ConstructorInput<'_>| NodePayload::Object {
                    instance: input.instance,
                    prototype: input.prototype.id,
                    scene: input.scene.clone(),
                }),
            );
        }
        factory
    }

    pub fn register(&mut self, kind: NodeKind, constructor: Constructor) {
        self.constructors.insert(kind, constructor);
    }

    pub fn construct(&self, input: &ConstructorInput<'_>) -> Option<NodePayload> {
        self.constructors.get(&input.prototype.kind).map(|c| c(input))
    }

    pub fn supports(&self, kind: NodeKind) -> bool {
        self.constructors.contains_key(&kind)
    }
}

impl Default for NodeFactory {
    fn default() -> Self {
        Self::with_defaults()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use farfield_common::{PrototypeId, RefId, Transform, VariantId};

    fn input_parts() -> (PlacementRecord, PrototypeDescription, SceneDescription) {
        let record = PlacementRecord {
            reference_id: RefId(1),
            base_object_id: PrototypeId(2),
            transform: Transform::default(),
        };
        let prototype = PrototypeDescription {
            id: PrototypeId(2),
            source_path: "meshes/x.bin".into(),
            variant: VariantId::BASE,
            kind: NodeKind::Light,
            common: false,
        };
        let scene = SceneDescription::placeholder("x");
        (record, prototype, scene)
    }

    #[test]
    fn defaults_cover_all_builtin_kinds() {
        let factory = NodeFactory::with_defaults();
        assert!(factory.supports(NodeKind::Object));
        assert!(factory.supports(NodeKind::Light));
        assert!(factory.supports(NodeKind::Actor));
    }

    #[test]
    fn unregistered_kind_returns_none() {
        let factory = NodeFactory::new();
        let (record, prototype, scene) = input_parts();
        let input = ConstructorInput {
            record: &record,
            prototype: &prototype,
            scene: &scene,
            instance: InstanceHandle(1),
        };
        assert!(factory.construct(&input).is_none());
    }

    #[test]
    fn registration_is_additive() {
        let mut factory = NodeFactory::new();
        factory.register(
            NodeKind::Light,
            Box::new(|input| NodePayload::Object {
                instance: input.instance,
                prototype: input.prototype.id,
                scene: input.scene.clone(),
            }),
        );
        let (record, prototype, scene) = input_parts();
        let input = ConstructorInput {
            record: &record,
            prototype: &prototype,
            scene: &scene,
            instance: InstanceHandle(9),
        };
        match factory.construct(&input) {
            Some(NodePayload::Object { instance, .. }) => assert_eq!(instance, InstanceHandle(9)),
            other => panic!("expected object payload, got {other:?}"),
        }
    }
}
