//! The graph a probe run produces, before it is applied to the shadow.

use std::collections::{BTreeMap, BTreeSet};

use mesh_kernel::{MeshObjectIdentifier, NetMeshBaseIdentifier, PropertyValue, TypeIdentifier};

#[derive(Debug, Clone, PartialEq, Default)]
pub struct StagedObject {
    pub types: BTreeSet<TypeIdentifier>,
    pub properties: BTreeMap<TypeIdentifier, PropertyValue>,
}

/// A relationship to the home object of another shadow, held locally as a
/// forward reference stub.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct ForwardLink {
    pub from: MeshObjectIdentifier,
    pub role: TypeIdentifier,
    pub target: NetMeshBaseIdentifier,
    pub stub: MeshObjectIdentifier,
}

impl ForwardLink {
    /// The object the stub stands for, in the target's mesh base.
    pub fn target_object(&self) -> MeshObjectIdentifier {
        MeshObjectIdentifier::home_object_of(&self.target)
    }
}

/// Objects keyed by identifier, relationships keyed by `(source, destination)`
/// with the roles the source plays. Objects are identified by fragments of the
/// source identifier so that repeated runs produce the same identifiers.
#[derive(Debug, Clone)]
pub struct StagingGraph {
    source: NetMeshBaseIdentifier,
    objects: BTreeMap<MeshObjectIdentifier, StagedObject>,
    relationships: BTreeMap<(MeshObjectIdentifier, MeshObjectIdentifier), BTreeSet<TypeIdentifier>>,
    forward_links: BTreeSet<ForwardLink>,
}

impl StagingGraph {
    pub fn new(source: NetMeshBaseIdentifier) -> Self {
        let mut graph = Self {
            source,
            objects: BTreeMap::new(),
            relationships: BTreeMap::new(),
            forward_links: BTreeSet::new(),
        };
        let home = graph.home();
        graph.objects.insert(home, StagedObject::default());
        graph
    }

    pub fn source(&self) -> &NetMeshBaseIdentifier {
        &self.source
    }

    /// The object representing the resource itself.
    pub fn home(&self) -> MeshObjectIdentifier {
        MeshObjectIdentifier::home_object_of(&self.source)
    }

    /// Find or add the object with `fragment`, blessing it with `types`.
    pub fn object(&mut self, fragment: &str, types: &[TypeIdentifier]) -> MeshObjectIdentifier {
        let id = MeshObjectIdentifier::local_to(&self.source, fragment);
        self.bless(&id, types);
        id
    }

    pub fn bless(&mut self, id: &MeshObjectIdentifier, types: &[TypeIdentifier]) {
        self.objects
            .entry(id.clone())
            .or_default()
            .types
            .extend(types.iter().cloned());
    }

    pub fn set_property(&mut self, id: &MeshObjectIdentifier, property: TypeIdentifier, value: PropertyValue) {
        self.objects
            .entry(id.clone())
            .or_default()
            .properties
            .insert(property, value);
    }

    /// Relate `source` to `destination`, `source` playing `role`.
    pub fn relate(&mut self, source: &MeshObjectIdentifier, destination: &MeshObjectIdentifier, role: TypeIdentifier) {
        self.relationships
            .entry((source.clone(), destination.clone()))
            .or_default()
            .insert(role);
    }

    /// Relate `from` to the home object of the shadow for `target`.
    pub fn link_to(&mut self, from: &MeshObjectIdentifier, role: TypeIdentifier, target: NetMeshBaseIdentifier) {
        if target == self.source {
            return;
        }
        let stub = MeshObjectIdentifier::local_to(&self.source, &format!("link:{}", target.as_str()));
        self.forward_links.insert(ForwardLink {
            from: from.clone(),
            role,
            target,
            stub,
        });
    }

    pub fn objects(&self) -> &BTreeMap<MeshObjectIdentifier, StagedObject> {
        &self.objects
    }

    pub fn get(&self, id: &MeshObjectIdentifier) -> Option<&StagedObject> {
        self.objects.get(id)
    }

    pub fn relationships(
        &self,
    ) -> &BTreeMap<(MeshObjectIdentifier, MeshObjectIdentifier), BTreeSet<TypeIdentifier>> {
        &self.relationships
    }

    pub fn forward_links(&self) -> &BTreeSet<ForwardLink> {
        &self.forward_links
    }

    /// Every identifier the shadow should contain after the run.
    pub fn wanted_identifiers(&self) -> BTreeSet<MeshObjectIdentifier> {
        self.objects
            .keys()
            .cloned()
            .chain(self.forward_links.iter().map(|l| l.stub.clone()))
            .collect()
    }
}
