//! Transactions: the only way to mutate a mesh base.
//!
//! A transaction holds the mesh base's write lock, so at most one is open per
//! mesh base. Every mutation appends one event to the transaction's ChangeSet.
//! Dropping a transaction without committing rolls all of its mutations back.

use std::{
    collections::{BTreeSet, HashMap},
    sync::Arc,
};

use parking_lot::RwLockWriteGuard;
use tracing::{debug, warn};

use crate::{
    access::CallerContext,
    error::{MeshError, MeshResult},
    event::{Change, ChangeEvent, ChangeSet},
    identifier::{MeshObjectIdentifier, NetMeshBaseIdentifier},
    meshbase::{GraphState, MeshBase, MutationGuard},
    model::{ModelBase, TypeIdentifier},
    object::MeshObject,
    value::PropertyValue,
};

pub struct Transaction<'a> {
    base: &'a MeshBase,
    state: RwLockWriteGuard<'a, GraphState>,
    changes: ChangeSet,
    /// Object state before its first mutation in this transaction.
    undo: HashMap<MeshObjectIdentifier, Option<MeshObject>>,
    origin: Option<NetMeshBaseIdentifier>,
    ctx: CallerContext,
    guard: Option<Arc<dyn MutationGuard>>,
    now: i64,
    finished: bool,
}

impl<'a> Transaction<'a> {
    pub(crate) fn new(
        base: &'a MeshBase,
        state: RwLockWriteGuard<'a, GraphState>,
        origin: Option<NetMeshBaseIdentifier>,
        guard: Option<Arc<dyn MutationGuard>>,
        now: i64,
    ) -> Self {
        let ctx = CallerContext {
            origin: origin.clone(),
            ..CallerContext::default()
        };
        Self {
            base,
            state,
            changes: ChangeSet::new(),
            undo: HashMap::new(),
            origin,
            ctx,
            guard,
            now,
            finished: false,
        }
    }

    pub fn origin(&self) -> Option<&NetMeshBaseIdentifier> {
        self.origin.as_ref()
    }

    pub fn time(&self) -> i64 {
        self.now
    }

    pub fn set_caller(&mut self, caller: Option<MeshObjectIdentifier>) {
        self.ctx.caller = caller;
    }

    pub fn is_sudo(&self) -> bool {
        self.ctx.sudo
    }

    /// Run `f` with access checks disabled. The previous privilege level is
    /// restored afterwards, even if `f` panics.
    pub fn with_sudo<R>(&mut self, f: impl FnOnce(&mut Self) -> R) -> R {
        let prior = self.ctx.sudo;
        self.ctx.sudo = true;
        let mut elevated = scopeguard::guard(self, move |tx| tx.ctx.sudo = prior);
        f(&mut **elevated)
    }

    /// Changes recorded so far.
    pub fn changes(&self) -> &ChangeSet {
        &self.changes
    }

    /// Commit and return the ChangeSet. Listeners run after the lock is released.
    pub fn commit(mut self) -> ChangeSet {
        let changes = std::mem::take(&mut self.changes);
        for change in changes.iter() {
            let id = change.event.affected().clone();
            if matches!(change.event, ChangeEvent::Deleted { .. }) {
                self.state.dirty.remove(&id);
                self.state.deleted.insert(id);
            } else if self.state.objects.contains_key(&id) {
                self.state.deleted.remove(&id);
                self.state.dirty.insert(id);
            }
            if let Some(other) = change.event.counterpart() {
                if self.state.objects.contains_key(other) {
                    self.state.dirty.insert(other.clone());
                }
            }
        }
        // metadata-only updates such as expiry changes
        let touched: Vec<_> = self.undo.keys().cloned().collect();
        for id in touched {
            if self.state.objects.contains_key(&id) {
                self.state.dirty.insert(id);
            }
        }
        self.finished = true;
        let base = self.base;
        drop(self);

        if !changes.is_empty() {
            debug!(base = %base.identifier(), events = changes.len(), "Transaction committed");
            base.notify(&changes);
        }
        changes
    }

    /// Abandon the transaction, rolling back all of its mutations.
    pub fn rollback(self) {
        drop(self);
    }

    fn restore_undo(&mut self) {
        let undo = std::mem::take(&mut self.undo);
        for (id, prior) in undo {
            match prior {
                Some(object) => {
                    self.state.objects.insert(id, object);
                }
                None => {
                    self.state.objects.remove(&id);
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    fn model(&self) -> &'a ModelBase {
        let base: &'a MeshBase = self.base;
        base.model.as_ref()
    }

    /// Remote changes were checked against the model by their originator.
    fn enforce_model_rules(&self) -> bool {
        self.origin.is_none()
    }

    fn record(&mut self, event: ChangeEvent) {
        self.changes.push(Change {
            event,
            origin: self.origin.clone(),
            time: self.now,
        });
    }

    fn remember(&mut self, id: &MeshObjectIdentifier) {
        if !self.undo.contains_key(id) {
            let prior = self.state.objects.get(id).cloned();
            self.undo.insert(id.clone(), prior);
        }
    }

    fn check_guard(&self, id: &MeshObjectIdentifier) -> MeshResult<()> {
        match &self.guard {
            Some(guard) => guard.check_may_mutate(id, self.origin.as_ref()),
            None => Ok(()),
        }
    }

    fn object(&self, id: &MeshObjectIdentifier) -> MeshResult<&MeshObject> {
        self.state
            .objects
            .get(id)
            .ok_or_else(|| MeshError::NotFound(id.to_string()))
    }

    fn object_mut(&mut self, id: &MeshObjectIdentifier) -> MeshResult<&mut MeshObject> {
        let now = self.now;
        let object = self
            .state
            .objects
            .get_mut(id)
            .ok_or_else(|| MeshError::NotFound(id.to_string()))?;
        object.touch_updated(now);
        Ok(object)
    }

    fn check_blessable(&self, types: &[TypeIdentifier]) -> MeshResult<()> {
        for t in types {
            let et = self.model().entity_type(t)?;
            if et.is_abstract {
                return Err(MeshError::EntityTypeAbstract(t.to_string()));
            }
        }
        Ok(())
    }

    fn apply_defaults(&self, object: &mut MeshObject, types: &[TypeIdentifier]) {
        for t in types {
            for pt in self.model().property_types_of(t) {
                if let Some(default) = &pt.default {
                    object
                        .properties
                        .entry(pt.id.clone())
                        .or_insert_with(|| default.clone());
                }
            }
        }
    }

    /// Validates `roles` for a relationship and returns their inverse roles.
    fn check_roles(
        &self,
        a: &MeshObject,
        b: &MeshObject,
        roles: &[TypeIdentifier],
    ) -> MeshResult<Vec<TypeIdentifier>> {
        let model = self.model();
        let mut inverses = Vec::with_capacity(roles.len());
        for role in roles {
            let rt = model.role_type(role)?;
            let inverse = model.inverse_role(role)?;
            if self.enforce_model_rules() {
                for (object, required, role_id) in [
                    (a, &rt.entity_type, &rt.id),
                    (b, &inverse.entity_type, &inverse.id),
                ] {
                    if let Some(required) = required {
                        if !model.satisfies(&object.types, required) {
                            return Err(MeshError::IncompatibleRole {
                                identifier: object.identifier.to_string(),
                                role: role_id.to_string(),
                                entity_type: required.to_string(),
                            });
                        }
                    }
                }
            }
            if a
                .roles_towards(&b.identifier)
                .is_some_and(|existing| existing.contains(role))
            {
                return Err(MeshError::RoleBlessedAlready {
                    identifier: a.identifier.to_string(),
                    neighbor: b.identifier.to_string(),
                    role: role.to_string(),
                });
            }
            inverses.push(inverse.id.clone());
        }
        Ok(inverses)
    }

    // ------------------------------------------------------------------
    // Reads within the transaction
    // ------------------------------------------------------------------

    pub fn get(&self, id: &MeshObjectIdentifier) -> MeshResult<&MeshObject> {
        self.object(id)
    }

    pub fn contains(&self, id: &MeshObjectIdentifier) -> bool {
        self.state.objects.contains_key(id)
    }

    pub fn identifiers(&self) -> Vec<MeshObjectIdentifier> {
        self.state.objects.keys().cloned().collect()
    }

    // ------------------------------------------------------------------
    // Life cycle
    // ------------------------------------------------------------------

    /// Create an object blessed with `types`. A random identifier is
    /// assigned when none is given.
    pub fn create(
        &mut self,
        identifier: Option<MeshObjectIdentifier>,
        types: &[TypeIdentifier],
    ) -> MeshResult<MeshObject> {
        let id =
            identifier.unwrap_or_else(|| MeshObjectIdentifier::random_in(self.base.identifier()));
        if self.state.objects.contains_key(&id) {
            return Err(MeshError::IdentifierNotUnique(id.to_string()));
        }
        self.check_blessable(types)?;

        let mut object = MeshObject::new(id.clone(), self.now);
        object.owner = self.ctx.caller.clone();
        object.types.extend(types.iter().cloned());
        self.apply_defaults(&mut object, types);

        self.remember(&id);
        self.state.objects.insert(id, object.clone());
        self.record(ChangeEvent::Created {
            object: object.clone(),
        });
        Ok(object)
    }

    /// Instantiate an object from a snapshot taken elsewhere.
    pub fn create_replica(&mut self, snapshot: MeshObject) -> MeshResult<()> {
        let id = snapshot.identifier.clone();
        if self.state.objects.contains_key(&id) {
            return Err(MeshError::IdentifierNotUnique(id.to_string()));
        }
        for t in &snapshot.types {
            self.model().entity_type(t)?;
        }
        self.remember(&id);
        self.state.objects.insert(id, snapshot.clone());
        self.record(ChangeEvent::Created { object: snapshot });
        Ok(())
    }

    pub fn delete(&mut self, id: &MeshObjectIdentifier) -> MeshResult<()> {
        let object = self.object(id)?.clone();
        self.check_guard(id)?;
        if !self.ctx.sudo {
            self.base.access.check_permitted_delete(&self.ctx, &object)?;
        }

        for neighbor in object.neighbors.keys() {
            self.remember(neighbor);
            if let Ok(n) = self.object_mut(neighbor) {
                n.neighbors.remove(id);
            }
        }
        for equivalent in &object.equivalents {
            self.remember(equivalent);
            if let Ok(e) = self.object_mut(equivalent) {
                e.equivalents.remove(id);
            }
        }
        self.remember(id);
        self.state.objects.remove(id);
        self.record(ChangeEvent::Deleted { object });
        Ok(())
    }

    // ------------------------------------------------------------------
    // Types and properties
    // ------------------------------------------------------------------

    pub fn bless(&mut self, id: &MeshObjectIdentifier, types: &[TypeIdentifier]) -> MeshResult<()> {
        self.check_blessable(types)?;
        let object = self.object(id)?;
        for t in types {
            if object.types.contains(t) {
                return Err(MeshError::BlessedAlready {
                    identifier: id.to_string(),
                    entity_type: t.to_string(),
                });
            }
        }
        self.check_guard(id)?;
        if !self.ctx.sudo {
            self.base.access.check_permitted_bless(&self.ctx, object, types)?;
        }

        self.remember(id);
        let mut updated = self.object(id)?.clone();
        updated.types.extend(types.iter().cloned());
        self.apply_defaults(&mut updated, types);
        updated.touch_updated(self.now);
        self.state.objects.insert(id.clone(), updated);
        self.record(ChangeEvent::TypesAdded {
            identifier: id.clone(),
            types: types.to_vec(),
        });
        Ok(())
    }

    pub fn unbless(
        &mut self,
        id: &MeshObjectIdentifier,
        types: &[TypeIdentifier],
    ) -> MeshResult<()> {
        let model = self.model();
        let object = self.object(id)?;
        for t in types {
            if !object.types.contains(t) {
                return Err(MeshError::NotBlessed {
                    identifier: id.to_string(),
                    entity_type: t.to_string(),
                });
            }
        }
        let remaining: BTreeSet<TypeIdentifier> = object
            .types
            .iter()
            .filter(|t| !types.contains(t))
            .cloned()
            .collect();
        if self.enforce_model_rules() {
            for role in object.neighbors.values().flatten() {
                let Ok(rt) = model.role_type(role) else {
                    continue;
                };
                if let Some(required) = &rt.entity_type {
                    if !model.satisfies(&remaining, required) {
                        return Err(MeshError::RoleRequiresEntityType {
                            identifier: id.to_string(),
                            entity_type: required.to_string(),
                            role: role.to_string(),
                        });
                    }
                }
            }
        }
        self.check_guard(id)?;
        if !self.ctx.sudo {
            self.base.access.check_permitted_unbless(&self.ctx, object, types)?;
        }

        self.remember(id);
        let object = self.object_mut(id)?;
        object.types = remaining;
        let carried = object.types.clone();
        object
            .properties
            .retain(|p, _| model.property_type_for(&carried, p).is_some());
        self.record(ChangeEvent::TypesRemoved {
            identifier: id.clone(),
            types: types.to_vec(),
        });
        Ok(())
    }

    pub fn set_property(
        &mut self,
        id: &MeshObjectIdentifier,
        property: &TypeIdentifier,
        value: Option<PropertyValue>,
    ) -> MeshResult<()> {
        let object = self.object(id)?;
        let pt = self
            .model()
            .property_type_for(&object.types, property)
            .ok_or_else(|| MeshError::IllegalProperty {
                identifier: id.to_string(),
                property: property.to_string(),
            })?;
        match &value {
            Some(v) if !v.conforms_to(&pt.data_type) => {
                return Err(MeshError::IllegalPropertyValue {
                    property: property.to_string(),
                    expected: pt.data_type.to_string(),
                });
            }
            None if !pt.optional => {
                return Err(MeshError::MandatoryProperty {
                    identifier: id.to_string(),
                    property: property.to_string(),
                });
            }
            _ => {}
        }
        let old = object.properties.get(property).cloned();
        if old == value {
            return Ok(());
        }
        self.check_guard(id)?;
        if !self.ctx.sudo {
            self.base
                .access
                .check_permitted_set_property(&self.ctx, object, property, value.as_ref())?;
        }

        self.remember(id);
        let object = self.object_mut(id)?;
        match &value {
            Some(v) => {
                object.properties.insert(property.clone(), v.clone());
            }
            None => {
                object.properties.remove(property);
            }
        }
        self.record(ChangeEvent::PropertyChanged {
            identifier: id.clone(),
            property: property.clone(),
            old,
            new: value,
        });
        Ok(())
    }

    /// Set or clear the expiry time. Expiry is bookkeeping and emits no event.
    pub fn set_expires(&mut self, id: &MeshObjectIdentifier, expires: Option<i64>) -> MeshResult<()> {
        self.object(id)?;
        self.check_guard(id)?;
        self.remember(id);
        self.object_mut(id)?.time_expires = expires;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Relationships
    // ------------------------------------------------------------------

    fn check_relatable(
        &self,
        a: &MeshObjectIdentifier,
        b: &MeshObjectIdentifier,
    ) -> MeshResult<(&MeshObject, &MeshObject)> {
        if a == b {
            return Err(MeshError::CannotRelateToItself(a.to_string()));
        }
        Ok((self.object(a)?, self.object(b)?))
    }

    fn link(&mut self, a: &MeshObjectIdentifier, b: &MeshObjectIdentifier) -> MeshResult<()> {
        self.remember(a);
        self.remember(b);
        self.object_mut(a)?.neighbors.entry(b.clone()).or_default();
        self.object_mut(b)?.neighbors.entry(a.clone()).or_default();
        Ok(())
    }

    pub fn relate(&mut self, a: &MeshObjectIdentifier, b: &MeshObjectIdentifier) -> MeshResult<()> {
        let (oa, _) = self.check_relatable(a, b)?;
        if oa.is_related_to(b) {
            return Err(MeshError::RelatedAlready {
                identifier: a.to_string(),
                neighbor: b.to_string(),
            });
        }
        self.check_guard(a)?;
        self.check_guard(b)?;
        if !self.ctx.sudo {
            self.base
                .access
                .check_permitted_bless_roles(&self.ctx, oa, b, &[])?;
        }
        self.link(a, b)?;
        self.record(ChangeEvent::NeighborAdded {
            identifier: a.clone(),
            neighbor: b.clone(),
        });
        Ok(())
    }

    pub fn unrelate(&mut self, a: &MeshObjectIdentifier, b: &MeshObjectIdentifier) -> MeshResult<()> {
        let (oa, _) = self.check_relatable(a, b)?;
        if !oa.is_related_to(b) {
            return Err(MeshError::NotRelated {
                identifier: a.to_string(),
                neighbor: b.to_string(),
            });
        }
        self.check_guard(a)?;
        self.check_guard(b)?;
        if !self.ctx.sudo {
            self.base
                .access
                .check_permitted_bless_roles(&self.ctx, oa, b, &[])?;
        }
        self.remember(a);
        self.remember(b);
        self.object_mut(a)?.neighbors.remove(b);
        self.object_mut(b)?.neighbors.remove(a);
        self.record(ChangeEvent::NeighborRemoved {
            identifier: a.clone(),
            neighbor: b.clone(),
        });
        Ok(())
    }

    /// Bless the existing relationship between `a` and `b`; `a` plays `roles`.
    pub fn bless_relationship(
        &mut self,
        a: &MeshObjectIdentifier,
        b: &MeshObjectIdentifier,
        roles: &[TypeIdentifier],
    ) -> MeshResult<()> {
        let (oa, _) = self.check_relatable(a, b)?;
        if !oa.is_related_to(b) {
            return Err(MeshError::NotRelated {
                identifier: a.to_string(),
                neighbor: b.to_string(),
            });
        }
        self.add_roles(a, b, roles)
    }

    /// Relate `a` and `b` if needed and bless the relationship, emitting a
    /// single roles-added event.
    pub fn relate_and_bless(
        &mut self,
        a: &MeshObjectIdentifier,
        b: &MeshObjectIdentifier,
        roles: &[TypeIdentifier],
    ) -> MeshResult<()> {
        self.check_relatable(a, b)?;
        self.add_roles(a, b, roles)
    }

    fn add_roles(
        &mut self,
        a: &MeshObjectIdentifier,
        b: &MeshObjectIdentifier,
        roles: &[TypeIdentifier],
    ) -> MeshResult<()> {
        let (oa, ob) = self.check_relatable(a, b)?;
        let inverses = self.check_roles(oa, ob, roles)?;
        self.check_guard(a)?;
        self.check_guard(b)?;
        if !self.ctx.sudo {
            self.base
                .access
                .check_permitted_bless_roles(&self.ctx, oa, b, roles)?;
        }

        self.link(a, b)?;
        if let Some(set) = self.object_mut(a)?.neighbors.get_mut(b) {
            set.extend(roles.iter().cloned());
        }
        if let Some(set) = self.object_mut(b)?.neighbors.get_mut(a) {
            set.extend(inverses);
        }
        self.record(ChangeEvent::RolesAdded {
            identifier: a.clone(),
            neighbor: b.clone(),
            roles: roles.to_vec(),
        });
        Ok(())
    }

    pub fn unbless_relationship(
        &mut self,
        a: &MeshObjectIdentifier,
        b: &MeshObjectIdentifier,
        roles: &[TypeIdentifier],
    ) -> MeshResult<()> {
        let model = self.model();
        let (oa, _) = self.check_relatable(a, b)?;
        let current = oa.roles_towards(b).ok_or_else(|| MeshError::NotRelated {
            identifier: a.to_string(),
            neighbor: b.to_string(),
        })?;
        let mut inverses = Vec::with_capacity(roles.len());
        for role in roles {
            if !current.contains(role) {
                return Err(MeshError::RoleNotBlessed {
                    identifier: a.to_string(),
                    neighbor: b.to_string(),
                    role: role.to_string(),
                });
            }
            inverses.push(model.inverse_role(role)?.id.clone());
        }
        self.check_guard(a)?;
        self.check_guard(b)?;
        if !self.ctx.sudo {
            self.base
                .access
                .check_permitted_bless_roles(&self.ctx, oa, b, roles)?;
        }

        self.remember(a);
        self.remember(b);
        if let Some(set) = self.object_mut(a)?.neighbors.get_mut(b) {
            set.retain(|r| !roles.contains(r));
        }
        if let Some(set) = self.object_mut(b)?.neighbors.get_mut(a) {
            set.retain(|r| !inverses.contains(r));
        }
        self.record(ChangeEvent::RolesRemoved {
            identifier: a.clone(),
            neighbor: b.clone(),
            roles: roles.to_vec(),
        });
        Ok(())
    }

    // ------------------------------------------------------------------
    // Equivalents
    // ------------------------------------------------------------------

    pub fn add_equivalent(
        &mut self,
        a: &MeshObjectIdentifier,
        b: &MeshObjectIdentifier,
    ) -> MeshResult<()> {
        let (oa, _) = self.check_relatable(a, b)?;
        if oa.equivalents.contains(b) {
            return Ok(());
        }
        self.check_guard(a)?;
        self.check_guard(b)?;
        self.remember(a);
        self.remember(b);
        self.object_mut(a)?.equivalents.insert(b.clone());
        self.object_mut(b)?.equivalents.insert(a.clone());
        self.record(ChangeEvent::EquivalentAdded {
            identifier: a.clone(),
            equivalent: b.clone(),
        });
        Ok(())
    }

    pub fn remove_equivalent(
        &mut self,
        a: &MeshObjectIdentifier,
        b: &MeshObjectIdentifier,
    ) -> MeshResult<()> {
        let (oa, _) = self.check_relatable(a, b)?;
        if !oa.equivalents.contains(b) {
            return Ok(());
        }
        self.check_guard(a)?;
        self.check_guard(b)?;
        self.remember(a);
        self.remember(b);
        self.object_mut(a)?.equivalents.remove(b);
        self.object_mut(b)?.equivalents.remove(a);
        self.record(ChangeEvent::EquivalentRemoved {
            identifier: a.clone(),
            equivalent: b.clone(),
        });
        Ok(())
    }

    // ------------------------------------------------------------------
    // Replay
    // ------------------------------------------------------------------

    /// Forget an object deleted elsewhere that was never replicated here:
    /// local objects still pointing at it lose the relationship or
    /// equivalence.
    fn detach_deleted(&mut self, object: &MeshObject) -> MeshResult<()> {
        let id = object.identifier();
        let neighbors: Vec<_> = object
            .neighbors()
            .filter(|n| self.get(n).is_ok_and(|o| o.is_related_to(id)))
            .cloned()
            .collect();
        let equivalents: Vec<_> = object
            .equivalents()
            .iter()
            .filter(|e| self.get(e).is_ok_and(|o| o.equivalents().contains(id)))
            .cloned()
            .collect();
        if neighbors.is_empty() && equivalents.is_empty() {
            return Err(MeshError::NotFound(id.to_string()));
        }
        for neighbor in &neighbors {
            self.drop_neighbor(neighbor, id)?;
        }
        for equivalent in &equivalents {
            self.check_guard(equivalent)?;
            self.remember(equivalent);
            self.object_mut(equivalent)?.equivalents.remove(id);
            self.record(ChangeEvent::EquivalentRemoved {
                identifier: equivalent.clone(),
                equivalent: id.clone(),
            });
        }
        Ok(())
    }

    /// One-sided unrelate for a neighbor that is not held locally.
    fn drop_neighbor(&mut self, a: &MeshObjectIdentifier, b: &MeshObjectIdentifier) -> MeshResult<()> {
        if !self.object(a)?.is_related_to(b) {
            return Err(MeshError::NotRelated {
                identifier: a.to_string(),
                neighbor: b.to_string(),
            });
        }
        self.check_guard(a)?;
        self.remember(a);
        self.object_mut(a)?.neighbors.remove(b);
        self.record(ChangeEvent::NeighborRemoved {
            identifier: a.clone(),
            neighbor: b.clone(),
        });
        Ok(())
    }

    /// Re-apply an event recorded elsewhere.
    pub fn apply_change(&mut self, event: &ChangeEvent) -> MeshResult<()> {
        match event {
            ChangeEvent::Created { object } => self.create_replica(object.clone()),
            ChangeEvent::Deleted { object } if !self.contains(object.identifier()) => {
                self.detach_deleted(object)
            }
            ChangeEvent::Deleted { object } => self.delete(object.identifier()),
            ChangeEvent::TypesAdded { identifier, types } => self.bless(identifier, types),
            ChangeEvent::TypesRemoved { identifier, types } => self.unbless(identifier, types),
            ChangeEvent::PropertyChanged {
                identifier,
                property,
                new,
                ..
            } => self.set_property(identifier, property, new.clone()),
            ChangeEvent::NeighborAdded {
                identifier,
                neighbor,
            } => self.relate(identifier, neighbor),
            ChangeEvent::NeighborRemoved {
                identifier,
                neighbor,
            } if !self.contains(neighbor) => self.drop_neighbor(identifier, neighbor),
            ChangeEvent::NeighborRemoved {
                identifier,
                neighbor,
            } => self.unrelate(identifier, neighbor),
            ChangeEvent::RolesAdded {
                identifier,
                neighbor,
                roles,
            } => self.relate_and_bless(identifier, neighbor, roles),
            ChangeEvent::RolesRemoved {
                identifier,
                neighbor,
                roles,
            } => self.unbless_relationship(identifier, neighbor, roles),
            ChangeEvent::EquivalentAdded {
                identifier,
                equivalent,
            } => self.add_equivalent(identifier, equivalent),
            ChangeEvent::EquivalentRemoved {
                identifier,
                equivalent,
            } => self.remove_equivalent(identifier, equivalent),
        }
    }

    /// Bring an existing object in line with `snapshot` by emitting the
    /// events that separate the two. Neighbors named by the snapshot must
    /// already exist locally.
    pub fn resynchronize(&mut self, snapshot: &MeshObject) -> MeshResult<usize> {
        let id = snapshot.identifier().clone();
        let before = self.changes.len();
        let current = self.object(&id)?.clone();

        let removed: Vec<_> = current
            .types
            .difference(&snapshot.types)
            .cloned()
            .collect();
        let added: Vec<_> = snapshot
            .types
            .difference(&current.types)
            .cloned()
            .collect();
        if !added.is_empty() {
            self.bless(&id, &added)?;
        }

        for (property, value) in &snapshot.properties {
            if current.properties.get(property) != Some(value) {
                self.set_property(&id, property, Some(value.clone()))?;
            }
        }

        for (neighbor, roles) in &snapshot.neighbors {
            let existing = self
                .object(&id)?
                .roles_towards(neighbor)
                .cloned()
                .unwrap_or_default();
            let missing: Vec<_> = roles.difference(&existing).cloned().collect();
            let extra: Vec<_> = existing.difference(roles).cloned().collect();
            if !self.object(&id)?.is_related_to(neighbor) && missing.is_empty() {
                self.relate(&id, neighbor)?;
            }
            if !missing.is_empty() {
                self.relate_and_bless(&id, neighbor, &missing)?;
            }
            if !extra.is_empty() {
                self.unbless_relationship(&id, neighbor, &extra)?;
            }
        }
        for neighbor in current.neighbors.keys() {
            if !snapshot.neighbors.contains_key(neighbor) && self.contains(neighbor) {
                self.unrelate(&id, neighbor)?;
            }
        }

        if !removed.is_empty() {
            self.unbless(&id, &removed)?;
        }
        for property in current.properties.keys() {
            let still_carried = self
                .object(&id)?
                .properties
                .contains_key(property);
            if still_carried && !snapshot.properties.contains_key(property) {
                self.set_property(&id, property, None)?;
            }
        }
        Ok(self.changes.len() - before)
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        if !self.undo.is_empty() {
            warn!(
                base = %self.base.identifier(),
                objects = self.undo.len(),
                "Transaction abandoned, rolling back"
            );
        }
        self.restore_undo();
    }
}
