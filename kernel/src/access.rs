//! Access-manager checkpoints.
//!
//! The kernel calls these before mutations and traversals. Rule evaluation is
//! up to the implementation; two simple managers are provided.

use crate::{
    error::{MeshError, MeshResult},
    identifier::{MeshObjectIdentifier, NetMeshBaseIdentifier},
    model::TypeIdentifier,
    object::MeshObject,
    value::PropertyValue,
};

/// Who is performing an operation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallerContext {
    pub caller: Option<MeshObjectIdentifier>,
    /// Set when the operation replays a change received from a partner.
    pub origin: Option<NetMeshBaseIdentifier>,
    pub sudo: bool,
}

impl CallerContext {
    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn as_caller(caller: MeshObjectIdentifier) -> Self {
        Self {
            caller: Some(caller),
            ..Self::default()
        }
    }
}

pub trait AccessManager: Send + Sync {
    fn check_permitted_bless(
        &self,
        _ctx: &CallerContext,
        _object: &MeshObject,
        _types: &[TypeIdentifier],
    ) -> MeshResult<()> {
        Ok(())
    }

    fn check_permitted_unbless(
        &self,
        _ctx: &CallerContext,
        _object: &MeshObject,
        _types: &[TypeIdentifier],
    ) -> MeshResult<()> {
        Ok(())
    }

    fn check_permitted_set_property(
        &self,
        _ctx: &CallerContext,
        _object: &MeshObject,
        _property: &TypeIdentifier,
        _value: Option<&PropertyValue>,
    ) -> MeshResult<()> {
        Ok(())
    }

    fn check_permitted_traversal(
        &self,
        _ctx: &CallerContext,
        _object: &MeshObject,
        _role: &TypeIdentifier,
    ) -> MeshResult<()> {
        Ok(())
    }

    fn check_permitted_delete(&self, _ctx: &CallerContext, _object: &MeshObject) -> MeshResult<()> {
        Ok(())
    }

    /// Relating and blessing relationships.
    fn check_permitted_bless_roles(
        &self,
        _ctx: &CallerContext,
        _object: &MeshObject,
        _neighbor: &MeshObjectIdentifier,
        _roles: &[TypeIdentifier],
    ) -> MeshResult<()> {
        Ok(())
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct PermitAllAccessManager;

impl AccessManager for PermitAllAccessManager {}

/// Objects with an owner may only be changed by that owner.
#[derive(Debug, Default, Clone, Copy)]
pub struct OwnerAccessManager;

impl OwnerAccessManager {
    fn check_owner(
        &self,
        operation: &'static str,
        ctx: &CallerContext,
        object: &MeshObject,
    ) -> MeshResult<()> {
        match object.owner() {
            Some(owner) if ctx.caller.as_ref() != Some(owner) => Err(MeshError::not_permitted(
                operation,
                object.identifier(),
                format!("owned by {owner}"),
            )),
            _ => Ok(()),
        }
    }
}

impl AccessManager for OwnerAccessManager {
    fn check_permitted_bless(
        &self,
        ctx: &CallerContext,
        object: &MeshObject,
        _types: &[TypeIdentifier],
    ) -> MeshResult<()> {
        self.check_owner("bless", ctx, object)
    }

    fn check_permitted_unbless(
        &self,
        ctx: &CallerContext,
        object: &MeshObject,
        _types: &[TypeIdentifier],
    ) -> MeshResult<()> {
        self.check_owner("unbless", ctx, object)
    }

    fn check_permitted_set_property(
        &self,
        ctx: &CallerContext,
        object: &MeshObject,
        _property: &TypeIdentifier,
        _value: Option<&PropertyValue>,
    ) -> MeshResult<()> {
        self.check_owner("set property", ctx, object)
    }

    fn check_permitted_delete(&self, ctx: &CallerContext, object: &MeshObject) -> MeshResult<()> {
        self.check_owner("delete", ctx, object)
    }

    fn check_permitted_bless_roles(
        &self,
        ctx: &CallerContext,
        object: &MeshObject,
        _neighbor: &MeshObjectIdentifier,
        _roles: &[TypeIdentifier],
    ) -> MeshResult<()> {
        self.check_owner("relate", ctx, object)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_owner_manager() {
        let owner = MeshObjectIdentifier::new("alice");
        let mut object = MeshObject::new(MeshObjectIdentifier::new("doc"), 0);
        object.owner = Some(owner.clone());

        let am = OwnerAccessManager;
        assert!(am
            .check_permitted_delete(&CallerContext::as_caller(owner), &object)
            .is_ok());
        let err = am
            .check_permitted_delete(&CallerContext::anonymous(), &object)
            .unwrap_err();
        assert!(err.is_permission_error());
    }
}
