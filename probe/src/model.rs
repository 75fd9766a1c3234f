//! Types the built-in probes bless objects with.

use mesh_kernel::{DataType, EntityType, ModelBase, PropertyType, RelationshipType, TypeIdentifier};

pub const SITE: &str = "probe.Site";
pub const SERVICE: &str = "probe.Service";
pub const AUTHENTICATION_SERVICE: &str = "probe.AuthenticationService";
pub const ENDPOINT: &str = "probe.Endpoint";

pub const TITLE: &str = "probe.Site.Title";
pub const SERVICE_TYPES: &str = "probe.Service.Types";
pub const PRIORITY: &str = "probe.Service.Priority";
pub const DELEGATE: &str = "probe.AuthenticationService.Delegate";
pub const URI: &str = "probe.Endpoint.Uri";

/// Site offers a service.
pub const OFFERS: &str = "probe.Offers";
/// Service is reachable at an endpoint.
pub const PROVIDED_AT: &str = "probe.ProvidedAt";
/// Site links to another site.
pub const LINKS_TO: &str = "probe.LinksTo";
/// Site is described by a service descriptor document.
pub const DESCRIBED_BY: &str = "probe.DescribedBy";

pub fn source_role(relationship: &str) -> TypeIdentifier {
    TypeIdentifier::new(format!("{relationship}-S"))
}

pub fn ty(id: &str) -> TypeIdentifier {
    TypeIdentifier::new(id)
}

/// The model every shadow mesh base is built with.
pub fn probe_model() -> ModelBase {
    ModelBase::new()
        .with_entity_type(
            EntityType::new(SITE).with_property(PropertyType::new(TITLE, DataType::String)),
        )
        .with_entity_type(
            EntityType::new(SERVICE)
                .with_property(PropertyType::new(SERVICE_TYPES, DataType::String))
                .with_property(PropertyType::new(PRIORITY, DataType::Integer)),
        )
        .with_entity_type(
            EntityType::new(AUTHENTICATION_SERVICE)
                .with_supertype(SERVICE)
                .with_property(PropertyType::new(DELEGATE, DataType::String)),
        )
        .with_entity_type(
            EntityType::new(ENDPOINT).with_property(PropertyType::new(URI, DataType::String)),
        )
        .with_relationship_type(RelationshipType::new(OFFERS, Some(SITE), Some(SERVICE)))
        .with_relationship_type(RelationshipType::new(PROVIDED_AT, Some(SERVICE), Some(ENDPOINT)))
        .with_relationship_type(RelationshipType::new(LINKS_TO, Some(SITE), None))
        .with_relationship_type(RelationshipType::new(DESCRIBED_BY, Some(SITE), None))
}
