//! Identifiers for mesh objects and mesh bases.
//!
//! `NetMeshBaseIdentifier` values are always canonical: two spellings of the
//! same resource compare equal once parsed.

use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{MeshError, MeshResult};

/// Schemes a mesh base identifier may carry. `mesh` names in-process nodes.
const SUPPORTED_SCHEMES: &[&str] = &["http", "https", "file", "mesh"];

/// XRI global context symbols.
const XRI_GCS: &[char] = &['=', '@', '+', '$', '!'];

const XRI_RESOLVER_PREFIX: &str = "http://xri.net/";

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MeshObjectIdentifier(String);

impl MeshObjectIdentifier {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Fresh random identifier scoped to a mesh base.
    pub fn random_in(base: &NetMeshBaseIdentifier) -> Self {
        Self(format!("{}#{}", base.as_str(), uuid::Uuid::new_v4().simple()))
    }

    /// The identifier of the home object of a mesh base.
    pub fn home_object_of(base: &NetMeshBaseIdentifier) -> Self {
        Self(base.as_str().to_string())
    }

    /// An identifier local to `base`, e.g. `http://example.com/#service-1`.
    pub fn local_to(base: &NetMeshBaseIdentifier, fragment: &str) -> Self {
        Self(format!("{}#{}", base.as_str(), fragment))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for MeshObjectIdentifier {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for MeshObjectIdentifier {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl Display for MeshObjectIdentifier {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Canonical network identifier of a mesh base.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct NetMeshBaseIdentifier(String);

impl NetMeshBaseIdentifier {
    /// Parse a fully-qualified external form.
    pub fn from_external_form(raw: &str) -> MeshResult<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(invalid(raw, "empty identifier"));
        }
        if trimmed.starts_with(XRI_GCS) {
            return Ok(Self(trimmed.to_string()));
        }
        let url = Url::parse(trimmed).map_err(|e| invalid(raw, e.to_string()))?;
        Self::from_url(raw, url)
    }

    /// Parse a possibly incomplete form, such as a bare host name or a path
    /// relative to `context`.
    pub fn guess_from_external_form(
        context: Option<&NetMeshBaseIdentifier>,
        raw: &str,
    ) -> MeshResult<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(invalid(raw, "empty identifier"));
        }
        if trimmed.starts_with(XRI_GCS) || has_scheme(trimmed) {
            return Self::from_external_form(trimmed);
        }
        match context.and_then(|c| Url::parse(&c.0).ok()) {
            Some(base) => {
                let joined = base.join(trimmed).map_err(|e| invalid(raw, e.to_string()))?;
                Self::from_url(raw, joined)
            }
            None => Self::from_external_form(&format!("http://{trimmed}")),
        }
    }

    fn from_url(raw: &str, url: Url) -> MeshResult<Self> {
        if !SUPPORTED_SCHEMES.contains(&url.scheme()) {
            return Err(invalid(
                raw,
                format!("unsupported protocol '{}'", url.scheme()),
            ));
        }
        // Parsing already lower-cases the host, drops default ports and removes
        // dot segments from the path.
        Ok(Self(url.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_xri(&self) -> bool {
        self.0.starts_with(XRI_GCS)
    }

    pub fn scheme(&self) -> &str {
        if self.is_xri() {
            return "xri";
        }
        self.0.split(':').next().unwrap_or_default()
    }

    /// Whether the identifier can be dereferenced with a plain GET.
    pub fn is_restfully_resolvable(&self) -> bool {
        self.is_xri() || matches!(self.scheme(), "http" | "https" | "file")
    }

    /// The URL to fetch when mirroring this identifier.
    pub fn resolution_url(&self) -> String {
        if self.is_xri() {
            format!("{XRI_RESOLVER_PREFIX}{}", self.0)
        } else {
            self.0.clone()
        }
    }
}

fn has_scheme(s: &str) -> bool {
    s.contains("://") || s.starts_with("file:") || s.starts_with("mesh:")
}

fn invalid(raw: &str, reason: impl Into<String>) -> MeshError {
    MeshError::InvalidIdentifier {
        raw: raw.to_string(),
        reason: reason.into(),
    }
}

impl TryFrom<String> for NetMeshBaseIdentifier {
    type Error = MeshError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::from_external_form(&value)
    }
}

impl From<NetMeshBaseIdentifier> for String {
    fn from(value: NetMeshBaseIdentifier) -> Self {
        value.0
    }
}

impl Display for NetMeshBaseIdentifier {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}
