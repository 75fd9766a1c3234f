use mesh_kernel::PropertyValue;
use once_cell::sync::Lazy;
use regex::Regex;

use super::{collapse_whitespace, decode_entities};
use crate::{
    directory::Probe,
    error::{ProbeError, ProbeResult},
    fetcher::FetchedContent,
    model::{
        source_role, ty, AUTHENTICATION_SERVICE, DELEGATE, ENDPOINT, OFFERS, PRIORITY,
        PROVIDED_AT, SERVICE, SERVICE_TYPES, SITE, URI,
    },
    staging::StagingGraph,
};

static XRDS_ROOT: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?is)<(?:\w+:)?XRDS[\s>]").unwrap());
static SERVICE_ELEMENT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?is)<(?:\w+:)?Service\b([^>]*)>(.*?)</(?:\w+:)?Service\s*>").unwrap()
});
static TYPE_ELEMENT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)<(?:\w+:)?Type\b[^>]*>(.*?)</(?:\w+:)?Type\s*>").unwrap());
static URI_ELEMENT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)<(?:\w+:)?URI\b([^>]*)>(.*?)</(?:\w+:)?URI\s*>").unwrap());
static DELEGATE_ELEMENT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?is)<(?:\w+:)?(?:Delegate|LocalID)\b[^>]*>(.*?)</(?:\w+:)?(?:Delegate|LocalID)\s*>")
        .unwrap()
});
static PRIORITY_ATTRIBUTE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?i)\bpriority\s*=\s*["']?(\d+)"#).unwrap());

fn priority_of(attributes: &str) -> Option<i64> {
    PRIORITY_ATTRIBUTE
        .captures(attributes)
        .and_then(|c| c[1].parse().ok())
}

fn text(raw: &str) -> String {
    collapse_whitespace(&decode_entities(raw))
}

struct ServiceDescriptor {
    priority: Option<i64>,
    types: Vec<String>,
    delegate: Option<String>,
    /// `(priority, uri)` in document order.
    uris: Vec<(Option<i64>, String)>,
}

impl ServiceDescriptor {
    fn is_authentication(&self) -> bool {
        self.types.iter().any(|t| t.contains("openid.net"))
    }
}

/// Yadis XRDS documents: one service object per `Service` element, ordered
/// by priority, each with its endpoints.
#[derive(Debug, Clone, Copy, Default)]
pub struct YadisProbe;

impl YadisProbe {
    fn descriptors(body: &str) -> Vec<ServiceDescriptor> {
        let mut services: Vec<ServiceDescriptor> = SERVICE_ELEMENT
            .captures_iter(body)
            .map(|caps| {
                let inner = &caps[2];
                let mut uris: Vec<(Option<i64>, String)> = URI_ELEMENT
                    .captures_iter(inner)
                    .map(|u| (priority_of(&u[1]), text(&u[2])))
                    .filter(|(_, uri)| !uri.is_empty())
                    .collect();
                // entries without priority sort last, stable otherwise
                uris.sort_by_key(|(p, _)| p.unwrap_or(i64::MAX));
                ServiceDescriptor {
                    priority: priority_of(&caps[1]),
                    types: TYPE_ELEMENT
                        .captures_iter(inner)
                        .map(|t| text(&t[1]))
                        .filter(|t| !t.is_empty())
                        .collect(),
                    delegate: DELEGATE_ELEMENT
                        .captures(inner)
                        .map(|d| text(&d[1]))
                        .filter(|d| !d.is_empty()),
                    uris,
                }
            })
            .collect();
        services.sort_by_key(|s| s.priority.unwrap_or(i64::MAX));
        services
    }
}

impl Probe for YadisProbe {
    fn name(&self) -> &'static str {
        "yadis"
    }

    fn parse(&self, content: &FetchedContent, graph: &mut StagingGraph) -> ProbeResult<()> {
        if !XRDS_ROOT.is_match(&content.body) {
            return Err(ProbeError::malformed(graph.source(), "not an XRDS document"));
        }
        let home = graph.home();
        graph.bless(&home, &[ty(SITE)]);

        for (index, descriptor) in Self::descriptors(&content.body).into_iter().enumerate() {
            let kind = if descriptor.is_authentication() {
                AUTHENTICATION_SERVICE
            } else {
                SERVICE
            };
            let service = graph.object(&format!("yadis-service-{index}"), &[ty(kind)]);
            if !descriptor.types.is_empty() {
                graph.set_property(
                    &service,
                    ty(SERVICE_TYPES),
                    PropertyValue::String(descriptor.types.join(" ")),
                );
            }
            if let Some(priority) = descriptor.priority {
                graph.set_property(&service, ty(PRIORITY), PropertyValue::Integer(priority));
            }
            if let (Some(delegate), true) = (&descriptor.delegate, descriptor.is_authentication()) {
                graph.set_property(&service, ty(DELEGATE), PropertyValue::String(delegate.clone()));
            }
            graph.relate(&home, &service, source_role(OFFERS));

            for (position, (_, uri)) in descriptor.uris.into_iter().enumerate() {
                let endpoint = graph.object(
                    &format!("yadis-service-{index}-endpoint-{position}"),
                    &[ty(ENDPOINT)],
                );
                graph.set_property(&endpoint, ty(URI), PropertyValue::String(uri));
                graph.relate(&service, &endpoint, source_role(PROVIDED_AT));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use mesh_kernel::{MeshObjectIdentifier, NetMeshBaseIdentifier};

    use super::*;

    const XRDS: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<xrds:XRDS xmlns:xrds="xri://$xrds" xmlns="xri://$xrd*($v*2.0)">
  <XRD>
    <Service priority="20">
      <Type>http://lid.netmesh.org/sso/2.0</Type>
      <URI>http://example.com/lid</URI>
    </Service>
    <Service priority="10">
      <Type>http://openid.net/signon/1.0</Type>
      <URI priority="2">https://backup.example.com/openid</URI>
      <URI priority="1">https://login.example.com/openid</URI>
      <openid:Delegate xmlns:openid="http://openid.net/xmlns/1.0">http://joe.example.com/</openid:Delegate>
    </Service>
  </XRD>
</xrds:XRDS>"#;

    fn id(fragment: &str) -> MeshObjectIdentifier {
        MeshObjectIdentifier::new(format!("http://example.com/xrds#{fragment}"))
    }

    fn parse(body: &str) -> ProbeResult<StagingGraph> {
        let source = NetMeshBaseIdentifier::from_external_form("http://example.com/xrds").unwrap();
        let mut graph = StagingGraph::new(source);
        YadisProbe.parse(
            &FetchedContent::new(Some("application/xrds+xml"), body),
            &mut graph,
        )?;
        Ok(graph)
    }

    fn string(graph: &StagingGraph, id: &MeshObjectIdentifier, property: &str) -> Option<String> {
        graph
            .get(id)?
            .properties
            .get(&ty(property))?
            .as_str()
            .map(str::to_string)
    }

    #[test]
    fn test_services_ordered_by_priority() {
        let graph = parse(XRDS).unwrap();

        let first = graph.get(&id("yadis-service-0")).unwrap();
        assert!(first.types.contains(&ty(AUTHENTICATION_SERVICE)));
        assert_eq!(
            first.properties.get(&ty(PRIORITY)),
            Some(&PropertyValue::Integer(10))
        );
        assert_eq!(
            string(&graph, &id("yadis-service-0"), DELEGATE).as_deref(),
            Some("http://joe.example.com/")
        );
        assert_eq!(
            string(&graph, &id("yadis-service-0-endpoint-0"), URI).as_deref(),
            Some("https://login.example.com/openid")
        );
        assert_eq!(
            string(&graph, &id("yadis-service-0-endpoint-1"), URI).as_deref(),
            Some("https://backup.example.com/openid")
        );

        let second = graph.get(&id("yadis-service-1")).unwrap();
        assert!(second.types.contains(&ty(SERVICE)));
        assert_eq!(
            string(&graph, &id("yadis-service-1"), SERVICE_TYPES).as_deref(),
            Some("http://lid.netmesh.org/sso/2.0")
        );
        // home + 2 services + 3 endpoints
        assert_eq!(graph.objects().len(), 6);
        assert_eq!(graph.relationships().len(), 5);
    }

    #[test]
    fn test_non_xrds_is_malformed() {
        let err = parse("<html><body>hello</body></html>").err().unwrap();
        assert!(matches!(err, ProbeError::Malformed { .. }));
    }

    #[test]
    fn test_empty_xrds_yields_only_the_site() {
        let graph = parse(r#"<XRDS xmlns="xri://$xrds"><XRD></XRD></XRDS>"#).unwrap();
        assert_eq!(graph.objects().len(), 1);
    }
}
