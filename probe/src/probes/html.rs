use std::collections::BTreeSet;

use mesh_kernel::{NetMeshBaseIdentifier, PropertyValue};
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::debug;

use super::{collapse_whitespace, decode_entities};
use crate::{
    directory::Probe,
    error::{ProbeError, ProbeResult},
    fetcher::{FetchedContent, XRDS_LOCATION_HEADER},
    model::{
        source_role, ty, AUTHENTICATION_SERVICE, DELEGATE, DESCRIBED_BY, ENDPOINT, LINKS_TO,
        OFFERS, PROVIDED_AT, SERVICE_TYPES, SITE, TITLE, URI,
    },
    staging::StagingGraph,
};

const OPENID_SIGNON: &str = "http://openid.net/signon/1.0";
const MAX_LINKS: usize = 256;

static HEAD: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?is)<head[\s>].*?</head\s*>").unwrap());
static TITLE_TAG: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)<title[^>]*>(.*?)</title\s*>").unwrap());

static OPENID_SERVER: Lazy<[Regex; 2]> = Lazy::new(|| {
    [
        Regex::new(r#"(?is)<link[^>]+rel=["']?openid2?\.(?:server|provider)["'\s][^>]*href=["']?([^\s"']*)["'\s>]"#).unwrap(),
        Regex::new(r#"(?is)<link[^>]+href=["']?([^\s"']*)["'\s][^>]*rel=["']?openid2?\.(?:server|provider)["'\s>]"#).unwrap(),
    ]
});
static OPENID_DELEGATE: Lazy<[Regex; 2]> = Lazy::new(|| {
    [
        Regex::new(r#"(?is)<link[^>]+rel=["']?openid2?\.(?:delegate|local_id)["'\s][^>]*href=["']?([^\s"']*)["'\s>]"#).unwrap(),
        Regex::new(r#"(?is)<link[^>]+href=["']?([^\s"']*)["'\s][^>]*rel=["']?openid2?\.(?:delegate|local_id)["'\s>]"#).unwrap(),
    ]
});
static XRDS_META: Lazy<[Regex; 2]> = Lazy::new(|| {
    [
        Regex::new(r#"(?is)<meta[^>]+http-equiv=["']?X-(?:XRDS|YADIS)-Location["'\s][^>]*content=["']?([^\s"']*)["'\s>]"#).unwrap(),
        Regex::new(r#"(?is)<meta[^>]+content=["']?([^\s"']*)["'\s][^>]*http-equiv=["']?X-(?:XRDS|YADIS)-Location["'\s>]"#).unwrap(),
    ]
});
static ANCHOR: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?is)<a\s[^>]*?href\s*=\s*["']?([^\s"'>]+)"#).unwrap());

fn first_capture<'a>(patterns: &[Regex], text: &'a str) -> Option<&'a str> {
    patterns
        .iter()
        .find_map(|re| re.captures(text).and_then(|c| c.get(1)))
        .map(|m| m.as_str())
        .filter(|s| !s.is_empty())
}

/// HTML pages: title, OpenID authentication services, the Yadis descriptor
/// location, and links to other resources.
#[derive(Debug, Clone, Copy, Default)]
pub struct HtmlProbe;

impl HtmlProbe {
    fn resolve(graph: &StagingGraph, href: &str) -> Option<NetMeshBaseIdentifier> {
        let href = decode_entities(href);
        let without_fragment = href.split('#').next().unwrap_or_default();
        if without_fragment.is_empty() {
            return None;
        }
        NetMeshBaseIdentifier::guess_from_external_form(Some(graph.source()), without_fragment).ok()
    }

    fn add_openid(graph: &mut StagingGraph, head: &str) {
        let Some(server) = first_capture(&OPENID_SERVER[..], head) else {
            return;
        };
        let Some(server) = Self::resolve(graph, server) else {
            debug!(source = %graph.source(), "Ignoring unparseable OpenID server");
            return;
        };
        let home = graph.home();
        let service = graph.object("openid-0", &[ty(AUTHENTICATION_SERVICE)]);
        graph.set_property(
            &service,
            ty(SERVICE_TYPES),
            PropertyValue::String(OPENID_SIGNON.to_string()),
        );
        if let Some(delegate) = first_capture(&OPENID_DELEGATE[..], head) {
            graph.set_property(&service, ty(DELEGATE), PropertyValue::String(decode_entities(delegate)));
        }
        let endpoint = graph.object("openid-0-endpoint-0", &[ty(ENDPOINT)]);
        graph.set_property(&endpoint, ty(URI), PropertyValue::String(server.as_str().to_string()));
        graph.relate(&home, &service, source_role(OFFERS));
        graph.relate(&service, &endpoint, source_role(PROVIDED_AT));
    }
}

impl Probe for HtmlProbe {
    fn name(&self) -> &'static str {
        "html"
    }

    fn parse(&self, content: &FetchedContent, graph: &mut StagingGraph) -> ProbeResult<()> {
        let body = content.body.as_str();
        if body.trim().is_empty() {
            return Err(ProbeError::malformed(graph.source(), "empty document"));
        }
        if !body.contains('<') {
            return Err(ProbeError::malformed(graph.source(), "no markup found"));
        }

        let home = graph.home();
        graph.bless(&home, &[ty(SITE)]);

        if let Some(title) = TITLE_TAG.captures(body).and_then(|c| c.get(1)) {
            let title = collapse_whitespace(&decode_entities(title.as_str()));
            if !title.is_empty() {
                graph.set_property(&home, ty(TITLE), PropertyValue::String(title));
            }
        }

        let head = HEAD.find(body).map_or(body, |m| m.as_str());
        Self::add_openid(graph, head);

        let xrds = content
            .header(XRDS_LOCATION_HEADER)
            .map(str::to_string)
            .or_else(|| first_capture(&XRDS_META[..], head).map(str::to_string));
        if let Some(location) = xrds.and_then(|l| Self::resolve(graph, &l)) {
            graph.link_to(&home, source_role(DESCRIBED_BY), location);
        }

        let mut seen = BTreeSet::new();
        for caps in ANCHOR.captures_iter(body) {
            let href = &caps[1];
            let lower = href.to_ascii_lowercase();
            if lower.starts_with("mailto:") || lower.starts_with("javascript:") {
                continue;
            }
            let Some(target) = Self::resolve(graph, href) else {
                continue;
            };
            if !matches!(target.scheme(), "http" | "https") || !seen.insert(target.clone()) {
                continue;
            }
            if seen.len() > MAX_LINKS {
                debug!(source = %graph.source(), "Too many links, ignoring the rest");
                break;
            }
            graph.link_to(&home, source_role(LINKS_TO), target);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use mesh_kernel::MeshObjectIdentifier;

    use super::*;

    fn nid(raw: &str) -> NetMeshBaseIdentifier {
        NetMeshBaseIdentifier::from_external_form(raw).unwrap()
    }

    fn parse(body: &str) -> StagingGraph {
        let mut graph = StagingGraph::new(nid("http://example.com/people/joe"));
        HtmlProbe
            .parse(&FetchedContent::new(Some("text/html"), body), &mut graph)
            .unwrap();
        graph
    }

    #[test]
    fn test_title_and_links() {
        let graph = parse(
            r##"<html><head><title>
                Joe &amp; Friends
            </title></head>
            <body>
              <a href="/about">About</a>
              <A HREF='http://other.example.org/x#top'>Other</A>
              <a href="#section">Skip</a>
              <a href="mailto:joe@example.com">Mail</a>
              <a href="/about">Again</a>
            </body></html>"##,
        );
        let home = graph.get(&graph.home()).unwrap();
        assert!(home.types.contains(&ty(SITE)));
        assert_eq!(
            home.properties.get(&ty(TITLE)),
            Some(&PropertyValue::String("Joe & Friends".to_string()))
        );
        let targets: Vec<_> = graph
            .forward_links()
            .iter()
            .map(|l| l.target.as_str().to_string())
            .collect();
        assert_eq!(
            targets,
            vec!["http://example.com/about", "http://other.example.org/x"]
        );
    }

    #[test]
    fn test_openid_links_become_authentication_service() {
        let graph = parse(
            r#"<html><head>
              <link rel="openid.server" href="https://login.example.com/server">
              <link href="http://joe.example.com/" rel='openid.delegate'>
            </head><body></body></html>"#,
        );
        let service_id = MeshObjectIdentifier::new("http://example.com/people/joe#openid-0");
        let service = graph.get(&service_id).unwrap();
        assert!(service.types.contains(&ty(AUTHENTICATION_SERVICE)));
        assert_eq!(
            service.properties.get(&ty(DELEGATE)).and_then(|v| v.as_str()),
            Some("http://joe.example.com/")
        );
        let endpoint_id =
            MeshObjectIdentifier::new("http://example.com/people/joe#openid-0-endpoint-0");
        assert_eq!(
            graph
                .get(&endpoint_id)
                .unwrap()
                .properties
                .get(&ty(URI))
                .and_then(|v| v.as_str()),
            Some("https://login.example.com/server")
        );
        assert!(graph
            .relationships()
            .contains_key(&(graph.home(), service_id.clone())));
        assert!(graph.relationships().contains_key(&(service_id, endpoint_id)));
    }

    #[test]
    fn test_openid_links_outside_head_are_ignored() {
        let graph = parse(
            r#"<html><head><title>t</title></head>
            <body><link rel="openid.server" href="https://login.example.com/"></body></html>"#,
        );
        assert_eq!(graph.objects().len(), 1);
    }

    #[test]
    fn test_xrds_location_from_meta_and_header() {
        let graph = parse(
            r#"<html><head><meta http-equiv="X-XRDS-Location" content="http://example.com/xrds"></head></html>"#,
        );
        let link = graph.forward_links().iter().next().unwrap();
        assert_eq!(link.role, source_role(DESCRIBED_BY));
        assert_eq!(link.target.as_str(), "http://example.com/xrds");

        let mut graph = StagingGraph::new(nid("http://example.com/"));
        let content = FetchedContent::new(Some("text/html"), "<html></html>")
            .with_header("X-XRDS-Location", "/yadis");
        HtmlProbe.parse(&content, &mut graph).unwrap();
        let link = graph.forward_links().iter().next().unwrap();
        assert_eq!(link.target.as_str(), "http://example.com/yadis");
    }

    #[test]
    fn test_plain_text_is_malformed() {
        let mut graph = StagingGraph::new(nid("http://example.com/"));
        let err = HtmlProbe
            .parse(&FetchedContent::new(Some("text/html"), "just words"), &mut graph)
            .unwrap_err();
        assert!(matches!(err, ProbeError::Malformed { .. }));
    }
}
