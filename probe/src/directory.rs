//! Choosing the probe for a resource.
//!
//! A probe registered for a URL pattern wins over one registered for the
//! content type the resource was served with.

use std::sync::Arc;

use mesh_kernel::NetMeshBaseIdentifier;
use regex::Regex;
use tracing::debug;

use crate::{
    error::{ProbeError, ProbeResult},
    fetcher::{normalize_content_type, FetchedContent},
    probes::{HtmlProbe, YadisProbe},
    staging::StagingGraph,
};

/// Turns fetched content into a staging graph.
pub trait Probe: Send + Sync {
    fn name(&self) -> &'static str;

    /// Fails with `ProbeError::Malformed` when the content cannot be understood.
    fn parse(&self, content: &FetchedContent, graph: &mut StagingGraph) -> ProbeResult<()>;
}

#[derive(Default)]
pub struct ProbeDirectory {
    by_url: Vec<(Regex, Arc<dyn Probe>)>,
    by_content_type: Vec<(String, Arc<dyn Probe>)>,
}

impl ProbeDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// HTML pages and Yadis service descriptors.
    pub fn with_defaults() -> Self {
        let html: Arc<dyn Probe> = Arc::new(HtmlProbe);
        let yadis: Arc<dyn Probe> = Arc::new(YadisProbe);
        let mut directory = Self::new();
        directory.register_content_type("text/html", html.clone());
        directory.register_content_type("application/xhtml+xml", html);
        directory.register_content_type("application/xrds+xml", yadis);
        directory
    }

    pub fn register_url_pattern(&mut self, pattern: &str, probe: Arc<dyn Probe>) -> ProbeResult<()> {
        let regex = Regex::new(pattern).map_err(|e| ProbeError::InvalidPattern {
            pattern: pattern.to_string(),
            reason: e.to_string(),
        })?;
        self.by_url.push((regex, probe));
        Ok(())
    }

    pub fn register_content_type(&mut self, content_type: &str, probe: Arc<dyn Probe>) {
        self.by_content_type
            .push((normalize_content_type(content_type), probe));
    }

    pub fn select(
        &self,
        source: &NetMeshBaseIdentifier,
        content_type: Option<&str>,
    ) -> ProbeResult<Arc<dyn Probe>> {
        if let Some((_, probe)) = self
            .by_url
            .iter()
            .find(|(regex, _)| regex.is_match(source.as_str()))
        {
            debug!(source = %source, probe = probe.name(), "Selected probe by URL");
            return Ok(probe.clone());
        }
        let wanted = content_type.map(normalize_content_type);
        if let Some(wanted) = &wanted {
            if let Some((_, probe)) = self.by_content_type.iter().find(|(ct, _)| ct == wanted) {
                debug!(source = %source, probe = probe.name(), "Selected probe by content type");
                return Ok(probe.clone());
            }
        }
        Err(ProbeError::NoProbe {
            source_id: source.clone(),
            content_type: wanted,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Named(&'static str);

    impl Probe for Named {
        fn name(&self) -> &'static str {
            self.0
        }

        fn parse(&self, _content: &FetchedContent, _graph: &mut StagingGraph) -> ProbeResult<()> {
            Ok(())
        }
    }

    fn nid(raw: &str) -> NetMeshBaseIdentifier {
        NetMeshBaseIdentifier::from_external_form(raw).unwrap()
    }

    #[test]
    fn test_url_pattern_wins_over_content_type() {
        let mut directory = ProbeDirectory::with_defaults();
        directory
            .register_url_pattern(r"^https?://feeds\.example\.com/", Arc::new(Named("feed")))
            .unwrap();

        let feed = directory
            .select(&nid("http://feeds.example.com/news"), Some("text/html"))
            .unwrap();
        assert_eq!(feed.name(), "feed");

        let page = directory
            .select(&nid("http://www.example.com/"), Some("text/html; charset=utf-8"))
            .unwrap();
        assert_eq!(page.name(), "html");

        let xrds = directory
            .select(&nid("http://www.example.com/xrds"), Some("application/xrds+xml"))
            .unwrap();
        assert_eq!(xrds.name(), "yadis");
    }

    #[test]
    fn test_unknown_content_type() {
        let directory = ProbeDirectory::with_defaults();
        let err = directory
            .select(&nid("http://www.example.com/a.png"), Some("image/png"))
            .err()
            .unwrap();
        assert!(matches!(err, ProbeError::NoProbe { content_type: Some(ct), .. } if ct == "image/png"));
        assert!(directory.select(&nid("http://www.example.com/"), None).is_err());
    }

    #[test]
    fn test_invalid_pattern() {
        let mut directory = ProbeDirectory::new();
        let err = directory
            .register_url_pattern("([", Arc::new(Named("broken")))
            .unwrap_err();
        assert!(matches!(err, ProbeError::InvalidPattern { .. }));
    }
}
