//! External-source shadows
//!
//! Mirrors resources that do not take part in replication (web pages,
//! identity documents) as small mesh bases kept fresh on a timer:
//! - `ShadowMeshBase`: the mirror of one resource
//! - `Probe` and `ProbeDirectory`: turning fetched content into objects
//! - `ContentFetcher`: HTTP, file and in-memory sources
//! - `CoherenceSpecification`: when to refresh
//! - `ProbeManager`: creates shadows on demand and schedules their runs

pub mod coherence;
pub mod directory;
pub mod error;
pub mod fetcher;
pub mod manager;
pub mod model;
pub mod probes;
pub mod shadow;
pub mod staging;

pub use coherence::{CoherenceSpecification, RunOutcome};
pub use directory::{Probe, ProbeDirectory};
pub use error::{ProbeError, ProbeResult};
pub use fetcher::{
    ContentFetcher, FetchedContent, FileFetcher, HttpFetcher, HttpFetcherConfig, SchemeFetcher,
    StaticFetcher,
};
pub use manager::{ProbeManager, ProbeManagerConfig};
pub use model::probe_model;
pub use probes::{HtmlProbe, YadisProbe};
pub use shadow::{ProbeContext, ShadowMeshBase, ShadowStatus};
pub use staging::{ForwardLink, StagedObject, StagingGraph};
