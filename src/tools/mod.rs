//! Pluggable container-runtime probes.
//!
//! A probe recognizes the cgroup-path shape of one container runtime and can
//! fetch metadata for the ids it extracts. The [`ToolRegistry`] holds the
//! registered probes keyed by [`ContainerToolKind`] and resolves cgroup
//! paths against them. Current probes recognize disjoint path shapes;
//! resolution order is unspecified.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;

pub mod docker;

pub use docker::DockerTool;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("no container tool recognizes cgroup path `{0}`")]
    NoMatch(String),
}

/// Failure modes of a probe's metadata fetch. The binding survives these;
/// only its metadata is absent.
#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    #[error("container `{0}` not found")]
    NotFound(String),
    #[error("container runtime rejected the request: {0}")]
    Unauthorized(String),
    #[error("container runtime transport: {0}")]
    Transport(#[source] Box<dyn std::error::Error + Send + Sync>),
}

/// Identifies the container tool associated with a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ContainerToolKind {
    #[default]
    Unknown,
    Docker,
}

impl fmt::Display for ContainerToolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContainerToolKind::Docker => f.write_str("docker"),
            ContainerToolKind::Unknown => f.write_str("unknown"),
        }
    }
}

/// Container metadata fetched from a runtime.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerData {
    pub id: String,
    /// Human-readable name as reported by the runtime (Docker keeps the
    /// leading slash).
    pub name: String,
    pub image: String,
    pub labels: HashMap<String, String>,
    pub tool: ContainerToolKind,
}

/// A container-runtime probe: a recognizer for cgroup-path shapes plus a
/// metadata fetcher for the ids it extracts.
#[async_trait]
pub trait ContainerTool: Send + Sync {
    /// Inspects a cgroup path and returns the extracted container id when
    /// this probe recognizes the path shape.
    fn can_handle(&self, cgroup_path: &str) -> Option<String>;

    /// Fetches metadata for a container id previously extracted by
    /// [`ContainerTool::can_handle`].
    ///
    /// # Errors
    ///
    /// Returns a [`ProbeError`] describing the transport, authorization, or
    /// not-found failure.
    async fn get_data(&self, id: &str) -> Result<ContainerData, ProbeError>;
}

/// Keyed collection of registered probes.
#[derive(Default)]
pub struct ToolRegistry {
    tools: RwLock<HashMap<ContainerToolKind, Arc<dyn ContainerTool>>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, kind: ContainerToolKind, tool: Arc<dyn ContainerTool>) {
        self.tools
            .write()
            .expect("tool registry lock poisoned")
            .insert(kind, tool);
    }

    /// Asks each registered probe to claim the cgroup path and returns the
    /// first match. Iteration order is unspecified; probes are expected to
    /// recognize disjoint path shapes.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoMatch`] when no probe claims the path.
    pub fn resolve(
        &self,
        cgroup_path: &str,
    ) -> Result<(String, ContainerToolKind, Arc<dyn ContainerTool>), Error> {
        let tools = self.tools.read().expect("tool registry lock poisoned");
        for (kind, tool) in tools.iter() {
            if let Some(id) = tool.can_handle(cgroup_path) {
                return Ok((id, *kind, Arc::clone(tool)));
            }
        }

        Err(Error::NoMatch(cgroup_path.to_owned()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedTool {
        prefix: &'static str,
    }

    #[async_trait]
    impl ContainerTool for FixedTool {
        fn can_handle(&self, cgroup_path: &str) -> Option<String> {
            cgroup_path
                .strip_prefix(self.prefix)
                .map(|id| id.to_owned())
        }

        async fn get_data(&self, id: &str) -> Result<ContainerData, ProbeError> {
            Ok(ContainerData {
                id: id.to_owned(),
                ..Default::default()
            })
        }
    }

    #[test]
    fn test_resolve_match() {
        let registry = ToolRegistry::new();
        registry.register(
            ContainerToolKind::Docker,
            Arc::new(FixedTool { prefix: "/fixed/" }),
        );

        let (id, kind, _) = registry.resolve("/fixed/abc").unwrap();
        assert_eq!(id, "abc");
        assert_eq!(kind, ContainerToolKind::Docker);
    }

    #[test]
    fn test_resolve_no_match() {
        let registry = ToolRegistry::new();
        registry.register(
            ContainerToolKind::Docker,
            Arc::new(FixedTool { prefix: "/fixed/" }),
        );

        assert!(matches!(
            registry.resolve("/other/abc"),
            Err(Error::NoMatch(path)) if path == "/other/abc"
        ));
    }

    #[test]
    fn test_tool_kind_display() {
        assert_eq!(ContainerToolKind::Docker.to_string(), "docker");
        assert_eq!(ContainerToolKind::Unknown.to_string(), "unknown");
    }
}
