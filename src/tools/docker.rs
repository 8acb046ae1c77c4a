//! Docker probe.
//!
//! Docker encodes the container id (64 lowercase hex characters) in the
//! cgroup path of every containerized process, in both the v1
//! (`/docker/<id>`) and v2 (`/system.slice/docker-<id>.scope`) layouts, so
//! recognition is a substring match. Metadata comes from the daemon's
//! inspect API over the local unix socket.

use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use bollard::container::InspectContainerOptions;
use bollard::{Docker, API_DEFAULT_VERSION};
use regex::Regex;

use super::{ContainerData, ContainerTool, ContainerToolKind, ProbeError};

/// Default Docker daemon endpoint.
pub const DEFAULT_ENDPOINT: &str = "unix:///var/run/docker.sock";

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

static DOCKER_ID_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new("[0-9a-f]{64}").expect("docker id regex is valid"));

/// Probe backed by the Docker daemon's local endpoint.
pub struct DockerTool {
    client: Docker,
}

impl DockerTool {
    /// Connects to the Docker daemon, verifying it is reachable by querying
    /// its version.
    ///
    /// # Errors
    ///
    /// Returns [`ProbeError::Transport`] when the endpoint cannot be reached;
    /// the caller logs and skips registration, metadata is simply not
    /// available.
    pub async fn new(endpoint: Option<&str>) -> Result<Self, ProbeError> {
        let endpoint = endpoint.unwrap_or(DEFAULT_ENDPOINT);
        let client = Docker::connect_with_unix(
            endpoint,
            CONNECT_TIMEOUT.as_secs(),
            API_DEFAULT_VERSION,
        )
        .map_err(|err| ProbeError::Transport(Box::new(err)))?;

        let version = client
            .version()
            .await
            .map_err(|err| ProbeError::Transport(Box::new(err)))?;
        log::info!(
            "initialized docker client for `{endpoint}`, server version {}",
            version.version.as_deref().unwrap_or("unknown")
        );

        Ok(Self { client })
    }
}

#[async_trait]
impl ContainerTool for DockerTool {
    fn can_handle(&self, cgroup_path: &str) -> Option<String> {
        extract_container_id(cgroup_path)
    }

    async fn get_data(&self, id: &str) -> Result<ContainerData, ProbeError> {
        let inspect = self
            .client
            .inspect_container(id, None::<InspectContainerOptions>)
            .await
            .map_err(|err| match err {
                bollard::errors::Error::DockerResponseServerError {
                    status_code: 404, ..
                } => ProbeError::NotFound(id.to_owned()),
                bollard::errors::Error::DockerResponseServerError {
                    status_code: 401 | 403,
                    message,
                } => ProbeError::Unauthorized(message),
                err => ProbeError::Transport(Box::new(err)),
            })?;

        Ok(ContainerData {
            id: id.to_owned(),
            name: inspect.name.unwrap_or_default(),
            image: inspect.image.unwrap_or_default(),
            labels: inspect
                .config
                .and_then(|config| config.labels)
                .unwrap_or_default(),
            tool: ContainerToolKind::Docker,
        })
    }
}

/// Returns the first 64-character lowercase hex substring of the path.
fn extract_container_id(cgroup_path: &str) -> Option<String> {
    DOCKER_ID_REGEX
        .find(cgroup_path)
        .map(|found| found.as_str().to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    const ID: &str = "abcdef0123456789abcdef0123456789abcdef0123456789abcdef0123456789";

    #[test]
    fn test_extract_id_from_v1_path() {
        let path = format!("/docker/{ID}/some/child");
        assert_eq!(extract_container_id(&path), Some(ID.to_owned()));
    }

    #[test]
    fn test_extract_id_from_systemd_scope_path() {
        let path = format!("/system.slice/docker-{ID}.scope");
        assert_eq!(extract_container_id(&path), Some(ID.to_owned()));
    }

    #[test]
    fn test_path_without_id_is_not_handled() {
        assert_eq!(extract_container_id("/system.slice/sshd.service"), None);
        // Uppercase hex is not a docker id.
        assert_eq!(
            extract_container_id(&format!("/docker/{}", ID.to_uppercase())),
            None
        );
        // Too short.
        assert_eq!(extract_container_id(&format!("/docker/{}", &ID[..63])), None);
    }
}
