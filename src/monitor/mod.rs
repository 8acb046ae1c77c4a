//! The correlation monitor: the integrating component that maintains the
//! live process-to-container map.
//!
//! The monitor subscribes to the process table and, for every added process,
//! resolves its cgroup path through the registered container-tool probes. A
//! claimed process becomes a [`ProcessContainer`] binding; the binding is
//! dropped again when the table reports the process gone. Metadata fetch
//! failures degrade the binding (metadata absent) instead of dropping it;
//! unresolvable processes are simply not bound. A telemetry pipeline that
//! needs stronger consistency can poll [`Table::select`] and re-reconcile.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot};

use crate::cgroup;
use crate::process::watcher::{EventKind, NetlinkProcessWatcher};
use crate::process::{self, ListenerToken, Process, Table, TableEvent};
use crate::procfs::ProcFs;
use crate::tools::{ContainerData, ContainerToolKind, DockerTool, ToolRegistry};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to open process filesystem: {0}")]
    Procfs(#[from] crate::procfs::Error),
    #[error("failed to start process table: {0}")]
    Table(#[from] process::Error),
    #[error("insufficient privileges (CAP_NET_ADMIN and host network namespace required): {0}")]
    Permission(String),
}

/// Monitor configuration. The recognized options are a closed set: the
/// rootfs under which `proc` and the cgroup hierarchy are located, and the
/// Docker endpoint override.
#[derive(Debug, Clone)]
pub struct Config {
    /// Path used as the root under which `/proc` and the cgroup roots are
    /// located.
    pub rootfs: PathBuf,
    /// Docker socket URL override; `None` selects the default unix socket.
    pub docker_endpoint: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            rootfs: PathBuf::from("/"),
            docker_endpoint: None,
        }
    }
}

impl Config {
    /// Reads overrides from `PROCLINK_ROOTFS` and
    /// `PROCLINK_DOCKER_ENDPOINT`.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(rootfs) = std::env::var_os("PROCLINK_ROOTFS") {
            config.rootfs = PathBuf::from(rootfs);
        }
        if let Ok(endpoint) = std::env::var("PROCLINK_DOCKER_ENDPOINT") {
            config.docker_endpoint = Some(endpoint);
        }
        config
    }
}

/// A live association between a running process and the container that owns
/// it.
#[derive(Clone)]
pub struct ProcessContainer {
    /// Snapshot of the process at binding time.
    pub process: Process,
    /// Runtime-assigned container id extracted from the cgroup path.
    pub id: String,
    /// Which probe resolved the binding.
    pub tool: ContainerToolKind,
    /// Fetched metadata; absent when the fetch failed.
    pub data: Option<ContainerData>,
    cgroup: cgroup::Reader,
}

impl ProcessContainer {
    /// Reloads the process's cgroup stats on demand.
    ///
    /// # Errors
    ///
    /// Propagates the cgroup reader's error, typically because the process
    /// already exited.
    pub fn cgroup_stats(&self) -> cgroup::Result<Option<cgroup::CgroupStats>> {
        self.cgroup.stats_for_process(self.process.pid)
    }
}

/// The process-to-container correlation monitor.
pub struct Monitor {
    table: Arc<Table>,
    listener_token: ListenerToken,
    cgroup: cgroup::Reader,
    registry: ToolRegistry,
    data: DashMap<i32, ProcessContainer>,
    stop_tx: Mutex<Option<oneshot::Sender<()>>>,
    event_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Monitor {
    /// Builds and starts a monitor over the host described by `config`.
    ///
    /// Probe construction failures (such as an absent Docker daemon) are
    /// logged and skipped; the monitor still tracks processes, just without
    /// that runtime's metadata.
    ///
    /// # Errors
    ///
    /// Construction fails when the process filesystem is unreadable
    /// ([`Error::Procfs`]), the watcher subscription cannot be established
    /// ([`Error::Table`]), or capabilities are missing
    /// ([`Error::Permission`]).
    pub async fn new(config: Config) -> Result<Arc<Self>, Error> {
        let procfs = ProcFs::new(config.rootfs.join("proc"))?;
        let watcher = NetlinkProcessWatcher::new();
        let table = Arc::new(Table::new(procfs, Some(Arc::new(watcher))));
        let reader = cgroup::Reader::new(&config.rootfs);

        let registry = ToolRegistry::new();
        match DockerTool::new(config.docker_endpoint.as_deref()).await {
            Ok(tool) => registry.register(ContainerToolKind::Docker, Arc::new(tool)),
            Err(err) => log::warn!("docker metadata will not be available: {err}"),
        }

        Self::start(table, reader, registry).await
    }

    /// Subscribes to the table, spawns the event loop, and starts the table.
    async fn start(
        table: Arc<Table>,
        reader: cgroup::Reader,
        registry: ToolRegistry,
    ) -> Result<Arc<Self>, Error> {
        let (event_tx, mut event_rx) = mpsc::channel(16);
        let listener_token = table.listen(event_tx).await;
        let (stop_tx, mut stop_rx) = oneshot::channel();

        let monitor = Arc::new(Self {
            table: Arc::clone(&table),
            listener_token,
            cgroup: reader,
            registry,
            data: DashMap::new(),
            stop_tx: Mutex::new(Some(stop_tx)),
            event_task: Mutex::new(None),
        });

        let handle = {
            let monitor = Arc::clone(&monitor);
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = &mut stop_rx => break,
                        event = event_rx.recv() => match event {
                            Some(event) => monitor.handle_table_event(event).await,
                            None => break,
                        },
                    }
                }
                log::debug!("correlation monitor event loop finished");
            })
        };
        *monitor
            .event_task
            .lock()
            .expect("monitor event task lock poisoned") = Some(handle);

        if let Err(err) = table.start().await {
            monitor.stop().await;
            return Err(map_start_error(err));
        }

        Ok(monitor)
    }

    async fn handle_table_event(&self, event: TableEvent) {
        match event.kind {
            EventKind::Add => self.handle_add(event.process).await,
            EventKind::Remove => {
                if let Some((pid, binding)) = self.data.remove(&event.process.pid) {
                    log::debug!("container process {pid} ({}) stopped", binding.id);
                }
            }
        }
    }

    async fn handle_add(&self, process: Process) {
        let pid = process.pid;

        let stats = match self.cgroup.stats_for_process(pid) {
            Ok(Some(stats)) => stats,
            Ok(None) => {
                log::debug!("process {pid} is not in a cgroup");
                return;
            }
            Err(err) => {
                log::warn!("failed to get cgroup stats for process {pid}: {err}");
                return;
            }
        };

        let (id, kind, tool) = match self.registry.resolve(&stats.path) {
            Ok(resolved) => resolved,
            Err(err) => {
                log::info!("could not find container tool for process {pid}: {err}");
                return;
            }
        };

        // Metadata failure degrades the binding, it does not drop it.
        let data = match tool.get_data(&id).await {
            Ok(data) => Some(data),
            Err(err) => {
                log::warn!("failed to get data for container {id} via {kind}: {err}");
                None
            }
        };

        log::debug!("new container binding: pid={pid} id={id} tool={kind}");
        self.data.insert(
            pid,
            ProcessContainer {
                process,
                id,
                tool: kind,
                data,
                cgroup: self.cgroup.clone(),
            },
        );
    }

    /// Returns the binding for `pid`, if the process is currently known to
    /// belong to a container.
    pub fn container_for_pid(&self, pid: i32) -> Option<ProcessContainer> {
        self.data.get(&pid).map(|binding| binding.value().clone())
    }

    /// Snapshot of all current bindings.
    pub fn containers(&self) -> Vec<ProcessContainer> {
        self.data
            .iter()
            .map(|binding| binding.value().clone())
            .collect()
    }

    /// The underlying process table, for snapshot queries via
    /// [`Table::select`].
    pub fn table(&self) -> &Arc<Table> {
        &self.table
    }

    /// Shuts down the event loop, detaches from the table, and stops the
    /// table (which in turn stops the watcher). Idempotent and safe to call
    /// from any task.
    pub async fn stop(&self) {
        let stop_tx = self
            .stop_tx
            .lock()
            .expect("monitor stop lock poisoned")
            .take();
        let Some(stop_tx) = stop_tx else { return };
        drop(stop_tx);

        let handle = self
            .event_task
            .lock()
            .expect("monitor event task lock poisoned")
            .take();
        if let Some(handle) = handle {
            if handle.await.is_err() {
                log::error!("correlation monitor event loop panicked");
            }
        }

        self.table.stop_listening(self.listener_token).await;
        self.table.stop().await;
    }
}

fn map_start_error(err: process::Error) -> Error {
    if let process::Error::Watcher(crate::process::watcher::Error::Transport(transport)) = &err {
        let denied = matches!(
            transport,
            crate::netlink::Error::Socket(source) | crate::netlink::Error::Bind(source)
                if source.kind() == std::io::ErrorKind::PermissionDenied
        );
        if denied {
            return Error::Permission(transport.to_string());
        }
    }
    Error::Table(err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::{ContainerTool, ProbeError};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::fs;
    use std::time::Duration;

    const ID: &str = "abcdef0123456789abcdef0123456789abcdef0123456789abcdef0123456789";

    /// Claims any path containing the fixed id and answers with canned
    /// metadata; fetches can be toggled to fail.
    struct StubTool {
        fail_data: bool,
    }

    #[async_trait]
    impl ContainerTool for StubTool {
        fn can_handle(&self, cgroup_path: &str) -> Option<String> {
            cgroup_path.contains(ID).then(|| ID.to_owned())
        }

        async fn get_data(&self, id: &str) -> Result<ContainerData, ProbeError> {
            if self.fail_data {
                return Err(ProbeError::NotFound(id.to_owned()));
            }
            Ok(ContainerData {
                id: id.to_owned(),
                name: "/test".to_owned(),
                image: "sha256:deadbeef".to_owned(),
                labels: HashMap::new(),
                tool: ContainerToolKind::Docker,
            })
        }
    }

    fn write_fixture_process(rootfs: &std::path::Path, pid: i32, in_container: bool) {
        let proc_dir = rootfs.join("proc").join(pid.to_string());
        fs::create_dir_all(&proc_dir).unwrap();
        fs::write(
            proc_dir.join("stat"),
            format!(
                "{pid} (app) S 1 {pid} {pid} 0 -1 4194304 0 0 0 0 0 0 0 0 \
                 20 0 1 0 7777 1000 10 18446744073709551615"
            ),
        )
        .unwrap();
        fs::write(proc_dir.join("cmdline"), b"app\0").unwrap();
        if in_container {
            fs::write(proc_dir.join("cgroup"), format!("0::/docker/{ID}\n")).unwrap();
        } else {
            fs::write(proc_dir.join("cgroup"), "0::/\n").unwrap();
        }
    }

    async fn fixture_monitor(rootfs: &std::path::Path, fail_data: bool) -> Arc<Monitor> {
        let procfs = ProcFs::new(rootfs.join("proc")).unwrap();
        let table = Arc::new(Table::new(procfs, None));
        let registry = ToolRegistry::new();
        registry.register(ContainerToolKind::Docker, Arc::new(StubTool { fail_data }));

        Monitor::start(table, cgroup::Reader::new(rootfs), registry)
            .await
            .unwrap()
    }

    async fn wait_for<F: Fn() -> bool>(condition: F) {
        for _ in 0..100 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_add_creates_binding_and_remove_clears_it() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("proc")).unwrap();
        write_fixture_process(dir.path(), 1000, true);

        let monitor = fixture_monitor(dir.path(), false).await;

        monitor.table().add_pid(1000).await.unwrap();
        wait_for(|| monitor.container_for_pid(1000).is_some()).await;

        let binding = monitor.container_for_pid(1000).unwrap();
        assert_eq!(binding.id, ID);
        assert_eq!(binding.tool, ContainerToolKind::Docker);
        assert_eq!(binding.data.as_ref().unwrap().name, "/test");
        assert_eq!(binding.process.command, "app");

        monitor.table().remove(1000).await;
        wait_for(|| monitor.container_for_pid(1000).is_none()).await;

        monitor.stop().await;
    }

    #[tokio::test]
    async fn test_metadata_failure_degrades_binding() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("proc")).unwrap();
        write_fixture_process(dir.path(), 1000, true);

        let monitor = fixture_monitor(dir.path(), true).await;

        monitor.table().add_pid(1000).await.unwrap();
        wait_for(|| monitor.container_for_pid(1000).is_some()).await;

        let binding = monitor.container_for_pid(1000).unwrap();
        assert_eq!(binding.id, ID);
        assert!(binding.data.is_none());

        monitor.stop().await;
    }

    #[tokio::test]
    async fn test_process_without_cgroup_is_not_bound() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("proc")).unwrap();
        write_fixture_process(dir.path(), 1000, false);
        write_fixture_process(dir.path(), 2000, true);

        let monitor = fixture_monitor(dir.path(), false).await;

        monitor.table().add_pid(1000).await.unwrap();
        monitor.table().add_pid(2000).await.unwrap();
        wait_for(|| monitor.container_for_pid(2000).is_some()).await;

        assert!(monitor.container_for_pid(1000).is_none());
        assert_eq!(monitor.containers().len(), 1);

        monitor.stop().await;
    }

    #[tokio::test]
    async fn test_binding_map_is_subset_of_table() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("proc")).unwrap();
        write_fixture_process(dir.path(), 1000, true);

        let monitor = fixture_monitor(dir.path(), false).await;
        monitor.table().add_pid(1000).await.unwrap();
        wait_for(|| monitor.container_for_pid(1000).is_some()).await;

        monitor.table().remove(1000).await;
        wait_for(|| monitor.container_for_pid(1000).is_none()).await;

        let table_pids = monitor.table().select(|_| true);
        for binding in monitor.containers() {
            assert!(table_pids.contains_key(&binding.process.pid));
        }

        monitor.stop().await;
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("proc")).unwrap();

        let monitor = fixture_monitor(dir.path(), false).await;
        monitor.stop().await;
        monitor.stop().await;
    }

    #[tokio::test]
    async fn test_binding_reloads_cgroup_stats() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("proc")).unwrap();
        write_fixture_process(dir.path(), 1000, true);

        let cg_dir = dir.path().join(format!("sys/fs/cgroup/docker/{ID}"));
        fs::create_dir_all(&cg_dir).unwrap();
        fs::write(cg_dir.join("memory.current"), "2048\n").unwrap();

        let monitor = fixture_monitor(dir.path(), false).await;
        monitor.table().add_pid(1000).await.unwrap();
        wait_for(|| monitor.container_for_pid(1000).is_some()).await;

        let binding = monitor.container_for_pid(1000).unwrap();
        let stats = binding.cgroup_stats().unwrap().unwrap();
        assert_eq!(stats.path, format!("/docker/{ID}"));
        assert_eq!(stats.memory.unwrap().current, 2048);

        // The handle re-reads on every call.
        fs::write(cg_dir.join("memory.current"), "8192\n").unwrap();
        let stats = binding.cgroup_stats().unwrap().unwrap();
        assert_eq!(stats.memory.unwrap().current, 8192);

        monitor.stop().await;
    }
}
