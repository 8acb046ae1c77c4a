//! proclink: a process/container correlation engine for Linux hosts.
//!
//! The crate observes a host and maintains a live view of which processes
//! belong to which containers, enriched with metadata from the container
//! runtime. It is meant to be embedded in host-level telemetry agents.
//!
//! The pipeline: the [`process::watcher`] subscribes to kernel process
//! lifecycle events over a netlink socket; the [`process::Table`] reconciles
//! them with a full procfs enumeration into an authoritative process table;
//! the [`monitor::Monitor`] consumes table changes, resolves each process's
//! cgroup to a container identity through the pluggable [`tools`] probes,
//! and maintains the process-to-container map for downstream consumers.
//!
//! ```no_run
//! # #[tokio::main]
//! # async fn main() -> Result<(), proclink::monitor::Error> {
//! let monitor = proclink::monitor::Monitor::new(Default::default()).await?;
//! for binding in monitor.containers() {
//!     println!("{} runs in {}", binding.process.pid, binding.id);
//! }
//! monitor.stop().await;
//! # Ok(())
//! # }
//! ```
//!
//! Watching live events requires `CAP_NET_ADMIN` and the host network
//! namespace; under Docker that means `--cap-add=NET_ADMIN --net=host`.

pub mod audit;
pub mod cgroup;
pub mod monitor;
pub mod netlink;
pub mod process;
pub mod procfs;
pub mod tools;
