//! Resolution of processes to their cgroup and on-demand controller stats.
//!
//! [`Reader`] maps a PID to its position in the cgroup hierarchy by parsing
//! `/proc/<pid>/cgroup`, preferring the v2 unified entry and falling back to
//! the first v1 hierarchy line. The resolved path doubles as the container
//! identity carrier consumed by the tool registry; the per-controller
//! statistics are read lazily from the unified hierarchy under
//! `<rootfs>/sys/fs/cgroup`.

use std::fs;
use std::io::BufRead;
use std::path::{Path, PathBuf};

mod error;

pub use error::{Error, Result};

/// Reads cgroup membership and controller statistics for processes, rooted
/// at a configurable rootfs.
#[derive(Debug, Clone)]
pub struct Reader {
    proc_root: PathBuf,
    cgroup_root: PathBuf,
}

/// The resolved cgroup view for one process: the hierarchy path plus
/// whatever controller statistics were readable at the time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CgroupStats {
    /// Slash-delimited position in the hierarchy, e.g. `/docker/<id>`.
    pub path: String,
    pub cpu: Option<CpuStat>,
    pub memory: Option<MemoryStat>,
}

/// Totals from the unified hierarchy's `cpu.stat` file, in microseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CpuStat {
    pub usage_usec: u64,
    pub user_usec: u64,
    pub system_usec: u64,
}

impl CpuStat {
    fn from_reader<R: BufRead>(buf: &mut R) -> std::io::Result<Self> {
        let mut stat = CpuStat::default();
        for line in buf.lines() {
            let line = line?;
            let mut parts = line.split_whitespace();
            let (Some(key), Some(value)) = (parts.next(), parts.next()) else {
                continue;
            };
            let Ok(value) = value.parse() else { continue };
            match key {
                "usage_usec" => stat.usage_usec = value,
                "user_usec" => stat.user_usec = value,
                "system_usec" => stat.system_usec = value,
                _ => {}
            }
        }
        Ok(stat)
    }
}

/// Current memory charge from `memory.current`, in bytes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryStat {
    pub current: u64,
}

impl MemoryStat {
    fn from_reader<R: BufRead>(buf: &mut R) -> std::io::Result<Self> {
        let mut line = String::new();
        buf.read_line(&mut line)?;
        Ok(MemoryStat {
            current: line.trim().parse().unwrap_or(0),
        })
    }
}

impl Reader {
    /// Creates a reader rooted at `rootfs`, locating the proc filesystem at
    /// `<rootfs>/proc` and the unified cgroup hierarchy at
    /// `<rootfs>/sys/fs/cgroup`.
    pub fn new(rootfs: impl AsRef<Path>) -> Self {
        let rootfs = rootfs.as_ref();
        Self {
            proc_root: rootfs.join("proc"),
            cgroup_root: rootfs.join("sys/fs/cgroup"),
        }
    }

    /// Resolves the cgroup view for `pid`.
    ///
    /// Returns `Ok(None)` for processes that live in the root cgroup only,
    /// i.e. are not inside any container-shaped cgroup.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Read`] when `/proc/<pid>/cgroup` cannot be read
    /// (typically the process already exited) and [`Error::InvalidLine`] for
    /// malformed membership lines.
    pub fn stats_for_process(&self, pid: i32) -> Result<Option<CgroupStats>> {
        let path = self.proc_root.join(pid.to_string()).join("cgroup");
        let content = fs::read_to_string(&path).map_err(|source| Error::Read { pid, source })?;

        let Some(cgroup_path) = resolve_cgroup_path(&content)? else {
            return Ok(None);
        };

        let prefix = self
            .cgroup_root
            .join(cgroup_path.strip_prefix('/').unwrap_or(&cgroup_path));

        Ok(Some(CgroupStats {
            path: cgroup_path,
            cpu: read_controller(&prefix.join("cpu.stat"), CpuStat::from_reader),
            memory: read_controller(&prefix.join("memory.current"), MemoryStat::from_reader),
        }))
    }
}

// Controller files are best-effort; a cgroup can vanish between the path
// resolution and the stat read.
fn read_controller<T>(
    path: &Path,
    parse: impl FnOnce(&mut std::io::BufReader<fs::File>) -> std::io::Result<T>,
) -> Option<T> {
    let file = fs::File::open(path).ok()?;
    parse(&mut std::io::BufReader::new(file)).ok()
}

/// Selects the single identifying path from the content of
/// `/proc/<pid>/cgroup`: the v2 unified entry (hierarchy id 0) when present,
/// otherwise the first v1 hierarchy's path. The root path means "no cgroup".
fn resolve_cgroup_path(content: &str) -> Result<Option<String>> {
    let mut first: Option<&str> = None;

    for line in content.lines().filter(|line| !line.is_empty()) {
        let parsed = parse_cgroup_line(line)?;
        if parsed.hierarchy_id == 0 {
            return Ok(keep_path(parsed.cgroup_path));
        }
        first.get_or_insert(parsed.cgroup_path);
    }

    Ok(first.and_then(keep_path))
}

fn keep_path(path: &str) -> Option<String> {
    (path != "/").then(|| path.to_owned())
}

struct CgroupLine<'a> {
    hierarchy_id: u32,
    #[allow(dead_code)]
    controllers: &'a str,
    cgroup_path: &'a str,
}

/// Parses one `<hierarchy-id>:<controller-list>:<cgroup-path>` line.
fn parse_cgroup_line(line: &str) -> Result<CgroupLine<'_>> {
    let invalid = || Error::InvalidLine(line.to_owned());

    let (id, rest) = line.split_once(':').ok_or_else(invalid)?;
    let (controllers, cgroup_path) = rest.split_once(':').ok_or_else(invalid)?;
    let hierarchy_id = id.parse().map_err(|_| invalid())?;

    Ok(CgroupLine {
        hierarchy_id,
        controllers,
        cgroup_path: cgroup_path.trim(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOCKER_ID: &str = "abcdef0123456789abcdef0123456789abcdef0123456789abcdef0123456789";

    #[test]
    fn test_resolve_v2_line() {
        let content = format!("0::/docker/{DOCKER_ID}\n");
        let path = resolve_cgroup_path(&content).unwrap().unwrap();
        assert_eq!(path, format!("/docker/{DOCKER_ID}"));
    }

    #[test]
    fn test_resolve_prefers_v2_over_v1() {
        let content = format!(
            "12:cpu,cpuacct:/v1/ignored\n1:name=systemd:/also/ignored\n0::/docker/{DOCKER_ID}\n"
        );
        let path = resolve_cgroup_path(&content).unwrap().unwrap();
        assert_eq!(path, format!("/docker/{DOCKER_ID}"));
    }

    #[test]
    fn test_resolve_v1_fallback() {
        let content = format!("12:cpu,cpuacct:/docker/{DOCKER_ID}\n11:memory:/docker/{DOCKER_ID}\n");
        let path = resolve_cgroup_path(&content).unwrap().unwrap();
        assert_eq!(path, format!("/docker/{DOCKER_ID}"));
    }

    #[test]
    fn test_root_cgroup_is_none() {
        assert_eq!(resolve_cgroup_path("0::/\n").unwrap(), None);
        assert_eq!(resolve_cgroup_path("").unwrap(), None);
    }

    #[test]
    fn test_malformed_line() {
        assert!(matches!(
            resolve_cgroup_path("not a cgroup line"),
            Err(Error::InvalidLine(_))
        ));
        assert!(matches!(
            resolve_cgroup_path("x::/bad-id"),
            Err(Error::InvalidLine(_))
        ));
    }

    #[test]
    fn test_cpu_stat_parse() {
        let data = "usage_usec 1000\nuser_usec 600\nsystem_usec 400\nnr_periods 0\n";
        let stat = CpuStat::from_reader(&mut data.as_bytes()).unwrap();
        assert_eq!(stat.usage_usec, 1000);
        assert_eq!(stat.user_usec, 600);
        assert_eq!(stat.system_usec, 400);
    }

    #[test]
    fn test_stats_for_process_fixture() {
        let dir = tempfile::tempdir().unwrap();
        let proc_dir = dir.path().join("proc/1000");
        fs::create_dir_all(&proc_dir).unwrap();
        fs::write(
            proc_dir.join("cgroup"),
            format!("0::/docker/{DOCKER_ID}\n"),
        )
        .unwrap();

        let cg_dir = dir.path().join(format!("sys/fs/cgroup/docker/{DOCKER_ID}"));
        fs::create_dir_all(&cg_dir).unwrap();
        fs::write(cg_dir.join("cpu.stat"), "usage_usec 5\nuser_usec 3\nsystem_usec 2\n").unwrap();
        fs::write(cg_dir.join("memory.current"), "4096\n").unwrap();

        let reader = Reader::new(dir.path());
        let stats = reader.stats_for_process(1000).unwrap().unwrap();

        assert_eq!(stats.path, format!("/docker/{DOCKER_ID}"));
        assert_eq!(stats.cpu.unwrap().usage_usec, 5);
        assert_eq!(stats.memory.unwrap().current, 4096);
    }

    #[test]
    fn test_stats_for_missing_process() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("proc")).unwrap();

        let reader = Reader::new(dir.path());
        assert!(matches!(
            reader.stats_for_process(4242),
            Err(Error::Read { pid: 4242, .. })
        ));
    }
}
