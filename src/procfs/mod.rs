//! Reader for the kernel's process filesystem.
//!
//! [`ProcFs`] abstracts a mount point (default `/proc`) and hands out
//! per-process [`Proc`] handles. The attribute readers only touch the kernel
//! files they need: `stat` for parentage, process group, command name, and
//! the start-time token; `cmdline` for the full command line; `ns/*` for the
//! namespace map. All reads race against process exit by design; the callers
//! treat [`Error::NotFound`] as "the process is already gone".

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

mod error;

pub use error::{Error, Result};

/// The common mount point of the proc filesystem.
pub const DEFAULT_MOUNT_POINT: &str = "/proc";

/// Mapping from namespace kind (`net`, `pid`, `mnt`, ...) to the opaque
/// namespace identifier (the inode backing the `ns/*` symlink).
pub type Namespaces = HashMap<String, u64>;

/// A proc filesystem rooted at a configurable mount point.
#[derive(Debug, Clone)]
pub struct ProcFs {
    root: PathBuf,
}

impl ProcFs {
    /// # Errors
    ///
    /// Returns [`Error::InvalidMountPoint`] if `mount_point` cannot be read
    /// or is not a directory.
    pub fn new(mount_point: impl AsRef<Path>) -> Result<Self> {
        let root = mount_point.as_ref().to_path_buf();
        match fs::metadata(&root) {
            Ok(meta) if meta.is_dir() => Ok(Self { root }),
            _ => Err(Error::InvalidMountPoint(root)),
        }
    }

    /// Enumerates all live processes, skipping non-numeric entries.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the mount point cannot be listed. Individual
    /// processes disappearing mid-enumeration are not errors; the stale
    /// handle surfaces [`Error::NotFound`] on first use.
    pub fn all_procs(&self) -> Result<Vec<Proc>> {
        let entries = fs::read_dir(&self.root).map_err(|source| Error::Io {
            path: self.root.clone(),
            source,
        })?;

        let mut procs = Vec::new();
        for entry in entries.flatten() {
            if let Some(pid) = entry
                .file_name()
                .to_str()
                .and_then(|name| name.parse::<i32>().ok())
            {
                procs.push(Proc {
                    pid,
                    dir: entry.path(),
                });
            }
        }

        Ok(procs)
    }

    /// Returns a handle for the given PID.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if the kernel no longer knows the PID.
    pub fn proc(&self, pid: i32) -> Result<Proc> {
        let dir = self.root.join(pid.to_string());
        if !dir.is_dir() {
            return Err(Error::NotFound(pid));
        }
        Ok(Proc { pid, dir })
    }

    /// Returns a handle for the current process, resolved via `self`.
    pub fn self_proc(&self) -> Result<Proc> {
        let link = self.root.join("self");
        let target = fs::read_link(&link).map_err(|source| Error::Io {
            path: link,
            source,
        })?;
        let pid = target
            .file_name()
            .and_then(|name| name.to_str())
            .and_then(|name| name.parse::<i32>().ok())
            .ok_or_else(|| Error::InvalidMountPoint(self.root.clone()))?;
        self.proc(pid)
    }
}

/// A single process under the proc filesystem.
#[derive(Debug, Clone)]
pub struct Proc {
    pid: i32,
    dir: PathBuf,
}

/// Fields parsed from `/proc/<pid>/stat` that the process table cares about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcStat {
    pub pid: i32,
    /// Short command name, without the surrounding parentheses.
    pub comm: String,
    pub state: char,
    pub ppid: i32,
    pub pgrp: i32,
    /// Boot-relative start time in clock ticks; combined with the PID it
    /// forms a stable process identity immune to PID reuse.
    pub starttime: u64,
}

impl Proc {
    pub fn pid(&self) -> i32 {
        self.pid
    }

    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if the process exited, or
    /// [`Error::InvalidStat`] if the stat line does not parse.
    pub fn stat(&self) -> Result<ProcStat> {
        let path = self.dir.join("stat");
        let content = fs::read_to_string(&path)
            .map_err(|source| Error::from_proc_io(self.pid, path, source))?;
        parse_proc_stat(self.pid, &content)
    }

    /// Returns the full command line, NUL-separated arguments joined by
    /// single spaces. Kernel threads yield an empty string.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if the process exited.
    pub fn cmdline(&self) -> Result<String> {
        let path = self.dir.join("cmdline");
        let content = fs::read(&path)
            .map_err(|source| Error::from_proc_io(self.pid, path, source))?;

        let args: Vec<&str> = content
            .split(|&b| b == 0)
            .filter(|part| !part.is_empty())
            .map(|part| std::str::from_utf8(part).unwrap_or(""))
            .collect();

        Ok(args.join(" "))
    }

    /// Reads the namespace map by resolving the `ns/*` symlinks, each of the
    /// form `kind:[inode]`. A missing `ns` directory is not an error; it
    /// yields an empty mapping.
    pub fn namespaces(&self) -> Result<Namespaces> {
        let dir = self.dir.join("ns");
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Namespaces::new());
            }
            Err(source) => return Err(Error::from_proc_io(self.pid, dir, source)),
        };

        let mut namespaces = Namespaces::new();
        for entry in entries.flatten() {
            let target = match fs::read_link(entry.path()) {
                Ok(target) => target,
                // The process can exit between listing and readlink.
                Err(_) => continue,
            };
            if let Some((kind, inode)) = parse_namespace_link(&target) {
                namespaces.insert(kind, inode);
            }
        }

        Ok(namespaces)
    }
}

/// Parses a `kind:[inode]` namespace link target.
fn parse_namespace_link(target: &Path) -> Option<(String, u64)> {
    let target = target.to_str()?;
    let (kind, rest) = target.split_once(':')?;
    let inode = rest.strip_prefix('[')?.strip_suffix(']')?.parse().ok()?;
    Some((kind.to_owned(), inode))
}

/// Parses `/proc/<pid>/stat`. The comm field is delimited by the first `(`
/// and the last `)` because it may itself contain spaces and parentheses.
fn parse_proc_stat(pid: i32, content: &str) -> Result<ProcStat> {
    let invalid = |reason: &str| Error::InvalidStat {
        pid,
        reason: reason.to_owned(),
    };

    let content = content.trim_end();
    let open = content.find('(').ok_or_else(|| invalid("missing '('"))?;
    let close = content.rfind(')').ok_or_else(|| invalid("missing ')'"))?;
    if close <= open {
        return Err(invalid("mismatched parentheses"));
    }

    let stat_pid: i32 = content[..open]
        .trim()
        .parse()
        .map_err(|_| invalid("invalid pid field"))?;
    let comm = content[open + 1..close].to_owned();

    // Fields after the comm field: state ppid pgrp session ... starttime is
    // overall field 22, i.e. index 19 here.
    let fields: Vec<&str> = content[close + 1..].split_whitespace().collect();
    if fields.len() < 20 {
        return Err(invalid("too few fields"));
    }

    Ok(ProcStat {
        pid: stat_pid,
        comm,
        state: fields[0].chars().next().unwrap_or('?'),
        ppid: fields[1].parse().map_err(|_| invalid("invalid ppid"))?,
        pgrp: fields[2].parse().map_err(|_| invalid("invalid pgrp"))?,
        starttime: fields[19]
            .parse()
            .map_err(|_| invalid("invalid starttime"))?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const STAT_LINE: &str = "26231 (vim) R 5392 7446 5392 34835 7446 4218880 \
         32533 309516 26 82 1677 44 158 99 20 0 1 0 82375 56274944 1981 \
         18446744073709551615 4194304 6294284 140736914091744 \
         140736914087944 139965136429984 0 0 12288 1870679807 0 0 0 17 0 0 0 \
         0 0 0 8391624 8481048 16420864";

    #[test]
    fn test_parse_stat() {
        let stat = parse_proc_stat(26231, STAT_LINE).unwrap();

        assert_eq!(stat.pid, 26231);
        assert_eq!(stat.comm, "vim");
        assert_eq!(stat.state, 'R');
        assert_eq!(stat.ppid, 5392);
        assert_eq!(stat.pgrp, 7446);
        assert_eq!(stat.starttime, 82375);
    }

    #[test]
    fn test_parse_stat_comm_with_spaces_and_parens() {
        let line = "42 (tmux: client (1)) S 1 42 42 0 -1 4194304 0 0 0 0 0 0 \
             0 0 20 0 1 0 12345 0 0 18446744073709551615";
        let stat = parse_proc_stat(42, line).unwrap();

        assert_eq!(stat.comm, "tmux: client (1)");
        assert_eq!(stat.ppid, 1);
        assert_eq!(stat.starttime, 12345);
    }

    #[test]
    fn test_parse_stat_invalid() {
        assert!(matches!(
            parse_proc_stat(1, "1 no-parens R 0"),
            Err(Error::InvalidStat { .. })
        ));
        assert!(matches!(
            parse_proc_stat(1, "1 (short) R 0 0"),
            Err(Error::InvalidStat { .. })
        ));
    }

    #[test]
    fn test_parse_namespace_link() {
        assert_eq!(
            parse_namespace_link(Path::new("net:[4026531993]")),
            Some(("net".to_owned(), 4026531993))
        );
        assert_eq!(parse_namespace_link(Path::new("garbage")), None);
    }

    #[test]
    fn test_fixture_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let proc_dir = dir.path().join("26231");
        fs::create_dir_all(proc_dir.join("ns")).unwrap();
        fs::write(proc_dir.join("stat"), STAT_LINE).unwrap();
        fs::write(proc_dir.join("cmdline"), b"vim\0test.go\0+10\0").unwrap();

        let fs = ProcFs::new(dir.path()).unwrap();
        let procs = fs.all_procs().unwrap();
        assert_eq!(procs.len(), 1);

        let proc = fs.proc(26231).unwrap();
        assert_eq!(proc.stat().unwrap().comm, "vim");
        assert_eq!(proc.cmdline().unwrap(), "vim test.go +10");
        assert!(proc.namespaces().unwrap().is_empty());
    }

    #[test]
    fn test_missing_ns_dir_is_empty_map() {
        let dir = tempfile::tempdir().unwrap();
        let proc_dir = dir.path().join("100");
        fs::create_dir_all(&proc_dir).unwrap();

        let fs = ProcFs::new(dir.path()).unwrap();
        let proc = fs.proc(100).unwrap();
        assert!(proc.namespaces().unwrap().is_empty());
    }

    #[test]
    fn test_missing_pid_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let fs = ProcFs::new(dir.path()).unwrap();
        assert!(matches!(fs.proc(9999), Err(Error::NotFound(9999))));
    }
}
