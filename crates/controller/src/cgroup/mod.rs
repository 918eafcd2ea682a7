//! Access to the cgroup CPU controller files
//!
//! Two layouts are supported: the legacy v1 hierarchy (`cpuacct.usage`,
//! `cpu.cfs_quota_us`, `cpu.cfs_period_us`) and the unified v2 hierarchy
//! (`cpu.stat`, `cpu.max`). All values are microseconds except the v1 usage
//! counter, which is in nanoseconds.

use std::fs;
use std::io;
use std::path::Path;
use std::path::PathBuf;

use error_stack::Report;
use error_stack::ResultExt;
use serde::Serialize;

use crate::ControllerError;
use crate::Result;

pub mod enforcement;
pub mod telemetry;

pub use enforcement::{CgroupEnforcer, DryRunEnforcer, Enforced, EnforcementSink};
pub use telemetry::{Sample, TelemetrySource};

const V1_USAGE: &str = "cpuacct.usage";
const V1_QUOTA: &str = "cpu.cfs_quota_us";
const V1_PERIOD: &str = "cpu.cfs_period_us";
const V2_STAT: &str = "cpu.stat";
const V2_MAX: &str = "cpu.max";

/// Written to `cpu.max` in place of a quota to remove the limit.
const V2_UNLIMITED: &str = "max";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CgroupLayout {
    V1,
    V2,
}

/// Quota and period as read from a control directory. A negative quota means
/// the entity is not limited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Bandwidth {
    pub quota: i64,
    pub period: u64,
}

impl CgroupLayout {
    /// The unified hierarchy exposes `cgroup.controllers` at its root.
    pub fn detect(root: &Path) -> Self {
        if root.join("cgroup.controllers").exists() {
            Self::V2
        } else {
            Self::V1
        }
    }

    /// Directory under which libvirt places the VM scopes.
    pub fn machine_slice(&self, root: &Path) -> PathBuf {
        match self {
            Self::V1 => root.join("cpu").join("machine.slice"),
            Self::V2 => root.join("machine.slice"),
        }
    }

    /// Control directory of one vCPU inside a VM scope.
    pub fn vcpu_dir(&self, vm_dir: &Path, index: u64) -> PathBuf {
        let name = format!("vcpu{index}");
        match self {
            Self::V1 => vm_dir.join(name),
            Self::V2 => vm_dir.join("libvirt").join(name),
        }
    }

    /// Directory holding the `vcpuN` children of a VM scope.
    pub fn vcpu_parent(&self, vm_dir: &Path) -> PathBuf {
        match self {
            Self::V1 => vm_dir.to_path_buf(),
            Self::V2 => vm_dir.join("libvirt"),
        }
    }

    /// Cumulative CPU time consumed by the group, in microseconds.
    ///
    /// `Ok(None)` when the counter file does not exist.
    pub fn read_usage(&self, dir: &Path) -> Result<Option<u64>, ControllerError> {
        match self {
            Self::V1 => {
                let path = dir.join(V1_USAGE);
                let Some(raw) = read_trimmed(&path)? else {
                    return Ok(None);
                };
                let nanos = parse_number::<u64>(&path, &raw)?;
                Ok(Some(nanos / 1000))
            }
            Self::V2 => {
                let path = dir.join(V2_STAT);
                let Some(raw) = read_trimmed(&path)? else {
                    return Ok(None);
                };
                let value = raw
                    .lines()
                    .find_map(|line| line.strip_prefix("usage_usec "))
                    .ok_or_else(|| {
                        Report::new(ControllerError::io(&path))
                            .attach_printable("usage_usec entry missing")
                    })?;
                parse_number::<u64>(&path, value).map(Some)
            }
        }
    }

    /// Currently enforced quota and period; `Ok(None)` when the files are absent.
    pub fn read_bandwidth(&self, dir: &Path) -> Result<Option<Bandwidth>, ControllerError> {
        match self {
            Self::V1 => {
                let quota_path = dir.join(V1_QUOTA);
                let period_path = dir.join(V1_PERIOD);
                let (Some(quota), Some(period)) =
                    (read_trimmed(&quota_path)?, read_trimmed(&period_path)?)
                else {
                    return Ok(None);
                };
                Ok(Some(Bandwidth {
                    quota: parse_number(&quota_path, &quota)?,
                    period: parse_number(&period_path, &period)?,
                }))
            }
            Self::V2 => {
                let path = dir.join(V2_MAX);
                let Some(raw) = read_trimmed(&path)? else {
                    return Ok(None);
                };
                let mut parts = raw.split_whitespace();
                let (Some(quota), Some(period)) = (parts.next(), parts.next()) else {
                    return Err(Report::new(ControllerError::io(&path))
                        .attach_printable(format!("unexpected content '{raw}'")));
                };
                let quota = if quota == V2_UNLIMITED {
                    -1
                } else {
                    parse_number(&path, quota)?
                };
                Ok(Some(Bandwidth {
                    quota,
                    period: parse_number(&path, period)?,
                }))
            }
        }
    }

    /// Writes a quota, or removes the limit when `quota` is `None`.
    ///
    /// Returns `Ok(false)` without creating anything when the control file is
    /// missing.
    pub fn write_bandwidth(
        &self,
        dir: &Path,
        quota: Option<u64>,
        period: u64,
    ) -> Result<bool, ControllerError> {
        match self {
            Self::V1 => {
                let value = quota.map_or_else(|| "-1".to_string(), |q| q.to_string());
                write_existing(&dir.join(V1_QUOTA), &value)
            }
            Self::V2 => {
                let value = match quota {
                    Some(q) => format!("{q} {period}"),
                    None => format!("{V2_UNLIMITED} {period}"),
                };
                write_existing(&dir.join(V2_MAX), &value)
            }
        }
    }
}

/// Reads a control file; `Ok(None)` when it does not exist.
fn read_trimmed(path: &Path) -> Result<Option<String>, ControllerError> {
    match fs::read_to_string(path) {
        Ok(content) => Ok(Some(content.trim().to_string())),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(Report::new(e).change_context(ControllerError::io(path))),
    }
}

/// Overwrites an existing control file, never creating it.
fn write_existing(path: &Path, value: &str) -> Result<bool, ControllerError> {
    use std::io::Write;

    let file = fs::OpenOptions::new().write(true).truncate(true).open(path);
    let mut file = match file {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(Report::new(e).change_context(ControllerError::io(path))),
    };
    file.write_all(value.as_bytes())
        .change_context(ControllerError::io(path))
        .attach_printable_lazy(|| format!("failed to write '{value}'"))?;
    Ok(true)
}

fn parse_number<T>(path: &Path, raw: &str) -> Result<T, ControllerError>
where
    T: std::str::FromStr,
    T::Err: core::error::Error + Send + Sync + 'static,
{
    raw.trim()
        .parse::<T>()
        .change_context(ControllerError::io(path))
        .attach_printable_lazy(|| format!("not a number: '{raw}'"))
}

#[cfg(test)]
pub(crate) mod testing {
    use std::fs;
    use std::path::Path;

    /// Populates a fake v1 control directory.
    pub fn write_v1(dir: &Path, usage_ns: u64, quota: i64, period: u64) {
        fs::create_dir_all(dir).unwrap();
        fs::write(dir.join("cpuacct.usage"), format!("{usage_ns}\n")).unwrap();
        fs::write(dir.join("cpu.cfs_quota_us"), format!("{quota}\n")).unwrap();
        fs::write(dir.join("cpu.cfs_period_us"), format!("{period}\n")).unwrap();
    }

    /// Populates a fake v2 control directory; `quota == None` writes `max`.
    pub fn write_v2(dir: &Path, usage_us: u64, quota: Option<u64>, period: u64) {
        fs::create_dir_all(dir).unwrap();
        fs::write(
            dir.join("cpu.stat"),
            format!("usage_usec {usage_us}\nuser_usec 0\nsystem_usec 0\n"),
        )
        .unwrap();
        let max = quota.map_or_else(|| "max".to_string(), |q| q.to_string());
        fs::write(dir.join("cpu.max"), format!("{max} {period}\n")).unwrap();
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::testing::*;
    use super::*;

    #[test]
    fn detects_unified_hierarchy() {
        let root = tempfile::tempdir().unwrap();
        assert_eq!(CgroupLayout::detect(root.path()), CgroupLayout::V1);

        fs::write(root.path().join("cgroup.controllers"), "cpu memory\n").unwrap();
        assert_eq!(CgroupLayout::detect(root.path()), CgroupLayout::V2);
    }

    #[test]
    fn layout_paths() {
        let root = Path::new("/sys/fs/cgroup");
        assert_eq!(
            CgroupLayout::V1.machine_slice(root),
            PathBuf::from("/sys/fs/cgroup/cpu/machine.slice")
        );
        assert_eq!(
            CgroupLayout::V2.vcpu_dir(Path::new("/vm"), 3),
            PathBuf::from("/vm/libvirt/vcpu3")
        );
        assert_eq!(
            CgroupLayout::V1.vcpu_dir(Path::new("/vm"), 0),
            PathBuf::from("/vm/vcpu0")
        );
    }

    #[test]
    fn reads_v1_files() {
        let dir = tempfile::tempdir().unwrap();
        write_v1(dir.path(), 5_000_000, 50_000, 100_000);

        let layout = CgroupLayout::V1;
        assert_eq!(layout.read_usage(dir.path()).unwrap(), Some(5_000));
        assert_eq!(
            layout.read_bandwidth(dir.path()).unwrap(),
            Some(Bandwidth {
                quota: 50_000,
                period: 100_000
            })
        );
    }

    #[test]
    fn reads_v2_files() {
        let dir = tempfile::tempdir().unwrap();
        write_v2(dir.path(), 1234, None, 100_000);

        let layout = CgroupLayout::V2;
        assert_eq!(layout.read_usage(dir.path()).unwrap(), Some(1234));
        assert_eq!(
            layout.read_bandwidth(dir.path()).unwrap(),
            Some(Bandwidth {
                quota: -1,
                period: 100_000
            })
        );
    }

    #[test]
    fn missing_files_are_not_errors() {
        let dir = tempfile::tempdir().unwrap();
        for layout in [CgroupLayout::V1, CgroupLayout::V2] {
            assert_eq!(layout.read_usage(dir.path()).unwrap(), None);
            assert_eq!(layout.read_bandwidth(dir.path()).unwrap(), None);
            assert!(!layout.write_bandwidth(dir.path(), Some(10), 100).unwrap());
        }
        assert!(!dir.path().join("cpu.max").exists());
        assert!(!dir.path().join("cpu.cfs_quota_us").exists());
    }

    #[test]
    fn garbage_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("cpu.max"), "lots\n").unwrap();
        let err = CgroupLayout::V2.read_bandwidth(dir.path()).unwrap_err();
        assert!(matches!(err.current_context(), ControllerError::Io { .. }));
    }

    #[test]
    fn writes_quota_and_sentinel() {
        let dir = tempfile::tempdir().unwrap();
        write_v2(dir.path(), 0, None, 10_000);
        assert!(CgroupLayout::V2
            .write_bandwidth(dir.path(), Some(2_500), 10_000)
            .unwrap());
        assert_eq!(
            fs::read_to_string(dir.path().join("cpu.max")).unwrap(),
            "2500 10000"
        );

        write_v1(dir.path(), 0, 5_000, 10_000);
        assert!(CgroupLayout::V1
            .write_bandwidth(dir.path(), None, 10_000)
            .unwrap());
        assert_eq!(
            fs::read_to_string(dir.path().join("cpu.cfs_quota_us")).unwrap(),
            "-1"
        );
    }
}
