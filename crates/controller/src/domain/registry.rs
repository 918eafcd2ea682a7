//! Registered VMs and their cgroup entities
//!
//! The registry maps every managed VM to its libvirt scope directory. Scopes
//! are looked up lazily: a VM registered before it has booted stays
//! unresolved, and is searched for again on each call to
//! [`EntityProvider::entities`] until its directory shows up.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::RwLock;

use error_stack::Report;
use error_stack::ResultExt;
use market::CYCLES_PER_CPU;
use serde::Serialize;

use crate::cgroup::CgroupLayout;
use crate::config::Granularity;
use crate::config::VmSpec;
use crate::ControllerError;
use crate::Result;

pub type SharedRegistry = Arc<CgroupRegistry>;

/// Scopes are never nested deeper than this below the machine slice.
const MAX_SEARCH_DEPTH: usize = 6;

/// One schedulable unit handed to the tick loop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EntityDescriptor {
    /// `<vm>` or `<vm>/vcpuN`
    pub id: String,
    pub vm: String,
    pub nominal_frequency_mhz: u64,
    pub max_capacity: u64,
    pub control_path: PathBuf,
}

/// Source of the entities the market trades with.
pub trait EntityProvider: Send + Sync {
    /// Current entity set; implementations may refresh cached lookups.
    fn entities(&self) -> Vec<EntityDescriptor>;
}

#[derive(Debug, Clone)]
struct VmRecord {
    spec: VmSpec,
    scope: Option<PathBuf>,
}

impl VmRecord {
    /// Unresolved, or resolved to a scope that has since disappeared.
    fn needs_lookup(&self) -> bool {
        self.scope.as_deref().map_or(true, |scope| !scope.exists())
    }
}

/// A registered VM as exposed to observers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VmEntry {
    #[serde(flatten)]
    pub spec: VmSpec,
    pub scope: Option<PathBuf>,
}

/// Registered VMs, shared between the tick loop and the API.
///
/// The record map sits behind its own lock, held only to copy records in
/// or out. Filesystem walks and reads happen with the lock released.
#[derive(Debug)]
pub struct CgroupRegistry {
    root: PathBuf,
    layout: CgroupLayout,
    granularity: Granularity,
    vms: RwLock<BTreeMap<String, VmRecord>>,
}

impl CgroupRegistry {
    /// Creates an empty registry, detecting the hierarchy layout under `root`.
    pub fn new(root: impl Into<PathBuf>, granularity: Granularity) -> Self {
        let root = root.into();
        let layout = CgroupLayout::detect(&root);
        tracing::info!(root = %root.display(), layout = ?layout, "cgroup hierarchy detected");
        Self::with_layout(root, layout, granularity)
    }

    pub fn with_layout(
        root: impl Into<PathBuf>,
        layout: CgroupLayout,
        granularity: Granularity,
    ) -> Self {
        Self {
            root: root.into(),
            layout,
            granularity,
            vms: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn layout(&self) -> CgroupLayout {
        self.layout
    }

    pub fn register(&self, spec: VmSpec) -> Result<(), ControllerError> {
        spec.validate()?;
        let mut vms = self.vms.write().expect("poisoned");
        if vms.contains_key(&spec.name) {
            return Err(Report::new(ControllerError::discovery(format!(
                "vm '{}' is already registered",
                spec.name
            ))));
        }

        tracing::info!(vm = %spec.name, frequency = spec.frequency, "vm registered");
        vms.insert(spec.name.clone(), VmRecord { spec, scope: None });
        Ok(())
    }

    /// Returns whether the VM was registered.
    pub fn unregister(&self, name: &str) -> bool {
        let removed = self.vms.write().expect("poisoned").remove(name).is_some();
        if removed {
            tracing::info!(vm = %name, "vm unregistered");
        }
        removed
    }

    pub fn contains(&self, name: &str) -> bool {
        self.vms.read().expect("poisoned").contains_key(name)
    }

    pub fn vms(&self) -> Vec<VmEntry> {
        self.vms
            .read()
            .expect("poisoned")
            .values()
            .map(|record| VmEntry {
                spec: record.spec.clone(),
                scope: record.scope.clone(),
            })
            .collect()
    }

    /// Searches for the scope of every VM that is unresolved or whose scope
    /// vanished, e.g. after a restart under a new domain id.
    fn resolve(&self) {
        let pending: Vec<VmRecord> = self
            .vms
            .read()
            .expect("poisoned")
            .values()
            .filter(|record| record.needs_lookup())
            .cloned()
            .collect();
        if pending.is_empty() {
            return;
        }

        let slice = self.layout.machine_slice(&self.root);
        let mut found = Vec::new();
        for record in pending {
            let name = &record.spec.name;
            match find_scope(&slice, name) {
                Ok(Some(scope)) => {
                    tracing::info!(vm = %name, scope = %scope.display(), "cgroup scope found");
                    found.push((record, Some(scope)));
                }
                Ok(None) if record.scope.is_some() => {
                    tracing::info!(vm = %name, "cgroup scope vanished");
                    found.push((record, None));
                }
                Ok(None) => {
                    tracing::debug!(vm = %name, "cgroup scope not found yet");
                }
                Err(e) => {
                    tracing::warn!(vm = %name, "cgroup search failed: {e:?}");
                }
            }
        }

        let mut vms = self.vms.write().expect("poisoned");
        for (searched, scope) in found {
            // Skip records unregistered or re-registered during the search
            if let Some(record) = vms.get_mut(&searched.spec.name) {
                if record.spec == searched.spec && record.scope == searched.scope {
                    record.scope = scope;
                }
            }
        }
    }

    fn vcpu_count(&self, record: &VmRecord) -> u64 {
        if let Some(vcpus) = record.spec.vcpus {
            return vcpus;
        }
        record
            .scope
            .as_deref()
            .map(|scope| count_vcpus(&self.layout.vcpu_parent(scope)))
            .filter(|count| *count > 0)
            .unwrap_or(1)
    }

    fn describe(&self, record: &VmRecord) -> Vec<EntityDescriptor> {
        let name = &record.spec.name;
        // An unresolved VM points at a directory that does not exist, so it is
        // traded as unobserved.
        let scope = record
            .scope
            .clone()
            .unwrap_or_else(|| self.layout.machine_slice(&self.root).join(name));
        let vcpus = self.vcpu_count(record);

        match self.granularity {
            Granularity::Vm => vec![EntityDescriptor {
                id: name.clone(),
                vm: name.clone(),
                nominal_frequency_mhz: record.spec.frequency,
                max_capacity: vcpus * CYCLES_PER_CPU,
                control_path: scope,
            }],
            Granularity::Vcpu => (0..vcpus)
                .map(|index| EntityDescriptor {
                    id: format!("{name}/vcpu{index}"),
                    vm: name.clone(),
                    nominal_frequency_mhz: record.spec.frequency,
                    max_capacity: CYCLES_PER_CPU,
                    control_path: self.layout.vcpu_dir(&scope, index),
                })
                .collect(),
        }
    }
}

impl EntityProvider for CgroupRegistry {
    fn entities(&self) -> Vec<EntityDescriptor> {
        self.resolve();
        let records: Vec<VmRecord> = self.vms.read().expect("poisoned").values().cloned().collect();
        records
            .iter()
            .flat_map(|record| self.describe(record))
            .collect()
    }
}

/// Whether a cgroup directory name belongs to the VM `name`.
///
/// libvirt names scopes `machine-<driver>-<id>-<name>.scope` with `-`
/// escaped as `\x2d` under systemd, e.g. `machine-qemu\x2d3\x2dvm\x2da.scope`
/// for `vm-a`. Any other directory matches only by its exact name.
fn matches_scope(dir_name: &str, name: &str) -> bool {
    if dir_name == name {
        return true;
    }
    let Some(stem) = dir_name.strip_suffix(".scope") else {
        return false;
    };
    let unescaped = stem.replace("\\x2d", "-");
    let Some(rest) = unescaped.strip_prefix("machine-") else {
        return unescaped == name;
    };

    let mut parts = rest.splitn(3, '-');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(driver), Some(id), Some(vm)) => {
            !driver.is_empty()
                && !id.is_empty()
                && id.bytes().all(|b| b.is_ascii_digit())
                && vm == name
        }
        _ => false,
    }
}

/// Depth-first search for the scope of `name` below `slice`, in name order.
fn find_scope(slice: &Path, name: &str) -> Result<Option<PathBuf>, ControllerError> {
    fn walk(dir: &Path, name: &str, depth: usize) -> Result<Option<PathBuf>, ControllerError> {
        if depth > MAX_SEARCH_DEPTH {
            return Ok(None);
        }

        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(Report::new(e)
                    .change_context(ControllerError::discovery("cannot list cgroup directory"))
                    .attach_printable(dir.display().to_string()))
            }
        };

        let mut children = Vec::new();
        for entry in entries {
            let entry = entry
                .change_context(ControllerError::discovery("cannot read directory entry"))?;
            if entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                children.push(entry.path());
            }
        }
        children.sort();

        for child in &children {
            let matched = child
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| matches_scope(n, name));
            if matched {
                return Ok(Some(child.clone()));
            }
        }
        for child in &children {
            if let Some(found) = walk(child, name, depth + 1)? {
                return Ok(Some(found));
            }
        }
        Ok(None)
    }

    walk(slice, name, 0)
}

/// Number of `vcpuN` directories in `dir`.
fn count_vcpus(dir: &Path) -> u64 {
    let Ok(entries) = fs::read_dir(dir) else {
        return 0;
    };
    entries
        .filter_map(|entry| entry.ok())
        .filter(|entry| {
            entry
                .file_name()
                .to_str()
                .and_then(|n| n.strip_prefix("vcpu"))
                .is_some_and(|index| !index.is_empty() && index.bytes().all(|b| b.is_ascii_digit()))
        })
        .count() as u64
}
