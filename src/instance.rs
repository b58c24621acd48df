//! Tracing instance lifecycle.
//!
//! An instance is an isolated copy of the tracing state (its own tracer
//! selection, event enables, options, pid filter and ring buffer) living
//! under `instances/<name>`. The empty/default name denotes the top-level
//! instance, which always exists and cannot be destroyed.

use crate::error::Error;
use crate::error::Result;
use crate::tracefs::TraceFs;
use compact_str::CompactString;
use std::cell::RefCell;
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;

/// A cheap handle naming a tracing instance. All state lives kernel-side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instance {
    name: Option<CompactString>,
}

impl Instance {
    /// The top-level (default) instance.
    pub fn top_level() -> Self {
        Self { name: None }
    }

    pub(crate) fn named(name: &str) -> Self {
        Self {
            name: Some(name.into()),
        }
    }

    /// `None` for the top-level instance.
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }
}

fn valid_name(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

/// Creates, looks up and destroys tracing instances.
///
/// Keeps a registry of the instances it created so [`destroy_all`] can
/// reclaim exactly those at teardown; instances pre-existing on the
/// filesystem are visible through [`list`]/[`get`] but never reclaimed.
///
/// [`destroy_all`]: InstanceManager::destroy_all
/// [`list`]: InstanceManager::list
/// [`get`]: InstanceManager::get
pub struct InstanceManager<F: TraceFs> {
    fs: Arc<F>,
    owned: RefCell<BTreeSet<CompactString>>,
}

impl<F: TraceFs> InstanceManager<F> {
    pub fn new(fs: Arc<F>) -> Self {
        Self {
            fs,
            owned: RefCell::new(BTreeSet::new()),
        }
    }

    /// Create a new instance directory and return a handle to it.
    pub fn create(&self, name: &str) -> Result<Instance> {
        if !valid_name(name) {
            return Err(Error::InvalidArgument(format!(
                "invalid instance name {name:?}"
            )));
        }
        if self.fs.exists(Some(name), "") {
            return Err(Error::AlreadyExists(format!("instance {name:?}")));
        }
        self.fs.make_instance(name)?;
        self.owned.borrow_mut().insert(name.into());
        log::debug!("created tracing instance {name:?}");
        Ok(Instance::named(name))
    }

    /// Look up a live instance by name.
    pub fn get(&self, name: &str) -> Result<Instance> {
        if self.fs.exists(Some(name), "") {
            Ok(Instance::named(name))
        } else {
            Err(Error::NotFound(format!("instance {name:?}")))
        }
    }

    /// Names of all live instances, including ones created elsewhere.
    pub fn list(&self) -> Result<Vec<CompactString>> {
        match self.fs.list_dir(None, "instances") {
            Ok(names) => Ok(names.into_iter().map(CompactString::from).collect()),
            // No instances directory entries yet.
            Err(Error::Io(err)) if err.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(err) => Err(err),
        }
    }

    /// Destroy an instance. The top-level instance cannot be destroyed.
    pub fn destroy(&self, name: &str) -> Result<()> {
        if name.is_empty() {
            return Err(Error::InvalidArgument(
                "the top-level instance cannot be destroyed".into(),
            ));
        }
        if !self.fs.exists(Some(name), "") {
            return Err(Error::NotFound(format!("instance {name:?}")));
        }
        self.fs.remove_instance(name)?;
        self.owned.borrow_mut().remove(name);
        log::debug!("destroyed tracing instance {name:?}");
        Ok(())
    }

    /// Destroy every instance this manager created. Instances already gone
    /// are skipped, so teardown is safe to repeat.
    pub fn destroy_all(&self) -> Result<()> {
        let owned: Vec<CompactString> = self.owned.borrow().iter().cloned().collect();
        for name in owned {
            match self.destroy(&name) {
                Ok(()) | Err(Error::NotFound(_)) => {
                    self.owned.borrow_mut().remove(&name);
                }
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    /// Absolute path of the tracefs mount.
    pub fn top_level_dir(&self) -> PathBuf {
        self.fs.top_dir()
    }

    /// Absolute path of a live instance's directory.
    pub fn instance_dir(&self, name: &str) -> Result<PathBuf> {
        if self.fs.exists(Some(name), "") {
            Ok(self.fs.instance_dir(name))
        } else {
            Err(Error::NotFound(format!("instance {name:?}")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracefs::mem::MemTraceFs;

    fn manager() -> InstanceManager<MemTraceFs> {
        InstanceManager::new(Arc::new(MemTraceFs::new()))
    }

    #[test]
    fn test_create_then_get() {
        let mgr = manager();
        let inst = mgr.create("melange").unwrap();
        assert_eq!(inst.name(), Some("melange"));
        assert_eq!(mgr.get("melange").unwrap(), inst);
        assert_eq!(mgr.list().unwrap(), vec!["melange"]);
        assert!(
            mgr.instance_dir("melange")
                .unwrap()
                .ends_with("instances/melange")
        );
    }

    #[test]
    fn test_create_rejects_bad_names() {
        let mgr = manager();
        for name in ["", "..", "a/b", "a b", "x\n"] {
            assert!(matches!(
                mgr.create(name),
                Err(Error::InvalidArgument(_))
            ));
        }
    }

    #[test]
    fn test_create_collision() {
        let mgr = manager();
        mgr.create("dup").unwrap();
        assert!(matches!(mgr.create("dup"), Err(Error::AlreadyExists(_))));
    }

    #[test]
    fn test_destroy_then_get_fails() {
        let mgr = manager();
        mgr.create("gone").unwrap();
        mgr.destroy("gone").unwrap();
        assert!(matches!(mgr.get("gone"), Err(Error::NotFound(_))));
        assert!(matches!(mgr.destroy("gone"), Err(Error::NotFound(_))));
    }

    #[test]
    fn test_top_level_not_destroyable() {
        let mgr = manager();
        assert!(matches!(mgr.destroy(""), Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn test_destroy_all_skips_foreign_instances() {
        let fs = Arc::new(MemTraceFs::new());
        fs.make_instance("preexisting").unwrap();
        let mgr = InstanceManager::new(Arc::clone(&fs));
        mgr.create("mine").unwrap();
        assert_eq!(mgr.list().unwrap(), vec!["mine", "preexisting"]);
        mgr.destroy_all().unwrap();
        assert_eq!(mgr.list().unwrap(), vec!["preexisting"]);
        // Repeating teardown is a no-op.
        mgr.destroy_all().unwrap();
    }
}
