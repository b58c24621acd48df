//! Restricting tracing to a set of processes.
//!
//! `set_event_pid` and `set_ftrace_pid` are independent scoping knobs over
//! the same instance; writes fully replace earlier scope, never merge.

use crate::error::Error;
use crate::error::Result;
use crate::instance::Instance;
use crate::tracefs::TraceFs;
use std::sync::Arc;

/// A pid scope write: clear the restriction, match no pid, or restrict to
/// exactly the given set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PidScope {
    /// Trace every pid (clears the restriction).
    AllPids,
    /// Trace no pid at all under this scope.
    NoPids,
    /// Trace exactly these pids.
    Pids(Vec<u32>),
}

impl PidScope {
    fn render(&self) -> Result<String> {
        match self {
            Self::AllPids => Ok(String::new()),
            // No real pid is ever -1, so the scope matches nothing.
            Self::NoPids => Ok("-1".to_string()),
            Self::Pids(pids) => {
                if pids.is_empty() {
                    return Err(Error::InvalidArgument(
                        "empty pid set; use NoPids or AllPids".into(),
                    ));
                }
                let rendered: Vec<String> = pids.iter().map(u32::to_string).collect();
                Ok(rendered.join(" "))
            }
        }
    }
}

/// Writes the pid scoping control files of an instance.
pub struct PidScoping<F: TraceFs> {
    fs: Arc<F>,
}

impl<F: TraceFs> PidScoping<F> {
    pub fn new(fs: Arc<F>) -> Self {
        Self { fs }
    }

    /// Scope event tracing to the given pids.
    pub fn set_event_pid(&self, instance: &Instance, scope: &PidScope) -> Result<()> {
        self.fs
            .write(instance.name(), "set_event_pid", &scope.render()?)
    }

    /// Scope function tracers to the given pids.
    pub fn set_ftrace_pid(&self, instance: &Instance, scope: &PidScope) -> Result<()> {
        self.fs
            .write(instance.name(), "set_ftrace_pid", &scope.render()?)
    }

    /// Restrict all tracing in the instance to one pid and its descendants.
    ///
    /// Sets both scoping knobs and turns on the fork-follow options where
    /// the kernel offers them, so children of the pid stay in scope.
    pub fn hook_to_pid(&self, instance: &Instance, pid: u32) -> Result<()> {
        let scope = PidScope::Pids(vec![pid]);
        self.set_event_pid(instance, &scope)?;
        self.set_ftrace_pid(instance, &scope)?;
        for option in ["event-fork", "function-fork"] {
            let file = format!("options/{option}");
            if self.fs.exists(instance.name(), &file) {
                self.fs.write(instance.name(), &file, "1")?;
            } else {
                log::debug!("option {option:?} not offered by this kernel, skipping");
            }
        }
        Ok(())
    }

    /// Drop any pid scope from both knobs.
    pub fn clear(&self, instance: &Instance) -> Result<()> {
        self.set_event_pid(instance, &PidScope::AllPids)?;
        self.set_ftrace_pid(instance, &PidScope::AllPids)
    }
}
