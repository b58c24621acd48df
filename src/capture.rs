//! Process-scoped trace capture.
//!
//! Combines instance state, event enablement, pid scoping and the tracing
//! switch around a spawned child: tracing is scoped to the child's pid for
//! exactly the duration of the child's life. The core invariant is that
//! the prior tracing-on/off state and a clean pid scope are restored on
//! every exit path, including spawn failure and wait errors, which a drop
//! guard enforces.

use crate::error::Error;
use crate::error::Result;
use crate::events::EventController;
use crate::events::EventSelect;
use crate::format::FormatDatabase;
use crate::instance::Instance;
use crate::pid::PidScoping;
use crate::tracefs::TraceFs;
use crate::tracer::TracerController;
use std::sync::Arc;

/// A running child the engine waits on.
pub trait ChildProcess {
    fn pid(&self) -> u32;
    /// Block until the child exits; returns its exit status.
    fn wait(&mut self) -> Result<i32>;
}

/// Creates child processes. Injected so tests can simulate spawn failure.
pub trait Spawner {
    type Child: ChildProcess;

    /// Execute `argv[0]` directly with the remaining arguments.
    fn spawn(&self, argv: &[String]) -> Result<Self::Child>;

    /// Run a command line through the shell.
    fn spawn_shell(&self, command: &str) -> Result<Self::Child>;
}

/// The real spawner, backed by [`std::process::Command`].
#[derive(Debug, Default, Clone, Copy)]
pub struct SysSpawner;

pub struct SysChild(std::process::Child);

impl ChildProcess for SysChild {
    fn pid(&self) -> u32 {
        self.0.id()
    }

    fn wait(&mut self) -> Result<i32> {
        let status = self
            .0
            .wait()
            .map_err(|err| Error::Spawn(format!("wait: {err}")))?;
        Ok(exit_code(status))
    }
}

fn exit_code(status: std::process::ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status
        .code()
        .unwrap_or_else(|| 128 + status.signal().unwrap_or(0))
}

impl Spawner for SysSpawner {
    type Child = SysChild;

    fn spawn(&self, argv: &[String]) -> Result<SysChild> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| Error::Spawn("empty argv".into()))?;
        let child = std::process::Command::new(program)
            .args(args)
            .spawn()
            .map_err(|err| Error::Spawn(format!("{program}: {err}")))?;
        Ok(SysChild(child))
    }

    fn spawn_shell(&self, command: &str) -> Result<SysChild> {
        let child = std::process::Command::new("/bin/sh")
            .arg("-c")
            .arg(command)
            .spawn()
            .map_err(|err| Error::Spawn(format!("sh -c {command:?}: {err}")))?;
        Ok(SysChild(child))
    }
}

/// Which events to enable before the child starts.
#[derive(Debug, Clone, Copy)]
pub struct EventSelection<'a> {
    /// `None` means every system.
    pub system: Option<&'a str>,
    pub events: EventSelect<'a>,
}

/// Spawns a child under trace and guarantees scope cleanup.
pub struct CaptureEngine<F: TraceFs, S: Spawner> {
    tracer: TracerController<F>,
    events: EventController<F>,
    pids: PidScoping<F>,
    spawner: S,
}

enum Target<'a> {
    Argv(&'a [String]),
    Shell(&'a str),
}

impl<F: TraceFs, S: Spawner> CaptureEngine<F, S> {
    pub fn new(fs: Arc<F>, db: Arc<FormatDatabase>, spawner: S) -> Self {
        Self {
            tracer: TracerController::new(Arc::clone(&fs)),
            events: EventController::new(Arc::clone(&fs), db),
            pids: PidScoping::new(fs),
            spawner,
        }
    }

    /// Run `argv` under trace in the given instance and return its exit
    /// status. The child's own nonzero exit is a result, not an error.
    pub fn trace_process(
        &self,
        instance: &Instance,
        argv: &[String],
        selection: Option<EventSelection<'_>>,
    ) -> Result<i32> {
        self.run(instance, Target::Argv(argv), selection)
    }

    /// Like [`trace_process`], but the command line runs through a shell.
    ///
    /// [`trace_process`]: CaptureEngine::trace_process
    pub fn trace_shell_process(
        &self,
        instance: &Instance,
        command: &str,
        selection: Option<EventSelection<'_>>,
    ) -> Result<i32> {
        self.run(instance, Target::Shell(command), selection)
    }

    fn run(
        &self,
        instance: &Instance,
        target: Target<'_>,
        selection: Option<EventSelection<'_>>,
    ) -> Result<i32> {
        if let Some(selection) = selection {
            self.events
                .enable(instance, selection.system, selection.events)?;
        }
        let prior_on = self.tracer.is_tracing_on(instance)?;
        let mut child = match target {
            Target::Argv(argv) => self.spawner.spawn(argv),
            Target::Shell(command) => self.spawner.spawn_shell(command),
        }?;
        // From here on, restoration must happen no matter how we leave.
        let _guard = ScopeGuard {
            tracer: &self.tracer,
            pids: &self.pids,
            instance,
            prior_on,
        };
        self.pids.hook_to_pid(instance, child.pid())?;
        self.tracer.trace_on(instance)?;
        log::debug!("tracing pid {} until it exits", child.pid());
        child.wait()
    }
}

/// Restores the tracing switch and clears the pid scope on drop.
struct ScopeGuard<'a, F: TraceFs> {
    tracer: &'a TracerController<F>,
    pids: &'a PidScoping<F>,
    instance: &'a Instance,
    prior_on: bool,
}

impl<F: TraceFs> Drop for ScopeGuard<'_, F> {
    fn drop(&mut self) {
        let restore = if self.prior_on {
            self.tracer.trace_on(self.instance)
        } else {
            self.tracer.trace_off(self.instance)
        };
        if let Err(err) = restore {
            log::warn!("failed to restore tracing switch: {err}");
        }
        if let Err(err) = self.pids.clear(self.instance) {
            log::warn!("failed to clear pid scope: {err}");
        }
    }
}
