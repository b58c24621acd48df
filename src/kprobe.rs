//! Dynamic kprobe and kretprobe management.
//!
//! Probes are defined by appending to the `kprobe_events` control file and
//! then behave like ordinary events in the `kprobes` system, so enable and
//! filter plumbing reuses the event controller's writers. The manager keeps
//! its own registry of definitions but treats `kprobe_events` as the source
//! of truth: probes defined outside the registry still surface in
//! [`list`](KprobeManager::list), so a crashed session cannot orphan them
//! invisibly.

use crate::error::Error;
use crate::error::Result;
use crate::events::EventController;
use crate::events::validate_filter;
use crate::instance::Instance;
use crate::tracefs::TraceFs;
use compact_str::CompactString;
use compact_str::format_compact;
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::sync::Arc;

/// The event system dynamic probes land in.
const KPROBE_SYSTEM: &str = "kprobes";

/// Fields every event carries; legal in probe filters alongside the
/// probe's own argument bindings.
const COMMON_FIELDS: &[&str] = &[
    "common_type",
    "common_flags",
    "common_preempt_count",
    "common_pid",
];

/// Whether a probe fires on function entry or return.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeKind {
    Entry,
    Return,
}

impl ProbeKind {
    fn prefix(self) -> char {
        match self {
            Self::Entry => 'p',
            Self::Return => 'r',
        }
    }
}

/// A registered dynamic probe.
#[derive(Debug, Clone)]
pub struct Probe {
    /// User-assigned name, unique among live probes.
    pub name: CompactString,
    pub kind: ProbeKind,
    /// Target symbol (optionally `+offset`) or `@address`.
    pub target: CompactString,
    /// Argument-format string mapping probe-time values to named fields.
    pub args: String,
    /// Attached filter expression, if any.
    pub filter: Option<String>,
}

/// Registers, enables and filters dynamic probes.
pub struct KprobeManager<F: TraceFs> {
    fs: Arc<F>,
    events: EventController<F>,
    registry: RefCell<BTreeMap<CompactString, Probe>>,
}

impl<F: TraceFs> KprobeManager<F> {
    pub fn new(fs: Arc<F>, events: EventController<F>) -> Self {
        Self {
            fs,
            events,
            registry: RefCell::new(BTreeMap::new()),
        }
    }

    /// Define a probe in the kernel and index it.
    ///
    /// Everything checkable locally is validated first: the name, the
    /// argument-format string, the kind/target combination and the filter
    /// vocabulary. The kernel still has the last word: an unresolvable
    /// symbol fails with `RejectedByKernel` and nothing is registered.
    pub fn register(
        &self,
        name: &str,
        kind: ProbeKind,
        target: &str,
        args: &str,
        filter: Option<&str>,
    ) -> Result<()> {
        if !is_ident(name) {
            return Err(Error::InvalidArgument(format!(
                "invalid probe name {name:?}"
            )));
        }
        if self.kernel_probe(name)?.is_some() || self.registry.borrow().contains_key(name) {
            return Err(Error::AlreadyExists(format!("probe {name:?}")));
        }
        if target.is_empty() {
            return Err(Error::InvalidArgument("empty probe target".into()));
        }
        let arg_names = parse_probe_args(kind, args)?;
        if kind == ProbeKind::Return {
            // A return point exists only at the function itself.
            if let Some((_, offset)) = target.split_once('+') {
                if offset != "0" {
                    return Err(Error::InvalidArgument(format!(
                        "return probe target {target:?} cannot carry an offset"
                    )));
                }
            }
        }
        if let Some(expr) = filter {
            let known = |ident: &str| {
                COMMON_FIELDS.contains(&ident) || arg_names.iter().any(|name| name == ident)
            };
            validate_filter(expr, known)?;
        }

        // Phase 1: the kernel-facing definition.
        let line = format!("{}:{KPROBE_SYSTEM}/{name} {target} {args}\n", kind.prefix());
        self.fs
            .append(None, "kprobe_events", &line)
            .map_err(|err| reject(err, name))?;
        // Phase 2: index it.
        let probe = Probe {
            name: name.into(),
            kind,
            target: target.into(),
            args: args.to_string(),
            filter: filter.map(str::to_string),
        };
        self.registry.borrow_mut().insert(probe.name.clone(), probe);

        if let Some(expr) = filter {
            if let Err(err) = self.write_filter(name, expr) {
                // All-or-nothing: take the definition back out.
                self.registry.borrow_mut().remove(name);
                let undo = format!("-:{KPROBE_SYSTEM}/{name}\n");
                if let Err(undo_err) = self.fs.append(None, "kprobe_events", &undo) {
                    log::warn!("failed to remove half-registered probe {name:?}: {undo_err}");
                }
                return Err(err);
            }
        }
        log::debug!("registered {kind:?} probe {name:?} on {target:?}");
        Ok(())
    }

    /// Remove a probe: disable it if enabled, drop the kernel definition,
    /// then drop the registry entry. Any failure leaves the probe exactly
    /// as it was.
    pub fn unregister(&self, name: &str) -> Result<()> {
        if self.kernel_probe(name)?.is_none() {
            return Err(Error::NotFound(format!("probe {name:?}")));
        }
        let was_enabled = self.is_enabled(name)?;
        if was_enabled {
            self.events
                .write_enable_raw(&Instance::top_level(), KPROBE_SYSTEM, name, false)?;
        }
        let line = format!("-:{KPROBE_SYSTEM}/{name}\n");
        if let Err(err) = self.fs.append(None, "kprobe_events", &line) {
            if was_enabled {
                // Put the probe back the way we found it.
                if let Err(redo) =
                    self.events
                        .write_enable_raw(&Instance::top_level(), KPROBE_SYSTEM, name, true)
                {
                    log::warn!("failed to re-enable probe {name:?} after aborted removal: {redo}");
                }
            }
            return Err(reject(err, name));
        }
        self.registry.borrow_mut().remove(name);
        Ok(())
    }

    /// All live probes, re-derived from `kprobe_events` and enriched with
    /// registry attributes where available.
    pub fn list(&self) -> Result<Vec<Probe>> {
        let text = match self.fs.read(None, "kprobe_events") {
            Ok(text) => text,
            Err(Error::Io(err)) if err.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(err) => return Err(err),
        };
        let registry = self.registry.borrow();
        let mut probes = Vec::new();
        for line in text.lines() {
            let Some(parsed) = parse_probe_line(line) else {
                log::warn!("unparseable kprobe_events line: {line:?}");
                continue;
            };
            match registry.get(&parsed.name) {
                Some(known) => probes.push(known.clone()),
                None => probes.push(parsed),
            }
        }
        probes.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(probes)
    }

    pub fn list_names(&self) -> Result<Vec<CompactString>> {
        Ok(self.list()?.into_iter().map(|probe| probe.name).collect())
    }

    pub fn enable(&self, name: &str) -> Result<()> {
        self.require(name)?;
        self.events
            .write_enable_raw(&Instance::top_level(), KPROBE_SYSTEM, name, true)
    }

    pub fn disable(&self, name: &str) -> Result<()> {
        self.require(name)?;
        self.events
            .write_enable_raw(&Instance::top_level(), KPROBE_SYSTEM, name, false)
    }

    pub fn is_enabled(&self, name: &str) -> Result<bool> {
        self.require(name)?;
        self.events
            .read_enable_raw(&Instance::top_level(), KPROBE_SYSTEM, name)
    }

    /// Attach a filter to a probe's event. The vocabulary is the probe's
    /// argument bindings plus the common fields.
    pub fn set_filter(&self, name: &str, expr: &str) -> Result<()> {
        let probe = self.require(name)?;
        let arg_names = parse_probe_args(probe.kind, &probe.args)?;
        let known = |ident: &str| {
            COMMON_FIELDS.contains(&ident) || arg_names.iter().any(|name| name == ident)
        };
        validate_filter(expr, known)?;
        self.write_filter(name, expr)?;
        if let Some(entry) = self.registry.borrow_mut().get_mut(name) {
            entry.filter = Some(expr.to_string());
        }
        Ok(())
    }

    /// Remove a probe's filter without affecting its enable state.
    pub fn clear_filter(&self, name: &str) -> Result<()> {
        self.require(name)?;
        self.events
            .write_filter_raw(&Instance::top_level(), KPROBE_SYSTEM, name, "0")?;
        if let Some(entry) = self.registry.borrow_mut().get_mut(name) {
            entry.filter = None;
        }
        Ok(())
    }

    fn write_filter(&self, name: &str, expr: &str) -> Result<()> {
        self.events
            .write_filter_raw(&Instance::top_level(), KPROBE_SYSTEM, name, expr)
    }

    fn require(&self, name: &str) -> Result<Probe> {
        if let Some(probe) = self.registry.borrow().get(name) {
            return Ok(probe.clone());
        }
        self.kernel_probe(name)?
            .ok_or_else(|| Error::NotFound(format!("probe {name:?}")))
    }

    fn kernel_probe(&self, name: &str) -> Result<Option<Probe>> {
        Ok(self
            .list_kernel()?
            .into_iter()
            .find(|probe| probe.name == name))
    }

    fn list_kernel(&self) -> Result<Vec<Probe>> {
        let text = match self.fs.read(None, "kprobe_events") {
            Ok(text) => text,
            Err(Error::Io(err)) if err.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(err) => return Err(err),
        };
        Ok(text.lines().filter_map(parse_probe_line).collect())
    }
}

/// The kernel refused a definition it was syntactically fine with.
fn reject(err: Error, name: &str) -> Error {
    match err {
        Error::Io(io) => Error::RejectedByKernel(format!("probe {name:?}: {io}")),
        other => other,
    }
}

fn is_ident(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !name.starts_with(|c: char| c.is_ascii_digit())
}

/// Parse an argument-format string into its field binding names.
///
/// Tokens are `name=<fetch>` or a bare fetch spec (auto-named `argN`);
/// fetch specs address registers (`%di`), memory (`+0(%si)`), symbols
/// (`@symbol`) or specials (`$stack`, `$retval`), optionally `:typed`.
fn parse_probe_args(kind: ProbeKind, args: &str) -> Result<Vec<CompactString>> {
    let mut names = Vec::new();
    for (idx, token) in args.split_whitespace().enumerate() {
        let (name, spec) = match token.split_once('=') {
            Some((name, spec)) => {
                if !is_ident(name) {
                    return Err(Error::InvalidArgument(format!(
                        "invalid probe field name {name:?}"
                    )));
                }
                (CompactString::from(name), spec)
            }
            None => (format_compact!("arg{}", idx + 1), token),
        };
        let spec = spec.split(':').next().unwrap_or(spec);
        let legal = spec
            .chars()
            .next()
            .is_some_and(|c| matches!(c, '%' | '@' | '$' | '+' | '-' | '0'..='9'));
        if !legal {
            return Err(Error::InvalidArgument(format!(
                "unparseable fetch spec {token:?}"
            )));
        }
        if kind == ProbeKind::Entry && spec.starts_with("$retval") {
            return Err(Error::InvalidArgument(
                "$retval is only available to return probes".into(),
            ));
        }
        names.push(name);
    }
    Ok(names)
}

fn parse_probe_line(line: &str) -> Option<Probe> {
    let mut parts = line.split_whitespace();
    let head = parts.next()?;
    let (kind, group) = head.split_once(':')?;
    let kind = match kind {
        "p" => ProbeKind::Entry,
        "r" => ProbeKind::Return,
        _ => return None,
    };
    let name = group.rsplit('/').next()?;
    let target = parts.next()?;
    let args: Vec<&str> = parts.collect();
    Some(Probe {
        name: name.into(),
        kind,
        target: target.into(),
        args: args.join(" "),
        filter: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::FormatDatabase;
    use crate::tracefs::mem::MemTraceFs;

    fn manager() -> (Arc<MemTraceFs>, KprobeManager<MemTraceFs>) {
        let fs = Arc::new(MemTraceFs::new());
        let db = Arc::new(FormatDatabase::load(fs.as_ref(), None).unwrap_or_default());
        let events = EventController::new(Arc::clone(&fs), db);
        let mgr = KprobeManager::new(Arc::clone(&fs), events);
        (fs, mgr)
    }

    #[test]
    fn test_register_lifecycle() {
        let (fs, mgr) = manager();
        mgr.register("myopen", ProbeKind::Entry, "do_sys_open", "dfd=%di fname=%si", None)
            .unwrap();
        assert_eq!(mgr.list_names().unwrap(), vec!["myopen"]);
        assert!(
            fs.contents(None, "kprobe_events")
                .unwrap()
                .contains("p:kprobes/myopen do_sys_open")
        );
        assert!(!mgr.is_enabled("myopen").unwrap());
        mgr.enable("myopen").unwrap();
        assert!(mgr.is_enabled("myopen").unwrap());
        mgr.disable("myopen").unwrap();
        mgr.unregister("myopen").unwrap();
        assert!(mgr.list_names().unwrap().is_empty());
        assert!(matches!(mgr.enable("myopen"), Err(Error::NotFound(_))));
    }

    #[test]
    fn test_register_collision() {
        let (_fs, mgr) = manager();
        mgr.register("dup", ProbeKind::Entry, "do_sys_open", "", None)
            .unwrap();
        assert!(matches!(
            mgr.register("dup", ProbeKind::Return, "do_sys_open", "", None),
            Err(Error::AlreadyExists(_))
        ));
    }

    #[test]
    fn test_register_validation() {
        let (_fs, mgr) = manager();
        assert!(matches!(
            mgr.register("bad name", ProbeKind::Entry, "do_sys_open", "", None),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            mgr.register("p1", ProbeKind::Entry, "do_sys_open", "fname=junk", None),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            mgr.register("p2", ProbeKind::Entry, "do_sys_open", "ret=$retval", None),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            mgr.register("p3", ProbeKind::Return, "do_sys_open+16", "ret=$retval", None),
            Err(Error::InvalidArgument(_))
        ));
        // A return probe at offset zero is the function itself.
        mgr.register("p4", ProbeKind::Return, "do_sys_open+0", "ret=$retval", None)
            .unwrap();
    }

    #[test]
    fn test_kernel_rejection() {
        let (fs, mgr) = manager();
        fs.reject_probes_matching("no_such_symbol");
        assert!(matches!(
            mgr.register("ghost", ProbeKind::Entry, "no_such_symbol", "", None),
            Err(Error::RejectedByKernel(_))
        ));
        assert!(mgr.list_names().unwrap().is_empty());
    }

    #[test]
    fn test_unregister_enabled_probe_disables_first() {
        let (fs, mgr) = manager();
        mgr.register("live", ProbeKind::Entry, "do_sys_open", "", None)
            .unwrap();
        mgr.enable("live").unwrap();
        mgr.unregister("live").unwrap();
        // Disabled-and-gone, never enabled-and-gone.
        assert!(mgr.list_names().unwrap().is_empty());
        assert!(fs.contents(None, "events/kprobes/live/enable").is_none());
    }

    #[test]
    fn test_unregister_failure_leaves_probe_intact() {
        let (fs, mgr) = manager();
        mgr.register("stuck", ProbeKind::Entry, "do_sys_open", "", None)
            .unwrap();
        mgr.enable("stuck").unwrap();
        fs.fail_writes_to("kprobe_events");
        assert!(mgr.unregister("stuck").is_err());
        assert_eq!(mgr.list_names().unwrap(), vec!["stuck"]);
        assert!(mgr.is_enabled("stuck").unwrap());
    }

    #[test]
    fn test_orphaned_probe_surfaces_in_list() {
        let (fs, mgr) = manager();
        // A probe defined by a previous session, unknown to the registry.
        fs.seed(
            "kprobe_events",
            b"p:kprobes/leftover vfs_read count=%dx\n",
        );
        let probes = mgr.list().unwrap();
        assert_eq!(probes.len(), 1);
        assert_eq!(probes[0].name, "leftover");
        assert_eq!(probes[0].target, "vfs_read");
        assert_eq!(probes[0].args, "count=%dx");
    }

    #[test]
    fn test_probe_filters() {
        let (fs, mgr) = manager();
        mgr.register("flt", ProbeKind::Entry, "do_sys_open", "dfd=%di", None)
            .unwrap();
        mgr.set_filter("flt", "dfd > 0 && common_pid != 0").unwrap();
        assert_eq!(
            fs.contents(None, "events/kprobes/flt/filter").unwrap(),
            "dfd > 0 && common_pid != 0"
        );
        assert!(matches!(
            mgr.set_filter("flt", "nonexistent == 1"),
            Err(Error::InvalidFilter(_))
        ));
        assert_eq!(
            fs.contents(None, "events/kprobes/flt/filter").unwrap(),
            "dfd > 0 && common_pid != 0"
        );
        mgr.clear_filter("flt").unwrap();
        assert_eq!(fs.contents(None, "events/kprobes/flt/filter").unwrap(), "0");
    }

    #[test]
    fn test_register_with_filter() {
        let (fs, mgr) = manager();
        mgr.register(
            "rf",
            ProbeKind::Entry,
            "do_sys_open",
            "dfd=%di",
            Some("dfd == 3"),
        )
        .unwrap();
        assert_eq!(
            fs.contents(None, "events/kprobes/rf/filter").unwrap(),
            "dfd == 3"
        );
        assert_eq!(mgr.list().unwrap()[0].filter.as_deref(), Some("dfd == 3"));
        // Filter vocabulary is checked before anything touches the kernel.
        assert!(matches!(
            mgr.register(
                "rf2",
                ProbeKind::Entry,
                "do_sys_open",
                "dfd=%di",
                Some("bogus == 1"),
            ),
            Err(Error::InvalidFilter(_))
        ));
        assert_eq!(mgr.list_names().unwrap(), vec!["rf"]);
    }
}
