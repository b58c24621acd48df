//! Event enablement and filter expressions.
//!
//! Event arguments are tagged selectors rather than string sentinels: a
//! single name, an explicit list, or every event of a system. Name
//! resolution happens against the [`FormatDatabase`] before any control
//! file is written, so a bulk call either applies completely or leaves
//! prior state unchanged (collect-then-apply, never rollback).

use crate::error::Error;
use crate::error::Result;
use crate::format::FormatDatabase;
use crate::instance::Instance;
use crate::tracefs::TraceFs;
use compact_str::CompactString;
use std::sync::Arc;

/// Which events of a system an operation applies to.
#[derive(Debug, Clone, Copy)]
pub enum EventSelect<'a> {
    /// Every event the system lists.
    All,
    /// A single event, by exact name.
    One(&'a str),
    /// An explicit list of exact names.
    List(&'a [&'a str]),
}

/// Enables/disables events and manages their filter expressions.
pub struct EventController<F: TraceFs> {
    fs: Arc<F>,
    db: Arc<FormatDatabase>,
}

impl<F: TraceFs> EventController<F> {
    pub fn new(fs: Arc<F>, db: Arc<FormatDatabase>) -> Self {
        Self { fs, db }
    }

    pub fn available_systems(&self) -> Vec<CompactString> {
        self.db.systems().map(CompactString::from).collect()
    }

    pub fn available_events(&self, system: &str) -> Result<Vec<CompactString>> {
        if !self.db.has_system(system) {
            return Err(Error::NotFound(format!("event system {system:?}")));
        }
        Ok(self
            .db
            .events_in(system)
            .map(|format| format.name.clone())
            .collect())
    }

    /// Enable the selected events. `system: None` widens the search to
    /// every system; an explicit name that resolves nowhere is still
    /// `NotFound` (wildcards widen matching, they never suppress it).
    pub fn enable(
        &self,
        instance: &Instance,
        system: Option<&str>,
        select: EventSelect<'_>,
    ) -> Result<()> {
        let targets = self.resolve(system, select)?;
        self.apply(instance, &targets, "1")
    }

    /// Disable the selected events; symmetric with [`enable`].
    ///
    /// [`enable`]: EventController::enable
    pub fn disable(
        &self,
        instance: &Instance,
        system: Option<&str>,
        select: EventSelect<'_>,
    ) -> Result<()> {
        let targets = self.resolve(system, select)?;
        self.apply(instance, &targets, "0")
    }

    pub fn is_enabled(&self, instance: &Instance, system: &str, event: &str) -> Result<bool> {
        self.lookup(system, event)?;
        let text = self
            .fs
            .read(instance.name(), &enable_file(system, event))?;
        Ok(text.trim() == "1")
    }

    /// Attach a boolean filter expression to an event.
    ///
    /// Validation is local: balanced syntax and every identifier naming a
    /// real field of the event. An invalid expression fails with
    /// `InvalidFilter` before anything is written, leaving any previous
    /// filter untouched. Runtime evaluation is the kernel's job.
    pub fn set_filter(
        &self,
        instance: &Instance,
        system: &str,
        event: &str,
        expr: &str,
    ) -> Result<()> {
        let format = self.lookup(system, event)?;
        validate_filter(expr, |name| format.field(name).is_some())?;
        self.fs
            .write(instance.name(), &filter_file(system, event), expr)
    }

    /// Remove an event's filter without touching its enable state.
    pub fn clear_filter(&self, instance: &Instance, system: &str, event: &str) -> Result<()> {
        self.lookup(system, event)?;
        self.fs
            .write(instance.name(), &filter_file(system, event), "0")
    }

    /// Write an enable file directly, bypassing database resolution. The
    /// kprobe manager uses this for probes registered after the database
    /// snapshot was taken.
    pub(crate) fn write_enable_raw(
        &self,
        instance: &Instance,
        system: &str,
        event: &str,
        on: bool,
    ) -> Result<()> {
        self.fs.write(
            instance.name(),
            &enable_file(system, event),
            if on { "1" } else { "0" },
        )
    }

    pub(crate) fn read_enable_raw(
        &self,
        instance: &Instance,
        system: &str,
        event: &str,
    ) -> Result<bool> {
        let text = self
            .fs
            .read(instance.name(), &enable_file(system, event))?;
        Ok(text.trim() == "1")
    }

    pub(crate) fn write_filter_raw(
        &self,
        instance: &Instance,
        system: &str,
        event: &str,
        expr: &str,
    ) -> Result<()> {
        self.fs
            .write(instance.name(), &filter_file(system, event), expr)
    }

    fn lookup(&self, system: &str, event: &str) -> Result<&crate::format::EventFormat> {
        self.db
            .get(system, event)
            .ok_or_else(|| Error::NotFound(format!("event {system}:{event}")))
    }

    /// Resolve a selector to concrete `(system, event)` pairs, failing
    /// before anything is applied if any explicit name is unknown.
    fn resolve(
        &self,
        system: Option<&str>,
        select: EventSelect<'_>,
    ) -> Result<Vec<(CompactString, CompactString)>> {
        if let Some(system) = system {
            if !self.db.has_system(system) {
                return Err(Error::NotFound(format!("event system {system:?}")));
            }
        }
        let one = |event: &str| -> Result<Vec<(CompactString, CompactString)>> {
            let matches: Vec<_> = match system {
                Some(system) => self
                    .db
                    .get(system, event)
                    .into_iter()
                    .map(|format| (format.system.clone(), format.name.clone()))
                    .collect(),
                None => self
                    .db
                    .iter()
                    .filter(|format| format.name == event)
                    .map(|format| (format.system.clone(), format.name.clone()))
                    .collect(),
            };
            if matches.is_empty() {
                return Err(Error::NotFound(match system {
                    Some(system) => format!("event {system}:{event}"),
                    None => format!("event {event:?}"),
                }));
            }
            Ok(matches)
        };
        match select {
            EventSelect::All => Ok(self
                .db
                .iter()
                .filter(|format| system.is_none_or(|sys| format.system == sys))
                .map(|format| (format.system.clone(), format.name.clone()))
                .collect()),
            EventSelect::One(event) => one(event),
            EventSelect::List(events) => {
                let mut targets = Vec::new();
                for event in events {
                    targets.extend(one(event)?);
                }
                Ok(targets)
            }
        }
    }

    fn apply(
        &self,
        instance: &Instance,
        targets: &[(CompactString, CompactString)],
        value: &str,
    ) -> Result<()> {
        for (system, event) in targets {
            self.fs
                .write(instance.name(), &enable_file(system, event), value)?;
        }
        Ok(())
    }
}

fn enable_file(system: &str, event: &str) -> String {
    format!("events/{system}/{event}/enable")
}

fn filter_file(system: &str, event: &str) -> String {
    format!("events/{system}/{event}/filter")
}

/// Lexical validation of a boolean filter expression: balanced parens and
/// quotes, only legal operator characters, and every identifier naming a
/// known field. Shared with probe filter validation.
pub(crate) fn validate_filter(expr: &str, known_field: impl Fn(&str) -> bool) -> Result<()> {
    let expr = expr.trim();
    if expr.is_empty() {
        return Err(Error::InvalidFilter("empty expression".into()));
    }
    let mut depth = 0i32;
    let mut chars = expr.char_indices().peekable();
    while let Some(&(at, c)) = chars.peek() {
        match c {
            c if c.is_whitespace() => {
                chars.next();
            }
            '(' => {
                depth += 1;
                chars.next();
            }
            ')' => {
                depth -= 1;
                if depth < 0 {
                    return Err(Error::InvalidFilter(format!(
                        "unbalanced parenthesis in {expr:?}"
                    )));
                }
                chars.next();
            }
            '"' | '\'' => {
                let quote = c;
                chars.next();
                let mut closed = false;
                for (_, inner) in chars.by_ref() {
                    if inner == quote {
                        closed = true;
                        break;
                    }
                }
                if !closed {
                    return Err(Error::InvalidFilter(format!(
                        "unterminated string in {expr:?}"
                    )));
                }
            }
            '&' | '|' | '!' | '=' | '<' | '>' | '~' | '*' | '+' | '-' | '/' | ',' | '.' => {
                chars.next();
            }
            '0'..='9' => {
                // Numeric literal, possibly hex.
                while chars
                    .peek()
                    .is_some_and(|&(_, c)| c.is_ascii_alphanumeric())
                {
                    chars.next();
                }
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let mut end = at;
                while let Some(&(idx, c)) = chars.peek() {
                    if c.is_ascii_alphanumeric() || c == '_' {
                        end = idx + c.len_utf8();
                        chars.next();
                    } else {
                        break;
                    }
                }
                let ident = &expr[at..end];
                if !known_field(ident) {
                    return Err(Error::InvalidFilter(format!(
                        "unknown field {ident:?} in {expr:?}"
                    )));
                }
            }
            other => {
                return Err(Error::InvalidFilter(format!(
                    "illegal character {other:?} in {expr:?}"
                )));
            }
        }
    }
    if depth != 0 {
        return Err(Error::InvalidFilter(format!(
            "unbalanced parenthesis in {expr:?}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracefs::mem::MemTraceFs;

    fn format_text(name: &str, id: u32) -> String {
        format!(
            "name: {name}\n\
             ID: {id}\n\
             format:\n\
             \tfield:unsigned short common_type;\toffset:0;\tsize:2;\tsigned:0;\n\
             \tfield:int common_pid;\toffset:4;\tsize:4;\tsigned:1;\n\
             \n\
             \tfield:int value;\toffset:8;\tsize:4;\tsigned:1;\n\
             \n\
             print fmt: \"value=%d\", REC->value\n"
        )
    }

    fn setup() -> (Arc<MemTraceFs>, EventController<MemTraceFs>) {
        let fs = Arc::new(MemTraceFs::new());
        fs.add_event("sched", "sched_switch", &format_text("sched_switch", 1));
        fs.add_event("sched", "sched_waking", &format_text("sched_waking", 2));
        fs.add_event("irq", "softirq_entry", &format_text("softirq_entry", 3));
        let db = Arc::new(FormatDatabase::load(fs.as_ref(), None).unwrap());
        let ctl = EventController::new(Arc::clone(&fs), db);
        (fs, ctl)
    }

    #[test]
    fn test_enumeration() {
        let (_fs, ctl) = setup();
        assert_eq!(ctl.available_systems(), vec!["irq", "sched"]);
        assert_eq!(
            ctl.available_events("sched").unwrap(),
            vec!["sched_switch", "sched_waking"]
        );
        assert!(matches!(
            ctl.available_events("block"),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn test_enable_disable_cycle() {
        let (_fs, ctl) = setup();
        let top = Instance::top_level();
        ctl.enable(&top, Some("sched"), EventSelect::One("sched_switch"))
            .unwrap();
        assert!(ctl.is_enabled(&top, "sched", "sched_switch").unwrap());
        ctl.disable(&top, Some("sched"), EventSelect::One("sched_switch"))
            .unwrap();
        assert!(!ctl.is_enabled(&top, "sched", "sched_switch").unwrap());
    }

    #[test]
    fn test_enable_all_in_system() {
        let (_fs, ctl) = setup();
        let top = Instance::top_level();
        ctl.enable(&top, Some("sched"), EventSelect::All).unwrap();
        for event in ctl.available_events("sched").unwrap() {
            assert!(ctl.is_enabled(&top, "sched", &event).unwrap());
        }
        assert!(!ctl.is_enabled(&top, "irq", "softirq_entry").unwrap());
    }

    #[test]
    fn test_enable_across_all_systems() {
        let (_fs, ctl) = setup();
        let top = Instance::top_level();
        // No system named: the single name is searched everywhere.
        ctl.enable(&top, None, EventSelect::One("softirq_entry"))
            .unwrap();
        assert!(ctl.is_enabled(&top, "irq", "softirq_entry").unwrap());
        // An unknown explicit name is NotFound even with the widest scope.
        assert!(matches!(
            ctl.enable(&top, None, EventSelect::One("no_such_event")),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn test_bulk_enable_is_atomic() {
        let (_fs, ctl) = setup();
        let top = Instance::top_level();
        let result = ctl.enable(
            &top,
            Some("sched"),
            EventSelect::List(&["sched_switch", "no_such_event"]),
        );
        assert!(matches!(result, Err(Error::NotFound(_))));
        // Nothing was applied.
        assert!(!ctl.is_enabled(&top, "sched", "sched_switch").unwrap());
        assert!(!ctl.is_enabled(&top, "sched", "sched_waking").unwrap());
    }

    #[test]
    fn test_filter_validation() {
        let (fs, ctl) = setup();
        let top = Instance::top_level();
        ctl.set_filter(&top, "sched", "sched_switch", "value > 10 && common_pid != 0")
            .unwrap();
        assert_eq!(
            fs.contents(None, "events/sched/sched_switch/filter")
                .unwrap(),
            "value > 10 && common_pid != 0"
        );
        // Unknown field: rejected, previous filter untouched.
        assert!(matches!(
            ctl.set_filter(&top, "sched", "sched_switch", "bogus == 1"),
            Err(Error::InvalidFilter(_))
        ));
        assert_eq!(
            fs.contents(None, "events/sched/sched_switch/filter")
                .unwrap(),
            "value > 10 && common_pid != 0"
        );
        // Bad syntax.
        assert!(matches!(
            ctl.set_filter(&top, "sched", "sched_switch", "(value > 10"),
            Err(Error::InvalidFilter(_))
        ));
        ctl.clear_filter(&top, "sched", "sched_switch").unwrap();
        assert_eq!(
            fs.contents(None, "events/sched/sched_switch/filter")
                .unwrap(),
            "0"
        );
    }

    #[test]
    fn test_validate_filter_lexing() {
        let known = |name: &str| name == "pid" || name == "comm";
        assert!(validate_filter("pid == 0x1f", known).is_ok());
        assert!(validate_filter("comm ~ \"bash*\"", known).is_ok());
        assert!(validate_filter("(pid > 1) && (pid < 100)", known).is_ok());
        assert!(validate_filter("", known).is_err());
        assert!(validate_filter("pid == 1)", known).is_err());
        assert!(validate_filter("comm ~ \"unterminated", known).is_err());
        assert!(validate_filter("pid == `1`", known).is_err());
    }
}
