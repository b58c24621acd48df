//! The tracefs pseudo-filesystem provider.
//!
//! All controller components talk to the kernel through the [`TraceFs`]
//! trait instead of touching `/sys/kernel/tracing` directly. This keeps the
//! shared, fallible kernel state behind an injectable seam, so tests can run
//! against [`mem::MemTraceFs`] and simulate filesystem failures and kernel
//! rejections.

use crate::error::Error;
use crate::error::Result;
use std::io::Read;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;

/// Access to a tracefs mount: control file I/O and instance directories.
///
/// `instance` is `None` for the top-level (default) instance, `Some(name)`
/// for `instances/<name>`.
pub trait TraceFs {
    /// Absolute path of the tracefs mount point.
    fn top_dir(&self) -> PathBuf;

    /// Absolute path of an instance directory.
    fn instance_dir(&self, name: &str) -> PathBuf;

    /// Read a control file as UTF-8 text.
    fn read(&self, instance: Option<&str>, file: &str) -> Result<String>;

    /// Read whatever is currently available from a control file as raw
    /// bytes, without blocking for more.
    fn read_bytes(&self, instance: Option<&str>, file: &str) -> Result<Vec<u8>>;

    /// Overwrite a control file.
    fn write(&self, instance: Option<&str>, file: &str, value: &str) -> Result<()>;

    /// Append to a control file (the `kprobe_events` definition protocol).
    fn append(&self, instance: Option<&str>, file: &str, value: &str) -> Result<()>;

    /// Whether a control file or directory exists.
    fn exists(&self, instance: Option<&str>, file: &str) -> bool;

    /// List the entries of a directory.
    fn list_dir(&self, instance: Option<&str>, dir: &str) -> Result<Vec<String>>;

    /// Create an instance directory subtree.
    fn make_instance(&self, name: &str) -> Result<()>;

    /// Remove an instance directory subtree.
    fn remove_instance(&self, name: &str) -> Result<()>;
}

/// Well-known mount points, tried in order before falling back to
/// `/proc/mounts`.
const MOUNT_CANDIDATES: &[&str] = &["/sys/kernel/tracing", "/sys/kernel/debug/tracing"];

/// The real tracefs mount on the running kernel.
#[derive(Debug, Clone)]
pub struct SysTraceFs {
    root: PathBuf,
}

impl SysTraceFs {
    /// Discover the tracefs mount point and verify this process may use it.
    ///
    /// Requires root (or equivalent privilege on the mount). Lack of
    /// privilege is reported here, once, rather than on every call.
    pub fn discover() -> Result<Self> {
        let root = Self::find_mount()
            .ok_or_else(|| Error::NotFound("tracefs is not mounted on this system".into()))?;
        let fs = Self { root };
        // Privilege probe: tracing_on is readable by root only by default.
        match std::fs::read_to_string(fs.root.join("tracing_on")) {
            Ok(_) => Ok(fs),
            Err(err) if err.kind() == std::io::ErrorKind::PermissionDenied => {
                Err(Error::PermissionDenied(format!(
                    "{} is not accessible; root privileges are required",
                    fs.root.display()
                )))
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Use an explicit mount point (or a sysroot copy of one).
    pub fn with_root<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    fn find_mount() -> Option<PathBuf> {
        for candidate in MOUNT_CANDIDATES {
            let path = Path::new(candidate);
            if path.join("trace").exists() {
                return Some(path.to_path_buf());
            }
        }
        let mounts = std::fs::read_to_string("/proc/mounts").ok()?;
        for line in mounts.lines() {
            let mut parts = line.split_whitespace();
            let _device = parts.next()?;
            let mount_point = parts.next()?;
            if parts.next() == Some("tracefs") {
                return Some(PathBuf::from(mount_point));
            }
        }
        None
    }

    fn path(&self, instance: Option<&str>, file: &str) -> PathBuf {
        let base = match instance {
            Some(name) => self.instance_dir(name),
            None => self.root.clone(),
        };
        if file.is_empty() { base } else { base.join(file) }
    }
}

/// Map an I/O error to the crate taxonomy, keeping the path as context.
fn map_io(err: std::io::Error, path: &Path) -> Error {
    match err.kind() {
        std::io::ErrorKind::PermissionDenied => {
            Error::PermissionDenied(format!("{}", path.display()))
        }
        _ => Error::Io(std::io::Error::new(
            err.kind(),
            format!("{}: {err}", path.display()),
        )),
    }
}

impl TraceFs for SysTraceFs {
    fn top_dir(&self) -> PathBuf {
        self.root.clone()
    }

    fn instance_dir(&self, name: &str) -> PathBuf {
        self.root.join("instances").join(name)
    }

    fn read(&self, instance: Option<&str>, file: &str) -> Result<String> {
        let path = self.path(instance, file);
        std::fs::read_to_string(&path).map_err(|err| map_io(err, &path))
    }

    fn read_bytes(&self, instance: Option<&str>, file: &str) -> Result<Vec<u8>> {
        use std::os::unix::fs::OpenOptionsExt;

        let path = self.path(instance, file);
        // trace_pipe_raw blocks when the buffer is empty; open non-blocking
        // so a drain returns once the currently available data is consumed.
        let mut file = std::fs::OpenOptions::new()
            .read(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(&path)
            .map_err(|err| map_io(err, &path))?;
        let mut data = Vec::new();
        let mut chunk = [0u8; 4096];
        loop {
            match file.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => data.extend_from_slice(&chunk[..n]),
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(err) => return Err(map_io(err, &path)),
            }
        }
        Ok(data)
    }

    fn write(&self, instance: Option<&str>, file: &str, value: &str) -> Result<()> {
        let path = self.path(instance, file);
        std::fs::write(&path, value).map_err(|err| map_io(err, &path))
    }

    fn append(&self, instance: Option<&str>, file: &str, value: &str) -> Result<()> {
        let path = self.path(instance, file);
        let mut file = std::fs::OpenOptions::new()
            .append(true)
            .open(&path)
            .map_err(|err| map_io(err, &path))?;
        file.write_all(value.as_bytes())
            .map_err(|err| map_io(err, &path))
    }

    fn exists(&self, instance: Option<&str>, file: &str) -> bool {
        self.path(instance, file).exists()
    }

    fn list_dir(&self, instance: Option<&str>, dir: &str) -> Result<Vec<String>> {
        let path = self.path(instance, dir);
        let entries = std::fs::read_dir(&path).map_err(|err| map_io(err, &path))?;
        let mut names = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|err| map_io(err, &path))?;
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        names.sort_unstable();
        Ok(names)
    }

    fn make_instance(&self, name: &str) -> Result<()> {
        let path = self.instance_dir(name);
        std::fs::create_dir(&path).map_err(|err| map_io(err, &path))
    }

    fn remove_instance(&self, name: &str) -> Result<()> {
        let path = self.instance_dir(name);
        // Instance directories are pseudo-files; rmdir tears down the whole
        // subtree kernel-side.
        std::fs::remove_dir(&path).map_err(|err| map_io(err, &path))
    }
}

#[cfg(test)]
pub(crate) mod mem {
    //! In-memory tracefs double used by unit tests across the crate.
    //!
    //! Emulates just enough kernel-side behavior to exercise the control
    //! plane: instance directories clone the top-level control files, and
    //! appends to `kprobe_events` create or remove the matching event
    //! directories under `events/kprobes/`.

    use super::TraceFs;
    use crate::error::Error;
    use crate::error::Result;
    use std::collections::BTreeMap;
    use std::collections::BTreeSet;
    use std::path::PathBuf;
    use std::sync::Mutex;

    #[derive(Default)]
    pub(crate) struct MemTraceFs {
        files: Mutex<BTreeMap<String, Vec<u8>>>,
        instances: Mutex<BTreeSet<String>>,
        fail_writes: Mutex<BTreeSet<String>>,
        reject_probes: Mutex<Vec<String>>,
        next_probe_id: Mutex<u32>,
    }

    fn not_found(path: &str) -> Error {
        Error::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            path.to_string(),
        ))
    }

    impl MemTraceFs {
        pub(crate) fn new() -> Self {
            let fs = Self {
                next_probe_id: Mutex::new(2000),
                ..Self::default()
            };
            fs.seed("tracing_on", b"1\n");
            fs.seed("current_tracer", b"nop\n");
            fs.seed("available_tracers", b"function_graph function nop\n");
            fs.seed("set_event_pid", b"");
            fs.seed("set_ftrace_pid", b"");
            fs.seed("kprobe_events", b"");
            fs.seed("options/event-fork", b"0\n");
            fs.seed("options/function-fork", b"0\n");
            fs.seed("options/sym-offset", b"0\n");
            fs
        }

        /// Write a raw file directly, bypassing failure injection.
        pub(crate) fn seed(&self, path: &str, data: &[u8]) {
            self.files
                .lock()
                .unwrap()
                .insert(path.to_string(), data.to_vec());
        }

        /// Register an event with its format descriptor text.
        pub(crate) fn add_event(&self, system: &str, event: &str, format: &str) {
            let base = format!("events/{system}/{event}");
            self.seed(&format!("{base}/format"), format.as_bytes());
            self.seed(&format!("{base}/enable"), b"0\n");
            self.seed(&format!("{base}/filter"), b"none\n");
        }

        /// Make every write to `file` fail with an I/O error.
        pub(crate) fn fail_writes_to(&self, file: &str) {
            self.fail_writes.lock().unwrap().insert(file.to_string());
        }

        /// Reject `kprobe_events` definitions containing `pattern`, the way
        /// the kernel refuses an unresolvable probe target.
        pub(crate) fn reject_probes_matching(&self, pattern: &str) {
            self.reject_probes.lock().unwrap().push(pattern.to_string());
        }

        /// Current content of a file, for post-condition assertions.
        pub(crate) fn contents(&self, instance: Option<&str>, file: &str) -> Option<String> {
            let key = key_of(instance, file);
            self.files
                .lock()
                .unwrap()
                .get(&key)
                .map(|data| String::from_utf8_lossy(data).into_owned())
        }

        fn define_probe(&self, line: &str) -> Result<()> {
            for pattern in self.reject_probes.lock().unwrap().iter() {
                if line.contains(pattern.as_str()) {
                    return Err(Error::Io(std::io::Error::new(
                        std::io::ErrorKind::InvalidInput,
                        "kprobe_events: Invalid argument",
                    )));
                }
            }
            if let Some(rest) = line.strip_prefix("-:") {
                let name = rest
                    .split_whitespace()
                    .next()
                    .and_then(|group| group.strip_prefix("kprobes/"))
                    .ok_or_else(|| not_found(line))?;
                let mut files = self.files.lock().unwrap();
                let existing = files.get("kprobe_events").cloned().unwrap_or_default();
                let text = String::from_utf8_lossy(&existing).into_owned();
                let kept: Vec<&str> = text
                    .lines()
                    .filter(|probe| !probe.contains(&format!("kprobes/{name} ")))
                    .collect();
                let mut joined = kept.join("\n");
                if !joined.is_empty() {
                    joined.push('\n');
                }
                files.insert("kprobe_events".into(), joined.into_bytes());
                let prefix = format!("events/kprobes/{name}/");
                files.retain(|key, _| !key.starts_with(&prefix));
                return Ok(());
            }
            let name = line
                .split_whitespace()
                .next()
                .and_then(|spec| spec.split(':').nth(1))
                .and_then(|group| group.strip_prefix("kprobes/"))
                .ok_or_else(|| not_found(line))?
                .to_string();
            let id = {
                let mut next = self.next_probe_id.lock().unwrap();
                *next += 1;
                *next
            };
            let format = format!(
                "name: {name}\n\
                 ID: {id}\n\
                 format:\n\
                 \tfield:unsigned short common_type;\toffset:0;\tsize:2;\tsigned:0;\n\
                 \tfield:unsigned char common_flags;\toffset:2;\tsize:1;\tsigned:0;\n\
                 \tfield:unsigned char common_preempt_count;\toffset:3;\tsize:1;\tsigned:0;\n\
                 \tfield:int common_pid;\toffset:4;\tsize:4;\tsigned:1;\n\
                 \n\
                 \tfield:unsigned long __probe_ip;\toffset:8;\tsize:8;\tsigned:0;\n\
                 \n\
                 print fmt: \"(%lx)\", REC->__probe_ip\n"
            );
            self.add_event("kprobes", &name, &format);
            let mut files = self.files.lock().unwrap();
            let entry = files.entry("kprobe_events".into()).or_default();
            entry.extend_from_slice(line.trim_end().as_bytes());
            entry.push(b'\n');
            Ok(())
        }
    }

    fn key_of(instance: Option<&str>, file: &str) -> String {
        match instance {
            Some(name) if file.is_empty() => format!("instances/{name}"),
            Some(name) => format!("instances/{name}/{file}"),
            None => file.to_string(),
        }
    }

    impl TraceFs for MemTraceFs {
        fn top_dir(&self) -> PathBuf {
            PathBuf::from("/sys/kernel/tracing")
        }

        fn instance_dir(&self, name: &str) -> PathBuf {
            self.top_dir().join("instances").join(name)
        }

        fn read(&self, instance: Option<&str>, file: &str) -> Result<String> {
            let key = key_of(instance, file);
            let files = self.files.lock().unwrap();
            let data = files.get(&key).ok_or_else(|| not_found(&key))?;
            Ok(String::from_utf8_lossy(data).into_owned())
        }

        fn read_bytes(&self, instance: Option<&str>, file: &str) -> Result<Vec<u8>> {
            let key = key_of(instance, file);
            let files = self.files.lock().unwrap();
            files.get(&key).cloned().ok_or_else(|| not_found(&key))
        }

        fn write(&self, instance: Option<&str>, file: &str, value: &str) -> Result<()> {
            if self.fail_writes.lock().unwrap().contains(file) {
                return Err(Error::Io(std::io::Error::other(format!(
                    "simulated write failure: {file}"
                ))));
            }
            let key = key_of(instance, file);
            self.files
                .lock()
                .unwrap()
                .insert(key, value.as_bytes().to_vec());
            Ok(())
        }

        fn append(&self, instance: Option<&str>, file: &str, value: &str) -> Result<()> {
            if self.fail_writes.lock().unwrap().contains(file) {
                return Err(Error::Io(std::io::Error::other(format!(
                    "simulated write failure: {file}"
                ))));
            }
            if instance.is_none() && file == "kprobe_events" {
                return self.define_probe(value.trim_end());
            }
            let key = key_of(instance, file);
            self.files
                .lock()
                .unwrap()
                .entry(key)
                .or_default()
                .extend_from_slice(value.as_bytes());
            Ok(())
        }

        fn exists(&self, instance: Option<&str>, file: &str) -> bool {
            let key = key_of(instance, file);
            let prefix = format!("{key}/");
            if let Some(name) = instance {
                if file.is_empty() {
                    return self.instances.lock().unwrap().contains(name);
                }
            }
            let files = self.files.lock().unwrap();
            files.contains_key(&key) || files.keys().any(|entry| entry.starts_with(&prefix))
        }

        fn list_dir(&self, instance: Option<&str>, dir: &str) -> Result<Vec<String>> {
            if instance.is_none() && dir == "instances" {
                return Ok(self.instances.lock().unwrap().iter().cloned().collect());
            }
            let prefix = format!("{}/", key_of(instance, dir));
            let files = self.files.lock().unwrap();
            let mut names = BTreeSet::new();
            for key in files.keys() {
                if let Some(rest) = key.strip_prefix(&prefix) {
                    if let Some(first) = rest.split('/').next() {
                        names.insert(first.to_string());
                    }
                }
            }
            if names.is_empty() {
                return Err(not_found(&prefix));
            }
            Ok(names.into_iter().collect())
        }

        fn make_instance(&self, name: &str) -> Result<()> {
            let mut instances = self.instances.lock().unwrap();
            if instances.contains(name) {
                return Err(Error::Io(std::io::Error::new(
                    std::io::ErrorKind::AlreadyExists,
                    format!("instances/{name}"),
                )));
            }
            instances.insert(name.to_string());
            // A new kernel instance starts with its own copy of the control
            // files and per-event enables.
            let mut files = self.files.lock().unwrap();
            let cloned: Vec<(String, Vec<u8>)> = files
                .iter()
                .filter(|(key, _)| {
                    !key.starts_with("instances/")
                        && !key.starts_with("per_cpu/")
                        && key.as_str() != "kprobe_events"
                })
                .map(|(key, data)| (format!("instances/{name}/{key}"), data.clone()))
                .collect();
            files.extend(cloned);
            Ok(())
        }

        fn remove_instance(&self, name: &str) -> Result<()> {
            let mut instances = self.instances.lock().unwrap();
            if !instances.remove(name) {
                return Err(not_found(&format!("instances/{name}")));
            }
            let prefix = format!("instances/{name}/");
            self.files
                .lock()
                .unwrap()
                .retain(|key, _| !key.starts_with(&prefix));
            Ok(())
        }
    }
}
