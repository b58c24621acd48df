//! Tracer selection, option flags and the tracing on/off switch.

use crate::error::Error;
use crate::error::Result;
use crate::instance::Instance;
use crate::tracefs::TraceFs;
use compact_str::CompactString;
use std::sync::Arc;

/// Controls `current_tracer`, `tracing_on` and the `options/` flags of one
/// or more instances.
pub struct TracerController<F: TraceFs> {
    fs: Arc<F>,
}

impl<F: TraceFs> TracerController<F> {
    pub fn new(fs: Arc<F>) -> Self {
        Self { fs }
    }

    /// Tracers the kernel offers, in the order it reports them.
    pub fn available_tracers(&self, instance: &Instance) -> Result<Vec<CompactString>> {
        let text = self.fs.read(instance.name(), "available_tracers")?;
        Ok(text.split_whitespace().map(CompactString::from).collect())
    }

    /// Select the active tracer. `"none"` or the empty string selects
    /// `nop`, which disables active tracing logic without touching event
    /// enablement. Any other name must be in [`available_tracers`].
    ///
    /// [`available_tracers`]: TracerController::available_tracers
    pub fn set_current_tracer(&self, instance: &Instance, name: &str) -> Result<()> {
        let name = match name {
            "" | "none" => "nop",
            other => other,
        };
        if name != "nop" {
            let available = self.available_tracers(instance)?;
            if !available.iter().any(|tracer| tracer == name) {
                return Err(Error::InvalidArgument(format!(
                    "tracer {name:?} is not available"
                )));
            }
        }
        self.fs.write(instance.name(), "current_tracer", name)
    }

    pub fn get_current_tracer(&self, instance: &Instance) -> Result<CompactString> {
        let text = self.fs.read(instance.name(), "current_tracer")?;
        Ok(text.trim().into())
    }

    /// Turn the tracing switch on.
    pub fn trace_on(&self, instance: &Instance) -> Result<()> {
        self.fs.write(instance.name(), "tracing_on", "1")
    }

    /// Turn the tracing switch off. The buffer keeps its contents.
    pub fn trace_off(&self, instance: &Instance) -> Result<()> {
        self.fs.write(instance.name(), "tracing_on", "0")
    }

    pub fn is_tracing_on(&self, instance: &Instance) -> Result<bool> {
        let text = self.fs.read(instance.name(), "tracing_on")?;
        Ok(text.trim() == "1")
    }

    /// The fixed option set this kernel supports.
    pub fn supported_options(&self, instance: &Instance) -> Result<Vec<CompactString>> {
        let names = self.fs.list_dir(instance.name(), "options")?;
        Ok(names.into_iter().map(CompactString::from).collect())
    }

    /// Options currently set.
    pub fn enabled_options(&self, instance: &Instance) -> Result<Vec<CompactString>> {
        let mut enabled = Vec::new();
        for name in self.supported_options(instance)? {
            if self.option_is_set(instance, &name)? {
                enabled.push(name);
            }
        }
        Ok(enabled)
    }

    pub fn enable_option(&self, instance: &Instance, name: &str) -> Result<()> {
        self.write_option(instance, name, "1")
    }

    pub fn disable_option(&self, instance: &Instance, name: &str) -> Result<()> {
        self.write_option(instance, name, "0")
    }

    pub fn option_is_set(&self, instance: &Instance, name: &str) -> Result<bool> {
        let file = self.option_file(instance, name)?;
        let text = self.fs.read(instance.name(), &file)?;
        Ok(text.trim() == "1")
    }

    fn write_option(&self, instance: &Instance, name: &str, value: &str) -> Result<()> {
        let file = self.option_file(instance, name)?;
        self.fs.write(instance.name(), &file, value)
    }

    fn option_file(&self, instance: &Instance, name: &str) -> Result<String> {
        let file = format!("options/{name}");
        if !self.fs.exists(instance.name(), &file) {
            return Err(Error::InvalidArgument(format!(
                "option {name:?} is not supported"
            )));
        }
        Ok(file)
    }
}
