//! A builder for connection [`Config`].
//!
//!

use std::fmt;
use std::sync::Arc;

/// Recognized connection options.
///
/// Mirrors the configuration surface of the embedded engine as exposed to
/// client code: open mode, pragmas applied at open time, and diagnostics.
#[derive(Clone)]
pub struct Config {
    pub(crate) read_only: bool,
    pub(crate) foreign_keys_enabled: bool,
    pub(crate) busy_timeout_ms: u32,
    pub(crate) label: String,
    pub(crate) trace: Option<Arc<dyn Fn(&str) + Send + Sync>>,
    pub(crate) vfs: Option<String>,
    pub(crate) extended_result_codes: bool,
    pub(crate) statement_cache_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            read_only: false,
            foreign_keys_enabled: true,
            busy_timeout_ms: 5_000,
            label: String::from("dbkit"),
            trace: None,
            vfs: None,
            extended_result_codes: true,
            statement_cache_capacity: crate::statement::StatementCache::DEFAULT_CAPACITY,
        }
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("read_only", &self.read_only)
            .field("foreign_keys_enabled", &self.foreign_keys_enabled)
            .field("busy_timeout_ms", &self.busy_timeout_ms)
            .field("label", &self.label)
            .field("trace", &self.trace.is_some())
            .field("vfs", &self.vfs)
            .field("extended_result_codes", &self.extended_result_codes)
            .field("statement_cache_capacity", &self.statement_cache_capacity)
            .finish()
    }
}

/// A builder for [`Config`]. Each `with_*` method returns `&mut Self` so
/// call sites read as a fluent chain, the way `dbt_xdbc`'s connection
/// builder does.
#[derive(Clone, Default)]
pub struct Builder {
    config: Config,
}

impl Builder {
    pub fn new() -> Builder {
        Builder::default()
    }

    pub fn read_only(&mut self, value: bool) -> &mut Self {
        self.config.read_only = value;
        self
    }

    pub fn foreign_keys_enabled(&mut self, value: bool) -> &mut Self {
        self.config.foreign_keys_enabled = value;
        self
    }

    pub fn busy_timeout_ms(&mut self, value: u32) -> &mut Self {
        self.config.busy_timeout_ms = value;
        self
    }

    pub fn label(&mut self, value: impl Into<String>) -> &mut Self {
        self.config.label = value.into();
        self
    }

    pub fn trace(&mut self, callback: impl Fn(&str) + Send + Sync + 'static) -> &mut Self {
        self.config.trace = Some(Arc::new(callback));
        self
    }

    pub fn vfs(&mut self, name: impl Into<String>) -> &mut Self {
        self.config.vfs = Some(name.into());
        self
    }

    pub fn extended_result_codes(&mut self, value: bool) -> &mut Self {
        self.config.extended_result_codes = value;
        self
    }

    pub fn statement_cache_capacity(&mut self, value: usize) -> &mut Self {
        self.config.statement_cache_capacity = value;
        self
    }

    pub fn build(&self) -> Config {
        self.config.clone()
    }
}

impl Config {
    pub fn read_only(&self) -> bool {
        self.read_only
    }

    pub fn foreign_keys_enabled(&self) -> bool {
        self.foreign_keys_enabled
    }

    pub fn busy_timeout_ms(&self) -> u32 {
        self.busy_timeout_ms
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn vfs(&self) -> Option<&str> {
        self.vfs.as_deref()
    }

    pub fn trace(&self) -> Option<Arc<dyn Fn(&str) + Send + Sync>> {
        self.trace.clone()
    }

    pub fn extended_result_codes(&self) -> bool {
        self.extended_result_codes
    }
}
