use crate::fuse::dispatch::DispatchOptions;
use crate::fuse::mount::{MountOptionError, MountOptions};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

const ENV_PREFIX: &str = "FUSEBRIDGE";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub fuse: FuseConfig,
    pub cache: CacheConfig,
    pub dispatch: DispatchConfig,
    pub runtime: RuntimeConfig,
    pub log: LogConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FuseConfig {
    pub allow_other: bool,
    pub allow_root: bool,
    pub read_only: bool,
    pub default_permissions: bool,
    pub fsname: String,
    pub subtype: Option<String>,
    pub auto_unmount: bool,
    /// Extra `-o` style options, applied after the fields above
    pub options: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub attr_ttl_ms: u64,
    pub entry_ttl_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    pub min_dir_buffer: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub worker_threads: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub filter: String,
}

impl Default for FuseConfig {
    fn default() -> Self {
        let mount = MountOptions::default();
        Self {
            allow_other: mount.allow_other,
            allow_root: mount.allow_root,
            read_only: mount.read_only,
            default_permissions: mount.default_permissions,
            fsname: mount.fsname.unwrap_or_default(),
            subtype: mount.subtype,
            auto_unmount: mount.auto_unmount,
            options: Vec::new(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { attr_ttl_ms: 1000, entry_ttl_ms: 1000 }
    }
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self { min_dir_buffer: crate::fuse::dirbuf::MIN_DIR_BUFFER }
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self { worker_threads: 4 }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self { filter: "fusebridge=debug,info".to_string() }
    }
}

impl FuseConfig {
    /// Build mount options from the fields plus the free-form option list
    pub fn mount_options(&self) -> Result<MountOptions, MountOptionError> {
        let mut options = MountOptions {
            allow_other: self.allow_other,
            allow_root: self.allow_root,
            read_only: self.read_only,
            default_permissions: self.default_permissions,
            fsname: Some(self.fsname.clone()).filter(|name| !name.is_empty()),
            subtype: self.subtype.clone(),
            auto_unmount: self.auto_unmount,
            extra: Vec::new(),
        };
        for list in &self.options {
            options.apply(list)?;
        }
        Ok(options)
    }
}

impl CacheConfig {
    pub fn attr_ttl(&self) -> Duration {
        Duration::from_millis(self.attr_ttl_ms)
    }

    pub fn entry_ttl(&self) -> Duration {
        Duration::from_millis(self.entry_ttl_ms)
    }
}

impl Config {
    /// Load `fusebridge.toml` (or `path`) and `FUSEBRIDGE__*` overrides
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        Self::load_with(path, Self::environment())
    }

    fn environment() -> config::Environment {
        config::Environment::with_prefix(ENV_PREFIX)
            .prefix_separator("__")
            .separator("__")
            .try_parsing(true)
            .list_separator(",")
            .with_list_parse_key("fuse.options")
    }

    fn load_with(path: Option<&Path>, env: config::Environment) -> anyhow::Result<Self> {
        let file = match path {
            Some(path) => config::File::from(path).required(true),
            None => config::File::with_name("fusebridge").required(false),
        };

        let config = config::Config::builder().add_source(file).add_source(env).build()?;

        Ok(config.try_deserialize()?)
    }

    pub fn dispatch_options(&self) -> DispatchOptions {
        DispatchOptions {
            attr_ttl: self.cache.attr_ttl(),
            min_dir_buffer: self.dispatch.min_dir_buffer,
        }
    }
}
