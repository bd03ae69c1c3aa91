use std::{fs, path::{Path, PathBuf}};

use pyroprof_common::{MAX_PIDS, PROFILE_MAPS_SIZE, PROG_ARRAY_SIZE};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_CONFIG: &str = "Pyroprof.toml";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("unable to read {path:?}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config {path:?}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("{0} must be greater than 0")]
    Zero(&'static str),
}

/// Sizes of the session tables and the per-process policy defaults
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct SessionOptions {
    pub max_pids: u32,
    pub profile_maps_size: u32,
    pub prog_array_size: u32,
    /// 0 means every online cpu
    pub num_cpus: u32,
    pub perf_buffer_capacity: usize,
    /// Hz
    pub sample_rate: u64,
    pub collect_user: bool,
    pub collect_kernel: bool,
    pub python: bool,
    /// The stack store is fully reset every this many collections
    pub stacks_reset_interval: u32,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            max_pids: MAX_PIDS,
            profile_maps_size: PROFILE_MAPS_SIZE,
            prog_array_size: PROG_ARRAY_SIZE,
            num_cpus: 0,
            perf_buffer_capacity: 1024,
            sample_rate: 97,
            collect_user: true,
            collect_kernel: true,
            python: false,
            stacks_reset_interval: 10,
        }
    }
}

impl SessionOptions {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_owned(),
            source,
        })?;
        let options: SessionOptions = toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_owned(),
            source,
        })?;
        options.validate()?;
        Ok(options)
    }

    /// `Pyroprof.toml` in the current dir if present, defaults otherwise
    pub fn load_default() -> Result<Self, ConfigError> {
        if Path::new(DEFAULT_CONFIG).exists() {
            Self::from_path(DEFAULT_CONFIG)
        } else {
            Ok(Self::default())
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let nonzero = [
            ("max_pids", self.max_pids as u64),
            ("profile_maps_size", self.profile_maps_size as u64),
            ("prog_array_size", self.prog_array_size as u64),
            ("perf_buffer_capacity", self.perf_buffer_capacity as u64),
            ("sample_rate", self.sample_rate),
            ("stacks_reset_interval", self.stacks_reset_interval as u64),
        ];
        match nonzero.iter().find(|(_, v)| *v == 0) {
            Some((name, _)) => Err(ConfigError::Zero(name)),
            None => Ok(()),
        }
    }

    pub fn cpus(&self) -> u32 {
        if self.num_cpus > 0 {
            return self.num_cpus;
        }
        std::thread::available_parallelism()
            .map(|n| n.get() as u32)
            .unwrap_or(1)
    }
}
