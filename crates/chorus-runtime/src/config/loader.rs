//! Layered configuration for the host.
//!
//! Sources, each overriding the one before:
//!
//! - built-in defaults, then anything passed to [`ConfigLoader::merge`];
//! - `chorus.<profile>.toml`, then `chorus.toml` (or `config.toml`) from
//!   the first search directory holding one; YAML with `yaml-config`;
//! - the deployment variables `OWNER_NUMBER`, `ADMIN_NUMBERS`, `PREFIX`,
//!   `MODE`, `STORE_URI`, `TIMEZONE` and `PLUGIN_DIR`;
//! - `CHORUS_`-prefixed variables, `__` separating sections, so
//!   `CHORUS_PLUGINS__ECONOMY__CURRENCY=NGN` sets
//!   `plugins.economy.currency`.
//!
//! The profile comes from `CHORUS_PROFILE` unless set on the loader.

use std::path::{Path, PathBuf};

use figment::Figment;
#[cfg(any(feature = "yaml-config", feature = "toml-config"))]
use figment::providers::Format;
#[cfg(feature = "toml-config")]
use figment::providers::Toml;
#[cfg(feature = "yaml-config")]
use figment::providers::Yaml;
use figment::providers::{Env, Serialized};
use tracing::{debug, info, warn};

use super::error::{ConfigError, ConfigResult};
use super::schema::ChorusConfig;

/// Deployment variables read without a prefix, and the key each one sets.
const OPERATOR_VARS: [(&str, &str); 7] = [
    ("OWNER_NUMBER", "host.owner_number"),
    ("ADMIN_NUMBERS", "host.admin_numbers"),
    ("PREFIX", "host.prefix"),
    ("MODE", "host.mode"),
    ("STORE_URI", "store.uri"),
    ("TIMEZONE", "host.timezone"),
    ("PLUGIN_DIR", "host.plugin_dir"),
];

/// Config file names tried in each search directory, in order.
const FILE_NAMES: &[&str] = &[
    #[cfg(feature = "toml-config")]
    "chorus.toml",
    #[cfg(feature = "toml-config")]
    "config.toml",
    #[cfg(feature = "yaml-config")]
    "chorus.yaml",
    #[cfg(feature = "yaml-config")]
    "chorus.yml",
];

/// Deployment profile; selects `chorus.<profile>.toml`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Profile {
    #[default]
    Development,
    Production,
    Custom(String),
}

impl Profile {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Development => "development",
            Self::Production => "production",
            Self::Custom(name) => name,
        }
    }

    /// Accepts `dev`/`prod` shorthands; anything else is a custom profile.
    pub fn parse(name: &str) -> Self {
        match name.to_lowercase().as_str() {
            "production" | "prod" => Self::Production,
            "development" | "dev" => Self::Development,
            other => Self::Custom(other.to_string()),
        }
    }

    fn from_env() -> Self {
        std::env::var("CHORUS_PROFILE")
            .map(|p| Self::parse(&p))
            .unwrap_or_default()
    }
}

impl std::fmt::Display for Profile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Builds a [`ChorusConfig`] from defaults, files and the environment.
pub struct ConfigLoader {
    overrides: Figment,
    profile: Profile,
    dirs: Vec<PathBuf>,
    file: Option<PathBuf>,
    env: bool,
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigLoader {
    /// Searches the working directory and `~/.config/chorus`, and reads
    /// the environment.
    pub fn new() -> Self {
        Self {
            overrides: Figment::new(),
            profile: Profile::from_env(),
            dirs: Vec::new(),
            file: None,
            env: true,
        }
    }

    pub fn profile(mut self, profile: impl AsRef<str>) -> Self {
        self.profile = Profile::parse(profile.as_ref());
        self
    }

    /// Searches `dir` instead of the default directories. Repeatable.
    pub fn search_path(mut self, dir: impl AsRef<Path>) -> Self {
        self.dirs.push(dir.as_ref().to_path_buf());
        self
    }

    /// Reads exactly this file; it must exist.
    pub fn file(mut self, path: impl AsRef<Path>) -> Self {
        self.file = Some(path.as_ref().to_path_buf());
        self
    }

    /// Ignores environment variables.
    pub fn without_env(mut self) -> Self {
        self.env = false;
        self
    }

    /// Layers `config` over the defaults, below files and the environment.
    pub fn merge(mut self, config: ChorusConfig) -> Self {
        self.overrides = self.overrides.merge(Serialized::defaults(config));
        self
    }

    pub fn load(self) -> ConfigResult<ChorusConfig> {
        let config: ChorusConfig = self.figment()?.extract()?;
        debug!(
            profile = %self.profile,
            store = %config.store.uri,
            plugin_dir = %config.host.plugin_dir.display(),
            "Configuration loaded"
        );
        Ok(config)
    }

    fn figment(&self) -> ConfigResult<Figment> {
        let mut figment = Figment::from(Serialized::defaults(ChorusConfig::default()))
            .merge(self.overrides.clone());

        match &self.file {
            Some(path) if !path.exists() => return Err(ConfigError::FileNotFound(path.clone())),
            Some(path) => figment = merge_file(figment, path)?,
            None => {
                let files = self.discover();
                if files.is_empty() {
                    warn!("No configuration file found, using defaults");
                }
                for path in files {
                    figment = merge_file(figment, &path)?;
                }
            }
        }

        if self.env {
            let names: Vec<&str> = OPERATOR_VARS.iter().map(|(name, _)| *name).collect();
            figment = figment
                .merge(Env::raw().only(&names).map(|key| {
                    OPERATOR_VARS
                        .iter()
                        .find(|(name, _)| key.as_str().eq_ignore_ascii_case(name))
                        .map_or_else(|| key.as_str().to_owned().into(), |(_, path)| (*path).into())
                }))
                .merge(Env::prefixed("CHORUS_").ignore(&["PROFILE"]).split("__"));
        }
        Ok(figment)
    }

    /// Files to merge, lowest precedence first: the profile variant (when
    /// present) and then the base file, from the first directory that has
    /// a base file.
    fn discover(&self) -> Vec<PathBuf> {
        let roots = if self.dirs.is_empty() {
            std::env::current_dir()
                .ok()
                .into_iter()
                .chain(dirs::config_dir().map(|d| d.join("chorus")))
                .collect()
        } else {
            self.dirs.clone()
        };

        for dir in &roots {
            for name in FILE_NAMES {
                let base = dir.join(name);
                if !base.exists() {
                    continue;
                }
                let mut files = Vec::with_capacity(2);
                if let Some((stem, ext)) = name.rsplit_once('.') {
                    let variant = dir.join(format!("{stem}.{}.{ext}", self.profile));
                    if variant.exists() {
                        files.push(variant);
                    }
                }
                info!(path = %base.display(), "Loading configuration file");
                files.push(base);
                return files;
            }
        }
        Vec::new()
    }
}

fn merge_file(figment: Figment, path: &Path) -> ConfigResult<Figment> {
    match path.extension().and_then(|e| e.to_str()).unwrap_or("") {
        #[cfg(feature = "toml-config")]
        "toml" => Ok(figment.merge(Toml::file(path))),
        #[cfg(feature = "yaml-config")]
        "yaml" | "yml" => Ok(figment.merge(Yaml::file(path))),
        ext => Err(ConfigError::ParseError(format!(
            "cannot read .{ext} configuration files"
        ))),
    }
}

/// Loads configuration from the default locations and the environment.
pub fn load_config() -> ConfigResult<ChorusConfig> {
    ConfigLoader::new().load()
}

/// Loads configuration from `path` and the environment.
pub fn load_config_from_file(path: impl AsRef<Path>) -> ConfigResult<ChorusConfig> {
    ConfigLoader::new().file(path).load()
}
