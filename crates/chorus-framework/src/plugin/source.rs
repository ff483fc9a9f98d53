//! Plugin discovery.
//!
//! A plugin file is a small TOML document naming a compiled-in plugin kind
//! and how to instantiate it:
//!
//! ```toml
//! kind = "economy"
//! name = "economy"        # optional, defaults to the plugin's own name
//! enabled = true
//!
//! [overrides]
//! cooldown_ms = 3000
//! aliases = ["bal"]
//!
//! [overrides.tasks.interest]
//! cron = "0 0 * * *"
//!
//! [config]
//! interest_rate = 0.01
//! ```
//!
//! Files are loaded in file-name order; that order is the plugin load order.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use figment::Figment;
use figment::providers::{Format, Toml};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, trace};

use super::ManifestOverrides;
use crate::error::{RegistryError, RegistryResult};

/// File extension of plugin files.
pub const PLUGIN_FILE_EXTENSION: &str = "toml";

// ─── PluginFile ──────────────────────────────────────────────────────────────

/// One discovered plugin instance.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PluginFile {
    /// File name, used as the sort key and in diagnostics.
    pub file: String,
    /// Catalog kind to instantiate.
    pub kind: String,
    /// Instance name; the manifest name when absent.
    pub name: Option<String>,
    /// Whether the plugin starts enabled.
    pub enabled: bool,
    /// Manifest adjustments.
    pub overrides: ManifestOverrides,
    /// The plugin's `[config]` table.
    pub config: Value,
    /// Content hash; a changed hash means the plugin is re-initialised on reload.
    #[serde(skip)]
    pub fingerprint: u64,
}

impl PluginFile {
    /// Creates an enabled instance of `kind` with an empty config.
    pub fn new(file: impl Into<String>, kind: impl Into<String>) -> Self {
        let mut this = Self {
            file: file.into(),
            kind: kind.into(),
            name: None,
            enabled: true,
            overrides: ManifestOverrides::default(),
            config: Value::Object(Map::new()),
            fingerprint: 0,
        };
        this.refresh_fingerprint();
        this
    }

    /// Sets the instance name.
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self.refresh_fingerprint();
        self
    }

    /// Starts the plugin disabled.
    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self.refresh_fingerprint();
        self
    }

    /// Sets the config table.
    pub fn with_config(mut self, config: Value) -> Self {
        self.config = config;
        self.refresh_fingerprint();
        self
    }

    /// Sets the manifest overrides.
    pub fn with_overrides(mut self, overrides: ManifestOverrides) -> Self {
        self.overrides = overrides;
        self.refresh_fingerprint();
        self
    }

    fn refresh_fingerprint(&mut self) {
        let encoded = serde_json::to_vec(self).unwrap_or_default();
        self.fingerprint = fingerprint(&encoded);
    }
}

fn fingerprint(bytes: &[u8]) -> u64 {
    let mut hasher = DefaultHasher::new();
    bytes.hash(&mut hasher);
    hasher.finish()
}

/// On-disk shape of a plugin file.
#[derive(Debug, Deserialize)]
struct RawPluginFile {
    kind: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default = "default_enabled")]
    enabled: bool,
    #[serde(default)]
    overrides: ManifestOverrides,
    #[serde(default)]
    config: Option<Value>,
}

fn default_enabled() -> bool {
    true
}

/// Parses one plugin file.
pub fn parse_plugin_file(file: &str, contents: &str) -> RegistryResult<PluginFile> {
    let raw: RawPluginFile = Figment::from(Toml::string(contents))
        .extract()
        .map_err(|e| RegistryError::InvalidFile {
            file: file.to_string(),
            message: e.to_string(),
        })?;

    if raw.kind.trim().is_empty() {
        return Err(RegistryError::InvalidFile {
            file: file.to_string(),
            message: "kind must not be empty".into(),
        });
    }
    if let Some(name) = &raw.name
        && name.trim().is_empty()
    {
        return Err(RegistryError::InvalidFile {
            file: file.to_string(),
            message: "name must not be empty".into(),
        });
    }

    Ok(PluginFile {
        file: file.to_string(),
        kind: raw.kind,
        name: raw.name,
        enabled: raw.enabled,
        overrides: raw.overrides,
        config: raw.config.unwrap_or_else(|| Value::Object(Map::new())),
        fingerprint: fingerprint(contents.as_bytes()),
    })
}

// ─── PluginSource ────────────────────────────────────────────────────────────

/// Where plugin files come from.
///
/// The outer result fails only when the source as a whole is unusable; a
/// single bad file is reported in its own slot so the rest still load.
#[async_trait]
pub trait PluginSource: Send + Sync + 'static {
    /// Lists plugin files in load order.
    async fn scan(&self) -> RegistryResult<Vec<RegistryResult<PluginFile>>>;
}

/// Reads `*.toml` files from a directory.
#[derive(Debug, Clone)]
pub struct DirectorySource {
    dir: PathBuf,
}

impl DirectorySource {
    /// Creates a source over `dir`.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// The directory scanned.
    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

#[async_trait]
impl PluginSource for DirectorySource {
    async fn scan(&self) -> RegistryResult<Vec<RegistryResult<PluginFile>>> {
        if !tokio::fs::try_exists(&self.dir).await.unwrap_or(false) {
            return Err(RegistryError::DirectoryMissing(self.dir.clone()));
        }

        let mut paths = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some(PLUGIN_FILE_EXTENSION)
                && entry.file_type().await?.is_file()
            {
                paths.push(path);
            } else {
                trace!(path = %path.display(), "Skipping non-plugin file");
            }
        }
        paths.sort();

        let mut files = Vec::with_capacity(paths.len());
        for path in paths {
            let file = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            let parsed = match tokio::fs::read_to_string(&path).await {
                Ok(contents) => parse_plugin_file(&file, &contents),
                Err(e) => Err(RegistryError::InvalidFile {
                    file,
                    message: e.to_string(),
                }),
            };
            files.push(parsed);
        }
        debug!(dir = %self.dir.display(), count = files.len(), "Scanned plugin directory");
        Ok(files)
    }
}

/// An in-memory source, replaceable between scans.
#[derive(Debug, Default)]
pub struct InlineSource {
    files: Mutex<Vec<PluginFile>>,
}

impl InlineSource {
    /// Creates a source serving `files`.
    pub fn new(files: Vec<PluginFile>) -> Self {
        Self {
            files: Mutex::new(files),
        }
    }

    /// Replaces the served files.
    pub fn set(&self, files: Vec<PluginFile>) {
        *self.files.lock() = files;
    }
}

#[async_trait]
impl PluginSource for InlineSource {
    async fn scan(&self) -> RegistryResult<Vec<RegistryResult<PluginFile>>> {
        let mut files = self.files.lock().clone();
        files.sort_by(|a, b| a.file.cmp(&b.file));
        Ok(files.into_iter().map(Ok).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_file() {
        let file = parse_plugin_file(
            "10-economy.toml",
            r#"
                kind = "economy"
                name = "bank"

                [overrides]
                cooldown_ms = 3000
                aliases = ["bal"]

                [overrides.tasks.interest]
                cron = "0 0 * * *"

                [config]
                interest_rate = 0.5
            "#,
        )
        .unwrap();

        assert_eq!(file.kind, "economy");
        assert_eq!(file.name.as_deref(), Some("bank"));
        assert!(file.enabled);
        assert_eq!(file.overrides.cooldown_ms, Some(3000));
        assert_eq!(file.overrides.aliases, Some(vec!["bal".to_string()]));
        assert_eq!(
            file.overrides.tasks["interest"].cron.as_deref(),
            Some("0 0 * * *")
        );
        assert_eq!(file.config["interest_rate"], 0.5);
    }

    #[test]
    fn test_optional_fields_default() {
        let file = parse_plugin_file("a.toml", "kind = \"ping\"").unwrap();
        assert!(file.enabled);
        assert!(file.name.is_none());
        assert_eq!(file.config, Value::Object(Map::new()));
        assert_eq!(file.overrides, ManifestOverrides::default());
    }

    #[test]
    fn test_invalid_files_are_reported() {
        assert!(matches!(
            parse_plugin_file("bad.toml", "kind = "),
            Err(RegistryError::InvalidFile { .. })
        ));
        assert!(matches!(
            parse_plugin_file("nokind.toml", "enabled = true"),
            Err(RegistryError::InvalidFile { .. })
        ));
        assert!(parse_plugin_file("empty.toml", "kind = \"x\"\nname = \" \"").is_err());
    }

    #[test]
    fn test_fingerprint_tracks_content() {
        let a = parse_plugin_file("a.toml", "kind = \"ping\"").unwrap();
        let b = parse_plugin_file("a.toml", "kind = \"ping\"").unwrap();
        let c = parse_plugin_file("a.toml", "kind = \"ping\"\nenabled = false").unwrap();
        assert_eq!(a.fingerprint, b.fingerprint);
        assert_ne!(a.fingerprint, c.fingerprint);

        let inline = PluginFile::new("a.toml", "ping");
        assert_ne!(inline.fingerprint, inline.clone().disabled().fingerprint);
    }

    #[tokio::test]
    async fn test_directory_scan_orders_by_file_name() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("20-b.toml"), "kind = \"b\"").unwrap();
        std::fs::write(dir.path().join("10-a.toml"), "kind = \"a\"").unwrap();
        std::fs::write(dir.path().join("15-broken.toml"), "kind = [").unwrap();
        std::fs::write(dir.path().join("README.md"), "ignored").unwrap();

        let files = DirectorySource::new(dir.path()).scan().await.unwrap();
        assert_eq!(files.len(), 3);
        assert_eq!(files[0].as_ref().unwrap().kind, "a");
        assert!(files[1].is_err());
        assert_eq!(files[2].as_ref().unwrap().kind, "b");
    }

    #[tokio::test]
    async fn test_missing_directory_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope");
        let err = DirectorySource::new(&missing).scan().await.unwrap_err();
        assert!(matches!(err, RegistryError::DirectoryMissing(p) if p == missing));
    }
}
