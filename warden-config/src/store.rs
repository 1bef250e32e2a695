//! The configuration store.

use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use serde_yaml::{Mapping, Value};
use tracing::warn;

use crate::merge::merge_values;
use crate::{parse_time_millis, ConfigError, ConfigResult};

/// Supplies the ordered list of configuration groups the host belongs to.
pub type GroupProvider = Arc<dyn Fn() -> Vec<String> + Send + Sync>;

#[cfg(not(windows))]
fn default_config_path() -> PathBuf {
    PathBuf::from("/etc/warden-agent/warden-agent.yml")
}

#[cfg(windows)]
fn default_config_path() -> PathBuf {
    let program_data =
        std::env::var("ProgramData").unwrap_or_else(|_| "C:\\ProgramData".to_owned());
    PathBuf::from(program_data).join("warden-agent\\config\\warden-agent.yml")
}

#[cfg(not(windows))]
fn default_shared_dir() -> PathBuf {
    PathBuf::from("/etc/warden-agent/shared")
}

#[cfg(windows)]
fn default_shared_dir() -> PathBuf {
    let program_data =
        std::env::var("ProgramData").unwrap_or_else(|_| "C:\\ProgramData".to_owned());
    PathBuf::from(program_data).join("warden-agent\\shared")
}

enum Source {
    File(PathBuf),
    Literal(String),
}

/// Layered configuration store.
///
/// Lookups read from an immutable snapshot behind an `Arc`; [`reload`]
/// builds a fresh snapshot off to the side and swaps it in atomically, so
/// concurrent readers see either the old or the new document, never a mix.
///
/// [`reload`]: ConfigStore::reload
pub struct ConfigStore {
    source: Source,
    shared_dir: PathBuf,
    group_provider: RwLock<Option<GroupProvider>>,
    snapshot: RwLock<Arc<Value>>,
}

impl ConfigStore {
    /// Opens the store against the OS-default configuration file.
    #[must_use]
    pub fn from_default_path() -> Self {
        Self::from_file(default_config_path())
    }

    /// Opens the store against an explicit configuration file.
    ///
    /// A missing or unparsable base document logs a warning and leaves the
    /// store with an empty configuration; every lookup then reports absent.
    #[must_use]
    pub fn from_file(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let base = match load_yaml_file(&path) {
            Ok(value) => value,
            Err(err) => {
                warn!(path = %path.display(), %err, "using default values, base configuration could not be loaded");
                empty_document()
            }
        };

        Self {
            source: Source::File(path),
            shared_dir: default_shared_dir(),
            group_provider: RwLock::new(None),
            snapshot: RwLock::new(Arc::new(base)),
        }
    }

    /// Builds the store from an in-memory YAML document.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when the document is malformed.
    pub fn from_literal(document: impl Into<String>) -> ConfigResult<Self> {
        let document = document.into();
        let base: Value = serde_yaml::from_str(&document)?;
        Ok(Self {
            source: Source::Literal(document),
            shared_dir: default_shared_dir(),
            group_provider: RwLock::new(None),
            snapshot: RwLock::new(Arc::new(normalize(base))),
        })
    }

    /// Overrides the directory group overlay files are read from.
    pub fn set_shared_dir(&mut self, dir: impl Into<PathBuf>) {
        self.shared_dir = dir.into();
    }

    /// Returns the directory group overlay files are read from.
    #[must_use]
    pub fn shared_dir(&self) -> &Path {
        &self.shared_dir
    }

    /// Installs the group provider consulted on every [`reload`].
    ///
    /// [`reload`]: ConfigStore::reload
    pub fn set_group_provider(&self, provider: GroupProvider) {
        *write_lock(&self.group_provider) = Some(provider);
    }

    /// Re-runs the construction pipeline and atomically swaps the snapshot.
    ///
    /// The base document is re-read from the original source (file or
    /// literal); a base failure falls back to an empty document with a
    /// warning, exactly as at construction. Each group overlay is then
    /// merged in provider order.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Overlay`] when a group file cannot be read or
    /// parsed; the current snapshot is left untouched.
    pub fn reload(&self) -> ConfigResult<()> {
        let mut fresh = match &self.source {
            Source::File(path) => match load_yaml_file(path) {
                Ok(value) => value,
                Err(err) => {
                    warn!(path = %path.display(), %err, "using default values, base configuration could not be loaded");
                    empty_document()
                }
            },
            Source::Literal(document) => serde_yaml::from_str(document)
                .map(normalize)
                .unwrap_or_else(|err| {
                    warn!(%err, "using default values, base configuration could not be parsed");
                    empty_document()
                }),
        };

        let provider = read_lock(&self.group_provider).clone();
        if let Some(provider) = provider {
            for group in provider() {
                let path = self.shared_dir.join(format!("{group}.conf"));
                let overlay = load_yaml_file(&path).map_err(|err| ConfigError::Overlay {
                    group: group.clone(),
                    reason: err.to_string(),
                })?;
                merge_values(&mut fresh, overlay);
            }
        }

        *write_lock(&self.snapshot) = Arc::new(fresh);
        Ok(())
    }

    /// Returns the current snapshot.
    #[must_use]
    pub fn snapshot(&self) -> Arc<Value> {
        Arc::clone(&read_lock(&self.snapshot))
    }

    /// Looks up `table.key`, converting the node to `T`.
    ///
    /// Absent keys and nodes of the wrong shape both report `None`.
    #[must_use]
    pub fn get<T: FromConfigValue>(&self, table: &str, key: &str) -> Option<T> {
        let snapshot = self.snapshot();
        let node = snapshot.get(table)?.get(key)?;
        T::from_config_value(node)
    }

    /// Looks up a duration-valued option, normalized to milliseconds.
    ///
    /// String nodes accept the `ms|s|m|h|d` suffixes (bare numbers are
    /// seconds); integer nodes are read as seconds. Malformed values log a
    /// warning and report absent.
    #[must_use]
    pub fn get_time_millis(&self, table: &str, key: &str) -> Option<u64> {
        let snapshot = self.snapshot();
        let node = snapshot.get(table)?.get(key)?;

        match node {
            Value::Number(n) => n.as_u64().map(|secs| secs * 1000),
            Value::String(text) => match parse_time_millis(text) {
                Ok(millis) => Some(millis),
                Err(err) => {
                    warn!(table, key, %err, "ignoring malformed duration option");
                    None
                }
            },
            _ => None,
        }
    }
}

/// Conversion from a YAML node into a typed configuration value.
pub trait FromConfigValue: Sized {
    /// Converts the node, reporting `None` when the shape does not match.
    fn from_config_value(value: &Value) -> Option<Self>;
}

impl FromConfigValue for bool {
    fn from_config_value(value: &Value) -> Option<Self> {
        value.as_bool()
    }
}

impl FromConfigValue for i64 {
    fn from_config_value(value: &Value) -> Option<Self> {
        value.as_i64()
    }
}

impl FromConfigValue for String {
    fn from_config_value(value: &Value) -> Option<Self> {
        value.as_str().map(str::to_owned)
    }
}

impl FromConfigValue for Vec<String> {
    fn from_config_value(value: &Value) -> Option<Self> {
        value
            .as_sequence()?
            .iter()
            .map(|item| item.as_str().map(str::to_owned))
            .collect()
    }
}

fn empty_document() -> Value {
    Value::Mapping(Mapping::new())
}

// A file containing only comments parses to Null; treat it as empty.
fn normalize(value: Value) -> Value {
    if value.is_null() {
        empty_document()
    } else {
        value
    }
}

fn load_yaml_file(path: &Path) -> ConfigResult<Value> {
    let text = std::fs::read_to_string(path).map_err(|err| ConfigError::Io {
        path: path.display().to_string(),
        reason: err.to_string(),
    })?;
    Ok(normalize(serde_yaml::from_str(&text)?))
}

fn read_lock<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(std::sync::PoisonError::into_inner)
}

fn write_lock<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    lock.write()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    const BASE: &str = "\
agent:
  manager_ip: 127.0.0.1
  agent_comms_api_port: 27000
  use_https: false
  retry_interval: 5s
  max_batching_size: 1048576
logcollector:
  paths:
    - /var/log/syslog
";

    #[test]
    fn typed_lookups() {
        let store = ConfigStore::from_literal(BASE).unwrap();

        assert_eq!(
            store.get::<String>("agent", "manager_ip").as_deref(),
            Some("127.0.0.1")
        );
        assert_eq!(
            store.get::<i64>("agent", "agent_comms_api_port"),
            Some(27000)
        );
        assert_eq!(store.get::<bool>("agent", "use_https"), Some(false));
        assert_eq!(
            store.get::<Vec<String>>("logcollector", "paths"),
            Some(vec!["/var/log/syslog".to_owned()])
        );
        assert_eq!(store.get::<String>("agent", "missing"), None);
        assert_eq!(store.get::<i64>("missing", "missing"), None);
    }

    #[test]
    fn duration_lookups() {
        let store = ConfigStore::from_literal(BASE).unwrap();
        assert_eq!(store.get_time_millis("agent", "retry_interval"), Some(5000));
        // Integer nodes default to seconds.
        assert_eq!(
            store.get_time_millis("agent", "max_batching_size"),
            Some(1_048_576_000)
        );
        assert_eq!(store.get_time_millis("agent", "manager_ip"), None);
    }

    #[test]
    fn malformed_literal_is_rejected() {
        assert!(ConfigStore::from_literal("agent: [unbalanced").is_err());
    }

    #[test]
    fn unreadable_base_file_yields_empty_config() {
        let store = ConfigStore::from_file("/nonexistent/warden-agent.yml");
        assert_eq!(store.get::<String>("agent", "manager_ip"), None);
    }

    #[test]
    fn reload_applies_group_overlays_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let mut default_conf = std::fs::File::create(dir.path().join("default.conf")).unwrap();
        writeln!(default_conf, "agent:\n  max_batching_size: 2048").unwrap();
        let mut linux_conf = std::fs::File::create(dir.path().join("linux.conf")).unwrap();
        writeln!(linux_conf, "logcollector:\n  paths:\n    - /var/log/auth.log").unwrap();

        let mut store = ConfigStore::from_literal(BASE).unwrap();
        store.set_shared_dir(dir.path());
        store.set_group_provider(Arc::new(|| {
            vec!["default".to_owned(), "linux".to_owned()]
        }));

        store.reload().unwrap();

        assert_eq!(store.get::<i64>("agent", "max_batching_size"), Some(2048));
        assert_eq!(
            store.get::<Vec<String>>("logcollector", "paths"),
            Some(vec![
                "/var/log/syslog".to_owned(),
                "/var/log/auth.log".to_owned()
            ])
        );
    }

    #[test]
    fn failed_overlay_leaves_snapshot_untouched() {
        let dir = tempfile::tempdir().unwrap();

        let mut store = ConfigStore::from_literal(BASE).unwrap();
        store.set_shared_dir(dir.path());
        store.set_group_provider(Arc::new(|| vec!["missing".to_owned()]));

        let err = store.reload().expect_err("overlay file is absent");
        assert!(matches!(err, ConfigError::Overlay { .. }));
        assert_eq!(
            store.get::<i64>("agent", "max_batching_size"),
            Some(1_048_576)
        );
    }
}
