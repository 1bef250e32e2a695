//! Persistent host identity.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing::{info, warn};

use warden_primitives::AgentIdentity;

use crate::{AgentError, AgentResult};

/// File the identity document is stored in, under the state directory.
const IDENTITY_FILE: &str = "agent_info.db";

/// Returns the OS-appropriate state directory.
#[cfg(not(windows))]
#[must_use]
pub fn default_state_dir() -> PathBuf {
    PathBuf::from("/var/lib/warden-agent")
}

/// Returns the OS-appropriate state directory.
#[cfg(windows)]
#[must_use]
pub fn default_state_dir() -> PathBuf {
    let program_data =
        std::env::var("ProgramData").unwrap_or_else(|_| "C:\\ProgramData".to_owned());
    PathBuf::from(program_data).join("warden-agent")
}

/// Durable [`AgentIdentity`] plus the derived request headers and batch
/// metadata.
///
/// Mutations persist before returning, with a write-temp-then-rename so a
/// crash mid-write cannot corrupt the stored document.
pub struct AgentInfo {
    path: PathBuf,
    identity: Mutex<AgentIdentity>,
}

impl AgentInfo {
    /// Loads the identity from `state_dir`, generating and persisting a
    /// fresh uuid on first run.
    ///
    /// # Errors
    ///
    /// Returns [`AgentError`] when the state directory is not writable or
    /// the stored document cannot be decoded.
    pub fn load(state_dir: &Path) -> AgentResult<Self> {
        std::fs::create_dir_all(state_dir)?;
        let path = state_dir.join(IDENTITY_FILE);

        let identity = match std::fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|err| AgentError::Identity {
                reason: format!("decoding {}: {err}", path.display()),
            })?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                let identity = AgentIdentity::generate();
                info!(uuid = identity.uuid(), "generated a fresh agent identity");
                persist(&path, &identity)?;
                identity
            }
            Err(err) => return Err(err.into()),
        };

        Ok(Self {
            path,
            identity: Mutex::new(identity),
        })
    }

    /// Returns the enrolment uuid.
    #[must_use]
    pub fn uuid(&self) -> String {
        self.lock().uuid().to_owned()
    }

    /// Returns the enrolment key.
    #[must_use]
    pub fn key(&self) -> String {
        self.lock().key().to_owned()
    }

    /// Returns the ordered group list.
    #[must_use]
    pub fn groups(&self) -> Vec<String> {
        self.lock().groups().to_vec()
    }

    /// Replaces the enrolment credentials, persisting before return.
    ///
    /// # Errors
    ///
    /// Returns [`AgentError`] when the document cannot be written; the
    /// in-memory identity is left unchanged in that case.
    pub fn set_credentials(&self, uuid: &str, key: &str) -> AgentResult<()> {
        let current_groups = self.lock().groups().to_vec();
        let mut updated = AgentIdentity::new(uuid, key).map_err(|err| AgentError::Identity {
            reason: err.to_string(),
        })?;
        updated.set_groups(current_groups);
        persist(&self.path, &updated)?;
        *self.lock() = updated;
        Ok(())
    }

    /// Replaces the group list, persisting before return.
    ///
    /// # Errors
    ///
    /// Returns [`AgentError`] when the document cannot be written; the
    /// in-memory identity is left unchanged in that case.
    pub fn set_groups(&self, groups: Vec<String>) -> AgentResult<()> {
        let mut updated = self.lock().clone();
        updated.set_groups(groups);
        persist(&self.path, &updated)?;
        *self.lock() = updated;
        Ok(())
    }

    /// `User-Agent` string presented to the manager.
    #[must_use]
    pub fn header_info(&self) -> String {
        format!(
            "warden-agent/{} ({}; {})",
            env!("CARGO_PKG_VERSION"),
            std::env::consts::OS,
            std::env::consts::ARCH
        )
    }

    /// Agent metadata JSON prepended to every outgoing batch.
    #[must_use]
    pub fn metadata_info(&self) -> String {
        let identity = self.lock();
        serde_json::json!({
            "agent": {
                "id": identity.uuid(),
                "groups": identity.groups(),
            }
        })
        .to_string()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, AgentIdentity> {
        self.identity
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

fn persist(path: &Path, identity: &AgentIdentity) -> AgentResult<()> {
    let bytes = serde_json::to_vec_pretty(identity).map_err(|err| AgentError::Identity {
        reason: err.to_string(),
    })?;

    let tmp_path = path.with_extension("db.tmp");
    std::fs::write(&tmp_path, bytes)?;
    if let Err(err) = std::fs::rename(&tmp_path, path) {
        warn!(%err, "could not swap identity document into place");
        return Err(err.into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_run_generates_and_persists_a_uuid() {
        let dir = tempfile::tempdir().unwrap();
        let first = AgentInfo::load(dir.path()).unwrap();
        let uuid = first.uuid();
        assert!(!uuid.is_empty());
        drop(first);

        let second = AgentInfo::load(dir.path()).unwrap();
        assert_eq!(second.uuid(), uuid);
    }

    #[test]
    fn credentials_and_groups_survive_reload() {
        let dir = tempfile::tempdir().unwrap();

        {
            let info = AgentInfo::load(dir.path()).unwrap();
            info.set_credentials("uuid-1", "key-1").unwrap();
            info.set_groups(vec!["default".to_owned(), "linux".to_owned()])
                .unwrap();
        }

        let info = AgentInfo::load(dir.path()).unwrap();
        assert_eq!(info.uuid(), "uuid-1");
        assert_eq!(info.key(), "key-1");
        assert_eq!(info.groups(), ["default", "linux"]);
    }

    #[test]
    fn replacing_groups_discards_the_previous_list() {
        let dir = tempfile::tempdir().unwrap();
        let info = AgentInfo::load(dir.path()).unwrap();

        info.set_groups(vec!["group_1".to_owned(), "group_2".to_owned()])
            .unwrap();
        info.set_groups(vec!["group_3".to_owned()]).unwrap();
        assert_eq!(info.groups(), ["group_3"]);
    }

    #[test]
    fn metadata_carries_id_and_groups() {
        let dir = tempfile::tempdir().unwrap();
        let info = AgentInfo::load(dir.path()).unwrap();
        info.set_credentials("uuid-9", "k").unwrap();
        info.set_groups(vec!["default".to_owned()]).unwrap();

        let metadata: serde_json::Value = serde_json::from_str(&info.metadata_info()).unwrap();
        assert_eq!(metadata["agent"]["id"], "uuid-9");
        assert_eq!(metadata["agent"]["groups"][0], "default");
    }
}
