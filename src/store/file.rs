//! Directory-backed store.
//!
//! Layout below the root directory:
//!
//! ```text
//! identities/local       long-term identity
//! prekeys/<id>           one file per prekey, decimal id
//! sessions/<hex(id)>     one file per session
//! ```
//!
//! Session ids are hex-encoded so any string is a valid file name. Every
//! write lands in a temporary file first and is renamed into place.

use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use crate::store::{IdentityStore, PreKeyStore, SessionStore, StoreError, StoreResult};

const IDENTITY_DIR: &str = "identities";
const IDENTITY_FILE: &str = "local";
const PREKEY_DIR: &str = "prekeys";
const SESSION_DIR: &str = "sessions";
const TMP_SUFFIX: &str = ".tmp";

/// Store rooted at a directory on disk.
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
    sync_writes: bool,
}

impl FileStore {
    /// Open (and create if needed) a store at `root`.
    pub fn open(root: impl AsRef<Path>) -> StoreResult<Self> {
        let root = root.as_ref().to_path_buf();
        for dir in [IDENTITY_DIR, PREKEY_DIR, SESSION_DIR] {
            fs::create_dir_all(root.join(dir))?;
        }
        Ok(Self {
            root,
            sync_writes: true,
        })
    }

    /// Toggle `fsync` after each write.
    pub fn with_sync_writes(mut self, sync_writes: bool) -> Self {
        self.sync_writes = sync_writes;
        self
    }

    /// Root directory of this store.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn identity_path(&self) -> PathBuf {
        self.root.join(IDENTITY_DIR).join(IDENTITY_FILE)
    }

    fn prekey_path(&self, id: u16) -> PathBuf {
        self.root.join(PREKEY_DIR).join(id.to_string())
    }

    fn session_path(&self, id: &str) -> PathBuf {
        self.root.join(SESSION_DIR).join(hex::encode(id))
    }

    fn write_atomic(&self, path: &Path, bytes: &[u8]) -> StoreResult<()> {
        let mut tmp = path.as_os_str().to_owned();
        tmp.push(TMP_SUFFIX);
        let tmp = PathBuf::from(tmp);

        let mut file = fs::File::create(&tmp)?;
        file.write_all(bytes)?;
        if self.sync_writes {
            file.sync_all()?;
        }
        drop(file);

        fs::rename(&tmp, path)?;
        Ok(())
    }

    fn entry_names(&self, dir: &str) -> StoreResult<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(self.root.join(dir))? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                if !name.ends_with(TMP_SUFFIX) {
                    names.push(name.to_string());
                }
            }
        }
        Ok(names)
    }
}

fn read_optional(path: &Path) -> StoreResult<Option<Vec<u8>>> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(StoreError::Io(e)),
    }
}

fn remove_optional(path: &Path) -> StoreResult<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(StoreError::Io(e)),
    }
}

impl IdentityStore for FileStore {
    fn load_identity(&self) -> StoreResult<Option<Vec<u8>>> {
        read_optional(&self.identity_path())
    }

    fn save_identity(&self, identity: &[u8]) -> StoreResult<()> {
        self.write_atomic(&self.identity_path(), identity)
    }
}

impl PreKeyStore for FileStore {
    fn load_prekey(&self, id: u16) -> StoreResult<Option<Vec<u8>>> {
        read_optional(&self.prekey_path(id))
    }

    fn save_prekey(&self, id: u16, record: &[u8]) -> StoreResult<()> {
        self.write_atomic(&self.prekey_path(id), record)
    }

    fn remove_prekey(&self, id: u16) -> StoreResult<()> {
        remove_optional(&self.prekey_path(id))
    }

    fn prekey_ids(&self) -> StoreResult<Vec<u16>> {
        let mut ids: Vec<u16> = self
            .entry_names(PREKEY_DIR)?
            .iter()
            .filter_map(|name| name.parse().ok())
            .collect();
        ids.sort_unstable();
        Ok(ids)
    }
}

impl SessionStore for FileStore {
    fn load_session(&self, id: &str) -> StoreResult<Option<Vec<u8>>> {
        read_optional(&self.session_path(id))
    }

    fn has_session(&self, id: &str) -> StoreResult<bool> {
        Ok(self.session_path(id).is_file())
    }

    fn save_session(&self, id: &str, record: &[u8]) -> StoreResult<()> {
        self.write_atomic(&self.session_path(id), record)
    }

    fn delete_session(&self, id: &str) -> StoreResult<()> {
        remove_optional(&self.session_path(id))
    }

    fn session_ids(&self) -> StoreResult<Vec<String>> {
        let mut ids = Vec::new();
        for name in self.entry_names(SESSION_DIR)? {
            let Ok(bytes) = hex::decode(&name) else {
                log::warn!("ignoring foreign file in session directory: {name}");
                continue;
            };
            ids.push(String::from_utf8(bytes)?);
        }
        ids.sort();
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_creates_layout_on_open() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).unwrap();

        assert!(store.root().join("identities").is_dir());
        assert!(store.root().join("prekeys").is_dir());
        assert!(store.root().join("sessions").is_dir());
        assert!(store.load_identity().unwrap().is_none());
    }

    #[test]
    fn test_session_ids_survive_arbitrary_characters() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).unwrap().with_sync_writes(false);

        store.save_session("conv/42_device:a1", b"one").unwrap();
        store.save_session("ünïcode", b"two").unwrap();

        assert_eq!(
            store.session_ids().unwrap(),
            vec!["conv/42_device:a1".to_string(), "ünïcode".to_string()]
        );
        assert_eq!(store.load_session("ünïcode").unwrap(), Some(b"two".to_vec()));
    }

    #[test]
    fn test_missing_records_are_not_errors() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).unwrap();

        assert!(store.load_prekey(3).unwrap().is_none());
        store.remove_prekey(3).unwrap();
        store.delete_session("nobody").unwrap();
        assert!(!store.has_session("nobody").unwrap());
    }

    #[test]
    fn test_prekeys_are_listed_by_id() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).unwrap().with_sync_writes(false);

        for id in [10u16, 2, 65535] {
            store.save_prekey(id, b"k").unwrap();
        }
        store.remove_prekey(10).unwrap();

        assert_eq!(store.prekey_ids().unwrap(), vec![2, 65535]);
    }
}
