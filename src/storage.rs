use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

use crate::models::{CollectionsFile, SettingsFile};

const DATA_FILE: &str = "collections.json";
const SETTINGS_FILE: &str = "settings.json";
const BACKUP_DIR: &str = "backups";
const BACKUP_LIMIT: usize = 5;

pub const SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid backup name: {0}")]
    InvalidBackupName(String),
}

impl StorageError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::Io(err) if err.kind() == std::io::ErrorKind::NotFound)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupEntry {
    pub name: String,
    pub modified_at: i64,
}

/// JSON files under one data directory: collections, settings and rolling backups.
#[derive(Debug, Clone)]
pub struct Storage {
    root: PathBuf,
}

impl Storage {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn ensure_dirs(&self) -> Result<(), StorageError> {
        fs::create_dir_all(self.root.join(BACKUP_DIR))?;
        Ok(())
    }

    pub fn has_collections(&self) -> bool {
        self.root.join(DATA_FILE).exists()
    }

    pub fn load_collections(&self) -> Result<CollectionsFile, StorageError> {
        self.load_json(self.root.join(DATA_FILE))
    }

    pub fn load_settings(&self) -> Result<SettingsFile, StorageError> {
        self.load_json(self.root.join(SETTINGS_FILE))
    }

    pub fn save_collections(&self, data: &CollectionsFile) -> Result<(), StorageError> {
        self.write_atomic(self.root.join(DATA_FILE), data)
    }

    pub fn save_settings(&self, data: &SettingsFile) -> Result<(), StorageError> {
        self.write_atomic(self.root.join(SETTINGS_FILE), data)
    }

    fn load_json<T: DeserializeOwned>(&self, path: PathBuf) -> Result<T, StorageError> {
        let mut file = File::open(path)?;
        let mut buf = String::new();
        file.read_to_string(&mut buf)?;
        Ok(serde_json::from_str(&buf)?)
    }

    fn write_atomic<T: Serialize>(&self, path: PathBuf, data: &T) -> Result<(), StorageError> {
        let temp_path = path.with_extension("tmp");
        let json = serde_json::to_vec_pretty(data)?;
        {
            let mut file = File::create(&temp_path)?;
            file.write_all(&json)?;
            file.sync_all()?;
        }
        fs::rename(temp_path, path)?;
        Ok(())
    }

    /// Copies the current collections file into the backup directory, keeping the newest few.
    pub fn create_backup(&self) -> Result<String, StorageError> {
        let timestamp = chrono::Local::now().format("%Y%m%d-%H%M%S%.3f").to_string();
        let backup_name = format!("collections-{timestamp}.json");
        fs::copy(
            self.root.join(DATA_FILE),
            self.root.join(BACKUP_DIR).join(&backup_name),
        )?;
        self.trim_backups()?;
        log::info!("storage: backup created name={backup_name}");
        Ok(backup_name)
    }

    pub fn list_backups(&self) -> Result<Vec<BackupEntry>, StorageError> {
        let mut entries: Vec<_> = fs::read_dir(self.root.join(BACKUP_DIR))?
            .filter_map(|entry| entry.ok())
            .collect();
        entries.sort_by_key(|entry| entry.file_name());
        let mut results = Vec::new();
        for entry in entries {
            if let Some(name) = entry.file_name().to_str() {
                let modified_at = entry
                    .metadata()
                    .and_then(|m| m.modified())
                    .ok()
                    .and_then(|time| time.duration_since(std::time::UNIX_EPOCH).ok())
                    .map(|dur| dur.as_secs() as i64)
                    .unwrap_or(0);
                results.push(BackupEntry {
                    name: name.to_string(),
                    modified_at,
                });
            }
        }
        Ok(results)
    }

    pub fn restore_backup(&self, filename: &str) -> Result<CollectionsFile, StorageError> {
        if filename.is_empty() || filename.contains(['/', '\\']) || filename.starts_with('.') {
            return Err(StorageError::InvalidBackupName(filename.to_string()));
        }
        let path = self.root.join(BACKUP_DIR).join(filename);
        let data: CollectionsFile = self.load_json(path)?;
        self.write_atomic(self.root.join(DATA_FILE), &data)?;
        log::info!("storage: restored backup name={filename}");
        Ok(data)
    }

    // Names carry a sortable timestamp, so lexical order is age order.
    fn trim_backups(&self) -> Result<(), StorageError> {
        let mut entries: Vec<_> = fs::read_dir(self.root.join(BACKUP_DIR))?
            .filter_map(|entry| entry.ok())
            .collect();
        entries.sort_by_key(|entry| entry.file_name());
        let to_remove = entries.len().saturating_sub(BACKUP_LIMIT);
        for entry in entries.into_iter().take(to_remove) {
            let _ = fs::remove_file(entry.path());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CollectionData, Document, Settings};

    fn sample(names: &[&str]) -> CollectionsFile {
        CollectionsFile {
            schema_version: SCHEMA_VERSION,
            collections: vec![CollectionData {
                name: "tasks".to_string(),
                documents: names
                    .iter()
                    .map(|id| Document {
                        id: id.to_string(),
                        fields: Default::default(),
                    })
                    .collect(),
                updated_at: Some(1),
            }],
        }
    }

    #[test]
    fn collections_round_trip_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::new(dir.path().to_path_buf());
        storage.ensure_dirs().unwrap();
        assert!(!storage.has_collections());
        assert!(storage.load_collections().unwrap_err().is_not_found());

        storage.save_collections(&sample(&["a", "b"])).unwrap();
        assert!(storage.has_collections());
        let loaded = storage.load_collections().unwrap();
        let ids: Vec<_> = loaded.collections[0]
            .documents
            .iter()
            .map(|d| d.id.as_str())
            .collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert!(!dir.path().join("collections.tmp").exists());
    }

    #[test]
    fn settings_round_trip_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::new(dir.path().to_path_buf());
        let mut settings = Settings::default();
        settings.collection = "chores".to_string();
        storage
            .save_settings(&SettingsFile {
                schema_version: SCHEMA_VERSION,
                settings: settings.clone(),
            })
            .unwrap();
        assert_eq!(storage.load_settings().unwrap().settings, settings);
    }

    #[test]
    fn corrupt_file_reports_json_error() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(DATA_FILE), "{ not json").unwrap();
        let storage = Storage::new(dir.path().to_path_buf());
        assert!(matches!(
            storage.load_collections(),
            Err(StorageError::Json(_))
        ));
    }

    #[test]
    fn backups_are_trimmed_and_restorable() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::new(dir.path().to_path_buf());
        storage.ensure_dirs().unwrap();
        storage.save_collections(&sample(&["first"])).unwrap();
        let first = storage.create_backup().unwrap();

        storage.save_collections(&sample(&["second"])).unwrap();
        for _ in 0..BACKUP_LIMIT + 2 {
            std::thread::sleep(std::time::Duration::from_millis(2));
            storage.create_backup().unwrap();
        }
        let backups = storage.list_backups().unwrap();
        assert_eq!(backups.len(), BACKUP_LIMIT);
        assert!(backups.iter().all(|b| b.name != first));

        let newest = backups.last().unwrap().name.clone();
        storage.save_collections(&sample(&["third"])).unwrap();
        let restored = storage.restore_backup(&newest).unwrap();
        assert_eq!(restored.collections[0].documents[0].id, "second");
        assert_eq!(
            storage.load_collections().unwrap().collections[0].documents[0].id,
            "second"
        );
    }

    #[test]
    fn restore_rejects_path_like_names() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::new(dir.path().to_path_buf());
        for name in ["", "../collections.json", "a/b.json", ".hidden"] {
            assert!(matches!(
                storage.restore_backup(name),
                Err(StorageError::InvalidBackupName(_))
            ));
        }
    }
}
