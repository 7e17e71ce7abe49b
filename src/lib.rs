pub mod board;
pub mod events;
pub mod logging;
pub mod models;
pub mod session;
pub mod storage;
pub mod store;
pub mod style;
#[cfg(feature = "app")]
mod ui;

use std::path::{Path, PathBuf};

use crate::models::{Settings, SettingsFile};
use crate::storage::{Storage, StorageError, SCHEMA_VERSION};

pub const DEFAULT_DATA_DIR: &str = ".taskboard";

/// Reads `settings.json`, writing the defaults on first run. A corrupt file is reported and
/// replaced by defaults for this run only.
pub fn load_or_init_settings(storage: &Storage) -> Result<Settings, StorageError> {
    match storage.load_settings() {
        Ok(file) => Ok(file.settings),
        Err(err) if err.is_not_found() => {
            let settings = Settings::default();
            storage.save_settings(&SettingsFile {
                schema_version: SCHEMA_VERSION,
                settings: settings.clone(),
            })?;
            log::info!("settings: wrote defaults to {}", storage.root().display());
            Ok(settings)
        }
        Err(err) => {
            log::warn!("settings: unreadable, using defaults err={err}");
            Ok(Settings::default())
        }
    }
}

pub fn resolve_data_dir(flag: Option<PathBuf>) -> PathBuf {
    flag.unwrap_or_else(|| Path::new(DEFAULT_DATA_DIR).to_path_buf())
}

#[cfg(all(feature = "app", not(test)))]
pub use app::run;

#[cfg(all(feature = "app", not(test)))]
mod app {
    use std::path::PathBuf;
    use std::sync::Arc;

    use anyhow::Context;
    use clap::{Parser, Subcommand, ValueEnum};

    use super::*;
    use crate::models::{Backend, Task, TaskFields};
    use crate::session::BoardSession;
    use crate::store::firestore::FirestoreStore;
    use crate::store::{DocumentStore, LocalStore};

    #[derive(Debug, Clone, Copy, ValueEnum)]
    enum BackendArg {
        Local,
        Firestore,
    }

    #[derive(Debug, Parser)]
    #[command(name = "taskboard", version, about = "Single-screen task board")]
    struct Cli {
        /// Directory holding settings, local collections, backups and logs.
        #[arg(long, env = "TASKBOARD_HOME")]
        data_dir: Option<PathBuf>,
        /// Overrides the backend from settings.json.
        #[arg(long, value_enum)]
        backend: Option<BackendArg>,
        /// Overrides the collection from settings.json.
        #[arg(long)]
        collection: Option<String>,
        #[command(subcommand)]
        command: Option<Command>,
    }

    #[derive(Debug, Subcommand)]
    enum Command {
        /// Print the current tasks once.
        List,
        /// Add one task.
        Add { text: Vec<String> },
        /// List local backups.
        Backups,
        /// Restore a local backup by file name.
        Restore { name: String },
    }

    fn open_store(
        settings: &Settings,
        data_dir: &std::path::Path,
    ) -> anyhow::Result<Arc<dyn DocumentStore>> {
        let store: Arc<dyn DocumentStore> = match settings.backend {
            Backend::Local => Arc::new(
                LocalStore::open(data_dir.to_path_buf()).context("failed to open local store")?,
            ),
            Backend::Firestore => Arc::new(
                FirestoreStore::new(&settings.firestore).context("failed to set up firestore")?,
            ),
        };
        Ok(store)
    }

    fn print_tasks(tasks: &[Task]) {
        if tasks.is_empty() {
            println!("No tasks.");
        }
        for (index, task) in tasks.iter().enumerate() {
            println!("Task#{} [{}] {} ({})", index + 1, task.status, task.task, task.id);
        }
    }

    pub fn run() -> anyhow::Result<()> {
        let cli = Cli::parse();
        let data_dir = resolve_data_dir(cli.data_dir);
        let _logger = crate::logging::init_logging(&data_dir).context("failed to start logging")?;

        let storage = Storage::new(data_dir.clone());
        storage.ensure_dirs()?;
        let mut settings = load_or_init_settings(&storage)?;
        match cli.backend {
            Some(BackendArg::Local) => settings.backend = Backend::Local,
            Some(BackendArg::Firestore) => settings.backend = Backend::Firestore,
            None => {}
        }
        if let Some(collection) = cli.collection {
            settings.collection = collection;
        }
        log::info!(
            "taskboard: start backend={:?} collection={}",
            settings.backend,
            settings.collection
        );

        match &cli.command {
            Some(Command::Backups) => {
                for backup in storage.list_backups()? {
                    println!("{}\t{}", backup.name, backup.modified_at);
                }
                return Ok(());
            }
            Some(Command::Restore { name }) => {
                let restored = storage.restore_backup(name)?;
                println!("Restored {name} ({} collections).", restored.collections.len());
                return Ok(());
            }
            _ => {}
        }

        let runtime = tokio::runtime::Runtime::new()?;
        runtime.block_on(serve(cli.command, settings, data_dir))
    }

    async fn serve(
        command: Option<Command>,
        settings: Settings,
        data_dir: PathBuf,
    ) -> anyhow::Result<()> {
        let store = open_store(&settings, &data_dir)?;
        match command {
            Some(Command::List) => {
                let mut subscription = store.subscribe(&settings.collection).await?;
                let snapshot = subscription
                    .next()
                    .await
                    .context("subscription closed before first snapshot")??;
                let tasks: Vec<Task> = snapshot.iter().map(Task::from_document).collect();
                print_tasks(&tasks);
                Ok(())
            }
            Some(Command::Add { text }) => {
                let text = text.join(" ");
                let text = text.trim();
                if text.is_empty() {
                    anyhow::bail!("task text must not be empty");
                }
                let id = store
                    .create(&settings.collection, TaskFields::new(text).into_fields())
                    .await?;
                println!("Added {id}.");
                Ok(())
            }
            _ => {
                let session = BoardSession::new(store, settings.collection);
                crate::ui::run(session).await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_run_writes_default_settings() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::new(dir.path().to_path_buf());
        let settings = load_or_init_settings(&storage).unwrap();
        assert_eq!(settings, Settings::default());
        assert_eq!(storage.load_settings().unwrap().schema_version, SCHEMA_VERSION);
    }

    #[test]
    fn corrupt_settings_fall_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("settings.json"), "nope").unwrap();
        let storage = Storage::new(dir.path().to_path_buf());
        assert_eq!(load_or_init_settings(&storage).unwrap(), Settings::default());
        assert_eq!(
            std::fs::read_to_string(dir.path().join("settings.json")).unwrap(),
            "nope"
        );
    }

    #[test]
    fn existing_settings_are_used() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("settings.json"),
            r#"{ "schema_version": 1, "settings": { "collection": "chores" } }"#,
        )
        .unwrap();
        let storage = Storage::new(dir.path().to_path_buf());
        assert_eq!(load_or_init_settings(&storage).unwrap().collection, "chores");
    }

    #[test]
    fn data_dir_defaults_to_local_folder() {
        assert_eq!(resolve_data_dir(None), PathBuf::from(DEFAULT_DATA_DIR));
        assert_eq!(
            resolve_data_dir(Some(PathBuf::from("/srv/board"))),
            PathBuf::from("/srv/board")
        );
    }
}
