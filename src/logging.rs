use std::path::Path;

pub const LOG_FILE_BASENAME: &str = "taskboard";
pub const LOG_FILE_SUFFIX: &str = "log";
pub const LOG_ROTATE_SIZE_BYTES: u64 = 10 * 1024 * 1024;
pub const LOG_ROTATE_KEEP_FILES: usize = 10;

const DEFAULT_SPEC_DEBUG: &str = "warn,taskboard_lib=debug";
const DEFAULT_SPEC_RELEASE: &str = "warn,taskboard_lib=info";

/// Log files sit next to the collections and settings they describe.
pub fn log_directory(data_dir: &Path) -> &Path {
    data_dir
}

/// Picks the filter: `TASKBOARD_LOG`, then `RUST_LOG`, then the build default.
/// Blank values count as unset.
pub fn log_spec(taskboard_log: Option<String>, rust_log: Option<String>) -> String {
    taskboard_log
        .filter(|value| !value.trim().is_empty())
        .or_else(|| rust_log.filter(|value| !value.trim().is_empty()))
        .unwrap_or_else(|| {
            if cfg!(debug_assertions) {
                DEFAULT_SPEC_DEBUG.to_string()
            } else {
                DEFAULT_SPEC_RELEASE.to_string()
            }
        })
}

#[cfg(all(feature = "app", not(test)))]
pub fn init_logging(
    data_dir: &Path,
) -> Result<flexi_logger::LoggerHandle, flexi_logger::FlexiLoggerError> {
    use flexi_logger::{detailed_format, Cleanup, Criterion, FileSpec, Logger, Naming, WriteMode};

    std::fs::create_dir_all(data_dir)?;

    let spec = log_spec(
        std::env::var("TASKBOARD_LOG").ok(),
        std::env::var("RUST_LOG").ok(),
    );

    // The terminal belongs to the UI, so logs only go to files.
    let handle = Logger::try_with_str(spec)?
        .log_to_file(
            FileSpec::default()
                .directory(log_directory(data_dir))
                .basename(LOG_FILE_BASENAME)
                .suffix(LOG_FILE_SUFFIX),
        )
        .write_mode(WriteMode::BufferAndFlush)
        .format_for_files(detailed_format)
        .rotate(
            Criterion::Size(LOG_ROTATE_SIZE_BYTES),
            Naming::Numbers,
            Cleanup::KeepLogFiles(LOG_ROTATE_KEEP_FILES),
        )
        .start()?;

    install_panic_hook();

    log::info!(
        "logger initialized dir={} rotate_size_bytes={} keep_files={}",
        log_directory(data_dir).display(),
        LOG_ROTATE_SIZE_BYTES,
        LOG_ROTATE_KEEP_FILES
    );
    Ok(handle)
}

#[cfg(all(feature = "app", not(test)))]
fn install_panic_hook() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info: &std::panic::PanicHookInfo<'_>| {
        let payload = info
            .payload()
            .downcast_ref::<&str>()
            .copied()
            .or_else(|| info.payload().downcast_ref::<String>().map(|s| s.as_str()))
            .unwrap_or("<non-string panic payload>");
        let location = info
            .location()
            .map(|loc| format!("{loc}"))
            .unwrap_or_else(|| "<unknown>".to_string());
        let backtrace = std::backtrace::Backtrace::force_capture();

        log::error!("panic: payload={payload} location={location}\nbacktrace:\n{backtrace}");
        default_hook(info);
    }));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn taskboard_log_wins_over_rust_log() {
        assert_eq!(
            log_spec(Some("debug".into()), Some("trace".into())),
            "debug"
        );
    }

    #[test]
    fn blank_values_fall_through() {
        assert_eq!(log_spec(Some("  ".into()), Some("trace".into())), "trace");
        let fallback = log_spec(None, Some(String::new()));
        assert!(fallback.starts_with("warn,taskboard_lib="));
    }

    #[test]
    fn logs_live_in_data_dir() {
        let dir = Path::new("/tmp/board");
        assert_eq!(log_directory(dir), dir);
    }
}
