use directories_next::ProjectDirs;
use std::fs;
use std::path::PathBuf;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Initialises the process-wide subscriber: env-filtered pretty output on
/// stderr plus hourly-rotated JSON files under the app's data directory.
/// Returns the log directory.
pub fn init(prefix: &str, app: &str) -> anyhow::Result<PathBuf> {
    let env_filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();
    let stderr_log = tracing_subscriber::fmt::layer()
        .pretty()
        .with_writer(std::io::stderr);

    let proj_dirs = ProjectDirs::from("", "", app)
        .ok_or_else(|| anyhow::anyhow!("unable to determine project directories"))?;
    let mut log_path = proj_dirs.data_dir().to_path_buf();
    log_path.push("logs");
    if !log_path.exists() {
        fs::create_dir_all(&log_path)?;
    }
    let file_appender = tracing_appender::rolling::RollingFileAppender::builder()
        .filename_prefix(format!("{}-{}", app, prefix))
        .filename_suffix("log")
        .max_log_files(12)
        .rotation(tracing_appender::rolling::Rotation::HOURLY)
        .build(log_path.clone())?;
    let file_appender_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(file_appender);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(stderr_log)
        .with(file_appender_layer)
        .init();

    Ok(log_path)
}
