// ABOUTME: Shared logging setup for shellcast binaries
// ABOUTME: init() for the server on stderr, init_file() for detached runs, init_for() for one crate

use std::path::PathBuf;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::filter::Directive;
use tracing_subscriber::EnvFilter;

/// Log to stderr at INFO unless `RUST_LOG` says otherwise.
pub fn init() {
    tracing_subscriber::fmt()
        .with_env_filter(filter(LevelFilter::INFO))
        .init();
}

/// Append to `<config_dir>/shellcast/<app_name>/<app_name>.log` at WARN.
///
/// Used when the server runs without a terminal. Setup problems are printed
/// to stderr and the process carries on without logging.
pub fn init_file(app_name: &str) {
    if let Err(e) = init_file_inner(app_name) {
        eprintln!("Warning: failed to set up file logging: {e}");
    }
}

pub fn log_dir(app_name: &str) -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("shellcast").join(app_name))
}

fn init_file_inner(app_name: &str) -> Result<(), Box<dyn std::error::Error>> {
    let log_dir = log_dir(app_name).ok_or("could not determine config directory")?;
    std::fs::create_dir_all(&log_dir)?;

    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_dir.join(format!("{app_name}.log")))?;

    tracing_subscriber::fmt()
        .with_writer(log_file)
        .with_env_filter(filter(LevelFilter::WARN))
        .with_ansi(false)
        .init();

    Ok(())
}

/// INFO for one crate, WARN for everything else.
pub fn init_for(crate_name: &str) {
    let mut filter = filter(LevelFilter::WARN);
    if let Some(directive) = crate_directive(crate_name) {
        filter = filter.add_directive(directive);
    }
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// `RUST_LOG` if set, `default` otherwise.
fn filter(default: LevelFilter) -> EnvFilter {
    EnvFilter::builder()
        .with_default_directive(default.into())
        .from_env_lossy()
}

// Targets use the crate's module path, so `shellcast-core` logs as `shellcast_core`.
fn crate_directive(crate_name: &str) -> Option<Directive> {
    format!("{}=info", crate_name.replace('-', "_")).parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crate_directive_uses_the_module_path() {
        let directive = crate_directive("shellcast-core").expect("directive");
        assert_eq!(directive.to_string().to_lowercase(), "shellcast_core=info");
    }

    #[test]
    fn crate_directive_rejects_garbage() {
        assert!(crate_directive("bad name=[").is_none());
    }

    #[test]
    fn log_dir_is_namespaced_by_app() {
        if let Some(dir) = log_dir("shellcast") {
            assert!(dir.ends_with("shellcast/shellcast"));
        }
    }
}
