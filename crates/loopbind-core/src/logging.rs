//! Logger bootstrap shared by the CLI and any embedding binary.

use log::LevelFilter;

/// Initialise the global logger.
///
/// `verbosity` counts `-v` occurrences: 0 warns only, 1 adds info,
/// 2 adds debug, anything higher traces. `RUST_LOG` still overrides.
pub fn init(verbosity: u8) {
    let level = match verbosity {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };

    env_logger::Builder::from_default_env()
        .filter_level(level)
        .format_timestamp(None)
        .try_init()
        .ok();
}
