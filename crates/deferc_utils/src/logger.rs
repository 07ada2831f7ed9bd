use std::sync::Once;

use tracing::Level;
use tracing_subscriber::{EnvFilter, fmt};

static INIT: Once = Once::new();

const TARGETS: [&str; 3] = ["deferc", "deferc_jit", "deferc_codec"];

/// Install the process-wide tracing subscriber; later calls are no-ops.
///
/// `RUST_LOG` wins when set. Otherwise the build crates log at `info`,
/// raised to `debug` and then `trace` by each `verbosity` step, and
/// everything else logs warnings only.
pub fn init_logging(verbosity: u8) {
    INIT.call_once(|| {
        let env_filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(filter_for(verbosity)));

        fmt()
            .with_env_filter(env_filter)
            .with_target(verbosity > 0)
            .with_writer(std::io::stderr)
            .compact()
            .init();
    });
}

fn level_for(verbosity: u8) -> Level {
    match verbosity {
        0 => Level::INFO,
        1 => Level::DEBUG,
        _ => Level::TRACE,
    }
}

fn filter_for(verbosity: u8) -> String {
    let level = level_for(verbosity).as_str().to_ascii_lowercase();
    std::iter::once("warn".to_string())
        .chain(TARGETS.iter().map(|target| format!("{target}={level}")))
        .collect::<Vec<_>>()
        .join(",")
}
