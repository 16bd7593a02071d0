use fern::Dispatch;
use fern::colors::{Color, ColoredLevelConfig};
use log::LevelFilter;

use crate::config;

/// Sets up the process-wide logger: colored stderr plus a file under
/// `logs/` named after the component, so a broker and a faculty running
/// on the same host never interleave their files.
///
/// `RUST_LOG` selects the level; unset or unparsable means info. Call
/// once from each binary's `main`.
pub fn init(component: &str) {
    let level = std::env::var("RUST_LOG").ok().and_then(|v| v.parse::<LevelFilter>().ok()).unwrap_or(LevelFilter::Info);

    let colors = ColoredLevelConfig::new()
        .error(Color::Red)
        .warn(Color::Yellow)
        .info(Color::Green)
        .debug(Color::Cyan)
        .trace(Color::BrightBlack);

    let stderr_log = Dispatch::new()
        .format(move |out, message, record| {
            // Millisecond timestamps; heartbeat windows and ACK
            // deadlines are sub-second.
            out.finish(format_args!(
                "{} {:5} {}] {}",
                chrono::Local::now().format("%H:%M:%S%.3f"),
                colors.color(record.level()),
                record.target(),
                message
            ))
        })
        .chain(std::io::stderr());

    let file_log = match open_log_file(component) {
        Ok(file) => Dispatch::new()
            .format(|out, message, record| {
                out.finish(format_args!(
                    "{} {:5} {}] {}",
                    chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
                    record.level(),
                    record.target(),
                    message
                ))
            })
            .chain(file),
        Err(e) => {
            eprintln!("Could not open {}: {}; logging to stderr only", config::log_file(component).display(), e);
            Dispatch::new()
        }
    };

    if let Err(e) = Dispatch::new().level(level).chain(stderr_log).chain(file_log).apply() {
        eprintln!("Logger setup failed: {}", e);
        return;
    }

    log::info!("Logging at {} to stderr and {}", level, config::log_file(component).display());
}

fn open_log_file(component: &str) -> std::io::Result<std::fs::File> {
    std::fs::create_dir_all(config::LOG_DIR)?;
    fern::log_file(config::log_file(component))
}
