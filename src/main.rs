use anyhow::{anyhow, Context, Result};
use log::{error, LevelFilter};
use nix::sys::signal::{signal, SigHandler, Signal};

use minihttpd::config::Config;
use minihttpd::server::ServerManager;

const DEFAULT_CONFIG_PATH: &str = "conf/default.conf";

/// Command-line options: `<program> [config_path] [-l:N]` where N selects
/// the log level (0 = DEBUG, 1 = INFO, 2 = ERROR).
#[derive(Debug, PartialEq)]
struct Options {
    config_path: String,
    log_level: LevelFilter,
}

/// Map a `-l:N` flag to a level; anything else is not a level flag.
fn parse_log_level_flag(arg: &str) -> Option<LevelFilter> {
    match arg {
        "-l:0" => Some(LevelFilter::Debug),
        "-l:1" => Some(LevelFilter::Info),
        "-l:2" => Some(LevelFilter::Error),
        _ => None,
    }
}

fn parse_commandline<I: Iterator<Item = String>>(args: I) -> Result<Options> {
    let mut config_path: Option<String> = None;
    let mut log_level: Option<LevelFilter> = None;

    for arg in args {
        if let Some(level) = parse_log_level_flag(&arg) {
            if log_level.is_some() {
                return Err(anyhow!("multiple log level flags provided"));
            }
            log_level = Some(level);
        } else if arg.starts_with('-') {
            return Err(anyhow!("unknown argument `{}'", arg));
        } else if config_path.is_none() {
            config_path = Some(arg);
        } else {
            return Err(anyhow!("multiple config file paths provided"));
        }
    }

    Ok(Options {
        config_path: config_path.unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string()),
        log_level: log_level.unwrap_or(LevelFilter::Info),
    })
}

fn run(options: &Options) -> Result<()> {
    // Writes to closed sockets must fail with an error, not a signal.
    unsafe { signal(Signal::SIGPIPE, SigHandler::SigIgn) }
        .context("failed to ignore SIGPIPE")?;

    let mut manager = ServerManager::new()?;

    let mut config = Config::new();
    config.parse_file(&options.config_path)?;
    let servers = config.build_servers()?;

    manager.init_servers(servers)?;
    manager.run()
}

fn main() {
    let options = match parse_commandline(std::env::args().skip(1)) {
        Ok(options) => options,
        Err(e) => {
            eprintln!("{}: {}", env!("CARGO_PKG_NAME"), e);
            std::process::exit(1);
        }
    };

    env_logger::Builder::new()
        .filter_level(options.log_level)
        .format_timestamp_millis()
        .init();

    if let Err(e) = run(&options) {
        error!("{:#}", e);
        std::process::exit(1);
    }
}
