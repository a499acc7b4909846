use nanoclaw::config::Config;
use nanoclaw::daemon;

use std::path::PathBuf;

fn parse_args() -> (Option<PathBuf>, bool) {
    let mut config_path = None;
    let mut debug = false;
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" | "-c" => config_path = args.next().map(PathBuf::from),
            "--debug" => debug = true,
            "--help" | "-h" => {
                println!("usage: nanoclaw [--config <file>] [--debug]");
                std::process::exit(0);
            }
            other => {
                eprintln!("nanoclaw: unknown argument {other:?}");
                std::process::exit(1);
            }
        }
    }
    (config_path, debug)
}

#[tokio::main]
async fn main() {
    let (config_path, debug) = parse_args();

    let config = match &config_path {
        Some(path) => match Config::load(path) {
            Ok(config) => config,
            Err(error) => {
                eprintln!("nanoclaw: {error:#}");
                std::process::exit(1);
            }
        },
        None => Config::default(),
    };

    let log_dir = config.data_dir.join("logs");
    if let Err(error) = std::fs::create_dir_all(&log_dir) {
        eprintln!("nanoclaw: failed to create log dir: {error}");
        std::process::exit(1);
    }
    daemon::init_tracing(debug, Some(&log_dir));

    if let Err(error) = daemon::run(config).await {
        tracing::error!(%error, "fatal startup or runtime error");
        eprintln!("nanoclaw: {error}");
        std::process::exit(1);
    }
}
