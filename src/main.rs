mod cli;
mod config;
mod coordinator;
mod error;
mod fetch;
mod merge;
mod plan;
mod signal;
mod source;
mod store;

use anyhow::Result;
use config::Config;
use std::env;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::EnvFilter;

fn init_logging(verbose: bool) {
    let level = if verbose { LevelFilter::INFO } else { LevelFilter::WARN };
    let _ = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(EnvFilter::builder().with_default_directive(level.into()).from_env_lossy())
        .try_init();
}

fn main() -> Result<()> {
    let args: Vec<String> = env::args().collect();

    match args.get(1).map(|s| s.as_str()) {
        Some("config") => {
            init_logging(false);
            let cfg = Config::load();
            eprintln!("SDM — Configuration");
            eprintln!();
            cfg.print();
            Ok(())
        }

        Some(url) if url.starts_with("http://") || url.starts_with("https://") => {
            let url = url.to_string();
            let opts = cli::parse_download_args(&args[2..])?;
            init_logging(opts.verbose);

            let cfg = Config::load();
            let segments = opts.segments.unwrap_or(cfg.segments);
            let filename = opts.output.unwrap_or_else(|| cli::filename_from_url(&url));
            let output = cfg.resolve_output_path(&filename);

            let started = Instant::now();
            tokio::runtime::Builder::new_multi_thread().enable_all().build()?
                .block_on(async {
                    let cancel = CancellationToken::new();
                    let sh = signal::spawn_signal_handler(cancel.clone());
                    let result = cli::run_download(&cfg, url, output, segments, cancel).await;
                    sh.abort();
                    result
                })?;

            eprintln!("  Download completed in {:.2} seconds", started.elapsed().as_secs_f64());
            Ok(())
        }

        _ => {
            let cfg = Config::load();
            eprintln!("SDM — Segmented Download Manager");
            eprintln!();
            eprintln!("Usage:");
            eprintln!("  sdm <URL> [output] [-c N] [-v]     Download in N parallel segments");
            eprintln!("  sdm config                         Show configuration");
            eprintln!();
            eprintln!("Options:");
            eprintln!("  -c, --segments N   Number of segments (default: {})", cfg.segments);
            eprintln!("  -o, --output FILE  Output filename");
            eprintln!("  -v, --verbose      Log each phase and segment (or set RUST_LOG)");
            eprintln!();
            eprintln!("Config: {}", config::config_path().display());
            std::process::exit(1);
        }
    }
}
