//! Command-line entry point: one invocation, one crawl.

use clap::Parser;
use log::{error, info, LevelFilter};
use peer_census_crawler::seeds::bootstrap_addresses;
use peer_census_crawler::{Args, Crawler, Settings};
use simplelog::{
    ColorChoice, CombinedLogger, Config, SharedLogger, TermLogger, TerminalMode, WriteLogger,
};

/// Set up terminal logging plus, if requested, a debug log file inside
/// the result directory.
fn init_logging(settings: &Settings) -> Result<(), Box<dyn std::error::Error>> {
    let mut loggers: Vec<Box<dyn SharedLogger>> = vec![TermLogger::new(
        settings.log_level,
        Config::default(),
        TerminalMode::Mixed,
        ColorChoice::Auto,
    )];

    if settings.store_debug_log {
        let file = std::fs::File::create(settings.debug_log_path())?;
        loggers.push(WriteLogger::new(LevelFilter::Debug, Config::default(), file));
    }

    CombinedLogger::init(loggers)?;
    Ok(())
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let settings = match Settings::from_args(&args) {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("configuration error: {e}");
            std::process::exit(2);
        }
    };

    // The result directory must exist before the debug log can open.
    if let Err(e) = std::fs::create_dir_all(&settings.result_dir) {
        eprintln!(
            "could not create result directory {}: {e}",
            settings.result_dir.display()
        );
        std::process::exit(2);
    }
    if let Err(e) = init_logging(&settings) {
        eprintln!("could not initialize logging: {e}");
        std::process::exit(2);
    }

    info!(
        "peer-census {} crawling {} (results: {})",
        env!("CARGO_PKG_VERSION"),
        settings.network,
        settings.result_dir.display()
    );

    if !settings.delay_start.is_zero() {
        info!(
            "Delaying start for {}s...",
            settings.delay_start.as_secs()
        );
        tokio::time::sleep(settings.delay_start).await;
    }

    let bootstrap = bootstrap_addresses(&args, settings.default_port()).await;
    if bootstrap.is_empty() {
        error!("No bootstrap addresses; provide --seed, --seed-file or --dns-seeds");
        std::process::exit(1);
    }

    let crawler = Crawler::new(settings);
    match crawler.run(bootstrap).await {
        Ok(summary) => {
            info!(
                "Processed {} nodes in {:.1}s: reachable={}, unreachable={}, seen={}",
                summary.processed,
                summary.runtime.as_secs_f64(),
                summary.reachable,
                summary.unreachable,
                summary.seen,
            );
        }
        Err(e) => {
            error!("Crawl failed: {e}");
            std::process::exit(1);
        }
    }
}
