use std::error::Error;
use std::sync::atomic::Ordering;

use clap::Parser;
use log::{error, info, warn};

use bgg_scraper_lib::{input_loader, logger, Cli, Dispatcher};

fn main() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();
    logger::init(cli.log_level);
    let config = cli.into_config();
    info!("Starting BGG scraper ({:?} -> {:?})", config.input, config.output);

    // 1. Load the master list. Nothing is submitted if this fails.
    let jobs = match input_loader::load_jobs(&config.input, config.limit) {
        Ok(jobs) => jobs,
        Err(e) => {
            error!("Error loading games: {}", e);
            return Err(e.into());
        }
    };

    // 2. Build the pipeline and wire Ctrl+C to its shutdown flag
    let dispatcher = Dispatcher::from_config(config)?;
    let shutdown = dispatcher.shutdown_handle();
    ctrlc::set_handler(move || {
        if !shutdown.swap(true, Ordering::SeqCst) {
            warn!("Interrupt received, finishing in-flight requests...");
        }
    })?;

    // 3. Run
    let summary = dispatcher.run(&jobs)?;

    info!("Total time elapsed: {:.2} minutes", summary.elapsed.as_secs_f64() / 60.0);
    info!(
        "Successfully processed {} out of {} games ({} written, {} without data, {} abandoned)",
        summary.processed(),
        summary.submitted,
        summary.written,
        summary.empty,
        summary.abandoned
    );
    if summary.interrupted {
        info!("Script interrupted by user. Progress saved at checkpoint.");
        info!("To resume, simply run the script again.");
    }
    Ok(())
}
