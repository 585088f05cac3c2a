use std::io;
use std::process;

use anyhow::Result;
use clap::Parser;
use log::{error, info};

use hopstorm::capture::reader;
use hopstorm::cli::Args;
use hopstorm::config::Config;
use hopstorm::prober;

fn main() {
    let args = Args::parse();
    if let Err(e) = args.validate() {
        eprintln!("Error: {e}");
        process::exit(2);
    }

    init_logging();

    if let Err(e) = run(&args) {
        error!("{e:#}");
        process::exit(1);
    }
}

fn init_logging() {
    let mut builder = pretty_env_logger::formatted_timed_builder();
    builder.filter_level(log::LevelFilter::Info);
    if let Ok(filters) = std::env::var("RUST_LOG") {
        builder.parse_filters(&filters);
    }
    builder.init();
}

fn run(args: &Args) -> Result<()> {
    // Offline mode: convert an existing capture into reply rows.
    if let Some(pcap_path) = &args.read_pcap {
        let snapshot = reader::read(pcap_path, &args.output_file_csv, &args.meta_round)?;
        info!("{snapshot}");
        return Ok(());
    }

    let config = Config::from_args(args)?;
    let (prober_stats, sniffer_stats) = match &config.input_file {
        Some(path) => prober::probe_from_file(&config, path)?,
        None => prober::probe_from_reader(&config, io::stdin().lock())?,
    };
    info!(
        "done: {} packets sent, {} frames captured",
        prober_stats.sent, sniffer_stats.received_count
    );
    Ok(())
}
