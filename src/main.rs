use clap::{Parser, Subcommand};
use geotally::alias::AliasTable;
use geotally::batcher::open_input;
use geotally::config::{PipelineConfig, DEFAULT_BATCH_SIZE, DEFAULT_MEMORY_FREE_FLOOR_MB, DEFAULT_WORKER_COUNT};
use geotally::geocode::PolygonGeocoder;
use geotally::pipeline::{consolidate_outputs, run_pipeline};
use geotally::summary::print_summary;
use geotally::TallyError;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "geotally")]
#[command(about = "Batch GPS track points into per-owner activity and region counts", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Tally an input stream into per-batch artifacts
    Run {
        /// Newline-delimited GeoJSON points, optionally gzipped. Omit or `-` for stdin
        #[arg(long)]
        input: Option<PathBuf>,
        #[arg(long, default_value = ".")]
        output_dir: PathBuf,
        #[arg(long, default_value_t = DEFAULT_BATCH_SIZE)]
        batch_size: usize,
        #[arg(long, default_value_t = DEFAULT_WORKER_COUNT)]
        workers: usize,
        /// Pause dispatch while free memory is below this many MB (0 disables)
        #[arg(long, default_value_t = DEFAULT_MEMORY_FREE_FLOOR_MB)]
        memory_floor_mb: u64,
        /// Defaults to the worker count
        #[arg(long)]
        max_in_flight: Option<usize>,
        /// GeoJSON FeatureCollection of region boundaries
        #[arg(long)]
        regions: PathBuf,
        /// JSON alias rules; the built-in list is used when omitted
        #[arg(long)]
        aliases: Option<PathBuf>,
        /// Skip writing the combined per-dimension files
        #[arg(long)]
        no_consolidate: bool,
    },
    /// Combine existing per-batch artifacts only
    Consolidate {
        #[arg(long, default_value = ".")]
        output_dir: PathBuf,
    },
}

fn main() -> Result<(), TallyError> {
    geotally::init_tracing("geotally");
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            input,
            output_dir,
            batch_size,
            workers,
            memory_floor_mb,
            max_in_flight,
            regions,
            aliases,
            no_consolidate,
        } => {
            let config = PipelineConfig {
                input_path: input,
                output_dir,
                batch_size,
                worker_count: workers,
                memory_free_floor_mb: memory_floor_mb,
                max_in_flight: max_in_flight.unwrap_or(workers),
                ..PipelineConfig::default()
            };
            config.validate()?;

            let aliases = match aliases {
                Some(path) => AliasTable::load(&path)?,
                None => AliasTable::builtin()?,
            };
            let geocoder = PolygonGeocoder::load(&regions)?;
            let reader = open_input(config.input_path.as_deref())?;

            let summary = run_pipeline(&config, reader, &aliases, &geocoder)?;
            if !no_consolidate {
                consolidate_outputs(&config.output_dir)?;
            }
            print_summary(&summary);
        }
        Commands::Consolidate { output_dir } => {
            let written = consolidate_outputs(&output_dir)?;
            println!("[geotally] wrote {} combined files", written.len());
        }
    }
    Ok(())
}
