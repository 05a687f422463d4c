use std::fs::{self, File};
use std::io::BufWriter;
use std::path::PathBuf;
use std::process;

use clap::Parser;
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::{debug, info};

use nlplace::config::{self, OptimizerKind};
use nlplace::design::{self, Design};
use nlplace::metrics::MetricRecord;
use nlplace::{
    logging, post_process, ElectrostaticModel, EplaceDensityWeight, EplaceGamma, NonLinearPlacer,
    PlaceResult,
};

///places a random benchmark described by a TOML file: the placement stages,
///optional [routability] table and a [design] table for the generator
#[derive(Parser, Debug)]
#[command(version, about = "Nonlinear global placement on a synthetic benchmark")]
struct Cli {
    /// Run configuration in TOML format.
    #[arg(short, long, value_name = "PATH")]
    config: PathBuf,

    /// Increase verbosity (-v for INFO, -vv for DEBUG, -vvv for TRACE)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress all log output
    #[arg(short, long, conflicts_with = "verbose")]
    quiet: bool,

    /// Also write logs to this file
    #[arg(long, value_name = "PATH")]
    log_file: Option<PathBuf>,

    /// Override the random seed of the configuration
    #[arg(long, value_name = "N")]
    seed: Option<u64>,

    /// Run every stage with this optimizer (nesterov, sgd, sgd_momentum, sgd_nesterov, adam)
    #[arg(long, value_name = "NAME")]
    optimizer: Option<OptimizerKind>,

    /// Write every metric record as JSON
    #[arg(long, value_name = "PATH")]
    dump_metrics: Option<PathBuf>,
}

fn main() {
    let cli = Cli::parse();
    if let Err(e) = run(cli) {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

fn run(cli: Cli) -> PlaceResult<()> {
    logging::setup_logging(cli.verbose, cli.quiet, cli.log_file.clone())?;
    info!("nlplace v{} starting", env!("CARGO_PKG_VERSION"));
    debug!("arguments: {:?}", cli);

    // both tables live in the same file
    let content = fs::read_to_string(&cli.config)?;
    let mut params = config::load_params_from_str(&content)?;
    let design_cfg = design::load_design_from_str(&content)?;
    if let Some(seed) = cli.seed {
        params.random_seed = seed;
    }
    if let Some(kind) = cli.optimizer {
        for stage in &mut params.stages {
            stage.optimizer = kind;
        }
    }

    let mut rng = StdRng::seed_from_u64(params.random_seed);
    let design = Design::synthetic(&design_cfg, &mut rng)?;
    info!(
        "design: {} movable and {} fixed nodes, {} nets, {} pins, {}x{} bins",
        design.layout.num_movable,
        design.layout.num_nodes - design.layout.num_movable,
        design.nets.len(),
        design.num_pins(),
        design.num_bins_x,
        design.num_bins_y
    );
    let pos = design.initial_position();
    let mut model = ElectrostaticModel::new(design);
    let grid = *model.grid();
    let mut gamma = EplaceGamma::new(params.gamma_factor, grid.bin_w, grid.bin_h);

    let placer = NonLinearPlacer::new(params);
    let mut density_weight = EplaceDensityWeight::default();
    let mut outcome = placer.run(&mut model, &mut gamma, &mut density_weight, pos)?;
    post_process(placer.params(), &model, None, &mut outcome)?;

    if let Some(last) = outcome.last_descent_record() {
        info!(
            "done after {} iterations: HPWL {:.6E}, overflow {:.4}, max density {:.3}",
            outcome.total_iterations,
            last.hpwl,
            last.overflow_or_max(),
            last.max_density_or_max()
        );
    }
    if outcome.area_adjustments > 0 {
        info!("{} routability area adjustments", outcome.area_adjustments);
    }

    if let Some(path) = &cli.dump_metrics {
        let records: Vec<&MetricRecord> = outcome.records().collect();
        let writer = BufWriter::new(File::create(path)?);
        serde_json::to_writer_pretty(writer, &records).map_err(std::io::Error::from)?;
        info!("wrote {} metric records to {}", records.len(), path.display());
    }
    Ok(())
}
