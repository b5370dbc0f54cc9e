//! histmatch CLI - History matching of the built-in analytic models.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use histmatch::{Config, GaussianLink, LocalComm, ModelLink, Pipeline, ProjectionRenderer, ProjectionSurface};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "histmatch")]
#[command(version)]
#[command(about = "Iterative history matching with regression and Gaussian process emulators")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to configuration file
    #[arg(short, long, global = true, default_value = "config.toml")]
    config: PathBuf,

    /// Built-in model to match
    #[arg(short, long, global = true, value_enum, default_value_t = ModelChoice::Gaussian2d)]
    model: ModelChoice,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Clone, Copy, ValueEnum)]
enum ModelChoice {
    Gaussian2d,
    Gaussian3d,
}

impl ModelChoice {
    fn link(self) -> Arc<dyn ModelLink> {
        match self {
            Self::Gaussian2d => Arc::new(GaussianLink::two_d()),
            Self::Gaussian3d => Arc::new(GaussianLink::three_d()),
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Construct and analyze iterations, then project the last one
    Run {
        /// Number of iterations to add
        #[arg(short, long, default_value = "1")]
        iterations: usize,

        /// Skip projections
        #[arg(long)]
        no_project: bool,
    },

    /// Show details of an iteration
    Details {
        /// Iteration (latest by default)
        #[arg(short, long)]
        emul_i: Option<usize>,

        /// Print as JSON
        #[arg(long)]
        json: bool,
    },

    /// Evaluate parameter sets given as JSON, e.g. '[2.5, 2.0]'
    Evaluate {
        /// JSON vector, list of vectors or name → value mapping
        sam_set: String,

        /// Iteration (latest by default)
        #[arg(short, long)]
        emul_i: Option<usize>,
    },

    /// Validate configuration file
    Validate,

    /// Show example configuration
    Example,
}

/// Logs a one-line summary of every projection.
struct LogRenderer;

impl ProjectionRenderer for LogRenderer {
    fn render(&self, surface: &ProjectionSurface) -> histmatch::Result<()> {
        let min = surface.min_impl.iter().copied().fold(f64::INFINITY, f64::min);
        let best = surface.los.iter().copied().fold(0.0, f64::max);
        info!(
            emul_i = surface.emul_i,
            par = ?surface.par_names,
            n_points = surface.n_points(),
            min_impl = min,
            max_los = best,
            "Projection"
        );
        Ok(())
    }
}

fn setup_logging(verbose: bool) -> Result<()> {
    let level = if verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber).context("Failed to set subscriber")
}

fn print_example_config() {
    let example = r#"# histmatch configuration file

[emulator]
n_sam_init = 150
# n_sam_refine = 150        # defaults to n_sam_init
base_eval_sam = 800         # candidates per parameter in each analysis
sigma = 0.8
l_corr = 0.3
impl_cut = [0.0, 4.0, 3.8, 3.5]
# criterion = "multi"       # "random", "maximin", "correlation", "multi" or a weight in [0, 1]
method = "full"             # "regression", "gaussian" or "full"
use_regr_cov = false
poly_order = 3
n_cross_val = 5
do_active_anal = true
freeze_active_par = true
# pot_active_par = ["A", "B"]
active_par_alpha = 0.05
use_mock = false            # true, or explicit parameter values
seed = 4
max_refine_rounds = 3
progress = true

[projection]
proj_res = 25
proj_depth = 250
proj_type = "both"          # "2D", "3D" or "both"

[store]
working_dir = "histmatch_0"
"#;
    println!("{example}");
}

fn load_pipeline(cli: &Cli) -> Result<Pipeline> {
    let config = Config::from_file(&cli.config)
        .with_context(|| format!("Failed to load config from {:?}", cli.config))?;
    Pipeline::new(config, cli.model.link(), Box::new(LocalComm)).context("Failed to open pipeline")
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose)?;

    match &cli.command {
        Commands::Example => {
            print_example_config();
        }

        Commands::Validate => {
            let config = Config::from_file(&cli.config)
                .with_context(|| format!("Failed to load config from {:?}", cli.config))?;
            config.validate().context("Invalid configuration")?;

            info!("Configuration is valid");
            info!("  Method: {}", config.emulator.method);
            info!("  Initial samples: {}", config.emulator.n_sam_init);
            info!("  Implausibility cut: {:?}", config.emulator.impl_cut);
            info!("  Working dir: {:?}", config.store.working_dir);
        }

        Commands::Run { iterations, no_project } => {
            let mut pipeline = load_pipeline(&cli)?;
            for _ in 0..*iterations {
                let k = pipeline
                    .construct(None, true, false, None)
                    .context("Construction failed")?;
                info!(emul_i = k, state = %pipeline.state(Some(k)), "Iteration done");
            }
            if !no_project {
                pipeline
                    .project(None, None, false, Some(&LogRenderer))
                    .context("Projection failed")?;
            }
            println!("\n{}", pipeline.details(None)?);
            for w in pipeline.warnings() {
                println!("warning: {w}");
            }
        }

        Commands::Details { emul_i, json } => {
            let pipeline = load_pipeline(&cli)?;
            let report = pipeline.details(*emul_i)?;
            if *json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!("{report}");
            }
        }

        Commands::Evaluate { sam_set, emul_i } => {
            let value: serde_json::Value =
                serde_json::from_str(sam_set).context("Parameter sets must be valid JSON")?;
            let mut pipeline = load_pipeline(&cli)?;
            let evals = pipeline.evaluate_value(&value, *emul_i)?;

            println!("\n=== Evaluation ===");
            for e in &evals {
                println!(
                    "{:?}  plausible: {:<5}  impl: {:.3}  stopped at iteration {}",
                    e.par, e.plausible, e.impl_cut_val, e.emul_i_stop
                );
            }
        }
    }

    Ok(())
}
