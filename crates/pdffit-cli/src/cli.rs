use clap::{Args, Parser, Subcommand};
use pdffit::core::scattering::ScatteringType;
use std::path::PathBuf;

const HELP_TEMPLATE: &str = "\
{before-help}{name} {version}
{author-with-newline}{about-with-newline}
{usage-heading} {usage}

{all-args}{after-help}
";

#[derive(Parser, Debug)]
#[command(
    version,
    about = "PDFfit CLI - Refine crystal-structure models against pair distribution function data.",
    help_template = HELP_TEMPLATE,
)]
#[command(propagate_version = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Increase verbosity level (-v for INFO, -vv for DEBUG, -vvv for TRACE)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress all log output except for errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    /// Write logs to a specified file in addition to the console output
    #[arg(long, global = true, value_name = "PATH")]
    pub log_file: Option<PathBuf>,

    /// Set the number of threads used for the PDF pair sums.
    /// Defaults to the number of available logical cores.
    #[arg(short = 'j', long, global = true, value_name = "NUM")]
    pub threads: Option<usize>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a refinement described by a TOML fit script.
    Fit(FitArgs),
    /// Calculate the PDF of a structure without fitting.
    Calc(CalcArgs),
}

/// Arguments for the `fit` subcommand.
#[derive(Args, Debug, Clone)]
pub struct FitArgs {
    /// Path to the fit script in TOML format.
    #[arg(short, long, required = true, value_name = "PATH")]
    pub config: PathBuf,

    /// Directory for the result files, overriding `output.dir`.
    #[arg(short, long, value_name = "DIR")]
    pub output_dir: Option<PathBuf>,

    /// Override the convergence tolerance from the fit script.
    #[arg(short, long, value_name = "FLOAT")]
    pub tolerance: Option<f64>,

    /// Do not show the per-step progress spinner.
    #[arg(long)]
    pub no_progress: bool,

    /// Set a specific configuration value, overriding the fit script.
    /// Can be used multiple times. Example: -S parameter.1=3.52
    #[arg(short = 'S', long = "set", value_name = "KEY=VALUE", num_args(0..))]
    pub set_values: Vec<String>,
}

/// Arguments for the `calc` subcommand.
#[derive(Args, Debug, Clone)]
pub struct CalcArgs {
    /// Path to the structure file in TOML format.
    #[arg(short, long, required = true, value_name = "PATH")]
    pub structure: PathBuf,

    /// Write the calculated PDF here instead of printing it.
    #[arg(short, long, value_name = "PATH")]
    pub output: Option<PathBuf>,

    /// Radiation type: X for x-rays, N for neutrons.
    #[arg(long, default_value = "X", value_name = "X|N")]
    pub stype: ScatteringType,

    /// Maximum momentum transfer in 1/A; 0 disables the cutoff.
    #[arg(long, default_value_t = 0.0, value_name = "FLOAT")]
    pub qmax: f64,

    /// Instrumental Q resolution damping.
    #[arg(long, default_value_t = 0.0, value_name = "FLOAT")]
    pub qsig: f64,

    #[arg(long, default_value_t = 1.0, value_name = "FLOAT")]
    pub rmin: f64,

    #[arg(long, default_value_t = 20.0, value_name = "FLOAT")]
    pub rmax: f64,

    /// Number of grid points, both ends included.
    #[arg(long, default_value_t = 1901, value_name = "INT")]
    pub bins: usize,
}
