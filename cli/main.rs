#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]
#![deny(clippy::no_effect_underscore_binding)]

use clap::{Args, Parser, Subcommand};
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::io::IsTerminal;
use std::path::PathBuf;
use std::process;

use riskwatch::config::ChartConfig;
use riskwatch::data::{load_subject_table, write_trace};
use riskwatch::hazard::RiskModel;
use riskwatch::limit::{CalibrationProgress, CalibrationSpec, InControlUnit, calibrate_control_limit};
use riskwatch::run_length;

#[derive(Parser)]
#[command(
    name = "riskwatch",
    about = "Risk-adjusted CUSUM monitoring of failure rates",
    long_about = "Constructs continuous-time generalized rapid-response CUSUM (CGR-CUSUM) charts \
                 for subjects of a monitored unit and calibrates their control limits."
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Construct the chart of one unit
    #[command(about = "Construct a CGR-CUSUM chart (outputs: chart.tsv)")]
    Chart(ChartArgs),

    /// Calibrate a control limit on simulated in-control units
    #[command(about = "Calibrate a control limit from in-control units")]
    Limit(LimitArgs),

    /// Write a default chart configuration to start from
    #[command(about = "Write a default chart configuration (outputs: chart.toml)")]
    InitConfig {
        /// Destination of the configuration file
        #[arg(default_value = "chart.toml")]
        path: String,
    },
}

#[derive(Args)]
struct ChartArgs {
    /// TSV file with entrytime, otime, censorid and covariate columns, sorted by entrytime
    subjects: String,

    /// Chart configuration file (.toml)
    #[arg(long)]
    config: String,

    /// Where to write the chart trace
    #[arg(long, default_value = "chart.tsv")]
    out: PathBuf,

    /// Override the number of worker threads from the configuration
    #[arg(long)]
    workers: Option<usize>,
}

#[derive(Args)]
struct LimitArgs {
    /// TSV file of simulated in-control subjects with a unit column
    units: String,

    /// Chart configuration file (.toml)
    #[arg(long)]
    config: String,

    /// Monitoring horizon over which the false-alarm rate is controlled
    #[arg(long)]
    time: f64,

    /// Target probability of a false alarm within the horizon
    #[arg(long, default_value = "0.05")]
    alpha: f64,

    /// Step to which the control limit is rounded up
    #[arg(long, default_value = "0.01")]
    precision: f64,

    /// Stop charting a unit once its chart exceeds this magnitude
    #[arg(long)]
    cap: Option<f64>,
}

struct BarProgress(ProgressBar);

impl CalibrationProgress for BarProgress {
    fn on_start(&self, total_units: usize) {
        self.0.set_length(total_units as u64);
    }
    fn on_unit_finished(&self) {
        self.0.inc(1);
    }
    fn on_finish(&self) {
        self.0.finish_with_message("done");
    }
}

fn create_progress_bar(message: &str) -> ProgressBar {
    let draw_target = if std::io::stderr().is_terminal() {
        ProgressDrawTarget::stderr_with_hz(20)
    } else {
        ProgressDrawTarget::hidden()
    };

    let pb = ProgressBar::with_draw_target(Some(0), draw_target);
    if let Ok(style) = ProgressStyle::with_template(
        "\n> [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}",
    ) {
        pb.set_style(style.progress_chars("█▉▊▋▌▍▎▏  "));
    }
    pb.set_message(message.to_string());
    pb
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Chart(args) => chart_command(args),
        Commands::Limit(args) => limit_command(args),
        Commands::InitConfig { path } => init_config_command(&path),
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}

fn chart_command(args: ChartArgs) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = ChartConfig::load(&args.config)?;
    if let Some(workers) = args.workers {
        config.workers = workers;
    }
    eprintln!("> Loading subjects from '{}'...", args.subjects);
    let table = load_subject_table(&args.subjects)?.into_table()?;
    log::info!("Loaded {} subjects.", table.len());

    let chart = config.chart()?;
    let hazard = config.baseline.build()?;
    let risk = config.risk.build();
    let run = chart.run_with_model(&table, &risk, &hazard)?;

    write_trace(&run.trace, &args.out)?;
    eprintln!(
        "> Wrote {} chart points to '{}'.",
        run.trace.len(),
        args.out.display()
    );
    if let Some(h) = config.control_limit {
        match run_length(&run.trace, h) {
            Some(time) => eprintln!("> Control limit {h} reached at time {time}."),
            None => eprintln!("> Control limit {h} was not reached."),
        }
    }
    Ok(())
}

fn limit_command(args: LimitArgs) -> Result<(), Box<dyn std::error::Error>> {
    let config = ChartConfig::load(&args.config)?;
    eprintln!("> Loading in-control units from '{}'...", args.units);
    let loaded = load_subject_table(&args.units)?;
    let risk_model = config.risk.build();

    let mut units = Vec::new();
    for (name, table) in loaded.into_units()? {
        log::debug!("Unit '{name}' holds {} subjects.", table.len());
        let risk = risk_model.risk_scores(&table)?;
        units.push(InControlUnit { table, risk });
    }

    let chart = config.chart()?;
    let hazard = config.baseline.build()?;
    let spec = CalibrationSpec {
        time: args.time,
        alpha: args.alpha,
        precision: args.precision,
        cap: args.cap,
    };
    let progress = BarProgress(create_progress_bar("charting units"));
    let limit = calibrate_control_limit(&chart, &units, &hazard, &spec, &progress)?;

    println!("h\t{}", limit.h);
    eprintln!(
        "> {} units, empirical false-alarm rate {:.4} at h = {}.",
        limit.maxima.len(),
        limit.false_alarm_rate(),
        limit.h
    );
    Ok(())
}

fn init_config_command(path: &str) -> Result<(), Box<dyn std::error::Error>> {
    ChartConfig::default().save(path)?;
    eprintln!("> Default chart configuration written to '{path}'.");
    Ok(())
}
