//! # bgsim CLI
//!
//! Command-line interface for simulating built-in models and fitting their
//! parameters.

use anyhow::{bail, Context};
use bgsim_core::{Classification, Method, ParameterOverride, SimulationSettings};
use bgsim_engine::{models, ConstantValues, ExternalSource, Simulation};
use bgsim_fit::{FitProblem, NelderMead};
use clap::{Parser, Subcommand};
use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser)]
#[command(name = "bgsim")]
#[command(author = "Yatrogenesis")]
#[command(version = "0.1.0")]
#[command(about = "Resumable bond-graph model simulation and fitting", long_about = None)]
struct Cli {
    /// Log engine activity to stderr
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List built-in models
    List,

    /// Run a uniform time course
    Run {
        /// Built-in model name
        #[arg(short, long)]
        model: String,
        /// JSON simulation settings; replaces the grid options below
        #[arg(short, long)]
        settings: Option<PathBuf>,
        #[arg(long, default_value = "0")]
        start: f64,
        #[arg(long, default_value = "10")]
        end: f64,
        #[arg(long, default_value = "100")]
        steps: usize,
        /// Integration method name or KISAO id
        #[arg(long, default_value = "euler")]
        method: String,
        /// Internal step of fixed-step methods
        #[arg(long)]
        step_size: Option<f64>,
        /// Solver parameter, KEY=VALUE
        #[arg(long = "option")]
        options: Vec<String>,
        /// Initial value override, CLASS:INDEX=VALUE
        #[arg(long = "set")]
        overrides: Vec<String>,
        /// External input held for the whole run, INDEX=VALUE
        #[arg(long = "input")]
        inputs: Vec<String>,
    },

    /// Fit model parameters to experimental data
    Fit {
        /// JSON fit problem
        problem: PathBuf,
        /// Cost function (MSE, AE, MIN-MAX, Z-SCORE)
        #[arg(short, long)]
        cost: Option<String>,
        #[arg(long)]
        max_iterations: Option<usize>,
    },
}

fn init_logging(verbose: bool) {
    let default = if verbose {
        "info,bgsim_engine=debug,bgsim_fit=debug"
    } else {
        "warn"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command {
        Commands::List => list(),

        Commands::Run {
            model,
            settings,
            start,
            end,
            steps,
            method,
            step_size,
            options,
            overrides,
            inputs,
        } => {
            let settings = match settings {
                Some(path) => {
                    let text = std::fs::read_to_string(&path)
                        .with_context(|| format!("reading {}", path.display()))?;
                    serde_json::from_str(&text)
                        .with_context(|| format!("parsing {}", path.display()))?
                }
                None => {
                    let mut method = Method::named(&method);
                    if let Some(h) = step_size {
                        method = method.with_parameter("step_size", h);
                    }
                    for option in &options {
                        let (key, value) = parse_assignment(option)?;
                        method = method.with_parameter(key, value);
                    }
                    SimulationSettings::uniform_time_course(start, start, end, steps, method)
                }
            };
            let overrides = overrides
                .iter()
                .map(|s| parse_override(s))
                .collect::<anyhow::Result<Vec<_>>>()?;
            let inputs = inputs
                .iter()
                .map(|s| {
                    let (index, value) = parse_assignment(s)?;
                    Ok((index.parse::<usize>().with_context(|| format!("bad index in '{s}'"))?, value))
                })
                .collect::<anyhow::Result<ConstantValues>>()?;
            run(&model, &settings, &overrides, &inputs)
        }

        Commands::Fit {
            problem,
            cost,
            max_iterations,
        } => fit(problem, cost, max_iterations),
    }
}

fn list() -> anyhow::Result<()> {
    println!("{}", "Built-in Models:".green().bold());
    println!();
    for name in models::names() {
        let model = models::builtin(name).with_context(|| format!("missing model {name}"))?;
        let sim = Simulation::new(model);
        println!(
            "  {:<16} {:<10} {} states, {} variables",
            name.cyan(),
            sim.kind().to_string(),
            sim.table().state_count(),
            sim.table().variable_count()
        );
    }
    Ok(())
}

fn run(
    model: &str,
    settings: &SimulationSettings,
    overrides: &[ParameterOverride],
    inputs: &ConstantValues,
) -> anyhow::Result<()> {
    let model = models::builtin(model).with_context(|| format!("unknown model '{model}'"))?;
    let sim = Simulation::new(model);
    let source: Option<&dyn ExternalSource> = if inputs.is_empty() { None } else { Some(inputs) };

    info!(model = ?sim.model(), method = %settings.method.name, "running");
    let observables = sim.default_observables();
    let state = sim.initialize(settings.initial_time, source, overrides)?;
    let state = sim.advance(state, settings, &observables, source)?;

    let results = &state.results;
    let mut header = format!("{:>14}", "time");
    for o in results.observables() {
        header.push_str(&format!(" {:>14}", o.label()));
    }
    println!("{}", header.bold());
    for (k, t) in results.times().iter().enumerate() {
        let mut row = format!("{t:>14.6}");
        for i in 0..results.observables().len() {
            let value = results.series_at(i).and_then(|s| s.get(k)).copied().unwrap_or(f64::NAN);
            row.push_str(&format!(" {value:>14.6e}"));
        }
        println!("{row}");
    }
    Ok(())
}

fn fit(path: PathBuf, cost: Option<String>, max_iterations: Option<usize>) -> anyhow::Result<()> {
    println!("{} {}", "Loading fit problem:".green().bold(), path.display());
    let mut problem =
        FitProblem::from_path(&path).with_context(|| format!("loading {}", path.display()))?;
    if let Some(cost) = cost {
        problem.cost = cost.parse()?;
    }
    let objective = problem.objective()?;

    let mut optimizer = NelderMead::default();
    if let Some(n) = max_iterations {
        optimizer.max_iterations = n;
    }
    println!(
        "  {} parameters, {} experiments, cost {}",
        objective.parameters().len(),
        objective.experiments().len(),
        objective.cost().to_string().cyan()
    );

    let bar = ProgressBar::new(optimizer.max_iterations as u64);
    bar.set_style(
        ProgressStyle::with_template("{spinner} [{bar:40}] {pos}/{len} cost {msg}")?
            .progress_chars("=> "),
    );
    let result = optimizer.minimize_with(
        |x| objective.evaluate(x),
        &objective.initial_point(),
        &objective.bounds(),
        |iteration, best| {
            bar.set_position(iteration as u64);
            bar.set_message(format!("{best:.6e}"));
        },
    );
    bar.finish_and_clear();

    let status = if result.converged {
        "converged".green()
    } else {
        "iteration limit reached".yellow()
    };
    println!(
        "{} after {} iterations ({} evaluations)",
        status, result.iterations, result.evaluations
    );
    for (p, value) in objective.parameters().iter().zip(&result.x) {
        println!("  {:<16} {value:>14.6e}", p.name.cyan());
    }
    println!("  {:<16} {:>14.6e}", "cost".bold(), result.cost);
    if result.cost >= objective.penalty() {
        println!("{}", "Every candidate failed to simulate".red());
    }
    Ok(())
}

/// Parse `KEY=VALUE`
fn parse_assignment(s: &str) -> anyhow::Result<(&str, f64)> {
    let Some((key, value)) = s.split_once('=') else {
        bail!("expected KEY=VALUE, got '{s}'");
    };
    let value = value
        .trim()
        .parse::<f64>()
        .with_context(|| format!("bad value in '{s}'"))?;
    Ok((key.trim(), value))
}

/// Parse `CLASS:INDEX=VALUE`, e.g. `state:0=2.5`
fn parse_override(s: &str) -> anyhow::Result<ParameterOverride> {
    let (slot, value) = parse_assignment(s)?;
    let Some((class, index)) = slot.split_once(':') else {
        bail!("expected CLASS:INDEX=VALUE, got '{s}'");
    };
    let classification: Classification = class.parse()?;
    let index = index
        .trim()
        .parse::<usize>()
        .with_context(|| format!("bad index in '{s}'"))?;
    Ok(ParameterOverride::new(index, classification, value))
}
