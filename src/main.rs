// ========================================================================================
//
//                      COMMAND-LINE DRIVER: MIXED-LAPLACE
//
// ========================================================================================
//
// Reads a random-intercept problem from a TOML file, estimates its fixed effects
// through the Laplace approximation, and writes a TOML report. The `check` command
// records the model and compares the outer derivatives with finite differences
// without optimizing.

use clap::{Args, CommandFactory, Parser, Subcommand};
use itertools::Itertools;
use mixed_laplace::{
    DerivativeTest, FitOptions, FitProblem, FitResult, MixedEngine, MixedModel, RandomInterceptModel, SolverStatus,
};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::process;

// ========================================================================================
//                         COMMAND-LINE INTERFACE DEFINITION
// ========================================================================================

#[derive(Parser)]
#[command(
    name = "mixed-laplace",
    version,
    about = "Laplace-approximated fixed-effects estimation for mixed models",
    long_about = "Estimates the fixed effects of a random-intercept model by minimizing the \
                 Laplace approximation of its marginal negative log-likelihood."
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Estimate the fixed effects of a problem file (outputs: fit.toml)")]
    Fit(FitArgs),

    #[command(about = "Compare analytic and finite-difference derivatives at the initial point")]
    Check(CheckArgs),
}

#[derive(Args)]
struct FitArgs {
    /// Problem file with [options], [model] and optional [start] sections.
    problem: PathBuf,

    /// Where to write the report; defaults to fit.toml next to the problem file.
    #[arg(long)]
    output: Option<PathBuf>,
}

#[derive(Args)]
struct CheckArgs {
    problem: PathBuf,

    /// Also compare the fixed-effects Hessian (requires quasi_fixed = false).
    #[arg(long)]
    second_order: bool,
}

// ========================================================================================
//                                  PROBLEM FILES
// ========================================================================================

/// Starting values and bounds. Missing entries fall back to the model's priors
/// and to a start at the data mean with unit group variance.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct StartSection {
    fixed_init: Option<Vec<f64>>,
    fixed_lower: Option<Vec<f64>>,
    fixed_upper: Option<Vec<f64>>,
    random_lower: Option<f64>,
    random_upper: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct ProblemFile {
    #[serde(default)]
    options: FitOptions,
    model: RandomInterceptModel,
    #[serde(default)]
    start: StartSection,
}

impl ProblemFile {
    fn load(path: &Path) -> Result<Self, Box<dyn std::error::Error>> {
        let text = fs::read_to_string(path)
            .map_err(|e| format!("Failed to read problem file {}: {e}", path.display()))?;
        let problem: ProblemFile = toml::from_str(&text)?;
        problem.options.validate()?;
        problem.model.validate()?;
        Ok(problem)
    }

    fn fit_problem(&self) -> FitProblem {
        let n_fixed = self.model.n_fixed();
        let n_random = self.model.n_random();
        let n_obs = self.model.n_observations().max(1) as f64;
        let mean = self.model.groups.iter().flatten().sum::<f64>() / n_obs;

        let prior_bound = |k: usize, upper: bool| {
            self.model.priors.get(k).map_or(
                if upper { f64::INFINITY } else { f64::NEG_INFINITY },
                |prior| if upper { prior.upper } else { prior.lower },
            )
        };
        let fixed_lower = self
            .start
            .fixed_lower
            .clone()
            .unwrap_or_else(|| (0..n_fixed).map(|k| prior_bound(k, false)).collect());
        let fixed_upper = self
            .start
            .fixed_upper
            .clone()
            .unwrap_or_else(|| (0..n_fixed).map(|k| prior_bound(k, true)).collect());
        let fixed_init = self.start.fixed_init.clone().unwrap_or_else(|| {
            vec![mean, 0.0]
                .into_iter()
                .zip(fixed_lower.iter().zip(&fixed_upper))
                .map(|(x, (&lo, &hi))| x.max(lo).min(hi))
                .collect()
        });

        FitProblem::unbounded(fixed_init, vec![0.0; n_random])
            .with_fixed_bounds(fixed_lower, fixed_upper)
            .with_random_bounds(
                vec![self.start.random_lower.unwrap_or(f64::NEG_INFINITY); n_random],
                vec![self.start.random_upper.unwrap_or(f64::INFINITY); n_random],
            )
    }
}

/// What `fit` writes: the estimates in plain arrays.
#[derive(Debug, Serialize)]
struct FitReport {
    status: SolverStatus,
    iterations: usize,
    objective: f64,
    max_constraint_violation: f64,
    fixed: Vec<f64>,
    random: Vec<f64>,
}

impl From<FitResult> for FitReport {
    fn from(result: FitResult) -> Self {
        Self {
            status: result.status,
            iterations: result.iterations,
            objective: result.objective,
            max_constraint_violation: result.max_constraint_violation,
            fixed: result.fixed.to_vec(),
            random: result.random.to_vec(),
        }
    }
}

// ========================================================================================
//                                    COMMANDS
// ========================================================================================

fn run_fit(args: FitArgs) -> Result<(), Box<dyn std::error::Error>> {
    log::info!("Loading problem from: {}", args.problem.display());
    let file = ProblemFile::load(&args.problem)?;
    let problem = file.fit_problem();
    log::info!(
        "Model has {} groups and {} observations; starting at θ = [{}]",
        file.model.n_random(),
        file.model.n_observations(),
        problem.fixed_init.iter().map(|x| format!("{x:.4}")).join(", ")
    );

    let engine = MixedEngine::new(file.model.clone(), &problem.fixed_init, &problem.random_init, file.options)?;
    let result = engine.optimize_fixed(&problem)?;
    log::info!(
        "Finished with status {:?} after {} iterations: θ = [{}], objective = {:.6}",
        result.status,
        result.iterations,
        result.fixed.iter().map(|x| format!("{x:.6}")).join(", "),
        result.objective
    );

    let output = args
        .output
        .unwrap_or_else(|| args.problem.with_file_name("fit.toml"));
    let report = FitReport::from(result);
    fs::write(&output, toml::to_string_pretty(&report)?)?;
    println!("Fit report written to: {}", output.display());
    Ok(())
}

fn run_check(args: CheckArgs) -> Result<(), Box<dyn std::error::Error>> {
    let mut file = ProblemFile::load(&args.problem)?;
    file.options.derivative_test = if args.second_order {
        DerivativeTest::SecondOrder
    } else {
        DerivativeTest::FirstOrder
    };
    file.options.validate()?;
    let problem = file.fit_problem();

    let engine = MixedEngine::new(file.model.clone(), &problem.fixed_init, &problem.random_init, file.options)?;
    let mismatches = engine.derivative_test(&problem)?;
    if mismatches.is_empty() {
        println!("All derivatives agree with finite differences.");
        return Ok(());
    }
    for mismatch in &mismatches {
        println!("{mismatch}");
    }
    Err(format!("{} derivative entries disagree with finite differences", mismatches.len()).into())
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let result = match cli.command {
        Some(Commands::Fit(args)) => run_fit(args),
        Some(Commands::Check(args)) => run_check(args),
        None => {
            let _ = Cli::command().print_help();
            println!();
            Ok(())
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}
