//! # bgsim Fit
//!
//! Parameter estimation on top of the resumable engine.
//!
//! A candidate parameter vector is scored by simulating every
//! [`FitExperiment`] and reducing simulated-vs-observed differences to one
//! number. Failed simulations never surface as errors from
//! [`Objective::evaluate`]; they cost a large finite penalty so an optimizer
//! can move away from infeasible regions.
//!
//! ## Cost functions
//!
//! | Kind | Per observable |
//! |------|----------------|
//! | `MSE` | weighted mean of squared residuals (default) |
//! | `AE` | weighted sum of absolute residuals |
//! | `MIN-MAX` | `AE` divided by the experimental range |
//! | `Z-SCORE` | `AE` divided by the experimental standard deviation |

use bgsim_core::{Classification, Method, Observable, SimError, SimulationSettings, VariableIndex};
use bgsim_engine::{
    models, ConstantValues, ExternalSource, LayeredValues, PerStepValues, Simulation,
};
use ndarray::{Array1, ArrayView1};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Error, Debug)]
pub enum FitError {
    #[error("Simulation error: {0}")]
    Simulation(#[from] SimError),
    #[error("Malformed experiment: {0}")]
    MalformedExperiment(String),
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),
    #[error("Unknown model: {0}")]
    UnknownModel(String),
    #[error("Unknown cost function: {0}")]
    UnknownCost(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, FitError>;

/// Cost of an experiment whose simulation failed
pub const DEFAULT_PENALTY: f64 = 1.0e12;

fn default_penalty() -> f64 {
    DEFAULT_PENALTY
}

/// Adaptive integration, so a steady-state row never jumps to its horizon in one step
fn default_method() -> Method {
    Method::named("dopri5")
}

// =============================================================================
// COST FUNCTIONS
// =============================================================================

/// Reduction of residuals to a scalar
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CostKind {
    #[default]
    #[serde(rename = "MSE")]
    Mse,
    #[serde(rename = "AE")]
    Ae,
    #[serde(rename = "MIN-MAX")]
    MinMax,
    #[serde(rename = "Z-SCORE")]
    ZScore,
}

impl fmt::Display for CostKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Mse => "MSE",
            Self::Ae => "AE",
            Self::MinMax => "MIN-MAX",
            Self::ZScore => "Z-SCORE",
        })
    }
}

impl FromStr for CostKind {
    type Err = FitError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().replace('_', "-").as_str() {
            "MSE" => Ok(Self::Mse),
            "AE" => Ok(Self::Ae),
            "MIN-MAX" | "MINMAX" => Ok(Self::MinMax),
            "Z-SCORE" | "ZSCORE" => Ok(Self::ZScore),
            _ => Err(FitError::UnknownCost(s.to_string())),
        }
    }
}

/// Observable weight, either one scalar or one value per sample
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Weight {
    Scalar(f64),
    PerSample(Vec<f64>),
}

impl Default for Weight {
    fn default() -> Self {
        Self::Scalar(1.0)
    }
}

impl Weight {
    fn expand(&self, n: usize) -> Result<Array1<f64>> {
        match self {
            Self::Scalar(w) => Ok(Array1::from_elem(n, *w)),
            Self::PerSample(w) if w.len() == n => Ok(Array1::from(w.clone())),
            Self::PerSample(w) => Err(FitError::MalformedExperiment(format!(
                "{} weights for {n} samples",
                w.len()
            ))),
        }
    }

    fn is_valid(&self) -> bool {
        let ok = |w: &f64| w.is_finite() && *w >= 0.0;
        match self {
            Self::Scalar(w) => ok(w),
            Self::PerSample(w) => w.iter().all(ok),
        }
    }
}

impl CostKind {
    /// Weighted residual of one observable.
    pub fn residual(
        self,
        simulated: ArrayView1<f64>,
        expected: ArrayView1<f64>,
        weight: &Weight,
    ) -> Result<f64> {
        let n = expected.len();
        if simulated.len() != n {
            return Err(FitError::Simulation(SimError::MalformedOutput(format!(
                "simulated {} samples, observed {n}",
                simulated.len()
            ))));
        }
        if n == 0 {
            return Ok(0.0);
        }

        let weights = weight.expand(n)?;
        let diff = &simulated - &expected;
        let absolute = (&weights * &diff.mapv(f64::abs)).sum();

        let cost = match self {
            Self::Mse => (&weights * &diff.mapv(|d| d * d)).sum() / n as f64,
            Self::Ae => absolute,
            Self::MinMax => {
                let max = expected.fold(f64::NEG_INFINITY, |a, &b| a.max(b));
                let min = expected.fold(f64::INFINITY, |a, &b| a.min(b));
                absolute / normalizer(max - min)
            }
            Self::ZScore => absolute / normalizer(expected.std(0.0)),
        };
        Ok(cost)
    }
}

/// Constant data has no spread; fall back to the unnormalized error.
fn normalizer(spread: f64) -> f64 {
    if spread > 0.0 && spread.is_finite() {
        spread
    } else {
        1.0
    }
}

// =============================================================================
// FIT EXPERIMENTS
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ExperimentKind {
    /// One multi-step run over the time span
    TimeCourse,
    /// One run to the horizon per condition row
    SteadyState,
}

/// Observable with its measured series
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FittedObservable {
    pub observable: Observable,
    pub expected: Vec<f64>,
    #[serde(default)]
    pub weight: Weight,
}

/// Externally driven input of an experiment.
///
/// One value per time point for a time course, one per row for a steady state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConditionInput {
    pub index: VariableIndex,
    pub values: Vec<f64>,
}

/// One parameter-estimation scenario
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FitExperiment {
    pub kind: ExperimentKind,
    pub time_span: Vec<f64>,
    pub observables: Vec<FittedObservable>,
    #[serde(default)]
    pub conditions: Vec<ConditionInput>,
    /// Positions in the parameter vector this experiment uses; empty means all
    #[serde(default)]
    pub adjustable: Vec<usize>,
    /// Values held fixed for this experiment only
    #[serde(default)]
    pub fixed: ConstantValues,
}

impl FitExperiment {
    pub fn time_course(time_span: Vec<f64>, observables: Vec<FittedObservable>) -> Self {
        Self {
            kind: ExperimentKind::TimeCourse,
            time_span,
            observables,
            conditions: Vec::new(),
            adjustable: Vec::new(),
            fixed: ConstantValues::empty(),
        }
    }

    pub fn steady_state(
        time_span: Vec<f64>,
        conditions: Vec<ConditionInput>,
        observables: Vec<FittedObservable>,
    ) -> Self {
        Self {
            kind: ExperimentKind::SteadyState,
            time_span,
            observables,
            conditions,
            adjustable: Vec::new(),
            fixed: ConstantValues::empty(),
        }
    }

    /// Condition rows of a steady-state experiment
    pub fn rows(&self) -> usize {
        self.conditions.first().map_or(1, |c| c.values.len())
    }

    /// Length every simulated and expected series must have
    pub fn sample_count(&self) -> usize {
        match self.kind {
            ExperimentKind::TimeCourse => self.time_span.len(),
            ExperimentKind::SteadyState => self.rows(),
        }
    }

    pub fn validate(&self, simulation: &Simulation, parameter_count: usize) -> Result<()> {
        let malformed = |msg: String| Err(FitError::MalformedExperiment(msg));

        if self.time_span.is_empty() {
            return malformed("empty time span".into());
        }
        if self.time_span.iter().any(|t| !t.is_finite())
            || self.time_span.windows(2).any(|w| w[1] < w[0])
        {
            return malformed("time span must be finite and non-decreasing".into());
        }
        if self.kind == ExperimentKind::TimeCourse {
            let t0 = self.time_span[0];
            let n = self.time_span.len() - 1;
            let end = self.time_span[n];
            let slack = 1e-9 * end.abs().max(1.0);
            let uniform = self
                .time_span
                .iter()
                .enumerate()
                .all(|(k, t)| (t - (t0 + (end - t0) * k as f64 / n.max(1) as f64)).abs() <= slack);
            if !uniform || (n > 0 && end == t0) {
                return malformed("time course needs a uniform, increasing time span".into());
            }
        }

        let samples = self.sample_count();
        if samples == 0 {
            return malformed("steady state without condition rows".into());
        }
        for c in &self.conditions {
            if c.values.len() != samples {
                return malformed(format!(
                    "condition on variable {} has {} values, expected {samples}",
                    c.index,
                    c.values.len()
                ));
            }
            simulation.table().check_slot(c.index, Classification::External)?;
        }

        if self.observables.is_empty() {
            return malformed("no observables".into());
        }
        for o in &self.observables {
            simulation.table().check_observable(&o.observable)?;
            if o.expected.len() != samples {
                return malformed(format!(
                    "{} has {} expected values, expected {samples}",
                    o.observable.label(),
                    o.expected.len()
                ));
            }
            if !o.weight.is_valid() {
                return malformed(format!("{} has an invalid weight", o.observable.label()));
            }
            o.weight.expand(samples)?;
        }

        if let Some(&p) = self.adjustable.iter().find(|&&p| p >= parameter_count) {
            return malformed(format!("adjustable position {p} out of {parameter_count}"));
        }
        Ok(())
    }

    fn observables(&self) -> Vec<Observable> {
        self.observables.iter().map(|o| o.observable.clone()).collect()
    }
}

/// Parameter under optimization, supplied to the model as an external value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdjustableParameter {
    pub name: String,
    pub index: VariableIndex,
    pub lower: f64,
    pub upper: f64,
    pub initial: f64,
}

impl AdjustableParameter {
    pub fn new(name: &str, index: VariableIndex, lower: f64, upper: f64, initial: f64) -> Self {
        Self {
            name: name.to_string(),
            index,
            lower,
            upper,
            initial,
        }
    }

    fn validate(&self, simulation: &Simulation) -> Result<()> {
        if !(self.lower <= self.initial && self.initial <= self.upper) {
            return Err(FitError::InvalidParameter(format!(
                "{}: initial {} outside [{}, {}]",
                self.name, self.initial, self.lower, self.upper
            )));
        }
        simulation
            .table()
            .check_slot(self.index, Classification::External)
            .map_err(|e| FitError::InvalidParameter(format!("{}: {e}", self.name)))
    }
}

// =============================================================================
// OBJECTIVE EVALUATOR
// =============================================================================

/// Scalar cost of a candidate parameter vector
#[derive(Debug, Clone)]
pub struct Objective {
    simulation: Simulation,
    parameters: Vec<AdjustableParameter>,
    experiments: Vec<FitExperiment>,
    base_inputs: ConstantValues,
    cost: CostKind,
    method: Method,
    penalty: f64,
    parallel: bool,
}

impl Objective {
    pub fn new(
        simulation: Simulation,
        parameters: Vec<AdjustableParameter>,
        experiments: Vec<FitExperiment>,
    ) -> Result<Self> {
        for p in &parameters {
            p.validate(&simulation)?;
        }
        for e in &experiments {
            e.validate(&simulation, parameters.len())?;
        }
        Ok(Self {
            simulation,
            parameters,
            experiments,
            base_inputs: ConstantValues::empty(),
            cost: CostKind::default(),
            method: default_method(),
            penalty: DEFAULT_PENALTY,
            parallel: true,
        })
    }

    /// External inputs shared by every experiment
    pub fn with_base_inputs(mut self, inputs: ConstantValues) -> Self {
        self.base_inputs = inputs;
        self
    }

    pub fn with_cost(mut self, cost: CostKind) -> Self {
        self.cost = cost;
        self
    }

    pub fn with_method(mut self, method: Method) -> Self {
        self.method = method;
        self
    }

    pub fn with_penalty(mut self, penalty: f64) -> Self {
        self.penalty = penalty;
        self
    }

    pub fn with_parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    pub fn parameters(&self) -> &[AdjustableParameter] {
        &self.parameters
    }

    pub fn experiments(&self) -> &[FitExperiment] {
        &self.experiments
    }

    pub fn cost(&self) -> CostKind {
        self.cost
    }

    pub fn penalty(&self) -> f64 {
        self.penalty
    }

    pub fn initial_point(&self) -> Vec<f64> {
        self.parameters.iter().map(|p| p.initial).collect()
    }

    pub fn bounds(&self) -> Vec<(f64, f64)> {
        self.parameters.iter().map(|p| (p.lower, p.upper)).collect()
    }

    /// Cost of `x` under the configured cost kind
    pub fn evaluate(&self, x: &[f64]) -> f64 {
        self.evaluate_with(x, self.cost)
    }

    /// Cost of `x`; never fails, degraded runs cost the penalty.
    pub fn evaluate_with(&self, x: &[f64], cost: CostKind) -> f64 {
        if x.len() != self.parameters.len() {
            warn!(got = x.len(), expected = self.parameters.len(), "parameter vector length mismatch");
            return self.penalty;
        }

        let score = |experiment: &FitExperiment| match self.evaluate_experiment(x, experiment, cost) {
            Ok(c) if c.is_finite() => c,
            Ok(c) => {
                debug!(cost = c, "non-finite experiment cost, using penalty");
                self.penalty
            }
            Err(e) => {
                warn!(error = %e, "experiment failed, using penalty");
                self.penalty
            }
        };

        let total: f64 = if self.parallel {
            self.experiments.par_iter().map(score).sum()
        } else {
            self.experiments.iter().map(score).sum()
        };

        if total.is_finite() {
            total
        } else {
            warn!(total, "non-finite objective, using penalty");
            self.penalty
        }
    }

    /// Simulate one experiment and return its cost; errors are propagated.
    pub fn evaluate_experiment(
        &self,
        x: &[f64],
        experiment: &FitExperiment,
        cost: CostKind,
    ) -> Result<f64> {
        let candidate = self.candidate(x, experiment);
        let simulated = match experiment.kind {
            ExperimentKind::TimeCourse => self.run_time_course(experiment, &candidate)?,
            ExperimentKind::SteadyState => self.run_steady_state(experiment, &candidate)?,
        };

        let mut total = 0.0;
        for (fitted, series) in experiment.observables.iter().zip(&simulated) {
            total += cost.residual(
                ArrayView1::from(series.as_slice()),
                ArrayView1::from(fitted.expected.as_slice()),
                &fitted.weight,
            )?;
        }
        debug!(kind = ?experiment.kind, cost = total, "experiment evaluated");
        Ok(total)
    }

    fn candidate(&self, x: &[f64], experiment: &FitExperiment) -> ConstantValues {
        let value = |p: usize| (self.parameters[p].index, x[p]);
        if experiment.adjustable.is_empty() {
            (0..self.parameters.len()).map(value).collect()
        } else {
            experiment.adjustable.iter().map(|&p| value(p)).collect()
        }
    }

    fn layered<'a>(
        &'a self,
        conditions: &'a dyn ExternalSource,
        experiment: &'a FitExperiment,
        candidate: &'a ConstantValues,
    ) -> LayeredValues<'a> {
        LayeredValues::new()
            .with(conditions)
            .with(&experiment.fixed)
            .with(candidate)
            .with(&self.base_inputs)
    }

    fn run_time_course(
        &self,
        experiment: &FitExperiment,
        candidate: &ConstantValues,
    ) -> Result<Vec<Vec<f64>>> {
        let inputs = PerStepValues::new(
            experiment.conditions.iter().map(|c| c.index).collect(),
            experiment.conditions.iter().map(|c| c.values.clone()).collect(),
        )?;
        let source = self.layered(&inputs, experiment, candidate);

        let span = &experiment.time_span;
        let (t0, end) = (span[0], span[span.len() - 1]);
        let settings =
            SimulationSettings::uniform_time_course(t0, t0, end, span.len() - 1, self.method.clone());
        let observables = experiment.observables();

        let state = self.simulation.initialize(t0, Some(&source), &[])?;
        let state = self
            .simulation
            .advance(state, &settings, &observables, Some(&source))?;

        (0..observables.len())
            .map(|i| {
                state.results.series_at(i).map(<[f64]>::to_vec).ok_or_else(|| {
                    FitError::Simulation(SimError::MalformedOutput(format!("missing series {i}")))
                })
            })
            .collect()
    }

    fn run_steady_state(
        &self,
        experiment: &FitExperiment,
        candidate: &ConstantValues,
    ) -> Result<Vec<Vec<f64>>> {
        let span = &experiment.time_span;
        let (t0, horizon) = (span[0], span[span.len() - 1]);
        let settings = SimulationSettings::steady_state(t0, horizon, self.method.clone());
        let observables = experiment.observables();
        let rows = experiment.rows();
        let mut simulated = vec![Vec::with_capacity(rows); observables.len()];

        for row in 0..rows {
            let inputs: ConstantValues = experiment
                .conditions
                .iter()
                .map(|c| (c.index, c.values[row]))
                .collect();
            let source = self.layered(&inputs, experiment, candidate);

            let state = self.simulation.initialize(t0, Some(&source), &[])?;
            let state = self
                .simulation
                .advance(state, &settings, &observables, Some(&source))?;
            for (i, series) in simulated.iter_mut().enumerate() {
                let value = state
                    .results
                    .series_at(i)
                    .and_then(|s| s.first().copied())
                    .ok_or_else(|| {
                        FitError::Simulation(SimError::MalformedOutput(format!(
                            "row {row} produced no sample for series {i}"
                        )))
                    })?;
                series.push(value);
            }
        }
        Ok(simulated)
    }
}

// =============================================================================
// OPTIMIZER
// =============================================================================

/// Bounded Nelder-Mead simplex search
#[derive(Debug, Clone, Copy)]
pub struct NelderMead {
    pub max_iterations: usize,
    /// Stop once best and worst vertex costs are this close
    pub tolerance: f64,
    /// Initial simplex edge, as a fraction of each bound range
    pub initial_scale: f64,
}

impl Default for NelderMead {
    fn default() -> Self {
        Self {
            max_iterations: 500,
            tolerance: 1e-10,
            initial_scale: 0.1,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OptimizationResult {
    pub x: Vec<f64>,
    pub cost: f64,
    pub iterations: usize,
    pub evaluations: usize,
    pub converged: bool,
}

impl NelderMead {
    pub fn minimize<F>(&self, f: F, x0: &[f64], bounds: &[(f64, f64)]) -> OptimizationResult
    where
        F: FnMut(&[f64]) -> f64,
    {
        self.minimize_with(f, x0, bounds, |_, _| {})
    }

    /// Same as [`minimize`](Self::minimize), reporting `(iteration, best cost)`.
    pub fn minimize_with<F, P>(
        &self,
        mut f: F,
        x0: &[f64],
        bounds: &[(f64, f64)],
        mut progress: P,
    ) -> OptimizationResult
    where
        F: FnMut(&[f64]) -> f64,
        P: FnMut(usize, f64),
    {
        let n = x0.len();
        let clamp = |x: &mut Vec<f64>| {
            for (v, (lo, hi)) in x.iter_mut().zip(bounds) {
                *v = v.max(*lo).min(*hi);
            }
        };
        let mut evaluations = 0;
        let mut eval = |x: &[f64]| {
            evaluations += 1;
            let c = f(x);
            if c.is_nan() {
                f64::INFINITY
            } else {
                c
            }
        };

        let mut start = x0.to_vec();
        clamp(&mut start);
        let mut simplex = vec![start.clone()];
        for i in 0..n {
            let mut vertex = start.clone();
            let step = match bounds.get(i) {
                Some((lo, hi)) if (hi - lo).is_finite() && hi > lo => self.initial_scale * (hi - lo),
                _ => self.initial_scale * start[i].abs().max(1.0),
            };
            vertex[i] += step;
            if bounds.get(i).is_some_and(|(_, hi)| vertex[i] > *hi) {
                vertex[i] = start[i] - step;
            }
            clamp(&mut vertex);
            simplex.push(vertex);
        }
        let mut costs: Vec<f64> = simplex.iter().map(|v| eval(v)).collect();

        let mut iterations = 0;
        let mut converged = n == 0;
        while !converged && iterations < self.max_iterations {
            let mut order: Vec<usize> = (0..=n).collect();
            order.sort_by(|&a, &b| costs[a].total_cmp(&costs[b]));
            simplex = order.iter().map(|&i| simplex[i].clone()).collect();
            costs = order.iter().map(|&i| costs[i]).collect();

            progress(iterations, costs[0]);
            if (costs[n] - costs[0]).abs() <= self.tolerance {
                converged = true;
                break;
            }
            iterations += 1;

            let centroid: Vec<f64> = (0..n)
                .map(|j| simplex[..n].iter().map(|v| v[j]).sum::<f64>() / n as f64)
                .collect();
            let toward = |from: &[f64], factor: f64| -> Vec<f64> {
                let mut x: Vec<f64> = centroid
                    .iter()
                    .zip(from)
                    .map(|(c, v)| c + factor * (v - c))
                    .collect();
                clamp(&mut x);
                x
            };

            let reflected = toward(&simplex[n], -1.0);
            let fr = eval(&reflected);
            if fr < costs[0] {
                let expanded = toward(&simplex[n], -2.0);
                let fe = eval(&expanded);
                if fe < fr {
                    simplex[n] = expanded;
                    costs[n] = fe;
                } else {
                    simplex[n] = reflected;
                    costs[n] = fr;
                }
            } else if fr < costs[n - 1] {
                simplex[n] = reflected;
                costs[n] = fr;
            } else {
                let contracted = if fr < costs[n] {
                    toward(&reflected, 0.5)
                } else {
                    toward(&simplex[n], 0.5)
                };
                let fc = eval(&contracted);
                if fc < fr.min(costs[n]) {
                    simplex[n] = contracted;
                    costs[n] = fc;
                } else {
                    let best = simplex[0].clone();
                    for i in 1..=n {
                        let mut shrunk: Vec<f64> = best
                            .iter()
                            .zip(&simplex[i])
                            .map(|(b, v)| b + 0.5 * (v - b))
                            .collect();
                        clamp(&mut shrunk);
                        costs[i] = eval(&shrunk);
                        simplex[i] = shrunk;
                    }
                }
            }
        }

        let best = (0..=n)
            .min_by(|&a, &b| costs[a].total_cmp(&costs[b]))
            .unwrap_or(0);
        OptimizationResult {
            x: simplex[best].clone(),
            cost: costs[best],
            iterations,
            evaluations,
            converged,
        }
    }
}

// =============================================================================
// FIT PROBLEM DOCUMENT
// =============================================================================

/// Complete parameter-estimation problem, as read from JSON
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FitProblem {
    /// Built-in model name
    pub model: String,
    pub parameters: Vec<AdjustableParameter>,
    pub experiments: Vec<FitExperiment>,
    #[serde(default)]
    pub base_inputs: ConstantValues,
    #[serde(default)]
    pub cost: CostKind,
    #[serde(default = "default_method")]
    pub method: Method,
    #[serde(default = "default_penalty")]
    pub penalty: f64,
}

impl FitProblem {
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    /// Resolve the model and build a validated objective
    pub fn objective(&self) -> Result<Objective> {
        let model = models::builtin(&self.model)
            .ok_or_else(|| FitError::UnknownModel(self.model.clone()))?;
        Ok(Objective::new(
            Simulation::new(model),
            self.parameters.clone(),
            self.experiments.clone(),
        )?
        .with_base_inputs(self.base_inputs.clone())
        .with_cost(self.cost)
        .with_method(self.method.clone())
        .with_penalty(self.penalty))
    }
}

// =============================================================================
// TESTS
// =============================================================================
