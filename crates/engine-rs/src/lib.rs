//! # bgsim Engine
//!
//! Resumable simulation of generated bond-graph / CellML model modules.
//!
//! ## Pipeline
//!
//! 1. **Initialize**: allocate the module arrays, apply overrides, settle constants
//! 2. **Advance**: drive the module to each output point (Euler, Dormand-Prince, or
//!    pure algebraic re-evaluation)
//! 3. **Record**: copy observables into fixed-capacity buffers
//!
//! An [`ExecutionState`] returned by [`Simulation::advance`] can be handed back
//! to a later `advance` call; the run continues exactly where it stopped.
//!
//! ## Module contract
//!
//! Generated modules implement [`DifferentialModule`] (ode/dae) or
//! [`AlgebraicModule`]. They work in place on caller-owned slices and ask for
//! `external` variables through an [`ExternalLookup`].

use bgsim_core::{
    Classification, Method, ModelKind, Observable, ParameterOverride, Result, SimError,
    SimulationKind, SimulationSettings, Time, VariableIndex, VariableInfo, VariableTable,
};
use nalgebra::DVector;
use ndarray::Array2;
use ode_solvers::dop_shared::{OutputType, System};
use ode_solvers::{Dop853, Dopri5};
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

/// Relative slack when comparing the current time with an output time
const TIME_TOLERANCE: f64 = 1e-12;

// =============================================================================
// EXTERNAL VALUE SOURCES
// =============================================================================

/// Supplier of values the module cannot compute itself.
///
/// Returns `None` for indices the source does not own.
pub trait ExternalSource: Send + Sync {
    fn value(&self, index: VariableIndex, step: Option<usize>) -> Option<f64>;
}

/// One value per index, held fixed for the whole run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawConstantValues")]
pub struct ConstantValues {
    indices: Vec<VariableIndex>,
    values: Vec<f64>,
}

impl ConstantValues {
    pub fn new(indices: Vec<VariableIndex>, values: Vec<f64>) -> Result<Self> {
        if indices.len() != values.len() {
            return Err(SimError::InvalidSettings(format!(
                "{} external indices but {} values",
                indices.len(),
                values.len()
            )));
        }
        Ok(Self { indices, values })
    }

    pub fn empty() -> Self {
        Self::default()
    }

    /// Add or replace the value of `index`
    pub fn set(&mut self, index: VariableIndex, value: f64) {
        match self.indices.iter().position(|&i| i == index) {
            Some(pos) => self.values[pos] = value,
            None => {
                self.indices.push(index);
                self.values.push(value);
            }
        }
    }

    pub fn indices(&self) -> &[VariableIndex] {
        &self.indices
    }

    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }
}

impl FromIterator<(VariableIndex, f64)> for ConstantValues {
    fn from_iter<I: IntoIterator<Item = (VariableIndex, f64)>>(iter: I) -> Self {
        let mut values = Self::empty();
        for (index, value) in iter {
            values.set(index, value);
        }
        values
    }
}

impl ExternalSource for ConstantValues {
    fn value(&self, index: VariableIndex, _step: Option<usize>) -> Option<f64> {
        self.indices
            .iter()
            .position(|&i| i == index)
            .and_then(|pos| self.values.get(pos).copied())
    }
}

#[derive(Deserialize)]
struct RawConstantValues {
    #[serde(default)]
    indices: Vec<VariableIndex>,
    #[serde(default)]
    values: Vec<f64>,
}

impl TryFrom<RawConstantValues> for ConstantValues {
    type Error = SimError;

    fn try_from(raw: RawConstantValues) -> Result<Self> {
        Self::new(raw.indices, raw.values)
    }
}

/// A distinct value per output step (a pre-computed driving signal).
///
/// `series[i][step]` is the value of `indices[i]` at output step `step`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawPerStepValues")]
pub struct PerStepValues {
    indices: Vec<VariableIndex>,
    series: Vec<Vec<f64>>,
}

impl PerStepValues {
    pub fn new(indices: Vec<VariableIndex>, series: Vec<Vec<f64>>) -> Result<Self> {
        if indices.len() != series.len() {
            return Err(SimError::InvalidSettings(format!(
                "{} external indices but {} series",
                indices.len(),
                series.len()
            )));
        }
        Ok(Self { indices, series })
    }

    /// Number of steps every series covers
    pub fn steps(&self) -> usize {
        self.series.iter().map(Vec::len).min().unwrap_or(0)
    }
}

impl ExternalSource for PerStepValues {
    fn value(&self, index: VariableIndex, step: Option<usize>) -> Option<f64> {
        let pos = self.indices.iter().position(|&i| i == index)?;
        self.series.get(pos)?.get(step?).copied()
    }
}

#[derive(Deserialize)]
struct RawPerStepValues {
    #[serde(default)]
    indices: Vec<VariableIndex>,
    #[serde(default)]
    series: Vec<Vec<f64>>,
}

impl TryFrom<RawPerStepValues> for PerStepValues {
    type Error = SimError;

    fn try_from(raw: RawPerStepValues) -> Result<Self> {
        Self::new(raw.indices, raw.series)
    }
}

/// Ordered stack of sources; the first one owning an index wins.
#[derive(Default)]
pub struct LayeredValues<'a> {
    layers: Vec<&'a dyn ExternalSource>,
}

impl<'a> LayeredValues<'a> {
    pub fn new() -> Self {
        Self { layers: Vec::new() }
    }

    pub fn with(mut self, layer: &'a dyn ExternalSource) -> Self {
        self.layers.push(layer);
        self
    }
}

impl ExternalSource for LayeredValues<'_> {
    fn value(&self, index: VariableIndex, step: Option<usize>) -> Option<f64> {
        self.layers.iter().find_map(|layer| layer.value(index, step))
    }
}

/// Handle passed to module functions for `external` variables.
#[derive(Clone, Copy)]
pub struct ExternalLookup<'a> {
    source: Option<&'a dyn ExternalSource>,
    step: Option<usize>,
}

impl<'a> ExternalLookup<'a> {
    pub fn new(source: Option<&'a dyn ExternalSource>, step: Option<usize>) -> Self {
        Self { source, step }
    }

    pub fn none() -> Self {
        Self {
            source: None,
            step: None,
        }
    }

    /// Current output step, if any
    pub fn step(&self) -> Option<usize> {
        self.step
    }

    /// Value of an `external` variable; a missing supplier is fatal.
    pub fn value(&self, index: VariableIndex) -> Result<f64> {
        self.source
            .and_then(|s| s.value(index, self.step))
            .ok_or(SimError::MissingExternal {
                index,
                step: self.step,
            })
    }
}

// =============================================================================
// NUMERIC MODULE CONTRACT
// =============================================================================

/// Generated module of an ode or dae model.
///
/// All functions operate in place and must not allocate on repeated calls.
pub trait DifferentialModule: Send + Sync {
    fn voi_info(&self) -> VariableInfo;
    fn state_info(&self) -> Vec<VariableInfo>;
    fn variable_info(&self) -> Vec<VariableInfo>;

    fn create_state_vector(&self) -> Vec<f64> {
        vec![0.0; self.state_info().len()]
    }

    fn create_variable_vector(&self) -> Vec<f64> {
        vec![0.0; self.variable_info().len()]
    }

    fn initialise_variables(
        &self,
        states: &mut [f64],
        rates: &mut [f64],
        variables: &mut [f64],
        external: &ExternalLookup<'_>,
    ) -> Result<()>;

    /// Settle computed constants.
    ///
    /// Modules may rely on being called twice, so that a computed constant
    /// which depends on a later one is right after the second pass.
    fn compute_computed_constants(&self, variables: &mut [f64]);

    fn compute_rates(
        &self,
        voi: Time,
        states: &[f64],
        rates: &mut [f64],
        variables: &mut [f64],
        external: &ExternalLookup<'_>,
    ) -> Result<()>;

    fn compute_variables(
        &self,
        voi: Time,
        states: &[f64],
        rates: &[f64],
        variables: &mut [f64],
        external: &ExternalLookup<'_>,
    ) -> Result<()>;
}

/// Generated module of a purely algebraic model
pub trait AlgebraicModule: Send + Sync {
    fn variable_info(&self) -> Vec<VariableInfo>;

    fn create_variable_vector(&self) -> Vec<f64> {
        vec![0.0; self.variable_info().len()]
    }

    fn initialise_variables(&self, variables: &mut [f64], external: &ExternalLookup<'_>)
        -> Result<()>;

    /// Same two-pass contract as [`DifferentialModule::compute_computed_constants`]
    fn compute_computed_constants(&self, variables: &mut [f64]);

    fn compute_variables(&self, variables: &mut [f64], external: &ExternalLookup<'_>) -> Result<()>;
}

/// Module handle tagged with its model kind
#[derive(Clone)]
pub enum Model {
    Ode(Arc<dyn DifferentialModule>),
    Dae(Arc<dyn DifferentialModule>),
    Algebraic(Arc<dyn AlgebraicModule>),
}

impl Model {
    pub fn ode(module: impl DifferentialModule + 'static) -> Self {
        Self::Ode(Arc::new(module))
    }

    pub fn dae(module: impl DifferentialModule + 'static) -> Self {
        Self::Dae(Arc::new(module))
    }

    pub fn algebraic(module: impl AlgebraicModule + 'static) -> Self {
        Self::Algebraic(Arc::new(module))
    }

    pub fn kind(&self) -> ModelKind {
        match self {
            Self::Ode(_) => ModelKind::Ode,
            Self::Dae(_) => ModelKind::Dae,
            Self::Algebraic(_) => ModelKind::Algebraic,
        }
    }

    fn variable_table(&self) -> VariableTable {
        match self {
            Self::Ode(m) | Self::Dae(m) => {
                VariableTable::new(Some(m.voi_info()), m.state_info(), m.variable_info())
            }
            Self::Algebraic(m) => VariableTable::new(None, Vec::new(), m.variable_info()),
        }
    }
}

impl fmt::Debug for Model {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Model({})", self.kind())
    }
}

// =============================================================================
// EXECUTION STATE
// =============================================================================

/// Fixed-capacity sample buffers of one `advance` call
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Recording {
    observables: Vec<Observable>,
    times: Vec<f64>,
    series: Vec<Vec<f64>>,
    capacity: usize,
    first_step: usize,
}

impl Recording {
    pub fn new(observables: &[Observable], capacity: usize, first_step: usize) -> Self {
        Self {
            observables: observables.to_vec(),
            times: Vec::with_capacity(capacity),
            series: observables.iter().map(|_| Vec::with_capacity(capacity)).collect(),
            capacity,
            first_step,
        }
    }

    /// Samples recorded so far
    pub fn len(&self) -> usize {
        self.times.len()
    }

    pub fn is_empty(&self) -> bool {
        self.times.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Cursor value of the first sample
    pub fn first_step(&self) -> usize {
        self.first_step
    }

    pub fn observables(&self) -> &[Observable] {
        &self.observables
    }

    /// Output times of the recorded samples
    pub fn times(&self) -> &[f64] {
        &self.times
    }

    pub fn series(&self, observable: &Observable) -> Option<&[f64]> {
        self.observables
            .iter()
            .position(|o| o == observable)
            .map(|i| self.series[i].as_slice())
    }

    /// Series of the observable named `name` in `component`
    pub fn series_by_name(&self, component: &str, name: &str) -> Option<&[f64]> {
        self.observables
            .iter()
            .position(|o| o.component == component && o.name == name)
            .map(|i| self.series[i].as_slice())
    }

    pub fn series_at(&self, position: usize) -> Option<&[f64]> {
        self.series.get(position).map(Vec::as_slice)
    }

    /// Rows are samples; column 0 is time, then one column per observable.
    pub fn to_array(&self) -> Array2<f64> {
        Array2::from_shape_fn((self.len(), self.observables.len() + 1), |(row, col)| {
            if col == 0 {
                self.times[row]
            } else {
                self.series[col - 1][row]
            }
        })
    }

    fn record(&mut self, time: Time, states: &[f64], variables: &[f64]) -> Result<()> {
        if self.len() >= self.capacity {
            return Err(SimError::MalformedOutput(format!(
                "recording already holds {} samples",
                self.capacity
            )));
        }
        self.times.push(time);
        for (observable, series) in self.observables.iter().zip(self.series.iter_mut()) {
            let value = match observable.classification {
                Classification::VariableOfIntegration => time,
                Classification::State => states[observable.index],
                _ => variables[observable.index],
            };
            series.push(value);
        }
        Ok(())
    }
}

/// Resumable snapshot of a simulation.
///
/// Owned by the caller that created it; never shared between concurrent runs.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionState {
    pub time: Time,
    pub states: Vec<f64>,
    pub rates: Vec<f64>,
    pub variables: Vec<f64>,
    /// Completed output steps, monotonic across resumed runs
    pub cursor: usize,
    pub results: Recording,
}

impl ExecutionState {
    /// Record the current point as output step `step`.
    fn record(&mut self, step: usize) -> Result<()> {
        self.results.record(self.time, &self.states, &self.variables)?;
        self.cursor = step + 1;
        Ok(())
    }

    fn check_finite(&self) -> Result<()> {
        if let Some(i) = self.states.iter().position(|s| !s.is_finite()) {
            return Err(SimError::Numerical(format!(
                "state {i} became {} at t = {}",
                self.states[i], self.time
            )));
        }
        Ok(())
    }
}

// =============================================================================
// VARIABLE-STEP BACKEND
// =============================================================================

/// Right-hand side handed to a variable-step backend
pub trait RightHandSide {
    fn evaluate(&mut self, t: Time, y: &[f64], dydt: &mut [f64]) -> Result<()>;
}

/// External ODE solver driving states from `t0` to `t1`.
pub trait OdeBackend: Send + Sync {
    fn name(&self) -> &str;

    /// Integrate `y` in place; a failed step is fatal for the run.
    fn integrate(&self, rhs: &mut dyn RightHandSide, t0: Time, t1: Time, y: &mut [f64]) -> Result<()>;
}

/// Tolerances and ceilings of the Dormand-Prince backend
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SolverOptions {
    pub rtol: f64,
    pub atol: f64,
    pub max_step: Option<f64>,
    /// Initial step; 0 lets the solver choose
    pub first_step: f64,
    /// Hard ceiling on steps per output interval
    pub nsteps: u32,
    pub nstiff: u32,
}

impl Default for SolverOptions {
    fn default() -> Self {
        Self {
            rtol: 1e-6,
            atol: 1e-12,
            max_step: None,
            first_step: 0.0,
            nsteps: 100_000,
            nstiff: 1000,
        }
    }
}

impl SolverOptions {
    pub fn from_method(method: &Method) -> Result<Self> {
        let mut options = Self::default();
        for (key, &value) in &method.parameters {
            let invalid = || SimError::InvalidSettings(format!("{key} = {value} is not allowed"));
            let count = || -> Result<u32> {
                if value.is_finite() && value >= 0.0 && value.fract() == 0.0 && value <= u32::MAX as f64 {
                    Ok(value as u32)
                } else {
                    Err(invalid())
                }
            };
            match key.as_str() {
                "rtol" if value > 0.0 => options.rtol = value,
                "atol" if value > 0.0 => options.atol = value,
                "max_step" if value > 0.0 => options.max_step = Some(value),
                "first_step" if value >= 0.0 => options.first_step = value,
                "rtol" | "atol" | "max_step" | "first_step" => return Err(invalid()),
                "nsteps" => options.nsteps = count()?,
                "nstiff" => options.nstiff = count()?,
                other => warn!(method = %method.name, parameter = other, "ignoring unknown solver parameter"),
            }
        }
        Ok(options)
    }
}

/// Embedded Runge-Kutta pair used by [`DormandPrince`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DormandPrinceOrder {
    /// 5(4)
    Five,
    /// 8(5,3)
    Eight,
}

/// Dormand-Prince backend built on `ode_solvers`
#[derive(Debug, Clone)]
pub struct DormandPrince {
    order: DormandPrinceOrder,
    options: SolverOptions,
}

impl DormandPrince {
    pub fn new(order: DormandPrinceOrder, options: SolverOptions) -> Self {
        Self { order, options }
    }

    pub fn options(&self) -> &SolverOptions {
        &self.options
    }
}

struct ModuleSystem<'a, 'r> {
    rhs: RefCell<&'a mut (dyn RightHandSide + 'r)>,
    failure: &'a RefCell<Option<SimError>>,
}

impl System<f64, DVector<f64>> for ModuleSystem<'_, '_> {
    fn system(&self, x: f64, y: &DVector<f64>, dy: &mut DVector<f64>) {
        if self.failure.borrow().is_some() {
            dy.fill(0.0);
            return;
        }
        if let Err(e) = self.rhs.borrow_mut().evaluate(x, y.as_slice(), dy.as_mut_slice()) {
            dy.fill(0.0);
            *self.failure.borrow_mut() = Some(e);
        }
    }
}

impl OdeBackend for DormandPrince {
    fn name(&self) -> &str {
        match self.order {
            DormandPrinceOrder::Five => "dopri5",
            DormandPrinceOrder::Eight => "dop853",
        }
    }

    fn integrate(&self, rhs: &mut dyn RightHandSide, t0: Time, t1: Time, y: &mut [f64]) -> Result<()> {
        let span = t1 - t0;
        if span <= 0.0 {
            return Ok(());
        }
        if self.options.nsteps == 0 {
            return Err(SimError::Integration(format!(
                "{}: step ceiling of 0 reached at t = {t0}",
                self.name()
            )));
        }

        let o = self.options;
        let h_max = o.max_step.map_or(span, |m| m.min(span));
        let failure = RefCell::new(None);
        let system = ModuleSystem {
            rhs: RefCell::new(rhs),
            failure: &failure,
        };
        let y0 = DVector::from_column_slice(y);

        let (outcome, last) = match self.order {
            DormandPrinceOrder::Five => {
                let mut solver = Dopri5::from_param(
                    system, t0, t1, span, y0, o.rtol, o.atol, 0.9, 0.04, 0.2, 10.0, h_max,
                    o.first_step, o.nsteps, o.nstiff, OutputType::Sparse,
                );
                let outcome = solver.integrate().map(|_| ());
                (outcome, solver.y_out().last().cloned())
            }
            DormandPrinceOrder::Eight => {
                let mut solver = Dop853::from_param(
                    system, t0, t1, span, y0, o.rtol, o.atol, 0.9, 0.0, 0.333, 6.0, h_max,
                    o.first_step, o.nsteps, o.nstiff, OutputType::Sparse,
                );
                let outcome = solver.integrate().map(|_| ());
                (outcome, solver.y_out().last().cloned())
            }
        };

        if let Some(e) = failure.borrow_mut().take() {
            return Err(e);
        }
        outcome.map_err(|e| SimError::Integration(format!("{}: {e:?}", self.name())))?;
        let last = last.ok_or_else(|| {
            SimError::Integration(format!("{}: no solution between {t0} and {t1}", self.name()))
        })?;
        y.copy_from_slice(last.as_slice());
        Ok(())
    }
}

struct ModuleRhs<'a> {
    module: &'a dyn DifferentialModule,
    variables: &'a mut [f64],
    external: ExternalLookup<'a>,
}

impl RightHandSide for ModuleRhs<'_> {
    fn evaluate(&mut self, t: Time, y: &[f64], dydt: &mut [f64]) -> Result<()> {
        self.module
            .compute_rates(t, y, dydt, self.variables, &self.external)
    }
}

// =============================================================================
// STEP DRIVERS
// =============================================================================

/// Step driver chosen once per run
#[derive(Clone)]
enum StepDriver {
    Euler { step_size: Option<f64> },
    VariableStep(Arc<dyn OdeBackend>),
    Algebraic,
}

/// Integration method family named by a [`Method`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MethodFamily {
    Euler,
    DormandPrince(DormandPrinceOrder),
}

impl MethodFamily {
    pub fn resolve(method: &Method) -> Result<Self> {
        let name = method.name.trim().to_ascii_lowercase().replace(':', "_");
        match name.as_str() {
            "euler" | "euler forward method" | "forward euler" | "kisao_0000030" => Ok(Self::Euler),
            "dopri5" | "rk45" | "kisao_0000087" => Ok(Self::DormandPrince(DormandPrinceOrder::Five)),
            "dop853" | "kisao_0000436" => Ok(Self::DormandPrince(DormandPrinceOrder::Eight)),
            "cvode" | "kisao_0000019" | "lsoda" | "kisao_0000088" => {
                warn!(method = %method.name, "no native backend, integrating with dopri5");
                Ok(Self::DormandPrince(DormandPrinceOrder::Five))
            }
            _ => Err(SimError::UnknownMethod(method.name.clone())),
        }
    }
}

impl StepDriver {
    fn select(model: &Model, method: &Method, backend: Option<&Arc<dyn OdeBackend>>) -> Result<Self> {
        if let Model::Algebraic(_) = model {
            return Ok(Self::Algebraic);
        }
        match MethodFamily::resolve(method)? {
            MethodFamily::Euler => Ok(Self::Euler {
                step_size: method.step_size(),
            }),
            MethodFamily::DormandPrince(order) => match backend {
                Some(custom) => Ok(Self::VariableStep(Arc::clone(custom))),
                None => Ok(Self::VariableStep(Arc::new(DormandPrince::new(
                    order,
                    SolverOptions::from_method(method)?,
                )))),
            },
        }
    }

    /// Move a differential model from the current time to `target`.
    fn step_to(
        &self,
        module: &dyn DifferentialModule,
        state: &mut ExecutionState,
        target: Time,
        source: Option<&dyn ExternalSource>,
    ) -> Result<()> {
        let span = target - state.time;
        if span <= TIME_TOLERANCE * target.abs().max(1.0) {
            return Ok(());
        }
        let external = ExternalLookup::new(source, Some(state.cursor));

        match self {
            Self::Euler { step_size } => {
                let h = step_size.filter(|h| *h < span).unwrap_or(span);
                let substeps = (span / h - 1e-9).ceil().max(1.0) as usize;
                for i in 0..substeps {
                    let last = i + 1 == substeps;
                    let dt = if last { target - state.time } else { h };
                    module.compute_rates(
                        state.time,
                        &state.states,
                        &mut state.rates,
                        &mut state.variables,
                        &external,
                    )?;
                    for (s, r) in state.states.iter_mut().zip(&state.rates) {
                        *s += dt * r;
                    }
                    state.time = if last { target } else { state.time + dt };
                    module.compute_variables(
                        state.time,
                        &state.states,
                        &state.rates,
                        &mut state.variables,
                        &external,
                    )?;
                }
            }
            Self::VariableStep(backend) => {
                let mut rhs = ModuleRhs {
                    module,
                    variables: &mut state.variables,
                    external,
                };
                backend.integrate(&mut rhs, state.time, target, &mut state.states)?;
                state.time = target;
                module.compute_rates(
                    state.time,
                    &state.states,
                    &mut state.rates,
                    &mut state.variables,
                    &external,
                )?;
                module.compute_variables(
                    state.time,
                    &state.states,
                    &state.rates,
                    &mut state.variables,
                    &external,
                )?;
            }
            Self::Algebraic => {
                return Err(SimError::InvalidSettings(
                    "algebraic models have no time integration".into(),
                ))
            }
        }

        state.check_finite()
    }
}

// =============================================================================
// SIMULATION
// =============================================================================

/// Output points of one `advance` call
#[derive(Debug, Clone, Copy)]
struct OutputGrid {
    first: Time,
    last: Time,
    steps: usize,
}

impl OutputGrid {
    fn new(settings: &SimulationSettings, now: Time) -> Self {
        match settings.kind {
            SimulationKind::UniformTimeCourse => Self {
                first: settings.output_start_time,
                last: settings.output_end_time,
                steps: settings.number_of_steps,
            },
            SimulationKind::OneStep => Self {
                first: now + settings.step_size,
                last: now + settings.step_size,
                steps: 0,
            },
            SimulationKind::SteadyState => Self {
                first: settings.output_end_time,
                last: settings.output_end_time,
                steps: 0,
            },
        }
    }

    fn time(&self, k: usize) -> Time {
        if k == self.steps {
            self.last
        } else {
            self.first + (self.last - self.first) * k as f64 / self.steps.max(1) as f64
        }
    }
}

/// Model handle plus its precomputed variable table
#[derive(Clone)]
pub struct Simulation {
    model: Model,
    table: VariableTable,
    backend: Option<Arc<dyn OdeBackend>>,
}

impl fmt::Debug for Simulation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Simulation")
            .field("model", &self.model)
            .field("states", &self.table.state_count())
            .field("variables", &self.table.variable_count())
            .field("backend", &self.backend.as_ref().map(|b| b.name().to_string()))
            .finish()
    }
}

impl Simulation {
    pub fn new(model: Model) -> Self {
        let table = model.variable_table();
        Self {
            model,
            table,
            backend: None,
        }
    }

    /// Use a custom backend for every variable-step method
    pub fn with_backend(mut self, backend: Arc<dyn OdeBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    pub fn model(&self) -> &Model {
        &self.model
    }

    pub fn kind(&self) -> ModelKind {
        self.model.kind()
    }

    pub fn table(&self) -> &VariableTable {
        &self.table
    }

    /// Resolve an observable by component and name
    pub fn observable(&self, component: &str, name: &str) -> Result<Observable> {
        self.table.find(component, name).ok_or_else(|| {
            SimError::InvalidObservable(format!("no variable {component}/{name} in model"))
        })
    }

    /// States followed by every algebraic variable
    pub fn default_observables(&self) -> Vec<Observable> {
        let states = self
            .table
            .states
            .iter()
            .enumerate()
            .map(|(i, s)| Observable::new(&s.name, &s.component, i, Classification::State));
        let algebraic = self
            .table
            .variables
            .iter()
            .enumerate()
            .filter(|(_, v)| v.classification == Classification::Algebraic)
            .map(|(i, v)| Observable::new(&v.name, &v.component, i, v.classification));
        states.chain(algebraic).collect()
    }

    pub fn validate_observables(&self, observables: &[Observable]) -> Result<()> {
        observables
            .iter()
            .try_for_each(|o| self.table.check_observable(o))
    }

    /// Build the initial execution state.
    ///
    /// Overrides are validated before anything is allocated; a rejected
    /// override leaves no state behind.
    pub fn initialize(
        &self,
        initial_time: Time,
        source: Option<&dyn ExternalSource>,
        overrides: &[ParameterOverride],
    ) -> Result<ExecutionState> {
        overrides
            .iter()
            .try_for_each(|o| self.table.check_override(o))?;

        let external = ExternalLookup::new(source, Some(0));
        let apply = |states: &mut [f64], variables: &mut [f64]| {
            for o in overrides {
                match o.classification {
                    Classification::State => states[o.index] = o.value,
                    _ => variables[o.index] = o.value,
                }
            }
        };

        let state = match &self.model {
            Model::Ode(m) | Model::Dae(m) => {
                let mut states = m.create_state_vector();
                let mut rates = m.create_state_vector();
                let mut variables = m.create_variable_vector();
                self.check_lengths(states.len(), variables.len())?;

                m.initialise_variables(&mut states, &mut rates, &mut variables, &external)?;
                apply(&mut states, &mut variables);
                m.compute_computed_constants(&mut variables);
                m.compute_computed_constants(&mut variables);
                m.compute_rates(initial_time, &states, &mut rates, &mut variables, &external)?;
                m.compute_variables(initial_time, &states, &rates, &mut variables, &external)?;

                ExecutionState {
                    time: initial_time,
                    states,
                    rates,
                    variables,
                    cursor: 0,
                    results: Recording::default(),
                }
            }
            Model::Algebraic(m) => {
                let mut variables = m.create_variable_vector();
                self.check_lengths(0, variables.len())?;

                let mut no_states: [f64; 0] = [];
                m.initialise_variables(&mut variables, &external)?;
                apply(&mut no_states, &mut variables);
                m.compute_computed_constants(&mut variables);
                m.compute_computed_constants(&mut variables);
                m.compute_variables(&mut variables, &external)?;

                ExecutionState {
                    time: initial_time,
                    states: Vec::new(),
                    rates: Vec::new(),
                    variables,
                    cursor: 0,
                    results: Recording::default(),
                }
            }
        };

        debug!(
            kind = %self.kind(),
            states = state.states.len(),
            variables = state.variables.len(),
            overrides = overrides.len(),
            "initialized execution state"
        );
        Ok(state)
    }

    /// Drive the model through every output point of `settings`.
    ///
    /// Records exactly `settings.sample_count()` samples per observable into a
    /// fresh [`Recording`]; the returned state can be advanced again.
    pub fn advance(
        &self,
        mut state: ExecutionState,
        settings: &SimulationSettings,
        observables: &[Observable],
        source: Option<&dyn ExternalSource>,
    ) -> Result<ExecutionState> {
        settings.validate()?;
        self.validate_observables(observables)?;
        let driver = StepDriver::select(&self.model, &settings.method, self.backend.as_ref())?;
        let grid = OutputGrid::new(settings, state.time);
        let capacity = grid.steps + 1;

        if !matches!(driver, StepDriver::Algebraic)
            && state.time > grid.first + TIME_TOLERANCE * grid.first.abs().max(1.0)
        {
            return Err(SimError::InvalidSettings(format!(
                "current time {} already exceeds output start {}",
                state.time, grid.first
            )));
        }

        debug!(
            kind = ?settings.kind,
            method = %settings.method.name,
            from = state.time,
            to = grid.last,
            samples = capacity,
            "advancing"
        );
        // A resumed run starting where the previous one stopped repeats that
        // boundary point under its original step.
        let repeats_boundary = state.cursor > 0
            && (grid.first - state.time).abs() <= TIME_TOLERANCE * grid.first.abs().max(1.0);
        let first_step = if repeats_boundary {
            state.cursor - 1
        } else {
            state.cursor
        };
        state.results = Recording::new(observables, capacity, first_step);

        match &self.model {
            Model::Algebraic(m) => {
                for k in 0..capacity {
                    state.time = grid.time(k);
                    let external = ExternalLookup::new(source, Some(first_step + k));
                    m.compute_variables(&mut state.variables, &external)?;
                    state.record(first_step + k)?;
                }
            }
            Model::Ode(m) | Model::Dae(m) => {
                for k in 0..capacity {
                    driver.step_to(m.as_ref(), &mut state, grid.time(k), source)?;
                    state.record(first_step + k)?;
                }
            }
        }

        if state.results.len() != capacity {
            return Err(SimError::MalformedOutput(format!(
                "recorded {} samples, expected {capacity}",
                state.results.len()
            )));
        }
        debug!(time = state.time, cursor = state.cursor, "advance finished");
        Ok(state)
    }

    fn check_lengths(&self, states: usize, variables: usize) -> Result<()> {
        if states != self.table.state_count() || variables != self.table.variable_count() {
            return Err(SimError::MalformedOutput(format!(
                "module allocated {states} states and {variables} variables, metadata lists {} and {}",
                self.table.state_count(),
                self.table.variable_count()
            )));
        }
        Ok(())
    }
}

// =============================================================================
// REFERENCE MODELS
// =============================================================================

pub mod models {
    use super::*;

    const COMPONENT: &str = "main";

    fn voi() -> VariableInfo {
        VariableInfo::new("t", "second", COMPONENT, Classification::VariableOfIntegration)
    }

    /// Built-in model names
    pub fn names() -> &'static [&'static str] {
        &["linear_decay", "external_decay", "lotka_volterra", "linear_response"]
    }

    /// Look up a built-in model by name
    pub fn builtin(name: &str) -> Option<Model> {
        match name {
            "linear_decay" => Some(Model::ode(LinearDecay)),
            "external_decay" => Some(Model::ode(ExternalDecay)),
            "lotka_volterra" => Some(Model::ode(LotkaVolterra)),
            "linear_response" => Some(Model::algebraic(LinearResponse)),
            _ => None,
        }
    }

    /// dx/dt = -k x with constant k = 1, x(0) = 1
    #[derive(Debug, Clone, Copy, Default)]
    pub struct LinearDecay;

    impl DifferentialModule for LinearDecay {
        fn voi_info(&self) -> VariableInfo {
            voi()
        }

        fn state_info(&self) -> Vec<VariableInfo> {
            vec![VariableInfo::new("x", "mole", COMPONENT, Classification::State)]
        }

        fn variable_info(&self) -> Vec<VariableInfo> {
            vec![
                VariableInfo::new("k", "per_second", COMPONENT, Classification::Constant),
                VariableInfo::new("flux", "mole_per_second", COMPONENT, Classification::Algebraic),
            ]
        }

        fn initialise_variables(
            &self,
            states: &mut [f64],
            _rates: &mut [f64],
            variables: &mut [f64],
            _external: &ExternalLookup<'_>,
        ) -> Result<()> {
            states[0] = 1.0;
            variables[0] = 1.0;
            Ok(())
        }

        fn compute_computed_constants(&self, _variables: &mut [f64]) {}

        fn compute_rates(
            &self,
            _voi: Time,
            states: &[f64],
            rates: &mut [f64],
            variables: &mut [f64],
            _external: &ExternalLookup<'_>,
        ) -> Result<()> {
            rates[0] = -variables[0] * states[0];
            Ok(())
        }

        fn compute_variables(
            &self,
            _voi: Time,
            states: &[f64],
            _rates: &[f64],
            variables: &mut [f64],
            _external: &ExternalLookup<'_>,
        ) -> Result<()> {
            variables[1] = variables[0] * states[0];
            Ok(())
        }
    }

    /// dx/dt = -k x + input, with k and input supplied externally
    #[derive(Debug, Clone, Copy, Default)]
    pub struct ExternalDecay;

    impl ExternalDecay {
        fn refresh(variables: &mut [f64], external: &ExternalLookup<'_>) -> Result<()> {
            variables[0] = external.value(0)?;
            variables[2] = external.value(2)?;
            Ok(())
        }
    }

    impl DifferentialModule for ExternalDecay {
        fn voi_info(&self) -> VariableInfo {
            voi()
        }

        fn state_info(&self) -> Vec<VariableInfo> {
            vec![VariableInfo::new("x", "mole", COMPONENT, Classification::State)]
        }

        fn variable_info(&self) -> Vec<VariableInfo> {
            vec![
                VariableInfo::new("k", "per_second", COMPONENT, Classification::External),
                VariableInfo::new("flux", "mole_per_second", COMPONENT, Classification::Algebraic),
                VariableInfo::new("input", "mole_per_second", COMPONENT, Classification::External),
            ]
        }

        fn initialise_variables(
            &self,
            states: &mut [f64],
            _rates: &mut [f64],
            variables: &mut [f64],
            external: &ExternalLookup<'_>,
        ) -> Result<()> {
            states[0] = 1.0;
            Self::refresh(variables, external)
        }

        fn compute_computed_constants(&self, _variables: &mut [f64]) {}

        fn compute_rates(
            &self,
            _voi: Time,
            states: &[f64],
            rates: &mut [f64],
            variables: &mut [f64],
            external: &ExternalLookup<'_>,
        ) -> Result<()> {
            Self::refresh(variables, external)?;
            rates[0] = -variables[0] * states[0] + variables[2];
            Ok(())
        }

        fn compute_variables(
            &self,
            _voi: Time,
            states: &[f64],
            _rates: &[f64],
            variables: &mut [f64],
            external: &ExternalLookup<'_>,
        ) -> Result<()> {
            Self::refresh(variables, external)?;
            variables[1] = variables[0] * states[0];
            Ok(())
        }
    }

    /// Predator-prey model.
    ///
    /// `cycle_scale` is computed before the equilibria it multiplies, so it is
    /// only correct after the second constants pass.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct LotkaVolterra;

    impl DifferentialModule for LotkaVolterra {
        fn voi_info(&self) -> VariableInfo {
            voi()
        }

        fn state_info(&self) -> Vec<VariableInfo> {
            vec![
                VariableInfo::new("prey", "dimensionless", COMPONENT, Classification::State),
                VariableInfo::new("predator", "dimensionless", COMPONENT, Classification::State),
            ]
        }

        fn variable_info(&self) -> Vec<VariableInfo> {
            use Classification::*;
            vec![
                VariableInfo::new("alpha", "per_second", COMPONENT, Constant),
                VariableInfo::new("beta", "per_second", COMPONENT, Constant),
                VariableInfo::new("gamma", "per_second", COMPONENT, Constant),
                VariableInfo::new("delta", "per_second", COMPONENT, Constant),
                VariableInfo::new("prey_equilibrium", "dimensionless", COMPONENT, ComputedConstant),
                VariableInfo::new("predator_equilibrium", "dimensionless", COMPONENT, ComputedConstant),
                VariableInfo::new("cycle_scale", "dimensionless", COMPONENT, ComputedConstant),
                VariableInfo::new("total", "dimensionless", COMPONENT, Algebraic),
            ]
        }

        fn initialise_variables(
            &self,
            states: &mut [f64],
            _rates: &mut [f64],
            variables: &mut [f64],
            _external: &ExternalLookup<'_>,
        ) -> Result<()> {
            states[0] = 10.0;
            states[1] = 5.0;
            variables[0] = 1.1;
            variables[1] = 0.4;
            variables[2] = 0.4;
            variables[3] = 0.1;
            Ok(())
        }

        fn compute_computed_constants(&self, variables: &mut [f64]) {
            variables[6] = variables[4] * variables[5];
            variables[4] = variables[2] / variables[3];
            variables[5] = variables[0] / variables[1];
        }

        fn compute_rates(
            &self,
            _voi: Time,
            states: &[f64],
            rates: &mut [f64],
            variables: &mut [f64],
            _external: &ExternalLookup<'_>,
        ) -> Result<()> {
            let (prey, predator) = (states[0], states[1]);
            rates[0] = variables[0] * prey - variables[1] * prey * predator;
            rates[1] = variables[3] * prey * predator - variables[2] * predator;
            Ok(())
        }

        fn compute_variables(
            &self,
            _voi: Time,
            states: &[f64],
            _rates: &[f64],
            variables: &mut [f64],
            _external: &ExternalLookup<'_>,
        ) -> Result<()> {
            variables[7] = states[0] + states[1];
            Ok(())
        }
    }

    /// y = gain * u + offset, with u supplied externally
    #[derive(Debug, Clone, Copy, Default)]
    pub struct LinearResponse;

    impl AlgebraicModule for LinearResponse {
        fn variable_info(&self) -> Vec<VariableInfo> {
            use Classification::*;
            vec![
                VariableInfo::new("u", "dimensionless", COMPONENT, External),
                VariableInfo::new("gain", "dimensionless", COMPONENT, Constant),
                VariableInfo::new("offset", "dimensionless", COMPONENT, Constant),
                VariableInfo::new("y", "dimensionless", COMPONENT, Algebraic),
            ]
        }

        fn initialise_variables(
            &self,
            variables: &mut [f64],
            external: &ExternalLookup<'_>,
        ) -> Result<()> {
            variables[0] = external.value(0)?;
            variables[1] = 2.0;
            variables[2] = 0.5;
            Ok(())
        }

        fn compute_computed_constants(&self, _variables: &mut [f64]) {}

        fn compute_variables(&self, variables: &mut [f64], external: &ExternalLookup<'_>) -> Result<()> {
            variables[0] = external.value(0)?;
            variables[3] = variables[1] * variables[0] + variables[2];
            Ok(())
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::models::*;
    use super::*;
    use approx::assert_abs_diff_eq;

    fn decay() -> Simulation {
        Simulation::new(Model::ode(LinearDecay))
    }

    fn state_x() -> Observable {
        Observable::new("x", "main", 0, Classification::State)
    }

    fn course(end: f64, steps: usize, method: Method) -> SimulationSettings {
        SimulationSettings::uniform_time_course(0.0, 0.0, end, steps, method)
    }

    #[test]
    fn test_euler_linear_decay() {
        let sim = decay();
        let state = sim.initialize(0.0, None, &[]).unwrap();
        let settings = course(1.0, 2, Method::euler(Some(0.5)));
        let state = sim.advance(state, &settings, &[state_x()], None).unwrap();

        assert_eq!(state.results.series(&state_x()).unwrap(), &[1.0, 0.5, 0.25]);
        assert_eq!(state.results.times(), &[0.0, 0.5, 1.0]);
        assert_eq!(state.cursor, 3);
        assert_eq!(state.time, 1.0);
    }

    #[test]
    fn test_euler_substeps() {
        let sim = decay();
        let state = sim.initialize(0.0, None, &[]).unwrap();
        let settings = course(1.0, 1, Method::euler(Some(0.25)));
        let state = sim.advance(state, &settings, &[state_x()], None).unwrap();

        let x = state.results.series(&state_x()).unwrap();
        assert_abs_diff_eq!(x[1], 0.75_f64.powi(4), epsilon = 1e-15);
    }

    #[test]
    fn test_sample_count_invariant() {
        let sim = decay();
        let observables = sim.default_observables();
        for method in [Method::euler(None), Method::named("dopri5"), Method::named("dop853")] {
            for steps in [1, 3, 10] {
                let state = sim.initialize(0.0, None, &[]).unwrap();
                let settings = course(2.0, steps, method.clone());
                let state = sim.advance(state, &settings, &observables, None).unwrap();
                assert_eq!(state.results.len(), steps + 1);
                for i in 0..observables.len() {
                    assert_eq!(state.results.series_at(i).unwrap().len(), steps + 1);
                }
            }
        }
    }

    #[test]
    fn test_degenerate_interval_records_once() {
        let sim = decay();
        let state = sim.initialize(0.0, None, &[]).unwrap();
        let settings = SimulationSettings::uniform_time_course(0.0, 0.5, 0.5, 0, Method::euler(Some(0.25)));
        let state = sim.advance(state, &settings, &[state_x()], None).unwrap();

        assert_eq!(state.results.len(), 1);
        assert_eq!(state.time, 0.5);
        assert_abs_diff_eq!(state.results.series(&state_x()).unwrap()[0], 0.5625, epsilon = 1e-15);
    }

    #[test]
    fn test_start_before_current_time_rejected() {
        let sim = decay();
        let state = sim.initialize(0.0, None, &[]).unwrap();
        let state = sim.advance(state, &course(1.0, 2, Method::default()), &[state_x()], None).unwrap();

        let settings = SimulationSettings::uniform_time_course(0.0, 0.5, 0.5, 0, Method::default());
        let err = sim.advance(state, &settings, &[state_x()], None).unwrap_err();
        assert!(err.is_configuration());
    }

    fn split_matches_full(method: Method) {
        let sim = decay();
        let observables = sim.default_observables();

        let full = sim.initialize(0.0, None, &[]).unwrap();
        let full = sim.advance(full, &course(1.0, 4, method.clone()), &observables, None).unwrap();

        let first = sim.initialize(0.0, None, &[]).unwrap();
        let first_settings = SimulationSettings::uniform_time_course(0.0, 0.0, 0.5, 2, method.clone());
        let first = sim.advance(first, &first_settings, &observables, None).unwrap();
        let head: Vec<Vec<f64>> = (0..observables.len())
            .map(|i| first.results.series_at(i).unwrap().to_vec())
            .collect();

        let second_settings = SimulationSettings::uniform_time_course(0.0, 0.5, 1.0, 2, method);
        let second = sim.advance(first, &second_settings, &observables, None).unwrap();
        assert_eq!(second.results.first_step(), 2);
        assert_eq!(second.cursor, full.cursor);

        for (i, head) in head.iter().enumerate() {
            let mut joined = head.clone();
            joined.extend_from_slice(&second.results.series_at(i).unwrap()[1..]);
            assert_eq!(joined.as_slice(), full.results.series_at(i).unwrap());
        }
        assert_eq!(second.states, full.states);
    }

    #[test]
    fn test_resumability_euler() {
        split_matches_full(Method::euler(Some(0.05)));
    }

    #[test]
    fn test_resumability_variable_step() {
        split_matches_full(Method::named("dopri5").with_parameter("rtol", 1e-8));
    }

    #[test]
    fn test_variable_step_accuracy() {
        let sim = decay();
        let state = sim.initialize(0.0, None, &[]).unwrap();
        let method = Method::named("dop853").with_parameter("rtol", 1e-10).with_parameter("atol", 1e-12);
        let state = sim.advance(state, &course(1.0, 4, method), &[state_x()], None).unwrap();

        let x = state.results.series(&state_x()).unwrap();
        assert_abs_diff_eq!(x[4], (-1.0_f64).exp(), epsilon = 1e-8);
    }

    #[test]
    fn test_step_ceiling_is_fatal() {
        let sim = decay();
        let state = sim.initialize(0.0, None, &[]).unwrap();
        let method = Method::named("dopri5").with_parameter("nsteps", 0.0);
        let err = sim.advance(state, &course(1.0, 2, method), &[state_x()], None).unwrap_err();
        assert!(matches!(err, SimError::Integration(_)));
    }

    #[test]
    fn test_solver_options_from_method() {
        let method = Method::named("dop853")
            .with_parameter("rtol", 1e-9)
            .with_parameter("max_step", 0.1)
            .with_parameter("nsteps", 500.0)
            .with_parameter("order", 8.0);
        let backend = DormandPrince::new(DormandPrinceOrder::Eight, SolverOptions::from_method(&method).unwrap());
        let options = backend.options();
        assert_eq!(options.rtol, 1e-9);
        assert_eq!(options.atol, SolverOptions::default().atol);
        assert_eq!(options.max_step, Some(0.1));
        assert_eq!(options.nsteps, 500);
        assert_eq!(backend.name(), "dop853");

        for (key, value) in [("rtol", 0.0), ("nsteps", 1.5), ("nstiff", -1.0)] {
            let bad = Method::named("dopri5").with_parameter(key, value);
            assert!(SolverOptions::from_method(&bad).unwrap_err().is_configuration());
        }
    }

    #[test]
    fn test_unknown_method() {
        let sim = decay();
        let state = sim.initialize(0.0, None, &[]).unwrap();
        let err = sim
            .advance(state, &course(1.0, 2, Method::named("leapfrog")), &[state_x()], None)
            .unwrap_err();
        assert!(matches!(err, SimError::UnknownMethod(_)));
    }

    #[test]
    fn test_override_precedence() {
        let sim = decay();
        let overrides = [
            ParameterOverride::new(0, Classification::State, 3.0),
            ParameterOverride::new(0, Classification::Constant, 2.0),
        ];
        let state = sim.initialize(0.0, None, &overrides).unwrap();
        assert_eq!(state.states[0], 3.0);
        assert_eq!(state.variables[0], 2.0);
        assert_eq!(state.rates[0], -6.0);
        assert_eq!(state.variables[1], 6.0);
    }

    #[test]
    fn test_classification_guard() {
        let sim = Simulation::new(Model::ode(ExternalDecay));
        let source = ConstantValues::new(vec![0, 2], vec![1.0, 0.0]).unwrap();

        let external = [ParameterOverride::new(0, Classification::External, 5.0)];
        let err = sim.initialize(0.0, Some(&source), &external).unwrap_err();
        assert!(matches!(err, SimError::NotOverridable { .. }));

        let voi = [ParameterOverride::new(0, Classification::VariableOfIntegration, 5.0)];
        assert!(sim.initialize(0.0, Some(&source), &voi).unwrap_err().is_configuration());
    }

    #[test]
    fn test_missing_external_is_fatal() {
        let sim = Simulation::new(Model::ode(ExternalDecay));
        let partial = ConstantValues::new(vec![0], vec![1.0]).unwrap();
        let err = sim.initialize(0.0, Some(&partial), &[]).unwrap_err();
        assert!(matches!(err, SimError::MissingExternal { index: 2, .. }));

        assert!(sim.initialize(0.0, None, &[]).is_err());
    }

    #[test]
    fn test_external_values_reject_mismatched_lengths() {
        let err = serde_json::from_str::<ConstantValues>(r#"{"indices": [5, 2], "values": [0.0]}"#)
            .unwrap_err();
        assert!(err.to_string().contains("2 external indices but 1 values"));
        assert!(serde_json::from_str::<PerStepValues>(r#"{"indices": [0], "series": []}"#).is_err());

        let ok: ConstantValues = serde_json::from_str(r#"{"indices": [2], "values": [0.25]}"#).unwrap();
        assert_eq!(ok.value(2, None), Some(0.25));
        assert!(ConstantValues::new(vec![1], vec![]).unwrap_err().is_configuration());
    }

    #[test]
    fn test_layered_values_precedence() {
        let base = ConstantValues::new(vec![0, 2], vec![1.0, 0.0]).unwrap();
        let candidate = ConstantValues::new(vec![0], vec![0.5]).unwrap();
        let layered = LayeredValues::new().with(&candidate).with(&base);
        assert_eq!(layered.value(0, None), Some(0.5));
        assert_eq!(layered.value(2, None), Some(0.0));
        assert_eq!(layered.value(7, None), None);
    }

    #[test]
    fn test_per_step_input_drives_rate() {
        let sim = Simulation::new(Model::ode(ExternalDecay));
        let k = ConstantValues::new(vec![0], vec![0.0]).unwrap();
        let input = PerStepValues::new(vec![2], vec![vec![0.0, 1.0, 2.0]]).unwrap();
        let source = LayeredValues::new().with(&input).with(&k);

        let state = sim.initialize(0.0, Some(&source), &[]).unwrap();
        let state = sim
            .advance(state, &course(2.0, 2, Method::default()), &[state_x()], Some(&source))
            .unwrap();
        // block k integrates with the input of step k
        assert_eq!(state.results.series(&state_x()).unwrap(), &[1.0, 2.0, 4.0]);
    }

    #[test]
    fn test_resumability_with_per_step_input() {
        let sim = Simulation::new(Model::ode(ExternalDecay));
        let k = ConstantValues::new(vec![0], vec![0.0]).unwrap();
        let input = PerStepValues::new(vec![2], vec![(0..7).map(f64::from).collect()]).unwrap();
        let source = LayeredValues::new().with(&input).with(&k);
        let window = |start: f64, end: f64, steps: usize| {
            SimulationSettings::uniform_time_course(0.0, start, end, steps, Method::default())
        };

        let full = sim.initialize(0.0, Some(&source), &[]).unwrap();
        let full = sim.advance(full, &window(0.0, 4.0, 4), &[state_x()], Some(&source)).unwrap();
        assert_eq!(full.results.series(&state_x()).unwrap(), &[1.0, 2.0, 4.0, 7.0, 11.0]);

        let split = sim.initialize(0.0, Some(&source), &[]).unwrap();
        let split = sim.advance(split, &window(0.0, 2.0, 2), &[state_x()], Some(&source)).unwrap();
        assert_eq!(split.cursor, 3);
        let split = sim.advance(split, &window(2.0, 4.0, 2), &[state_x()], Some(&source)).unwrap();
        assert_eq!(split.results.series(&state_x()).unwrap(), &[4.0, 7.0, 11.0]);
        assert_eq!(split.results.first_step(), 2);
        assert_eq!(split.cursor, full.cursor);
        assert_eq!(split.states, full.states);
    }

    #[test]
    fn test_algebraic_resumes_on_same_steps() {
        let sim = Simulation::new(Model::algebraic(LinearResponse));
        let y = sim.observable("main", "y").unwrap();
        let source = PerStepValues::new(vec![0], vec![vec![0.0, 1.0, 2.0, 3.0, 4.0]]).unwrap();
        let window = |start: f64, end: f64, steps: usize| {
            SimulationSettings::uniform_time_course(0.0, start, end, steps, Method::default())
        };

        let full = sim.initialize(0.0, Some(&source), &[]).unwrap();
        let full = sim.advance(full, &window(0.0, 4.0, 4), &[y.clone()], Some(&source)).unwrap();
        assert_eq!(full.results.series(&y).unwrap(), &[0.5, 2.5, 4.5, 6.5, 8.5]);

        let split = sim.initialize(0.0, Some(&source), &[]).unwrap();
        let split = sim.advance(split, &window(0.0, 2.0, 2), &[y.clone()], Some(&source)).unwrap();
        let split = sim.advance(split, &window(2.0, 4.0, 2), &[y.clone()], Some(&source)).unwrap();
        assert_eq!(split.results.series(&y).unwrap(), &[4.5, 6.5, 8.5]);
        assert_eq!(split.cursor, full.cursor);
    }

    #[test]
    fn test_algebraic_step_independence() {
        let sim = Simulation::new(Model::algebraic(LinearResponse));
        let y = sim.observable("main", "y").unwrap();
        let settings = course(3.0, 3, Method::default());

        let run = |series: Vec<f64>| {
            let source = PerStepValues::new(vec![0], vec![series]).unwrap();
            let state = sim.initialize(0.0, Some(&source), &[]).unwrap();
            let state = sim.advance(state, &settings, &[y.clone()], Some(&source)).unwrap();
            state.results.series(&y).unwrap().to_vec()
        };

        let base = run(vec![0.0, 1.0, 2.0, 3.0]);
        assert_eq!(base, vec![0.5, 2.5, 4.5, 6.5]);

        let varied = run(vec![0.0, 1.0, 10.0, 3.0]);
        for k in 0..4 {
            if k == 2 {
                assert_ne!(base[k], varied[k]);
            } else {
                assert_eq!(base[k], varied[k]);
            }
        }
    }

    #[test]
    fn test_algebraic_runs_out_of_steps() {
        let sim = Simulation::new(Model::algebraic(LinearResponse));
        let y = sim.observable("main", "y").unwrap();
        let source = PerStepValues::new(vec![0], vec![vec![1.0, 2.0]]).unwrap();
        let state = sim.initialize(0.0, Some(&source), &[]).unwrap();
        let err = sim
            .advance(state, &course(2.0, 2, Method::default()), &[y], Some(&source))
            .unwrap_err();
        assert!(matches!(err, SimError::MissingExternal { index: 0, step: Some(2) }));
    }

    #[test]
    fn test_computed_constants_settle_after_two_passes() {
        let sim = Simulation::new(Model::ode(LotkaVolterra));
        let state = sim.initialize(0.0, None, &[]).unwrap();
        assert_abs_diff_eq!(state.variables[4], 4.0, epsilon = 1e-12);
        assert_abs_diff_eq!(state.variables[5], 2.75, epsilon = 1e-12);
        assert_abs_diff_eq!(state.variables[6], 11.0, epsilon = 1e-12);
        assert_eq!(state.variables[7], 15.0);
    }

    #[test]
    fn test_observable_validation() {
        let sim = decay();
        let state = sim.initialize(0.0, None, &[]).unwrap();
        let bad = Observable::new("x", "main", 0, Classification::Unknown);
        let err = sim.advance(state, &course(1.0, 1, Method::default()), &[bad], None).unwrap_err();
        assert!(matches!(err, SimError::InvalidObservable(_)));
    }

    #[test]
    fn test_voi_observable_and_export() {
        let sim = decay();
        let t = sim.observable("main", "t").unwrap();
        let state = sim.initialize(0.0, None, &[]).unwrap();
        let state = sim
            .advance(state, &course(1.0, 4, Method::default()), &[t.clone(), state_x()], None)
            .unwrap();

        assert_eq!(state.results.series(&t).unwrap(), state.results.times());
        assert_eq!(state.results.series_by_name("main", "x"), state.results.series(&state_x()));
        assert!(state.results.series_by_name("other", "x").is_none());
        let table = state.results.to_array();
        assert_eq!(table.dim(), (5, 3));
        assert_eq!(table[[4, 0]], 1.0);
        assert_eq!(table[[0, 2]], 1.0);
    }

    #[test]
    fn test_one_step_and_steady_state() {
        let sim = decay();
        let state = sim.initialize(0.0, None, &[]).unwrap();
        let state = sim
            .advance(state, &SimulationSettings::one_step(0.5, Method::default()), &[state_x()], None)
            .unwrap();
        assert_eq!(state.time, 0.5);
        assert_eq!(state.results.series(&state_x()).unwrap(), &[0.5]);

        let settings = SimulationSettings::steady_state(0.0, 50.0, Method::named("dopri5"));
        let state = sim.advance(state, &settings, &[state_x()], None).unwrap();
        assert_eq!(state.results.len(), 1);
        assert!(state.results.series(&state_x()).unwrap()[0].abs() < 1e-6);
    }

    #[test]
    fn test_builtin_registry() {
        for name in names() {
            let model = builtin(name).unwrap();
            let sim = Simulation::new(model);
            assert!(sim.table().variable_count() > 0);
        }
        assert!(builtin("missing").is_none());
    }
}
