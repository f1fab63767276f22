//! # bgsim Core
//!
//! Shared types for simulating compiled bond-graph / CellML-derived models.
//!
//! A generated numeric module lays its scalars out in three parallel arrays
//! (states, rates, variables). Everything in this workspace addresses those
//! slots by index; names only matter when resolving an [`Observable`].
//!
//! ## Contents
//!
//! | Type | Role |
//! |------|------|
//! | [`Classification`] | Role of a variable slot |
//! | [`VariableTable`] | Index to classification table, built once per model |
//! | [`Observable`] | Variable selected for recording |
//! | [`ParameterOverride`] | Caller-supplied initial value |
//! | [`SimulationSettings`] | Output grid and integration method of one run |

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Common errors
#[derive(Debug, Error)]
pub enum SimError {
    #[error("Invalid simulation settings: {0}")]
    InvalidSettings(String),

    #[error("Variable {index} classified {classification} cannot be overridden")]
    NotOverridable {
        index: usize,
        classification: Classification,
    },

    #[error("No {classification} variable at index {index}")]
    UnknownVariable {
        index: usize,
        classification: Classification,
    },

    #[error("Variable {index} is classified {found}, not {expected}")]
    ClassificationMismatch {
        index: usize,
        expected: Classification,
        found: Classification,
    },

    #[error("Invalid observable: {0}")]
    InvalidObservable(String),

    #[error("Unknown integration method: {0}")]
    UnknownMethod(String),

    #[error("No external value supplied for variable {index} (step {step:?})")]
    MissingExternal { index: usize, step: Option<usize> },

    #[error("Integration error: {0}")]
    Integration(String),

    #[error("Malformed output: {0}")]
    MalformedOutput(String),

    #[error("Numerical error: {0}")]
    Numerical(String),
}

impl SimError {
    /// True for errors raised before any integration happens.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::InvalidSettings(_)
                | Self::NotOverridable { .. }
                | Self::UnknownVariable { .. }
                | Self::ClassificationMismatch { .. }
                | Self::InvalidObservable(_)
                | Self::UnknownMethod(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, SimError>;

/// Value of the variable of integration
pub type Time = f64;

/// Slot address in the state, rate or variable array
pub type VariableIndex = usize;

// =============================================================================
// CLASSIFICATION
// =============================================================================

/// Role of a variable slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Classification {
    Constant,
    ComputedConstant,
    Algebraic,
    External,
    State,
    VariableOfIntegration,
    /// Analysis could not classify the variable; never recordable
    Unknown,
}

impl Classification {
    /// Whether a caller may set the initial value directly.
    pub fn is_overridable(self) -> bool {
        matches!(
            self,
            Self::State | Self::Constant | Self::ComputedConstant | Self::Algebraic
        )
    }

    /// Whether the slot lives in the variable array.
    pub fn in_variable_array(self) -> bool {
        matches!(
            self,
            Self::Constant | Self::ComputedConstant | Self::Algebraic | Self::External
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Constant => "constant",
            Self::ComputedConstant => "computed_constant",
            Self::Algebraic => "algebraic",
            Self::External => "external",
            Self::State => "state",
            Self::VariableOfIntegration => "variable_of_integration",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for Classification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Classification {
    type Err = SimError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "constant" => Ok(Self::Constant),
            "computed_constant" => Ok(Self::ComputedConstant),
            "algebraic" => Ok(Self::Algebraic),
            "external" => Ok(Self::External),
            "state" => Ok(Self::State),
            "variable_of_integration" | "voi" => Ok(Self::VariableOfIntegration),
            "unknown" => Ok(Self::Unknown),
            other => Err(SimError::InvalidObservable(format!(
                "unrecognised classification '{other}'"
            ))),
        }
    }
}

/// Shape of the generated numeric module
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelKind {
    Ode,
    Dae,
    Algebraic,
}

impl fmt::Display for ModelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Ode => "ode",
            Self::Dae => "dae",
            Self::Algebraic => "algebraic",
        })
    }
}

// =============================================================================
// VARIABLE TABLE
// =============================================================================

/// Metadata of one slot, as published by a generated module
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariableInfo {
    pub name: String,
    pub units: String,
    pub component: String,
    pub classification: Classification,
}

impl VariableInfo {
    pub fn new(name: &str, units: &str, component: &str, classification: Classification) -> Self {
        Self {
            name: name.to_string(),
            units: units.to_string(),
            component: component.to_string(),
            classification,
        }
    }
}

/// Index to classification lookup for one model.
///
/// Built once when a model is loaded; overrides and observables are checked
/// against it without rescanning module metadata.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VariableTable {
    pub voi: Option<VariableInfo>,
    pub states: Vec<VariableInfo>,
    pub variables: Vec<VariableInfo>,
}

impl VariableTable {
    pub fn new(
        voi: Option<VariableInfo>,
        states: Vec<VariableInfo>,
        variables: Vec<VariableInfo>,
    ) -> Self {
        Self {
            voi,
            states,
            variables,
        }
    }

    pub fn state_count(&self) -> usize {
        self.states.len()
    }

    pub fn variable_count(&self) -> usize {
        self.variables.len()
    }

    /// Classification of a slot in the variable array
    pub fn variable_classification(&self, index: VariableIndex) -> Option<Classification> {
        self.variables.get(index).map(|v| v.classification)
    }

    /// Check that `index` names a slot of the given classification.
    pub fn check_slot(&self, index: VariableIndex, classification: Classification) -> Result<()> {
        match classification {
            Classification::VariableOfIntegration => {
                if self.voi.is_some() {
                    Ok(())
                } else {
                    Err(SimError::UnknownVariable {
                        index,
                        classification,
                    })
                }
            }
            Classification::State => {
                if index < self.states.len() {
                    Ok(())
                } else {
                    Err(SimError::UnknownVariable {
                        index,
                        classification,
                    })
                }
            }
            Classification::Unknown => Err(SimError::InvalidObservable(format!(
                "variable {index} has unknown classification"
            ))),
            _ => match self.variable_classification(index) {
                None => Err(SimError::UnknownVariable {
                    index,
                    classification,
                }),
                Some(found) if found != classification => Err(SimError::ClassificationMismatch {
                    index,
                    expected: classification,
                    found,
                }),
                Some(_) => Ok(()),
            },
        }
    }

    /// Check an override without touching any array.
    pub fn check_override(&self, o: &ParameterOverride) -> Result<()> {
        if !o.classification.is_overridable() {
            return Err(SimError::NotOverridable {
                index: o.index,
                classification: o.classification,
            });
        }
        self.check_slot(o.index, o.classification)
    }

    /// Reject observables that the recorder could not read.
    pub fn check_observable(&self, observable: &Observable) -> Result<()> {
        self.check_slot(observable.index, observable.classification)
            .map_err(|e| match e {
                SimError::InvalidObservable(_) => e,
                other => SimError::InvalidObservable(format!(
                    "{}/{}: {other}",
                    observable.component, observable.name
                )),
            })
    }

    /// Look up a slot by component and name.
    pub fn find(&self, component: &str, name: &str) -> Option<Observable> {
        let matches = |v: &VariableInfo| v.component == component && v.name == name;

        if let Some(voi) = self.voi.as_ref().filter(|v| matches(v)) {
            return Some(Observable::new(&voi.name, &voi.component, 0, voi.classification));
        }
        if let Some(i) = self.states.iter().position(matches) {
            let s = &self.states[i];
            return Some(Observable::new(&s.name, &s.component, i, Classification::State));
        }
        self.variables.iter().position(matches).map(|i| {
            let v = &self.variables[i];
            Observable::new(&v.name, &v.component, i, v.classification)
        })
    }
}

// =============================================================================
// OBSERVABLES AND OVERRIDES
// =============================================================================

/// Variable selected for recording
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Observable {
    pub name: String,
    pub component: String,
    pub index: VariableIndex,
    pub classification: Classification,
}

impl Observable {
    pub fn new(
        name: &str,
        component: &str,
        index: VariableIndex,
        classification: Classification,
    ) -> Self {
        Self {
            name: name.to_string(),
            component: component.to_string(),
            index,
            classification,
        }
    }

    /// `component/name` label used in reports
    pub fn label(&self) -> String {
        format!("{}/{}", self.component, self.name)
    }
}

/// Initial value set by the caller before constants are computed
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ParameterOverride {
    pub index: VariableIndex,
    pub classification: Classification,
    pub value: f64,
}

impl ParameterOverride {
    pub fn new(index: VariableIndex, classification: Classification, value: f64) -> Self {
        Self {
            index,
            classification,
            value,
        }
    }
}

// =============================================================================
// SIMULATION SETTINGS
// =============================================================================

/// Kind of simulation task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SimulationKind {
    UniformTimeCourse,
    OneStep,
    SteadyState,
}

/// Integration method name plus opaque solver parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Method {
    pub name: String,
    #[serde(default)]
    pub parameters: BTreeMap<String, f64>,
}

impl Default for Method {
    fn default() -> Self {
        Self::euler(None)
    }
}

impl Method {
    pub fn named(name: &str) -> Self {
        Self {
            name: name.to_string(),
            parameters: BTreeMap::new(),
        }
    }

    /// Euler forward method, optionally with a finer internal step
    pub fn euler(step_size: Option<f64>) -> Self {
        let method = Self::named("Euler forward method");
        match step_size {
            Some(h) => method.with_parameter("step_size", h),
            None => method,
        }
    }

    pub fn with_parameter(mut self, key: &str, value: f64) -> Self {
        self.parameters.insert(key.to_string(), value);
        self
    }

    pub fn parameter(&self, key: &str) -> Option<f64> {
        self.parameters.get(key).copied()
    }

    pub fn step_size(&self) -> Option<f64> {
        self.parameter("step_size")
    }
}

/// Output grid and method of one `advance` call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulationSettings {
    pub kind: SimulationKind,
    pub initial_time: Time,
    pub output_start_time: Time,
    pub output_end_time: Time,
    pub number_of_steps: usize,
    /// Step of a `OneStep` task; unused otherwise
    #[serde(default)]
    pub step_size: f64,
    #[serde(default)]
    pub method: Method,
}

impl SimulationSettings {
    pub fn uniform_time_course(
        initial_time: Time,
        output_start_time: Time,
        output_end_time: Time,
        number_of_steps: usize,
        method: Method,
    ) -> Self {
        Self {
            kind: SimulationKind::UniformTimeCourse,
            initial_time,
            output_start_time,
            output_end_time,
            number_of_steps,
            step_size: 0.0,
            method,
        }
    }

    pub fn one_step(step_size: Time, method: Method) -> Self {
        Self {
            kind: SimulationKind::OneStep,
            initial_time: 0.0,
            output_start_time: 0.0,
            output_end_time: 0.0,
            number_of_steps: 0,
            step_size,
            method,
        }
    }

    pub fn steady_state(initial_time: Time, horizon: Time, method: Method) -> Self {
        Self {
            kind: SimulationKind::SteadyState,
            initial_time,
            output_start_time: horizon,
            output_end_time: horizon,
            number_of_steps: 0,
            step_size: 0.0,
            method,
        }
    }

    /// Spacing between two output points (zero for a single point).
    pub fn output_step_size(&self) -> Time {
        (self.output_end_time - self.output_start_time) / self.number_of_steps.max(1) as f64
    }

    /// Number of samples one run records per observable.
    pub fn sample_count(&self) -> usize {
        match self.kind {
            SimulationKind::UniformTimeCourse => self.number_of_steps + 1,
            SimulationKind::OneStep | SimulationKind::SteadyState => 1,
        }
    }

    /// Enforce the settings invariants; called before any integration.
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(SimError::InvalidSettings(msg));

        for (label, t) in [
            ("initial_time", self.initial_time),
            ("output_start_time", self.output_start_time),
            ("output_end_time", self.output_end_time),
        ] {
            if !t.is_finite() {
                return invalid(format!("{label} must be finite, got {t}"));
            }
        }

        match self.kind {
            SimulationKind::UniformTimeCourse => {
                if self.output_start_time > self.output_end_time {
                    return invalid(format!(
                        "output_start_time {} is after output_end_time {}",
                        self.output_start_time, self.output_end_time
                    ));
                }
                let degenerate = self.output_start_time == self.output_end_time;
                if degenerate != (self.number_of_steps == 0) {
                    return invalid(format!(
                        "number_of_steps {} does not match output interval [{}, {}]",
                        self.number_of_steps, self.output_start_time, self.output_end_time
                    ));
                }
                if self.initial_time > self.output_start_time {
                    return invalid(format!(
                        "initial_time {} is after output_start_time {}",
                        self.initial_time, self.output_start_time
                    ));
                }
            }
            SimulationKind::OneStep => {
                if !(self.step_size.is_finite() && self.step_size > 0.0) {
                    return invalid(format!("one-step size must be positive, got {}", self.step_size));
                }
            }
            SimulationKind::SteadyState => {
                if self.number_of_steps != 0 || self.output_start_time != self.output_end_time {
                    return invalid("steady state records a single point at its horizon".into());
                }
                if self.initial_time > self.output_end_time {
                    return invalid(format!(
                        "initial_time {} is after horizon {}",
                        self.initial_time, self.output_end_time
                    ));
                }
            }
        }

        if let Some(h) = self.method.step_size() {
            if !(h.is_finite() && h > 0.0) {
                return invalid(format!("method step_size must be positive, got {h}"));
            }
            if self.kind == SimulationKind::UniformTimeCourse
                && self.number_of_steps > 0
                && h > self.output_step_size() * (1.0 + 1e-12)
            {
                return invalid(format!(
                    "method step_size {h} exceeds output step size {}",
                    self.output_step_size()
                ));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> VariableTable {
        VariableTable::new(
            Some(VariableInfo::new("t", "second", "main", Classification::VariableOfIntegration)),
            vec![VariableInfo::new("x", "mole", "main", Classification::State)],
            vec![
                VariableInfo::new("k", "per_second", "main", Classification::Constant),
                VariableInfo::new("u", "mole", "main", Classification::External),
                VariableInfo::new("v", "mole", "main", Classification::Algebraic),
            ],
        )
    }

    #[test]
    fn test_settings_invariants() {
        let ok = SimulationSettings::uniform_time_course(0.0, 0.0, 1.0, 10, Method::default());
        assert!(ok.validate().is_ok());
        assert_eq!(ok.sample_count(), 11);
        assert!((ok.output_step_size() - 0.1).abs() < 1e-12);

        let degenerate = SimulationSettings::uniform_time_course(0.0, 2.0, 2.0, 0, Method::default());
        assert!(degenerate.validate().is_ok());

        let zero_steps = SimulationSettings::uniform_time_course(0.0, 0.0, 1.0, 0, Method::default());
        assert!(matches!(zero_steps.validate(), Err(SimError::InvalidSettings(_))));

        let empty_interval = SimulationSettings::uniform_time_course(0.0, 1.0, 1.0, 3, Method::default());
        assert!(empty_interval.validate().is_err());

        let reversed = SimulationSettings::uniform_time_course(0.0, 2.0, 1.0, 3, Method::default());
        assert!(reversed.validate().is_err());
    }

    #[test]
    fn test_method_step_size_bounded_by_output_step() {
        let fine = SimulationSettings::uniform_time_course(0.0, 0.0, 1.0, 2, Method::euler(Some(0.1)));
        assert!(fine.validate().is_ok());

        let coarse = SimulationSettings::uniform_time_course(0.0, 0.0, 1.0, 2, Method::euler(Some(0.8)));
        assert!(coarse.validate().unwrap_err().is_configuration());
    }

    #[test]
    fn test_override_guard() {
        let table = table();
        let voi = ParameterOverride::new(0, Classification::VariableOfIntegration, 1.0);
        assert!(matches!(table.check_override(&voi), Err(SimError::NotOverridable { .. })));

        let external = ParameterOverride::new(1, Classification::External, 1.0);
        assert!(matches!(table.check_override(&external), Err(SimError::NotOverridable { .. })));

        let mismatch = ParameterOverride::new(1, Classification::Constant, 1.0);
        assert!(matches!(
            table.check_override(&mismatch),
            Err(SimError::ClassificationMismatch { .. })
        ));

        assert!(table.check_override(&ParameterOverride::new(0, Classification::State, 2.0)).is_ok());
        assert!(table.check_override(&ParameterOverride::new(3, Classification::State, 2.0)).is_err());
    }

    #[test]
    fn test_observable_resolution() {
        let table = table();
        let v = table.find("main", "v").unwrap();
        assert_eq!(v.index, 2);
        assert_eq!(v.classification, Classification::Algebraic);

        let t = table.find("main", "t").unwrap();
        assert_eq!(t.classification, Classification::VariableOfIntegration);

        assert!(table.find("other", "v").is_none());

        let unknown = Observable::new("q", "main", 0, Classification::Unknown);
        assert!(matches!(table.check_observable(&unknown), Err(SimError::InvalidObservable(_))));

        let out_of_range = Observable::new("v", "main", 9, Classification::Algebraic);
        assert!(table.check_observable(&out_of_range).is_err());
    }

    #[test]
    fn test_classification_serde() {
        let json = serde_json::to_string(&Classification::ComputedConstant).unwrap();
        assert_eq!(json, "\"computed_constant\"");
        let parsed: Classification = "variable-of-integration".parse().unwrap();
        assert_eq!(parsed, Classification::VariableOfIntegration);
    }
}
