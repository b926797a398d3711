//! Analysis policies and the name → policy registry.

use crate::controller::StepControlOptions;
use crate::error::{SimError, SimResult};
use crate::external::ExternalCoupling;
use crate::integrator::{IntegrationMethod, MAX_BDF_ORDER};
use cs_solver::OperatingPointConfig;
use nalgebra::DVector;
use std::collections::{BTreeMap, HashMap};

/// Transient analysis options.
#[derive(Clone, Debug)]
pub struct TransientOptions {
    pub start_time: f64,
    pub step: StepControlOptions,
    /// Start from `initial_state` without solving the operating point.
    pub use_initial_conditions: bool,
    /// Initial state, or the operating-point guess. Zero when unset.
    pub initial_state: Option<DVector<f64>>,
    pub operating_point: OperatingPointConfig,
    /// Breakpoints in addition to the loader's.
    pub breakpoints: Vec<f64>,
}

impl Default for TransientOptions {
    fn default() -> Self {
        Self {
            start_time: 0.0,
            step: StepControlOptions::default(),
            use_initial_conditions: false,
            initial_state: None,
            operating_point: OperatingPointConfig::default(),
            breakpoints: Vec::new(),
        }
    }
}

/// DC sweep over one loader parameter.
#[derive(Clone, Debug, Default)]
pub struct DcSweepOptions {
    /// Name passed to `Loader::set_param`.
    pub parameter: String,
    pub values: Vec<f64>,
    /// Start every point from `initial_guess` instead of the previous point.
    pub sweep_source_reset: bool,
    pub initial_guess: Option<DVector<f64>>,
    pub operating_point: OperatingPointConfig,
    /// Time at which sources are evaluated.
    pub time: f64,
}

/// Steps dictated by an outer simulator.
#[derive(Clone, Debug, Default)]
pub struct CoupledOptions {
    pub step: StepControlOptions,
    pub initial_state: Option<DVector<f64>>,
    pub descriptors: Vec<ExternalCoupling>,
}

/// What an analysis run does between start and finish.
#[derive(Clone, Debug)]
pub enum SteppingPolicy {
    Transient(TransientOptions),
    DcSweep(DcSweepOptions),
    Coupled(CoupledOptions),
}

impl SteppingPolicy {
    pub fn name(&self) -> &'static str {
        match self {
            SteppingPolicy::Transient(_) => "tran",
            SteppingPolicy::DcSweep(_) => "dc",
            SteppingPolicy::Coupled(_) => "coupled",
        }
    }
}

/// Loosely typed analysis parameters, as read from an input deck.
#[derive(Clone, Debug, Default)]
pub struct AnalysisParams {
    pub options: BTreeMap<String, f64>,
    pub sweep_parameter: Option<String>,
    pub sweep_values: Vec<f64>,
    pub initial_state: Option<DVector<f64>>,
    pub descriptors: Vec<ExternalCoupling>,
}

impl AnalysisParams {
    pub fn with(mut self, key: &str, value: f64) -> Self {
        self.options.insert(key.to_owned(), value);
        self
    }

    pub fn get(&self, key: &str) -> Option<f64> {
        self.options.get(key).copied()
    }

    pub fn flag(&self, key: &str) -> bool {
        self.get(key).is_some_and(|v| v != 0.0)
    }

    fn positive(&self, key: &str, what: &'static str) -> SimResult<Option<f64>> {
        match self.get(key) {
            Some(v) if !(v > 0.0 && v.is_finite()) => Err(SimError::InvalidArg { what }),
            other => Ok(other),
        }
    }

    /// Step-control options from the integrator keys.
    pub fn step_options(&self) -> SimResult<StepControlOptions> {
        let mut step = StepControlOptions::default();
        if let Some(order) = self.get("maxord") {
            if !(order >= 1.0 && order <= MAX_BDF_ORDER as f64) {
                return Err(SimError::InvalidArg {
                    what: "maxord must lie in 1..=5",
                });
            }
            step.method = IntegrationMethod::VariableOrderBdf {
                max_order: order as usize,
            };
        }
        if let Some(v) = self.positive("reltol", "reltol must be positive")? {
            step.tolerances.rel = v;
        }
        if let Some(v) = self.positive("abstol", "abstol must be positive")? {
            step.tolerances.abs = v;
        }
        if let Some(v) = self.positive("tstep", "tstep must be positive")? {
            step.initial_step = Some(v);
        }
        if let Some(v) = self.positive("tmax", "tmax must be positive")? {
            step.max_step = v;
        }
        if let Some(v) = self.positive("delmin", "delmin must be positive")? {
            step.min_step = v;
        }
        if let Some(v) = self.get("maxrejects") {
            step.max_consecutive_rejections = v.max(1.0) as usize;
        }
        step.constant_step = self.flag("constant_step");
        step.test_first_step = self.flag("testfirststep");
        Ok(step)
    }
}

/// Builds a policy from parameters.
pub type PolicyFactory = fn(&AnalysisParams) -> SimResult<SteppingPolicy>;

/// Explicit table of known analyses.
#[derive(Clone, Debug, Default)]
pub struct AnalysisRegistry {
    factories: HashMap<String, PolicyFactory>,
}

impl AnalysisRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with `tran`, `dc` and `coupled`.
    pub fn standard() -> Self {
        let mut registry = Self::new();
        registry.register("tran", transient_policy);
        registry.register("dc", dc_sweep_policy);
        registry.register("coupled", coupled_policy);
        registry
    }

    /// Add or replace an analysis.
    pub fn register(&mut self, name: &str, factory: PolicyFactory) {
        self.factories.insert(name.to_ascii_lowercase(), factory);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(&name.to_ascii_lowercase())
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn create(&self, name: &str, params: &AnalysisParams) -> SimResult<SteppingPolicy> {
        let factory = self
            .factories
            .get(&name.to_ascii_lowercase())
            .ok_or_else(|| SimError::UnknownAnalysis { name: name.to_owned() })?;
        factory(params)
    }
}

fn transient_policy(params: &AnalysisParams) -> SimResult<SteppingPolicy> {
    Ok(SteppingPolicy::Transient(TransientOptions {
        start_time: params.get("tstart").unwrap_or(0.0),
        step: params.step_options()?,
        use_initial_conditions: params.flag("uic"),
        initial_state: params.initial_state.clone(),
        ..TransientOptions::default()
    }))
}

fn dc_sweep_policy(params: &AnalysisParams) -> SimResult<SteppingPolicy> {
    let Some(parameter) = params.sweep_parameter.clone() else {
        return Err(SimError::InvalidArg {
            what: "dc sweep needs a parameter name",
        });
    };
    if params.sweep_values.is_empty() {
        return Err(SimError::InvalidArg {
            what: "dc sweep needs at least one value",
        });
    }
    Ok(SteppingPolicy::DcSweep(DcSweepOptions {
        parameter,
        values: params.sweep_values.clone(),
        sweep_source_reset: params.flag("sweep_source_reset"),
        initial_guess: params.initial_state.clone(),
        ..DcSweepOptions::default()
    }))
}

fn coupled_policy(params: &AnalysisParams) -> SimResult<SteppingPolicy> {
    Ok(SteppingPolicy::Coupled(CoupledOptions {
        step: params.step_options()?,
        initial_state: params.initial_state.clone(),
        descriptors: params.descriptors.clone(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standard_registry_knows_three_analyses() {
        let registry = AnalysisRegistry::standard();
        assert_eq!(registry.names(), vec!["coupled", "dc", "tran"]);
        assert!(registry.contains("TRAN"));
    }

    #[test]
    fn unknown_names_are_reported() {
        let err = AnalysisRegistry::standard()
            .create("noise", &AnalysisParams::default())
            .unwrap_err();
        assert!(matches!(err, SimError::UnknownAnalysis { ref name } if name == "noise"));
    }

    #[test]
    fn transient_reads_integrator_keys() {
        let params = AnalysisParams::default()
            .with("maxord", 2.0)
            .with("reltol", 1e-4)
            .with("tmax", 0.5)
            .with("uic", 1.0);
        let policy = AnalysisRegistry::standard().create("tran", &params).unwrap();
        let SteppingPolicy::Transient(opts) = policy else {
            panic!("expected a transient policy");
        };
        assert_eq!(opts.step.method.max_order(), 2);
        assert_eq!(opts.step.tolerances.rel, 1e-4);
        assert_eq!(opts.step.max_step, 0.5);
        assert!(opts.use_initial_conditions);
    }

    #[test]
    fn bad_values_are_invalid() {
        let registry = AnalysisRegistry::standard();
        let params = AnalysisParams::default().with("maxord", 7.0);
        assert!(matches!(registry.create("tran", &params), Err(SimError::InvalidArg { .. })));
        let params = AnalysisParams::default().with("reltol", -1.0);
        assert!(matches!(registry.create("tran", &params), Err(SimError::InvalidArg { .. })));
    }

    #[test]
    fn dc_sweep_needs_a_parameter() {
        let registry = AnalysisRegistry::standard();
        assert!(registry.create("dc", &AnalysisParams::default()).is_err());
        let params = AnalysisParams {
            sweep_parameter: Some("vin".into()),
            sweep_values: vec![0.0, 1.0],
            ..AnalysisParams::default()
        };
        let policy = registry.create("dc", &params).unwrap();
        assert_eq!(policy.name(), "dc");
    }

    #[test]
    fn custom_analyses_can_be_registered() {
        let mut registry = AnalysisRegistry::new();
        registry.register("tran_be", |p| {
            let mut step = p.step_options()?;
            step.method = IntegrationMethod::BackwardEuler;
            Ok(SteppingPolicy::Transient(TransientOptions {
                step,
                ..TransientOptions::default()
            }))
        });
        let policy = registry.create("tran_be", &AnalysisParams::default()).unwrap();
        let SteppingPolicy::Transient(opts) = policy else {
            panic!("expected a transient policy");
        };
        assert_eq!(opts.step.method, IntegrationMethod::BackwardEuler);
    }
}
