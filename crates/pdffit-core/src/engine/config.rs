use crate::core::scattering::ScatteringType;
use thiserror::Error;

/// Convergence tolerance used when a caller does not give one.
pub const DEFAULT_TOLERANCE: f64 = 1e-8;

#[derive(Debug, Error, PartialEq, Clone)]
pub enum ConfigError {
    #[error("Missing required parameter: {0}")]
    MissingParameter(&'static str),
    #[error("Invalid value for {name}: {reason}")]
    InvalidValue { name: &'static str, reason: String },
}

/// Grid and radiation of a calculation-only dataset (see `alloc`).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CalculationConfig {
    pub stype: ScatteringType,
    pub qmax: f64,
    pub qsig: f64,
    pub qalp: f64,
    pub rmin: f64,
    pub rmax: f64,
    pub bins: usize,
}

#[derive(Default)]
pub struct CalculationConfigBuilder {
    stype: Option<ScatteringType>,
    qmax: Option<f64>,
    qsig: Option<f64>,
    qalp: Option<f64>,
    rmin: Option<f64>,
    rmax: Option<f64>,
    bins: Option<usize>,
}

impl CalculationConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stype(mut self, stype: ScatteringType) -> Self {
        self.stype = Some(stype);
        self
    }
    pub fn qmax(mut self, qmax: f64) -> Self {
        self.qmax = Some(qmax);
        self
    }
    pub fn qsig(mut self, qsig: f64) -> Self {
        self.qsig = Some(qsig);
        self
    }
    pub fn qalp(mut self, qalp: f64) -> Self {
        self.qalp = Some(qalp);
        self
    }
    pub fn rmin(mut self, rmin: f64) -> Self {
        self.rmin = Some(rmin);
        self
    }
    pub fn rmax(mut self, rmax: f64) -> Self {
        self.rmax = Some(rmax);
        self
    }
    pub fn bins(mut self, bins: usize) -> Self {
        self.bins = Some(bins);
        self
    }

    pub fn build(self) -> Result<CalculationConfig, ConfigError> {
        let config = CalculationConfig {
            stype: self.stype.unwrap_or(ScatteringType::Xray),
            qmax: self.qmax.unwrap_or(0.0),
            qsig: self.qsig.unwrap_or(0.0),
            qalp: self.qalp.unwrap_or(0.0),
            rmin: self.rmin.ok_or(ConfigError::MissingParameter("rmin"))?,
            rmax: self.rmax.ok_or(ConfigError::MissingParameter("rmax"))?,
            bins: self.bins.ok_or(ConfigError::MissingParameter("bins"))?,
        };
        if config.bins < 2 {
            return Err(ConfigError::InvalidValue {
                name: "bins",
                reason: format!("at least 2 points are needed (got {})", config.bins),
            });
        }
        if !(config.rmin >= 0.0 && config.rmax > config.rmin) {
            return Err(ConfigError::InvalidValue {
                name: "rmax",
                reason: format!(
                    "range [{}, {}] must satisfy 0 <= rmin < rmax",
                    config.rmin, config.rmax
                ),
            });
        }
        if config.qmax < 0.0 {
            return Err(ConfigError::InvalidValue {
                name: "qmax",
                reason: "must not be negative".to_string(),
            });
        }
        Ok(config)
    }
}

/// Damping schedule and numerical settings of the Levenberg-Marquardt step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LmConfig {
    pub initial_lambda: f64,
    pub lambda_factor: f64,
    /// Attempts per step to find a downhill move before giving up.
    pub max_retries: usize,
    /// Relative forward-difference step for the Jacobian.
    pub derivative_step: f64,
}

impl Default for LmConfig {
    fn default() -> Self {
        Self {
            initial_lambda: 1e-3,
            lambda_factor: 10.0,
            max_retries: 10,
            derivative_step: 1e-6,
        }
    }
}

#[derive(Default)]
pub struct LmConfigBuilder {
    initial_lambda: Option<f64>,
    lambda_factor: Option<f64>,
    max_retries: Option<usize>,
    derivative_step: Option<f64>,
}

impl LmConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn initial_lambda(mut self, lambda: f64) -> Self {
        self.initial_lambda = Some(lambda);
        self
    }
    pub fn lambda_factor(mut self, factor: f64) -> Self {
        self.lambda_factor = Some(factor);
        self
    }
    pub fn max_retries(mut self, retries: usize) -> Self {
        self.max_retries = Some(retries);
        self
    }
    pub fn derivative_step(mut self, step: f64) -> Self {
        self.derivative_step = Some(step);
        self
    }

    pub fn build(self) -> Result<LmConfig, ConfigError> {
        let defaults = LmConfig::default();
        let config = LmConfig {
            initial_lambda: self.initial_lambda.unwrap_or(defaults.initial_lambda),
            lambda_factor: self.lambda_factor.unwrap_or(defaults.lambda_factor),
            max_retries: self.max_retries.unwrap_or(defaults.max_retries),
            derivative_step: self.derivative_step.unwrap_or(defaults.derivative_step),
        };
        if config.initial_lambda <= 0.0 {
            return Err(ConfigError::InvalidValue {
                name: "initial_lambda",
                reason: "must be positive".to_string(),
            });
        }
        if config.lambda_factor <= 1.0 {
            return Err(ConfigError::InvalidValue {
                name: "lambda_factor",
                reason: "must be greater than 1".to_string(),
            });
        }
        if config.derivative_step <= 0.0 {
            return Err(ConfigError::InvalidValue {
                name: "derivative_step",
                reason: "must be positive".to_string(),
            });
        }
        Ok(config)
    }
}

/// Checks a convergence tolerance supplied by a caller.
pub fn validate_tolerance(tolerance: f64) -> Result<f64, ConfigError> {
    if tolerance.is_finite() && tolerance > 0.0 {
        Ok(tolerance)
    } else {
        Err(ConfigError::InvalidValue {
            name: "tolerance",
            reason: format!("must be a positive number (got {})", tolerance),
        })
    }
}
