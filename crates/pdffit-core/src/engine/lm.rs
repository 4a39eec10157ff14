use super::config::LmConfig;
use super::error::FitError;
use nalgebra::{DMatrix, DVector};
use tracing::{debug, trace};

/// Below this chi-square a fit is considered exact.
const CHI2_FLOOR: f64 = 1e-30;

/// Result of one Levenberg-Marquardt iteration.
#[derive(Debug, Clone, PartialEq)]
pub struct StepOutcome {
    /// Parameter values after the step (unchanged if no step was accepted).
    pub parameters: Vec<f64>,
    pub chi2_before: f64,
    pub chi2_after: f64,
    pub accepted: bool,
    pub converged: bool,
}

fn chi2(residuals: &DVector<f64>) -> f64 {
    residuals.norm_squared()
}

fn rejects_trial(error: &FitError) -> bool {
    error.is_calculation() || error.is_structure() || error.is_constraint()
}

/// Performs one damped Gauss-Newton iteration on `residuals` starting at
/// `start`.
///
/// The damping factor `lambda` is carried between calls: it shrinks after an
/// accepted step and grows while trial steps go uphill. The step is reported
/// converged when the relative decrease of chi-square falls below
/// `tolerance`, when chi-square is already negligible, when there is nothing
/// to vary, or when no downhill step can be found.
///
/// A trial point whose model cannot be calculated, whose cell is no longer
/// valid, or whose constraints cannot be evaluated counts as uphill. The
/// same failures at the starting point or while probing derivatives are
/// returned as errors. When no step is accepted the returned parameters are
/// `start`, and the caller restores them.
pub fn lm_step<F>(
    mut residuals: F,
    start: &[f64],
    lambda: &mut f64,
    config: &LmConfig,
    tolerance: f64,
) -> Result<StepOutcome, FitError>
where
    F: FnMut(&[f64]) -> Result<Vec<f64>, FitError>,
{
    let r0 = DVector::from_vec(residuals(start)?);
    let chi0 = chi2(&r0);
    let unchanged = |converged| StepOutcome {
        parameters: start.to_vec(),
        chi2_before: chi0,
        chi2_after: chi0,
        accepted: false,
        converged,
    };

    if start.is_empty() || chi0 < CHI2_FLOOR {
        return Ok(unchanged(true));
    }

    let n = start.len();
    let mut jacobian = DMatrix::<f64>::zeros(r0.len(), n);
    let mut probe = start.to_vec();
    for k in 0..n {
        let h = config.derivative_step * start[k].abs().max(1.0);
        probe[k] = start[k] + h;
        let shifted = DVector::from_vec(residuals(&probe)?);
        probe[k] = start[k];
        jacobian.set_column(k, &((shifted - &r0) / h));
    }

    let normal = jacobian.transpose() * &jacobian;
    let gradient = jacobian.transpose() * &r0;

    for attempt in 0..config.max_retries {
        let mut damped = normal.clone();
        for k in 0..n {
            damped[(k, k)] += *lambda * normal[(k, k)].max(1e-12);
        }
        let Some(delta) = damped.lu().solve(&(-&gradient)) else {
            *lambda *= config.lambda_factor;
            continue;
        };
        let trial: Vec<f64> = start.iter().zip(delta.iter()).map(|(x, d)| x + d).collect();
        let chi_trial = match residuals(&trial) {
            Ok(r) => chi2(&DVector::from_vec(r)),
            Err(e) if rejects_trial(&e) => {
                trace!(attempt, error = %e, "Trial point could not be calculated.");
                f64::INFINITY
            }
            Err(e) => return Err(e),
        };

        if chi_trial.is_finite() && chi_trial < chi0 {
            *lambda /= config.lambda_factor;
            let converged = (chi0 - chi_trial) / chi0 < tolerance;
            debug!(chi0, chi_trial, lambda = *lambda, converged, "Accepted step.");
            return Ok(StepOutcome {
                parameters: trial,
                chi2_before: chi0,
                chi2_after: chi_trial,
                accepted: true,
                converged,
            });
        }
        *lambda *= config.lambda_factor;
    }

    debug!(chi0, "No downhill step found; treating as converged.");
    Ok(unchanged(true))
}
