use super::fit::PdfFit;
use crate::engine::config::{DEFAULT_TOLERANCE, validate_tolerance};
use crate::engine::error::FitError;
use crate::engine::progress::{NoopObserver, StepObserver};
use crate::engine::state::{RefinementState, RefinementSummary};
use crate::engine::traits::Engine;
use tracing::{info, instrument, warn};

impl<E: Engine> PdfFit<E> {
    /// Runs exactly one engine iteration and returns whether it converged.
    ///
    /// Any error leaves the session in [`RefinementState::Failed`] and is
    /// returned as the engine reported it; parameters stay wherever the
    /// engine left them.
    pub fn step(&mut self, tolerance: Option<f64>) -> Result<bool, FitError> {
        let tolerance = validate_tolerance(tolerance.unwrap_or(DEFAULT_TOLERANCE))?;
        match self.engine.refine_step(tolerance) {
            Ok(converged) => {
                let state = self.session.refinement_state().after_step(converged);
                self.session.set_refinement_state(state);
                Ok(converged)
            }
            Err(e) => {
                warn!(error = %e, "Refinement step failed.");
                self.session.set_refinement_state(RefinementState::Failed);
                Err(e)
            }
        }
    }

    /// Steps until the engine reports convergence, notifying `observer`
    /// after every step with the step number (from 1) and the converged
    /// flag. An observer error ends the run and is returned unchanged.
    #[instrument(skip_all, name = "run_to_convergence")]
    pub fn run_to_convergence<O>(
        &mut self,
        tolerance: Option<f64>,
        mut observer: Option<O>,
    ) -> Result<RefinementSummary, FitError>
    where
        O: StepObserver<Self>,
    {
        let tolerance = validate_tolerance(tolerance.unwrap_or(DEFAULT_TOLERANCE))?;
        info!(tolerance, free = self.free_parameters().len(), "Starting refinement.");
        let mut steps = 0;
        loop {
            steps += 1;
            let converged = self.step(Some(tolerance))?;
            if let Some(observer) = observer.as_mut() {
                observer.on_step(self, steps, converged)?;
            }
            if converged {
                break;
            }
        }
        let summary = RefinementSummary {
            steps,
            rw: self.rw(),
            state: self.refinement_state(),
        };
        info!(steps, rw = summary.rw, "Refinement converged.");
        Ok(summary)
    }

    /// [`Self::run_to_convergence`] without an observer.
    pub fn refine(&mut self, tolerance: Option<f64>) -> Result<RefinementSummary, FitError> {
        self.run_to_convergence(tolerance, None::<NoopObserver>)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::address::VariableAddress;
    use crate::core::scattering::ScatteringType;
    use crate::engine::progress::Throttled;
    use std::time::Duration;

    const COPPER: &str = r#"
title = "Cu"

[lattice]
a = 3.61
b = 3.61
c = 3.61
alpha = 90.0
beta = 90.0
gamma = 90.0

[[atom]]
element = "Cu"
xyz = [0.0, 0.0, 0.0]
uiso = 0.007

[[atom]]
element = "Cu"
xyz = [0.5, 0.5, 0.0]
uiso = 0.007

[[atom]]
element = "Cu"
xyz = [0.5, 0.0, 0.5]
uiso = 0.007

[[atom]]
element = "Cu"
xyz = [0.0, 0.5, 0.5]
uiso = 0.007
"#;

    /// Session fitting pscale and the cell edge against data calculated
    /// with pscale 0.8 and a = 3.61.
    fn scaled_fit() -> PdfFit {
        let mut reference = PdfFit::new();
        reference.read_struct_string(COPPER, "").unwrap();
        reference.set_variable("pscale", 0.8).unwrap();
        reference
            .alloc(ScatteringType::Xray, 30.0, 0.0, 1.5, 9.0, 301)
            .unwrap();
        reference.calc().unwrap();
        let r = reference.get_r(1).unwrap();
        let g = reference.get_pdf_fit(1).unwrap();

        let mut fit = PdfFit::new();
        fit.read_struct_string(COPPER, "").unwrap();
        fit.read_data_lists(ScatteringType::Xray, 30.0, 0.0, &r, &g, None, "ref")
            .unwrap();
        fit.constrain("pscale", 1usize).unwrap();
        fit.set_parameter(1, 1.0).unwrap();
        for lat in ["a", "b", "c"] {
            fit.constrain(lat, 2usize).unwrap();
        }
        fit.set_parameter(2, 3.6).unwrap();
        fit
    }

    #[test]
    fn starts_idle() {
        assert_eq!(PdfFit::new().refinement_state(), RefinementState::Idle);
    }

    #[test]
    fn observer_sees_every_step_in_order() {
        let mut fit = scaled_fit();
        let mut seen = Vec::new();
        let summary = fit
            .run_to_convergence(
                None,
                Some(|_: &PdfFit, step: usize, converged: bool| -> Result<(), FitError> {
                    seen.push((step, converged));
                    Ok(())
                }),
            )
            .unwrap();

        assert_eq!(seen.len(), summary.steps);
        assert!(seen.iter().enumerate().all(|(i, (step, _))| *step == i + 1));
        assert!(seen.last().unwrap().1);
        assert!(seen[..seen.len() - 1].iter().all(|(_, c)| !c));
        assert_eq!(summary.state, RefinementState::Converged);
        assert!((fit.get_parameter(1).unwrap() - 0.8).abs() < 1e-3);
        assert!((fit.get_variable(VariableAddress::lat(3).unwrap()).unwrap() - 3.61).abs() < 1e-3);
    }

    #[test]
    fn observer_can_stop_the_run() {
        let mut fit = scaled_fit();
        let err = fit
            .run_to_convergence(
                None,
                Some(|_: &PdfFit, step: usize, _: bool| -> Result<(), FitError> {
                    if step == 1 {
                        Err(FitError::Value("stopped".into()))
                    } else {
                        Ok(())
                    }
                }),
            )
            .unwrap_err();
        assert!(err.is_value());
        assert_eq!(fit.refinement_state(), RefinementState::Stepping);
    }

    #[test]
    fn throttled_observer_still_gets_the_final_step() {
        let mut fit = scaled_fit();
        let mut last = None;
        let observer = Throttled::skipping(
            |_: &PdfFit, step: usize, converged: bool| -> Result<(), FitError> {
                last = Some((step, converged));
                Ok(())
            },
            Duration::from_secs(3600),
        );
        let summary = fit.run_to_convergence(None, Some(observer)).unwrap();
        assert_eq!(last, Some((summary.steps, true)));
    }

    #[test]
    fn fixed_parameters_converge_on_the_first_step() {
        let mut fit = scaled_fit();
        fit.fix("ALL").unwrap();
        assert!(fit.step(Some(1e-8)).unwrap());
        assert_eq!(fit.refinement_state(), RefinementState::Converged);
        let summary = fit.refine(None).unwrap();
        assert_eq!(summary.steps, 1);
    }

    #[test]
    fn uninitialized_parameter_fails_the_step() {
        let mut fit = scaled_fit();
        fit.constrain("delta", 9usize).unwrap();
        assert!(fit.step(None).unwrap_err().is_unassigned());
        assert_eq!(fit.refinement_state(), RefinementState::Failed);
    }

    #[test]
    fn constraint_error_fails_the_step() {
        let mut fit = scaled_fit();
        fit.constrain("pscale", "1/@3").unwrap();
        fit.set_parameter(3, 0.0).unwrap();
        assert!(fit.step(None).unwrap_err().is_constraint());
        assert_eq!(fit.refinement_state(), RefinementState::Failed);
    }

    #[test]
    fn negative_peak_width_fails_the_step() {
        let mut fit = scaled_fit();
        fit.set_variable("delta", 50.0).unwrap();
        assert!(fit.step(None).unwrap_err().is_calculation());
        assert_eq!(fit.refinement_state(), RefinementState::Failed);
    }

    #[test]
    fn invalid_tolerance_is_rejected_without_stepping() {
        let mut fit = scaled_fit();
        assert!(fit.step(Some(-1.0)).unwrap_err().is_value());
        assert_eq!(fit.refinement_state(), RefinementState::Idle);
    }
}
