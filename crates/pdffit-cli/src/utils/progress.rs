use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use pdffit::engine::error::FitError;
use pdffit::engine::progress::StepObserver;
use pdffit::engine::traits::Engine;
use pdffit::workflows::fit::PdfFit;
use std::time::Duration;
use tracing::info;

const SPINNER_TICK_MS: u64 = 80;

/// Spinner on stderr showing the step count and current Rw of a running
/// refinement.
pub struct CliStepObserver {
    pb: ProgressBar,
}

impl CliStepObserver {
    pub fn new() -> Self {
        Self::with_target(ProgressDrawTarget::stderr())
    }

    pub fn with_target(target: ProgressDrawTarget) -> Self {
        let pb = ProgressBar::new_spinner()
            .with_style(Self::spinner_style())
            .with_message("Refining...");
        pb.set_draw_target(target);
        pb.enable_steady_tick(Duration::from_millis(SPINNER_TICK_MS));
        Self { pb }
    }

    fn spinner_style() -> ProgressStyle {
        ProgressStyle::with_template("{spinner:.green} {msg} [{elapsed}]")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
    }

    pub fn message(&self) -> String {
        self.pb.message()
    }

    pub fn is_finished(&self) -> bool {
        self.pb.is_finished()
    }
}

impl Default for CliStepObserver {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: Engine> StepObserver<PdfFit<E>> for CliStepObserver {
    fn on_step(&mut self, session: &PdfFit<E>, step: usize, converged: bool) -> Result<(), FitError> {
        let rw = session.rw();
        info!(step, rw, converged, "Refinement step.");
        if converged {
            self.pb.disable_steady_tick();
            self.pb
                .finish_with_message(format!("✓ Converged after {} steps, Rw = {:.6}", step, rw));
        } else {
            self.pb.set_message(format!("Step {:>4}  Rw = {:.6}", step, rw));
        }
        Ok(())
    }
}

impl Drop for CliStepObserver {
    fn drop(&mut self) {
        if !self.pb.is_finished() {
            self.pb.abandon();
        }
    }
}
