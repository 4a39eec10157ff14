use crate::cli::FitArgs;
use crate::config::{FitPlan, ParameterValue, PartialFitConfig};
use crate::error::{CliError, Result};
use crate::utils::progress::CliStepObserver;
use pdffit::engine::error::FitError;
use pdffit::engine::progress::NoopObserver;
use pdffit::engine::state::RefinementSummary;
use pdffit::engine::traits::Engine;
use pdffit::workflows::fit::PdfFit;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

pub fn run(args: FitArgs) -> Result<()> {
    let partial_config = PartialFitConfig::from_file(&args.config)?;
    info!("Merging fit script with CLI arguments...");
    let plan = partial_config.merge_with_cli(&args)?;

    let mut fit = prepare(&plan)?;
    println!(
        "Starting refinement: {} phase(s), {} dataset(s), {} free parameter(s)...",
        fit.engine().num_phases(),
        fit.engine().num_datasets(),
        fit.free_parameters().len()
    );

    let summary = refine(&mut fit, &plan)?;
    println!(
        "Refinement {} after {} step(s), Rw = {:.6}",
        summary.state, summary.steps, summary.rw
    );
    for line in parameter_table(&fit, &plan) {
        println!("  {}", line);
    }

    let output_dir = plan
        .output
        .dir
        .clone()
        .or_else(|| args.config.parent().map(Path::to_path_buf))
        .unwrap_or_default();
    let stem = file_stem(&args.config, "fit");
    for path in write_outputs(&fit, &plan, &output_dir, &stem)? {
        println!("✓ Wrote {}", path.display());
    }
    Ok(())
}

/// Builds a session from the plan: structures, data and fit ranges, then
/// constraints, then parameter values and fixed flags.
pub fn prepare(plan: &FitPlan) -> Result<PdfFit> {
    let mut fit = PdfFit::new();

    for path in &plan.structures {
        info!("Loading structure from {:?}", path);
        fit.read_struct(path).map_err(|e| file_error(path, e))?;
    }
    for entry in &plan.data {
        info!("Loading data from {:?}", &entry.path);
        let iset = fit
            .read_data(&entry.path, entry.stype, entry.qmax, entry.qsig)
            .map_err(|e| file_error(&entry.path, e))?;
        if let Some([rmin, rmax]) = entry.fit_range {
            fit.pdfrange(iset, rmin, rmax)?;
        }
    }

    for constraint in &plan.constraints {
        if let Some(ip) = constraint.phase {
            fit.set_phase(ip)?;
        }
        if let Some(iset) = constraint.dataset {
            fit.set_dataset(iset)?;
        }
        let variable = constraint.variable.as_str();
        let target = constraint.target.clone();
        match constraint.mode()? {
            Some(mode) => fit.constrain_with_mode(variable, target, mode)?,
            None => fit.constrain(variable, target)?,
        }
    }

    for parameter in &plan.parameters {
        match &parameter.value {
            ParameterValue::Number(v) => fit.set_parameter(parameter.slot, *v)?,
            ParameterValue::Reference(name) => {
                fit.set_parameter_from_variable(parameter.slot, name.as_str())?
            }
        }
        if parameter.fixed {
            fit.fix(parameter.slot)?;
        }
    }
    Ok(fit)
}

fn refine(fit: &mut PdfFit, plan: &FitPlan) -> Result<RefinementSummary> {
    let summary = if plan.progress {
        fit.run_to_convergence(Some(plan.tolerance), Some(CliStepObserver::new()))?
    } else {
        fit.run_to_convergence(Some(plan.tolerance), None::<NoopObserver>)?
    };
    Ok(summary)
}

/// One line per slot named in the plan or left free, in slot order.
fn parameter_table<E: Engine>(fit: &PdfFit<E>, plan: &FitPlan) -> Vec<String> {
    let free = fit.free_parameters();
    let mut slots: Vec<usize> = plan.parameters.iter().map(|p| p.slot).collect();
    slots.extend(free.iter().copied());
    slots.sort_unstable();
    slots.dedup();

    slots
        .into_iter()
        .filter_map(|slot| {
            let value = fit.get_parameter(slot).ok()?;
            let status = if free.contains(&slot) { "" } else { " (fixed)" };
            Some(format!("@{:<3} = {:.6}{}", slot, value, status))
        })
        .collect()
}

/// Writes the requested result files and returns their paths.
fn write_outputs<E: Engine>(
    fit: &PdfFit<E>,
    plan: &FitPlan,
    dir: &Path,
    stem: &str,
) -> Result<Vec<PathBuf>> {
    std::fs::create_dir_all(dir)?;
    let mut written = Vec::new();

    for (i, entry) in plan.data.iter().enumerate() {
        let iset = i + 1;
        let data_stem = file_stem(&entry.path, &format!("data{}", iset));
        if plan.output.pdf {
            let path = dir.join(format!("{}.fgr", data_stem));
            fit.save_pdf(iset, &path)?;
            written.push(path);
        }
        if plan.output.dif {
            let path = dir.join(format!("{}.dif", data_stem));
            fit.save_dif(iset, &path)?;
            written.push(path);
        }
    }
    if plan.output.structures {
        for (i, source) in plan.structures.iter().enumerate() {
            let phase_stem = file_stem(source, &format!("phase{}", i + 1));
            let path = dir.join(format!("{}_fit.toml", phase_stem));
            fit.save_struct(i + 1, &path)?;
            written.push(path);
        }
    }
    if plan.output.res {
        let path = dir.join(format!("{}.res", stem));
        fit.save_res(&path)?;
        written.push(path);
    }
    if written.is_empty() {
        warn!("All outputs are disabled; nothing was written.");
    }
    Ok(written)
}

fn file_stem(path: &Path, fallback: &str) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| fallback.to_string())
}

fn file_error(path: &Path, e: FitError) -> CliError {
    match e {
        FitError::Io(_) | FitError::Structure(_) | FitError::Value(_) => CliError::FileParsing {
            path: path.to_path_buf(),
            source: e.into(),
        },
        other => other.into(),
    }
}
