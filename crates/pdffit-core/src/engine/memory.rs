use super::config::{CalculationConfig, LmConfig};
use super::constraints::{Binding, ConstraintMode, ConstraintSet, ConstraintTarget, ScopedVariable};
use super::error::FitError;
use super::lm::lm_step;
use super::parameters::{ParameterStore, RefineStatus};
use super::traits::{BondLength, DataSpec, Engine};
use crate::core::address::{VariableAddress, VariableScope};
use crate::core::formula::FormulaError;
use crate::core::io::data::{DataColumns, DataFile};
use crate::core::io::stru::StructureFile;
use crate::core::io::traits::ModelFile;
use crate::core::models::dataset::{DatasetParameters, PdfDataset};
use crate::core::models::phase::{PairEnd, Phase};
use crate::core::pdf::total_pdf;
use crate::core::scattering::{ScatteringType, normalize_element};
use crate::core::selection::Selector;
use crate::core::utils::geometry::{periodic_images, shortest_image};
use std::fmt::Write as _;
use std::path::Path;
use tracing::{debug, info, instrument, warn};

/// In-process engine: keeps phases, datasets, parameters and constraints
/// in memory and refines with a Levenberg-Marquardt step.
#[derive(Debug, Clone)]
pub struct MemoryEngine {
    phases: Vec<Phase>,
    datasets: Vec<PdfDataset>,
    parameters: ParameterStore,
    constraints: ConstraintSet,
    current_phase: Option<usize>,
    current_dataset: Option<usize>,
    lm: LmConfig,
    lambda: f64,
}

impl Default for MemoryEngine {
    fn default() -> Self {
        Self::with_config(LmConfig::default())
    }
}

impl MemoryEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(lm: LmConfig) -> Self {
        Self {
            phases: Vec::new(),
            datasets: Vec::new(),
            parameters: ParameterStore::new(),
            constraints: ConstraintSet::new(),
            current_phase: None,
            current_dataset: None,
            lambda: lm.initial_lambda,
            lm,
        }
    }

    pub fn phase(&self, ip: usize) -> Option<&Phase> {
        ip.checked_sub(1).and_then(|i| self.phases.get(i))
    }

    pub fn dataset(&self, iset: usize) -> Option<&PdfDataset> {
        iset.checked_sub(1).and_then(|i| self.datasets.get(i))
    }

    pub fn constraints(&self) -> &ConstraintSet {
        &self.constraints
    }

    pub fn parameters(&self) -> &ParameterStore {
        &self.parameters
    }

    fn phase_or_unassigned(&self, ip: usize) -> Result<&Phase, FitError> {
        self.phase(ip)
            .ok_or_else(|| FitError::unassigned(format!("phase {} does not exist", ip)))
    }

    fn dataset_or_unassigned(&self, iset: usize) -> Result<&PdfDataset, FitError> {
        self.dataset(iset)
            .ok_or_else(|| FitError::unassigned(format!("dataset {} does not exist", iset)))
    }

    fn active_phase(&self) -> Result<&Phase, FitError> {
        let ip = self
            .current_phase
            .ok_or_else(|| FitError::unassigned("no structure has been loaded"))?;
        self.phase_or_unassigned(ip)
    }

    /// Active phase, checked to be a valid periodic cell for distance queries.
    fn geometry_phase(&self) -> Result<&Phase, FitError> {
        let phase = self.active_phase()?;
        phase.structure.validate()?;
        Ok(phase)
    }

    fn active_dataset_mut(&mut self) -> Result<&mut PdfDataset, FitError> {
        let iset = self
            .current_dataset
            .ok_or_else(|| FitError::unassigned("no dataset has been loaded"))?;
        Ok(&mut self.datasets[iset - 1])
    }

    fn phase_indices(&self, selector: Selector) -> Result<Vec<usize>, FitError> {
        match selector {
            Selector::All => Ok((1..=self.phases.len()).collect()),
            Selector::Index(ip) => {
                self.phase_or_unassigned(ip)?;
                Ok(vec![ip])
            }
        }
    }

    /// Pins `address` to the active phase or dataset.
    fn scope(&self, address: VariableAddress) -> Result<ScopedVariable, FitError> {
        match address.scope() {
            VariableScope::Dataset => self
                .current_dataset
                .map(|iset| ScopedVariable::dataset(address, iset))
                .ok_or_else(|| {
                    FitError::unassigned(format!("{} needs a dataset, none is loaded", address))
                }),
            _ => self
                .current_phase
                .map(|ip| ScopedVariable::phase(address, ip))
                .ok_or_else(|| {
                    FitError::unassigned(format!("{} needs a structure, none is loaded", address))
                }),
        }
    }

    fn read_variable(&self, variable: &ScopedVariable) -> Result<f64, FitError> {
        let address = variable.address;
        match (variable.phase, variable.dataset) {
            (_, Some(iset)) => self
                .dataset_or_unassigned(iset)?
                .variable(address.kind())
                .ok_or_else(|| FitError::value(format!("{} is not a dataset variable", address))),
            (Some(ip), None) => self
                .phase_or_unassigned(ip)?
                .variable(address.kind(), address.atom())
                .ok_or_else(|| {
                    FitError::value(format!("{} is out of range for phase {}", address, ip))
                }),
            (None, None) => Err(FitError::unassigned(format!("{} has no scope", address))),
        }
    }

    fn write_variable(&mut self, variable: &ScopedVariable, value: f64) -> Result<(), FitError> {
        let address = variable.address;
        let written = match (variable.phase, variable.dataset) {
            (_, Some(iset)) => {
                self.dataset_or_unassigned(iset)?;
                self.datasets[iset - 1].set_variable(address.kind(), value)
            }
            (Some(ip), None) => {
                self.phase_or_unassigned(ip)?;
                self.phases[ip - 1].set_variable(address.kind(), address.atom(), value)
            }
            (None, None) => false,
        };
        if written {
            Ok(())
        } else {
            Err(FitError::value(format!("{} is out of range", variable)))
        }
    }

    /// Like [`Self::read_variable`], but a missing variable is unassigned.
    fn existing_variable(&self, variable: &ScopedVariable) -> Result<f64, FitError> {
        self.read_variable(variable).map_err(|e| match e {
            FitError::Value(msg) => FitError::Unassigned(msg),
            other => other,
        })
    }

    /// Current value of a parameter slot, following variable tracking.
    fn parameter_value(&self, slot: usize) -> Option<f64> {
        let parameter = self.parameters.get(slot)?;
        match parameter.tracking {
            Some(variable) => self.read_variable(&variable).ok(),
            None => parameter.value,
        }
    }

    /// Evaluates every binding and writes the results. In strict mode an
    /// uninitialized parameter or a failing formula is an error; otherwise
    /// such bindings are skipped.
    fn apply_constraints(&mut self, strict: bool) -> Result<(), FitError> {
        let mut updates = Vec::with_capacity(self.constraints.len());
        for binding in self.constraints.iter() {
            match binding.evaluate(|slot| self.parameter_value(slot)) {
                Ok(value) => updates.push((binding.variable, value)),
                Err(FormulaError::UndefinedParameter(slot)) if strict => {
                    return Err(FitError::unassigned(format!(
                        "parameter {} used by '{}' has no value",
                        slot, binding
                    )));
                }
                Err(e) if strict => {
                    return Err(FitError::Constraint(format!("{}: {}", binding, e)));
                }
                Err(e) => debug!(binding = %binding, error = %e, "Skipping constraint."),
            }
        }
        for (variable, value) in updates {
            self.write_variable(&variable, value)?;
        }
        Ok(())
    }

    /// Turns tracked parameters into plain values.
    fn materialize_tracking(&mut self) {
        for (slot, variable) in self.parameters.tracking_slots() {
            if let Ok(value) = self.read_variable(&variable) {
                self.parameters.materialize(slot, value);
            }
        }
    }

    fn recalculate(&mut self, observed_only: bool) -> Result<(), FitError> {
        for iset in 0..self.datasets.len() {
            if observed_only && !self.datasets[iset].observed {
                continue;
            }
            let dataset = &self.datasets[iset];
            let phases = self
                .phases
                .iter()
                .enumerate()
                .filter(|(i, _)| dataset.phase_selected(i + 1))
                .map(|(_, p)| p);
            let g = total_pdf(phases, &dataset.params, &dataset.r)?;
            self.datasets[iset].g_calc = g;
        }
        Ok(())
    }

    fn residuals(&self) -> Vec<f64> {
        let mut out = Vec::new();
        for dataset in self.datasets.iter().filter(|d| d.observed) {
            for i in dataset.fit_indices() {
                out.push(dataset.weight(i) * (dataset.g_obs[i] - dataset.g_calc[i]));
            }
        }
        out
    }

    fn require_model(&self) -> Result<(), FitError> {
        if self.phases.is_empty() {
            return Err(FitError::unassigned("no structure has been loaded"));
        }
        if self.datasets.is_empty() {
            return Err(FitError::unassigned("no dataset has been loaded or allocated"));
        }
        Ok(())
    }

    /// Free slots that some constraint actually uses.
    fn varied_slots(&self) -> Vec<usize> {
        let used = self.constraints.parameters();
        self.parameters
            .free_slots()
            .into_iter()
            .filter(|slot| used.contains(slot))
            .collect()
    }

    fn add_phase(&mut self, phase: Phase) -> String {
        let title = phase.structure.title.clone();
        info!(title = %title, atoms = phase.structure.num_atoms(), "Loaded structure.");
        self.phases.push(phase);
        self.current_phase = Some(self.phases.len());
        title
    }

    fn add_dataset(&mut self, dataset: PdfDataset) {
        info!(name = %dataset.name, points = dataset.len(), "Loaded dataset.");
        self.datasets.push(dataset);
        self.current_dataset = Some(self.datasets.len());
    }

    fn dataset_from_columns(
        columns: DataColumns,
        spec: DataSpec,
        name: &str,
    ) -> Result<PdfDataset, FitError> {
        let params = DatasetParameters::new(spec.stype, spec.qmax, spec.qsig);
        Ok(PdfDataset::from_columns(
            name,
            params,
            columns.r,
            columns.g,
            columns.dg,
        )?)
    }

    fn select_types(
        &mut self,
        ip: Selector,
        element: &str,
        end: PairEnd,
        selected: bool,
    ) -> Result<(), FitError> {
        let all = element.trim().eq_ignore_ascii_case("ALL");
        for index in self.phase_indices(ip)? {
            let phase = &mut self.phases[index - 1];
            let types = phase.structure.atom_types();
            let targets: Vec<String> = if all {
                types
            } else {
                let element = normalize_element(element);
                if !types.contains(&element) {
                    return Err(FitError::value(format!(
                        "phase {} has no atoms of type '{}'",
                        index, element
                    )));
                }
                vec![element]
            };
            for target in targets {
                phase.set_type_selected(end, &target, selected);
            }
        }
        Ok(())
    }

    fn select_phases(&mut self, ip: Selector, selected: bool) -> Result<(), FitError> {
        let indices = self.phase_indices(ip)?;
        let dataset = self.active_dataset_mut()?;
        for index in indices {
            dataset.set_phase_selected(index, selected);
        }
        Ok(())
    }

    fn calculated_dataset(&self, iset: usize) -> Result<&PdfDataset, FitError> {
        let dataset = self.dataset_or_unassigned(iset)?;
        if dataset.g_calc.len() != dataset.len() {
            return Err(FitError::unassigned(format!(
                "dataset {} has not been calculated",
                iset
            )));
        }
        Ok(dataset)
    }

    fn write_text(text: String, destination: Option<&Path>) -> Result<String, FitError> {
        if let Some(path) = destination {
            std::fs::write(path, &text)?;
            info!(path = %path.display(), "Wrote output.");
        }
        Ok(text)
    }

    fn atom_position(&self, phase: &Phase, index: usize) -> Result<nalgebra::Vector3<f64>, FitError> {
        phase
            .structure
            .atom(index)
            .map(|a| a.position)
            .ok_or_else(|| FitError::value(format!("atom {} is out of range", index)))
    }
}

impl Engine for MemoryEngine {
    fn reset(&mut self) {
        *self = Self::with_config(self.lm);
        debug!("Engine reset.");
    }

    fn read_struct(&mut self, path: &Path) -> Result<String, FitError> {
        let (structure, params) = StructureFile::read_from_path(path)?;
        Ok(self.add_phase(Phase::new(structure).with_params(params)))
    }

    fn read_struct_string(&mut self, text: &str) -> Result<String, FitError> {
        let (structure, params) = StructureFile::read_from_str(text)?;
        Ok(self.add_phase(Phase::new(structure).with_params(params)))
    }

    fn read_data(&mut self, path: &Path, spec: DataSpec) -> Result<(), FitError> {
        let (columns, _) = DataFile::read_from_path(path)?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        let dataset = Self::dataset_from_columns(columns, spec, &name)?;
        self.add_dataset(dataset);
        Ok(())
    }

    fn read_data_string(&mut self, text: &str, spec: DataSpec, name: &str) -> Result<(), FitError> {
        let (columns, _) = DataFile::read_from_str(text)?;
        let dataset = Self::dataset_from_columns(columns, spec, name)?;
        self.add_dataset(dataset);
        Ok(())
    }

    fn read_data_arrays(
        &mut self,
        spec: DataSpec,
        r: &[f64],
        g: &[f64],
        dg: Option<&[f64]>,
        name: &str,
    ) -> Result<(), FitError> {
        let columns = DataColumns {
            r: r.to_vec(),
            g: g.to_vec(),
            dg: dg.map(<[f64]>::to_vec).unwrap_or_default(),
        };
        let dataset = Self::dataset_from_columns(columns, spec, name)?;
        self.add_dataset(dataset);
        Ok(())
    }

    fn alloc(&mut self, config: &CalculationConfig) -> Result<(), FitError> {
        if self.phases.is_empty() {
            return Err(FitError::unassigned("alloc needs a loaded structure"));
        }
        let mut params = DatasetParameters::new(config.stype, config.qmax, config.qsig);
        params.qalp = config.qalp;
        let dataset = PdfDataset::from_grid(
            format!("calc {}", self.datasets.len() + 1),
            params,
            config.rmin,
            config.rmax,
            config.bins,
        )?;
        self.add_dataset(dataset);
        Ok(())
    }

    #[instrument(skip_all, name = "calc")]
    fn calc(&mut self) -> Result<(), FitError> {
        self.require_model()?;
        self.materialize_tracking();
        self.apply_constraints(true)?;
        self.recalculate(false)?;
        info!(rw = self.getrw(), "Calculated PDF.");
        Ok(())
    }

    fn pdfrange(&mut self, iset: Selector, rmin: f64, rmax: f64) -> Result<(), FitError> {
        let indices: Vec<usize> = match iset {
            Selector::All => (1..=self.datasets.len()).collect(),
            Selector::Index(i) => {
                self.dataset_or_unassigned(i)?;
                vec![i]
            }
        };
        for i in indices {
            self.datasets[i - 1].set_fit_range(rmin, rmax)?;
        }
        Ok(())
    }

    #[instrument(skip_all, name = "refine_step")]
    fn refine_step(&mut self, tolerance: f64) -> Result<bool, FitError> {
        self.require_model()?;
        if !self.datasets.iter().any(|d| d.observed) {
            return Err(FitError::unassigned("no observed data to refine against"));
        }
        self.materialize_tracking();
        self.apply_constraints(true)?;
        self.recalculate(true)?;

        let slots = self.varied_slots();
        let start: Vec<f64> = slots
            .iter()
            .map(|&slot| self.parameter_value(slot).unwrap_or_default())
            .collect();
        let config = self.lm;
        let mut lambda = self.lambda;

        let outcome = lm_step(
            |x: &[f64]| {
                for (&slot, &value) in slots.iter().zip(x) {
                    self.parameters.set(slot, value);
                }
                self.apply_constraints(true)?;
                self.recalculate(true)?;
                Ok(self.residuals())
            },
            &start,
            &mut lambda,
            &config,
            tolerance,
        )?;
        self.lambda = lambda;

        for (&slot, &value) in slots.iter().zip(&outcome.parameters) {
            self.parameters.set(slot, value);
        }
        self.apply_constraints(true)?;
        self.recalculate(false)?;
        debug!(
            free = slots.len(),
            chi2 = outcome.chi2_after,
            rw = self.getrw(),
            converged = outcome.converged,
            "Refinement step finished."
        );
        Ok(outcome.converged)
    }

    fn constrain(
        &mut self,
        address: VariableAddress,
        target: ConstraintTarget,
        mode: Option<ConstraintMode>,
    ) -> Result<(), FitError> {
        let variable = self.scope(address)?;
        self.existing_variable(&variable)?;
        let binding = Binding::new(variable, target, mode)?;
        for slot in binding.parameters() {
            self.parameters.ensure(slot);
        }
        debug!(binding = %binding, "Bound variable.");
        self.constraints.bind(binding);
        self.apply_constraints(false)
    }

    fn setpar(&mut self, slot: usize, value: f64) -> Result<(), FitError> {
        if slot == 0 {
            return Err(FitError::value("parameter slots are numbered from 1"));
        }
        if !value.is_finite() {
            return Err(FitError::value(format!("parameter {} must be finite", slot)));
        }
        self.parameters.set(slot, value);
        self.apply_constraints(false)
    }

    fn setpar_from_variable(&mut self, slot: usize, address: VariableAddress) -> Result<(), FitError> {
        if slot == 0 {
            return Err(FitError::value("parameter slots are numbered from 1"));
        }
        let variable = self.scope(address)?;
        let current = self.existing_variable(&variable)?;
        self.parameters.track(slot, variable, current);
        self.apply_constraints(false)
    }

    fn setvar(&mut self, address: VariableAddress, value: f64) -> Result<(), FitError> {
        if !value.is_finite() {
            return Err(FitError::value(format!("{} must be finite", address)));
        }
        let variable = self.scope(address)?;
        self.read_variable(&variable)?;
        self.write_variable(&variable, value)
    }

    fn getvar(&self, address: VariableAddress) -> Result<f64, FitError> {
        let variable = self.scope(address)?;
        self.read_variable(&variable)
    }

    fn getpar(&self, slot: usize) -> Result<f64, FitError> {
        if !self.parameters.contains(slot) {
            return Err(FitError::value(format!("parameter {} is not defined", slot)));
        }
        self.parameter_value(slot)
            .ok_or_else(|| FitError::unassigned(format!("parameter {} has no value", slot)))
    }

    fn fixpar(&mut self, selector: Selector) -> Result<(), FitError> {
        self.parameters.fix(selector)
    }

    fn freepar(&mut self, selector: Selector) -> Result<(), FitError> {
        self.parameters.free(selector)
    }

    fn free_parameters(&self) -> Vec<usize> {
        self.parameters.free_slots()
    }

    fn setphase(&mut self, ip: usize) -> Result<(), FitError> {
        self.phase_or_unassigned(ip)?;
        self.current_phase = Some(ip);
        Ok(())
    }

    fn setdata(&mut self, iset: usize) -> Result<(), FitError> {
        self.dataset_or_unassigned(iset)?;
        self.current_dataset = Some(iset);
        Ok(())
    }

    fn current_phase(&self) -> Option<usize> {
        self.current_phase
    }

    fn current_dataset(&self) -> Option<usize> {
        self.current_dataset
    }

    fn num_phases(&self) -> usize {
        self.phases.len()
    }

    fn num_datasets(&self) -> usize {
        self.datasets.len()
    }

    fn psel(&mut self, ip: Selector) -> Result<(), FitError> {
        self.select_phases(ip, true)
    }

    fn pdesel(&mut self, ip: Selector) -> Result<(), FitError> {
        self.select_phases(ip, false)
    }

    fn isel(&mut self, ip: Selector, element: &str) -> Result<(), FitError> {
        self.select_types(ip, element, PairEnd::First, true)
    }

    fn idesel(&mut self, ip: Selector, element: &str) -> Result<(), FitError> {
        self.select_types(ip, element, PairEnd::First, false)
    }

    fn jsel(&mut self, ip: Selector, element: &str) -> Result<(), FitError> {
        self.select_types(ip, element, PairEnd::Second, true)
    }

    fn jdesel(&mut self, ip: Selector, element: &str) -> Result<(), FitError> {
        self.select_types(ip, element, PairEnd::Second, false)
    }

    fn getrw(&self) -> f64 {
        self.current_dataset
            .and_then(|iset| self.dataset(iset))
            .map(PdfDataset::rw)
            .unwrap_or(0.0)
    }

    fn get_r(&self, iset: usize) -> Result<Vec<f64>, FitError> {
        Ok(self.dataset_or_unassigned(iset)?.r.clone())
    }

    fn getpdf_fit(&self, iset: usize) -> Result<Vec<f64>, FitError> {
        Ok(self.calculated_dataset(iset)?.g_calc.clone())
    }

    fn getpdf_obs(&self, iset: usize) -> Result<Vec<f64>, FitError> {
        Ok(self.dataset_or_unassigned(iset)?.g_obs.clone())
    }

    fn get_atoms(&self, ip: usize) -> Result<Vec<String>, FitError> {
        Ok(self
            .phase_or_unassigned(ip)?
            .structure
            .atoms
            .iter()
            .map(|a| a.element.clone())
            .collect())
    }

    fn num_atoms(&self, ip: usize) -> Result<usize, FitError> {
        Ok(self.phase_or_unassigned(ip)?.structure.num_atoms())
    }

    fn bang(&self, i: usize, j: usize, k: usize) -> Result<f64, FitError> {
        let phase = self.geometry_phase()?;
        let lattice = &phase.structure.lattice;
        let vertex = self.atom_position(phase, j)?;
        let to_i = shortest_image(lattice, &vertex, &self.atom_position(phase, i)?)?;
        let to_k = shortest_image(lattice, &vertex, &self.atom_position(phase, k)?)?;
        let cos = to_i.dot(&to_k) / (to_i.norm() * to_k.norm());
        Ok(cos.clamp(-1.0, 1.0).acos().to_degrees())
    }

    fn blen(&self, i: usize, j: usize) -> Result<f64, FitError> {
        let phase = self.geometry_phase()?;
        let from = self.atom_position(phase, i)?;
        let to = self.atom_position(phase, j)?;
        Ok(shortest_image(&phase.structure.lattice, &from, &to)?.norm())
    }

    fn blen_range(
        &self,
        first: &str,
        second: &str,
        lower: f64,
        upper: f64,
    ) -> Result<Vec<BondLength>, FitError> {
        if !(lower >= 0.0 && upper >= lower) {
            return Err(FitError::value(format!(
                "invalid distance range [{}, {}]",
                lower, upper
            )));
        }
        let phase = self.geometry_phase()?;
        let matches = |filter: &str, element: &str| {
            filter.trim().eq_ignore_ascii_case("ALL") || normalize_element(filter) == element
        };
        let atoms = &phase.structure.atoms;
        let mut bonds = Vec::new();
        for (i, a) in atoms.iter().enumerate() {
            for (j, b) in atoms.iter().enumerate().skip(i) {
                let forward = matches(first, &a.element) && matches(second, &b.element);
                let backward = matches(first, &b.element) && matches(second, &a.element);
                if !(forward || backward) {
                    continue;
                }
                for v in periodic_images(&phase.structure.lattice, &a.position, &b.position, lower, upper)? {
                    // Self pairs see each image twice, as +v and -v.
                    if i == j && (v.x, v.y, v.z) < (0.0, 0.0, 0.0) {
                        continue;
                    }
                    bonds.push(BondLength {
                        first: i + 1,
                        second: j + 1,
                        first_element: a.element.clone(),
                        second_element: b.element.clone(),
                        distance: v.norm(),
                    });
                }
            }
        }
        bonds.sort_by(|x, y| x.distance.total_cmp(&y.distance));
        Ok(bonds)
    }

    fn show_scat(&self, stype: ScatteringType) -> Result<String, FitError> {
        let phase = self.active_phase()?;
        let mut text = String::new();
        for element in phase.structure.atom_types() {
            match phase.scattering_factor(&element, stype) {
                Some(value) => {
                    let _ = writeln!(text, "{:<4} {} {:12.6}", element, stype, value);
                }
                None => {
                    let _ = writeln!(text, "{:<4} {} {:>12}", element, stype, "unknown");
                }
            }
        }
        Ok(text)
    }

    fn set_scat(&mut self, stype: ScatteringType, element: &str, value: f64) -> Result<(), FitError> {
        let ip = self
            .current_phase
            .ok_or_else(|| FitError::unassigned("no structure has been loaded"))?;
        let phase = &mut self.phases[ip - 1];
        let element = normalize_element(element);
        if !phase.structure.atom_types().contains(&element) {
            return Err(FitError::value(format!(
                "phase {} has no atoms of type '{}'",
                ip, element
            )));
        }
        phase.set_scattering_factor(&element, stype, value);
        Ok(())
    }

    fn reset_scat(&mut self, element: &str) -> Result<(), FitError> {
        let ip = self
            .current_phase
            .ok_or_else(|| FitError::unassigned("no structure has been loaded"))?;
        let phase = &mut self.phases[ip - 1];
        let element = normalize_element(element);
        if !phase.structure.atom_types().contains(&element) {
            return Err(FitError::value(format!(
                "phase {} has no atoms of type '{}'",
                ip, element
            )));
        }
        phase.reset_scattering_factor(&element);
        Ok(())
    }

    fn save_pdf(&self, iset: usize, destination: Option<&Path>) -> Result<String, FitError> {
        let dataset = self.calculated_dataset(iset)?;
        let columns = DataColumns {
            r: dataset.r.clone(),
            g: dataset.g_calc.clone(),
            dg: Vec::new(),
        };
        let header = vec![
            format!("calculated PDF of {}", dataset.name),
            format!("Rw = {:.6}", dataset.rw()),
        ];
        Self::write_text(DataFile::write_to_string(&columns, &header)?, destination)
    }

    fn save_dif(&self, iset: usize, destination: Option<&Path>) -> Result<String, FitError> {
        let dataset = self.calculated_dataset(iset)?;
        if !dataset.observed {
            warn!(dataset = iset, "Difference curve of a calculation-only dataset.");
        }
        let columns = DataColumns {
            r: dataset.r.clone(),
            g: dataset
                .g_obs
                .iter()
                .zip(&dataset.g_calc)
                .map(|(o, c)| o - c)
                .collect(),
            dg: Vec::new(),
        };
        let header = vec![format!("difference Gobs - Gcalc of {}", dataset.name)];
        Self::write_text(DataFile::write_to_string(&columns, &header)?, destination)
    }

    fn save_res(&self, destination: Option<&Path>) -> Result<String, FitError> {
        let mut text = String::new();
        let _ = writeln!(text, "Refinement results");
        let _ = writeln!(text, "==================");
        for (i, dataset) in self.datasets.iter().enumerate() {
            let _ = writeln!(
                text,
                "dataset {} ({}): {} points, fit range [{:.4}, {:.4}], Rw = {:.6}",
                i + 1,
                dataset.name,
                dataset.len(),
                dataset.fit_range.0,
                dataset.fit_range.1,
                dataset.rw()
            );
        }
        let _ = writeln!(text, "\nParameters");
        for (slot, parameter) in self.parameters.iter() {
            let status = match parameter.status {
                RefineStatus::Free => "free",
                RefineStatus::Fixed => "fixed",
            };
            match self.parameter_value(slot) {
                Some(value) => {
                    let _ = writeln!(text, "  @{:<4} {:16.8} {}", slot, value, status);
                }
                None => {
                    let _ = writeln!(text, "  @{:<4} {:>16} {}", slot, "unset", status);
                }
            }
        }
        let _ = writeln!(text, "\nConstraints");
        for binding in self.constraints.iter() {
            let _ = writeln!(text, "  {}", binding);
        }
        for (i, phase) in self.phases.iter().enumerate() {
            let l = &phase.structure.lattice;
            let _ = writeln!(
                text,
                "\nPhase {} ({}): a={:.5} b={:.5} c={:.5} alpha={:.4} beta={:.4} gamma={:.4}",
                i + 1,
                phase.structure.title,
                l.a,
                l.b,
                l.c,
                l.alpha,
                l.beta,
                l.gamma
            );
            let p = &phase.params;
            let _ = writeln!(
                text,
                "  pscale={:.6} srat={:.6} delta={:.6} gamma={:.6} rcut={:.4}",
                p.pscale, p.srat, p.delta, p.gamma, p.rcut
            );
        }
        Self::write_text(text, destination)
    }

    fn save_struct(&self, ip: usize, destination: Option<&Path>) -> Result<String, FitError> {
        let phase = self.phase_or_unassigned(ip)?;
        let text = StructureFile::write_to_string(&phase.structure, &phase.params)?;
        Self::write_text(text, destination)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::address::VariableAddress as V;
    use crate::engine::config::CalculationConfigBuilder;
    use tempfile::tempdir;

    const TOLERANCE: f64 = 1e-9;

    const NICKEL: &str = r#"
title = "Ni"

[lattice]
a = 3.52
b = 3.52
c = 3.52
alpha = 90.0
beta = 90.0
gamma = 90.0

[[atom]]
element = "Ni"
xyz = [0.0, 0.0, 0.0]
uiso = 0.005

[[atom]]
element = "Ni"
xyz = [0.5, 0.5, 0.0]
uiso = 0.005

[[atom]]
element = "Ni"
xyz = [0.5, 0.0, 0.5]
uiso = 0.005

[[atom]]
element = "Ni"
xyz = [0.0, 0.5, 0.5]
uiso = 0.005
"#;

    fn neutron() -> DataSpec {
        DataSpec::new(ScatteringType::Neutron, 30.0, 0.0)
    }

    fn engine_with_structure() -> MemoryEngine {
        let mut engine = MemoryEngine::new();
        engine.read_struct_string(NICKEL).unwrap();
        engine
    }

    fn grid(rmin: f64, rmax: f64, bins: usize) -> CalculationConfig {
        CalculationConfigBuilder::new()
            .stype(ScatteringType::Neutron)
            .qmax(30.0)
            .rmin(rmin)
            .rmax(rmax)
            .bins(bins)
            .build()
            .unwrap()
    }

    /// Engine holding "observed" data generated from the structure with
    /// lattice constant `a_true`, then reset to `a_start`.
    fn synthetic_fit(a_true: f64, a_start: f64) -> MemoryEngine {
        let mut reference = engine_with_structure();
        reference.setvar(V::lat(1).unwrap(), a_true).unwrap();
        reference.setvar(V::lat(2).unwrap(), a_true).unwrap();
        reference.setvar(V::lat(3).unwrap(), a_true).unwrap();
        reference.alloc(&grid(1.5, 8.0, 326)).unwrap();
        reference.calc().unwrap();
        let r = reference.get_r(1).unwrap();
        let g = reference.getpdf_fit(1).unwrap();

        let mut engine = engine_with_structure();
        engine
            .read_data_arrays(neutron(), &r, &g, None, "synthetic")
            .unwrap();
        for n in 1..=3 {
            engine
                .constrain(V::lat(n).unwrap(), ConstraintTarget::Slot(1), None)
                .unwrap();
        }
        engine.setpar(1, a_start).unwrap();
        engine
    }

    #[test]
    fn alloc_then_calc_gives_the_requested_grid() {
        let mut engine = engine_with_structure();
        engine.alloc(&grid(1.0, 20.0, 400)).unwrap();
        engine.calc().unwrap();
        let r = engine.get_r(1).unwrap();
        assert_eq!(r.len(), 400);
        assert!((r[0] - 1.0).abs() < TOLERANCE);
        assert!((r[399] - 20.0).abs() < TOLERANCE);
        let dr = 19.0 / 399.0;
        assert!(r.windows(2).all(|w| (w[1] - w[0] - dr).abs() < TOLERANCE));
        assert_eq!(engine.getpdf_fit(1).unwrap().len(), 400);
    }

    #[test]
    fn alloc_without_structure_is_unassigned() {
        let mut engine = MemoryEngine::new();
        assert!(engine.alloc(&grid(1.0, 20.0, 400)).unwrap_err().is_unassigned());
    }

    #[test]
    fn constraint_applies_as_soon_as_the_parameter_is_set() {
        let mut engine = engine_with_structure();
        engine
            .constrain(V::x(1).unwrap(), ConstraintTarget::Slot(1), None)
            .unwrap();
        engine.setpar(1, 0.5).unwrap();
        assert!((engine.getvar(V::x(1).unwrap()).unwrap() - 0.5).abs() < TOLERANCE);
    }

    #[test]
    fn formula_constraints_use_fcomp() {
        let mut engine = engine_with_structure();
        engine
            .constrain(V::y(2).unwrap(), "0.5 + @3".into(), None)
            .unwrap();
        assert_eq!(engine.constraints().iter().next().unwrap().mode, ConstraintMode::FComp);
        engine.setpar(3, 0.01).unwrap();
        assert!((engine.getvar(V::y(2).unwrap()).unwrap() - 0.51).abs() < TOLERANCE);
    }

    #[test]
    fn constraining_a_missing_atom_is_unassigned() {
        let mut engine = engine_with_structure();
        let err = engine
            .constrain(V::x(9).unwrap(), ConstraintTarget::Slot(1), None)
            .unwrap_err();
        assert!(err.is_unassigned());
        let mut empty = MemoryEngine::new();
        assert!(empty
            .constrain(V::pscale(), ConstraintTarget::Slot(1), None)
            .unwrap_err()
            .is_unassigned());
    }

    #[test]
    fn setvar_and_getvar_report_scope_and_range_errors() {
        let mut engine = MemoryEngine::new();
        assert!(engine.getvar(V::pscale()).unwrap_err().is_unassigned());
        engine.read_struct_string(NICKEL).unwrap();
        assert!(engine.getvar(V::dscale()).unwrap_err().is_unassigned());
        assert!(engine.setvar(V::occ(5).unwrap(), 0.5).unwrap_err().is_value());
        engine.setvar(V::occ(4).unwrap(), 0.5).unwrap();
        assert_eq!(engine.getvar(V::occ(4).unwrap()).unwrap(), 0.5);
    }

    #[test]
    fn setvar_does_not_reapply_constraints() {
        let mut engine = engine_with_structure();
        engine
            .constrain(V::pscale(), ConstraintTarget::Slot(1), None)
            .unwrap();
        engine.setpar(1, 0.8).unwrap();
        engine.setvar(V::pscale(), 0.3).unwrap();
        assert_eq!(engine.getvar(V::pscale()).unwrap(), 0.3);
    }

    #[test]
    fn parameters_track_their_source_variable_until_set() {
        let mut engine = engine_with_structure();
        engine.setpar_from_variable(2, V::lat(1).unwrap()).unwrap();
        assert!((engine.getpar(2).unwrap() - 3.52).abs() < TOLERANCE);
        engine.setvar(V::lat(1).unwrap(), 3.60).unwrap();
        assert!((engine.getpar(2).unwrap() - 3.60).abs() < TOLERANCE);
        engine.setpar(2, 1.0).unwrap();
        engine.setvar(V::lat(1).unwrap(), 3.70).unwrap();
        assert_eq!(engine.getpar(2).unwrap(), 1.0);
    }

    #[test]
    fn calc_materializes_tracked_parameters() {
        let mut engine = engine_with_structure();
        engine.alloc(&grid(1.0, 5.0, 50)).unwrap();
        engine.setpar_from_variable(1, V::pscale()).unwrap();
        engine.calc().unwrap();
        engine.setvar(V::pscale(), 0.25).unwrap();
        assert_eq!(engine.getpar(1).unwrap(), 1.0);
    }

    #[test]
    fn calc_with_uninitialized_parameter_is_unassigned() {
        let mut engine = engine_with_structure();
        engine.alloc(&grid(1.0, 5.0, 50)).unwrap();
        engine
            .constrain(V::pscale(), ConstraintTarget::Slot(7), None)
            .unwrap();
        assert!(engine.calc().unwrap_err().is_unassigned());
        assert!(engine.getpar(7).unwrap_err().is_unassigned());
        assert!(engine.getpar(8).unwrap_err().is_value());
    }

    #[test]
    fn negative_peak_width_is_a_calculation_error() {
        let mut engine = engine_with_structure();
        engine.alloc(&grid(1.0, 5.0, 50)).unwrap();
        engine.setvar(V::delta(), 100.0).unwrap();
        assert!(engine.calc().unwrap_err().is_calculation());
    }

    #[test]
    fn rw_is_zero_before_any_calculation() {
        let mut engine = engine_with_structure();
        assert_eq!(engine.getrw(), 0.0);
        engine
            .read_data_string("1.0 0.1\n1.1 0.2\n1.2 0.3\n", neutron(), "tiny")
            .unwrap();
        assert_eq!(engine.getrw(), 0.0);
    }

    #[test]
    fn fixing_everything_converges_on_the_first_step() {
        let mut engine = synthetic_fit(3.52, 3.50);
        engine.fixpar(Selector::All).unwrap();
        assert!(engine.free_parameters().is_empty());
        assert!(engine.refine_step(1e-8).unwrap());
    }

    #[test]
    fn refinement_recovers_the_lattice_constant() {
        let mut engine = synthetic_fit(3.52, 3.49);
        let mut converged = false;
        for _ in 0..50 {
            if engine.refine_step(1e-8).unwrap() {
                converged = true;
                break;
            }
        }
        assert!(converged);
        assert!((engine.getpar(1).unwrap() - 3.52).abs() < 1e-3);
        assert!((engine.getvar(V::lat(2).unwrap()).unwrap() - 3.52).abs() < 1e-3);
        assert!(engine.getrw() < 1e-2);
    }

    #[test]
    fn refine_without_observed_data_is_unassigned() {
        let mut engine = engine_with_structure();
        engine.alloc(&grid(1.0, 5.0, 50)).unwrap();
        assert!(engine.refine_step(1e-8).unwrap_err().is_unassigned());
    }

    #[test]
    fn phase_and_dataset_selection() {
        let mut engine = engine_with_structure();
        engine.read_struct_string(NICKEL).unwrap();
        assert_eq!(engine.current_phase(), Some(2));
        engine.setphase(1).unwrap();
        assert_eq!(engine.current_phase(), Some(1));
        assert!(engine.setphase(3).unwrap_err().is_unassigned());
        assert!(engine.psel(Selector::All).unwrap_err().is_unassigned());

        engine.alloc(&grid(1.0, 5.0, 50)).unwrap();
        engine.pdesel(Selector::Index(2)).unwrap();
        engine.calc().unwrap();
        let single = engine.getpdf_fit(1).unwrap();
        engine.psel(Selector::All).unwrap();
        engine.calc().unwrap();
        let double = engine.getpdf_fit(1).unwrap();
        for (s, d) in single.iter().zip(&double) {
            assert!((2.0 * s - d).abs() < 1e-9);
        }
    }

    #[test]
    fn type_selection_validates_elements() {
        let mut engine = engine_with_structure();
        engine.idesel(Selector::All, "ni").unwrap();
        assert!(!engine.phase(1).unwrap().is_type_selected(PairEnd::First, "Ni"));
        engine.isel(Selector::Index(1), "ALL").unwrap();
        assert!(engine.phase(1).unwrap().is_type_selected(PairEnd::First, "Ni"));
        assert!(engine.jsel(Selector::Index(1), "O").unwrap_err().is_value());
    }

    #[test]
    fn geometry_queries_use_periodic_images() {
        let engine = engine_with_structure();
        let nn = 3.52 / 2f64.sqrt();
        assert!((engine.blen(1, 2).unwrap() - nn).abs() < 1e-9);
        assert!((engine.blen(1, 1).unwrap() - 3.52).abs() < 1e-9);
        assert!((engine.bang(2, 1, 3).unwrap() - 60.0).abs() < 1e-6);
        let bonds = engine.blen_range("Ni", "ALL", 2.0, 2.6).unwrap();
        // 4 atoms x 12 neighbours, each pair listed once.
        assert_eq!(bonds.len(), 24);
        assert!(bonds.iter().all(|b| (b.distance - nn).abs() < 1e-9));
    }

    #[test]
    fn geometry_queries_reject_flat_cells_and_huge_ranges() {
        let mut engine = engine_with_structure();
        assert!(engine.blen_range("ALL", "ALL", 0.0, 1e9).unwrap_err().is_value());
        engine.setvar(V::lat(1).unwrap(), 0.0).unwrap();
        assert!(engine.blen(1, 2).unwrap_err().is_structure());
        assert!(engine.bang(2, 1, 3).unwrap_err().is_structure());
        assert!(engine.blen_range("Ni", "Ni", 0.0, 3.0).unwrap_err().is_structure());
    }

    #[test]
    fn variables_only_take_finite_values() {
        let mut engine = engine_with_structure();
        assert!(engine.setvar(V::pscale(), f64::NAN).unwrap_err().is_value());
        assert!(engine.setvar(V::lat(1).unwrap(), f64::INFINITY).unwrap_err().is_value());
        assert_eq!(engine.getvar(V::pscale()).unwrap(), 1.0);
    }

    #[test]
    fn scattering_overrides_are_per_phase() {
        let mut engine = engine_with_structure();
        let before = engine.show_scat(ScatteringType::Xray).unwrap();
        assert!(before.contains("28.000000"));
        engine.set_scat(ScatteringType::Xray, "Ni", 25.0).unwrap();
        assert!(engine.show_scat(ScatteringType::Xray).unwrap().contains("25.000000"));
        engine.reset_scat("Ni").unwrap();
        assert!(engine.show_scat(ScatteringType::Xray).unwrap().contains("28.000000"));
        assert!(engine.set_scat(ScatteringType::Xray, "Fe", 1.0).unwrap_err().is_value());
        assert!(engine.reset_scat("Fe").unwrap_err().is_value());
    }

    #[test]
    fn saved_outputs_are_returned_and_written() {
        let dir = tempdir().unwrap();
        let mut engine = engine_with_structure();
        engine.alloc(&grid(1.0, 5.0, 50)).unwrap();
        assert!(engine.save_pdf(1, None).unwrap_err().is_unassigned());
        engine.calc().unwrap();

        let path = dir.path().join("ni.fgr");
        let text = engine.save_pdf(1, Some(&path)).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), text);
        let (columns, _) = DataFile::read_from_str(&text).unwrap();
        assert_eq!(columns.len(), 50);

        let stru = engine.save_struct(1, None).unwrap();
        let mut other = MemoryEngine::new();
        other.read_struct_string(&stru).unwrap();
        assert_eq!(other.num_atoms(1).unwrap(), 4);

        let res = engine.save_res(None).unwrap();
        assert!(res.contains("Phase 1 (Ni)"));
    }

    #[test]
    fn reset_clears_everything() {
        let mut engine = synthetic_fit(3.52, 3.50);
        engine.reset();
        assert_eq!(engine.num_phases(), 0);
        assert_eq!(engine.num_datasets(), 0);
        assert!(engine.constraints().is_empty());
        assert!(engine.getpar(1).unwrap_err().is_value());
    }
}
