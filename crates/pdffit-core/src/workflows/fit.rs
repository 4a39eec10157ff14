use super::session::SessionState;
use crate::core::address::{IntoAddress, VariableAddress};
use crate::core::formula::Formula;
use crate::core::scattering::ScatteringType;
use crate::core::selection::IntoSelector;
use crate::engine::config::{CalculationConfig, CalculationConfigBuilder};
use crate::engine::constraints::{ConstraintMode, ConstraintTarget};
use crate::engine::error::FitError;
use crate::engine::memory::MemoryEngine;
use crate::engine::state::RefinementState;
use crate::engine::traits::{BondLength, DataSpec, Engine};
use std::path::Path;
use tracing::{debug, info};

/// A fitting session: one engine plus the bookkeeping around it.
///
/// Every method validates what it can locally (address syntax, selector
/// aliases, formula syntax) before calling into the engine, so misuse of
/// that kind never reaches engine state. Indices are 1-based throughout.
#[derive(Debug, Clone)]
pub struct PdfFit<E: Engine = MemoryEngine> {
    pub(super) engine: E,
    pub(super) session: SessionState,
}

impl PdfFit<MemoryEngine> {
    pub fn new() -> Self {
        Self::with_engine(MemoryEngine::new())
    }
}

impl Default for PdfFit<MemoryEngine> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: Engine> PdfFit<E> {
    pub fn with_engine(engine: E) -> Self {
        Self {
            engine,
            session: SessionState::new(),
        }
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    pub fn into_engine(self) -> E {
        self.engine
    }

    pub fn session(&self) -> &SessionState {
        &self.session
    }

    pub fn refinement_state(&self) -> RefinementState {
        self.session.refinement_state()
    }

    /// Discards every structure, dataset, parameter and constraint.
    pub fn reset(&mut self) {
        self.engine.reset();
        self.session.reset();
        info!("Session reset.");
    }

    // --- Loading ---

    /// Loads a structure file as a new phase; returns its index.
    pub fn read_struct(&mut self, path: impl AsRef<Path>) -> Result<usize, FitError> {
        let path = path.as_ref();
        self.engine.read_struct(path)?;
        Ok(self.session.add_structure(path.display().to_string()))
    }

    /// Loads structure text as a new phase, recorded as `name` (or the
    /// structure title when `name` is empty).
    pub fn read_struct_string(&mut self, text: &str, name: &str) -> Result<usize, FitError> {
        let title = self.engine.read_struct_string(text)?;
        let name = if name.is_empty() { title } else { name.to_string() };
        Ok(self.session.add_structure(name))
    }

    /// Loads a data file as a new dataset; returns its index.
    pub fn read_data(
        &mut self,
        path: impl AsRef<Path>,
        stype: ScatteringType,
        qmax: f64,
        qsig: f64,
    ) -> Result<usize, FitError> {
        let path = path.as_ref();
        self.engine
            .read_data(path, DataSpec::new(stype, qmax, qsig))?;
        Ok(self.session.add_dataset(path.display().to_string()))
    }

    pub fn read_data_string(
        &mut self,
        text: &str,
        stype: ScatteringType,
        qmax: f64,
        qsig: f64,
        name: &str,
    ) -> Result<usize, FitError> {
        self.engine
            .read_data_string(text, DataSpec::new(stype, qmax, qsig), name)?;
        Ok(self.session.add_dataset(name))
    }

    /// Loads a dataset from in-memory columns. `dg` may be omitted.
    #[allow(clippy::too_many_arguments)]
    pub fn read_data_lists(
        &mut self,
        stype: ScatteringType,
        qmax: f64,
        qsig: f64,
        r: &[f64],
        g: &[f64],
        dg: Option<&[f64]>,
        name: &str,
    ) -> Result<usize, FitError> {
        if r.len() != g.len() || dg.is_some_and(|dg| dg.len() != r.len()) {
            return Err(FitError::value(format!(
                "column lengths differ: r={}, G={}, dG={}",
                r.len(),
                g.len(),
                dg.map_or(r.len(), <[f64]>::len)
            )));
        }
        self.engine
            .read_data_arrays(DataSpec::new(stype, qmax, qsig), r, g, dg, name)?;
        Ok(self.session.add_dataset(name))
    }

    // --- Calculation ---

    /// Creates a calculation-only dataset with `bins` points spanning
    /// `[rmin, rmax]` inclusively.
    pub fn alloc(
        &mut self,
        stype: ScatteringType,
        qmax: f64,
        qsig: f64,
        rmin: f64,
        rmax: f64,
        bins: usize,
    ) -> Result<usize, FitError> {
        let config = CalculationConfigBuilder::new()
            .stype(stype)
            .qmax(qmax)
            .qsig(qsig)
            .rmin(rmin)
            .rmax(rmax)
            .bins(bins)
            .build()?;
        self.alloc_with(&config)
    }

    pub fn alloc_with(&mut self, config: &CalculationConfig) -> Result<usize, FitError> {
        self.engine.alloc(config)?;
        let index = self.engine.num_datasets();
        Ok(self.session.add_dataset(format!("calc {}", index)))
    }

    pub fn calc(&mut self) -> Result<(), FitError> {
        self.engine.calc()
    }

    /// Restricts the fit range of a dataset (or `"ALL"`).
    pub fn pdfrange(&mut self, iset: impl IntoSelector, rmin: f64, rmax: f64) -> Result<(), FitError> {
        let selector = iset.into_selector()?;
        self.engine.pdfrange(selector, rmin, rmax)
    }

    // --- Constraints ---

    /// Binds a variable to a parameter slot (identity) or a formula
    /// (formula component).
    pub fn constrain(
        &mut self,
        address: impl IntoAddress,
        target: impl Into<ConstraintTarget>,
    ) -> Result<(), FitError> {
        self.bind(address, target.into(), None)
    }

    /// Binds with an explicit mode, whatever the target's shape.
    pub fn constrain_with_mode(
        &mut self,
        address: impl IntoAddress,
        target: impl Into<ConstraintTarget>,
        mode: ConstraintMode,
    ) -> Result<(), FitError> {
        self.bind(address, target.into(), Some(mode))
    }

    pub fn bind_by_slot(&mut self, address: impl IntoAddress, slot: usize) -> Result<(), FitError> {
        self.bind(address, ConstraintTarget::Slot(slot), None)
    }

    pub fn bind_by_formula(&mut self, address: impl IntoAddress, formula: &str) -> Result<(), FitError> {
        self.bind(address, ConstraintTarget::Formula(formula.to_string()), None)
    }

    fn bind(
        &mut self,
        address: impl IntoAddress,
        target: ConstraintTarget,
        mode: Option<ConstraintMode>,
    ) -> Result<(), FitError> {
        let address = address.into_address()?;
        match &target {
            ConstraintTarget::Slot(0) => {
                return Err(FitError::Constraint(
                    "parameter slots are numbered from 1".to_string(),
                ));
            }
            ConstraintTarget::Formula(text) => {
                Formula::parse(text)?;
            }
            ConstraintTarget::Slot(_) => {}
        }
        debug!(%address, ?target, ?mode, "Binding variable.");
        self.engine.constrain(address, target, mode)
    }

    // --- Parameters and variables ---

    pub fn set_parameter(&mut self, slot: usize, value: f64) -> Result<(), FitError> {
        self.engine.setpar(slot, value)
    }

    /// Makes `slot` track the current value of a variable until the slot
    /// is next set numerically or a calculation materializes it.
    pub fn set_parameter_from_variable(
        &mut self,
        slot: usize,
        address: impl IntoAddress,
    ) -> Result<(), FitError> {
        let address = address.into_address()?;
        self.engine.setpar_from_variable(slot, address)
    }

    /// Sets a parameter from text: a number if it parses as one, otherwise
    /// a variable reference such as `"lat(1)"`.
    pub fn set_parameter_str(&mut self, slot: usize, text: &str) -> Result<(), FitError> {
        match text.trim().parse::<f64>() {
            Ok(value) => self.set_parameter(slot, value),
            Err(_) => self.set_parameter_from_variable(slot, text),
        }
    }

    pub fn get_parameter(&self, slot: usize) -> Result<f64, FitError> {
        self.engine.getpar(slot)
    }

    pub fn set_variable(&mut self, address: impl IntoAddress, value: f64) -> Result<(), FitError> {
        let address = address.into_address()?;
        self.engine.setvar(address, value)
    }

    pub fn get_variable(&self, address: impl IntoAddress) -> Result<f64, FitError> {
        let address = address.into_address()?;
        self.engine.getvar(address)
    }

    pub fn fix(&mut self, selector: impl IntoSelector) -> Result<(), FitError> {
        let selector = selector.into_selector()?;
        self.engine.fixpar(selector)
    }

    pub fn free(&mut self, selector: impl IntoSelector) -> Result<(), FitError> {
        let selector = selector.into_selector()?;
        self.engine.freepar(selector)
    }

    pub fn free_parameters(&self) -> Vec<usize> {
        self.engine.free_parameters()
    }

    /// Weighted agreement factor of the active dataset. Always readable;
    /// 0 before any calculation.
    pub fn rw(&self) -> f64 {
        self.engine.getrw()
    }

    // --- Selection ---

    pub fn set_phase(&mut self, ip: usize) -> Result<(), FitError> {
        self.engine.setphase(ip)
    }

    pub fn set_dataset(&mut self, iset: usize) -> Result<(), FitError> {
        self.engine.setdata(iset)
    }

    pub fn current_phase(&self) -> Option<usize> {
        self.engine.current_phase()
    }

    pub fn current_dataset(&self) -> Option<usize> {
        self.engine.current_dataset()
    }

    pub fn psel(&mut self, ip: impl IntoSelector) -> Result<(), FitError> {
        self.engine.psel(ip.into_selector()?)
    }

    pub fn pdesel(&mut self, ip: impl IntoSelector) -> Result<(), FitError> {
        self.engine.pdesel(ip.into_selector()?)
    }

    pub fn isel(&mut self, ip: impl IntoSelector, element: &str) -> Result<(), FitError> {
        self.engine.isel(ip.into_selector()?, element)
    }

    pub fn idesel(&mut self, ip: impl IntoSelector, element: &str) -> Result<(), FitError> {
        self.engine.idesel(ip.into_selector()?, element)
    }

    pub fn jsel(&mut self, ip: impl IntoSelector, element: &str) -> Result<(), FitError> {
        self.engine.jsel(ip.into_selector()?, element)
    }

    pub fn jdesel(&mut self, ip: impl IntoSelector, element: &str) -> Result<(), FitError> {
        self.engine.jdesel(ip.into_selector()?, element)
    }

    // --- Queries ---

    pub fn get_r(&self, iset: usize) -> Result<Vec<f64>, FitError> {
        self.engine.get_r(iset)
    }

    pub fn get_pdf_fit(&self, iset: usize) -> Result<Vec<f64>, FitError> {
        self.engine.getpdf_fit(iset)
    }

    pub fn get_pdf_obs(&self, iset: usize) -> Result<Vec<f64>, FitError> {
        self.engine.getpdf_obs(iset)
    }

    pub fn get_atoms(&self, ip: usize) -> Result<Vec<String>, FitError> {
        self.engine.get_atoms(ip)
    }

    pub fn num_atoms(&self, ip: usize) -> Result<usize, FitError> {
        self.engine.num_atoms(ip)
    }

    /// Element and `(a·x, b·y, c·z)` of every atom in the active phase.
    pub fn get_xyz(&self) -> Result<Vec<(String, [f64; 3])>, FitError> {
        let ip = self
            .current_phase()
            .ok_or_else(|| FitError::unassigned("no structure has been loaded"))?;
        let lengths = [
            self.engine.getvar(VariableAddress::lat(1)?)?,
            self.engine.getvar(VariableAddress::lat(2)?)?,
            self.engine.getvar(VariableAddress::lat(3)?)?,
        ];
        self.get_atoms(ip)?
            .into_iter()
            .enumerate()
            .map(|(i, element)| -> Result<(String, [f64; 3]), FitError> {
                let n = i + 1;
                let xyz = [
                    self.engine.getvar(VariableAddress::x(n)?)? * lengths[0],
                    self.engine.getvar(VariableAddress::y(n)?)? * lengths[1],
                    self.engine.getvar(VariableAddress::z(n)?)? * lengths[2],
                ];
                Ok((element, xyz))
            })
            .collect()
    }

    pub fn bang(&self, i: usize, j: usize, k: usize) -> Result<f64, FitError> {
        self.engine.bang(i, j, k)
    }

    pub fn blen(&self, i: usize, j: usize) -> Result<f64, FitError> {
        self.engine.blen(i, j)
    }

    pub fn blen_range(
        &self,
        first: &str,
        second: &str,
        lower: f64,
        upper: f64,
    ) -> Result<Vec<BondLength>, FitError> {
        self.engine.blen_range(first, second, lower, upper)
    }

    // --- Scattering factors ---

    pub fn show_scat(&self, stype: ScatteringType) -> Result<String, FitError> {
        self.engine.show_scat(stype)
    }

    pub fn set_scat(&mut self, stype: ScatteringType, element: &str, value: f64) -> Result<(), FitError> {
        self.engine.set_scat(stype, element, value)
    }

    pub fn reset_scat(&mut self, element: &str) -> Result<(), FitError> {
        self.engine.reset_scat(element)
    }

    // --- Output ---

    pub fn save_pdf(&self, iset: usize, path: impl AsRef<Path>) -> Result<(), FitError> {
        self.engine.save_pdf(iset, Some(path.as_ref())).map(drop)
    }

    pub fn save_pdf_string(&self, iset: usize) -> Result<String, FitError> {
        self.engine.save_pdf(iset, None)
    }

    pub fn save_dif(&self, iset: usize, path: impl AsRef<Path>) -> Result<(), FitError> {
        self.engine.save_dif(iset, Some(path.as_ref())).map(drop)
    }

    pub fn save_dif_string(&self, iset: usize) -> Result<String, FitError> {
        self.engine.save_dif(iset, None)
    }

    pub fn save_res(&self, path: impl AsRef<Path>) -> Result<(), FitError> {
        self.engine.save_res(Some(path.as_ref())).map(drop)
    }

    pub fn save_res_string(&self) -> Result<String, FitError> {
        self.engine.save_res(None)
    }

    pub fn save_struct(&self, ip: usize, path: impl AsRef<Path>) -> Result<(), FitError> {
        self.engine.save_struct(ip, Some(path.as_ref())).map(drop)
    }

    pub fn save_struct_string(&self, ip: usize) -> Result<String, FitError> {
        self.engine.save_struct(ip, None)
    }

    /// Structure text of phase `ip`, in the same format `read_struct` takes.
    pub fn show_struct(&self, ip: usize) -> Result<String, FitError> {
        self.save_struct_string(ip)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::selection::ALL;
    use crate::engine::constraints::ScopedVariable;
    use crate::engine::error::ErrorKind;
    use tempfile::tempdir;

    const TOLERANCE: f64 = 1e-9;

    const ROCKSALT: &str = r#"
title = "NiO"

[lattice]
a = 4.17
b = 4.17
c = 4.17
alpha = 90.0
beta = 90.0
gamma = 90.0

[[atom]]
element = "Ni"
xyz = [0.0, 0.0, 0.0]
uiso = 0.006

[[atom]]
element = "O"
xyz = [0.5, 0.5, 0.5]
uiso = 0.008
"#;

    fn loaded() -> PdfFit {
        let mut fit = PdfFit::new();
        fit.read_struct_string(ROCKSALT, "").unwrap();
        fit
    }

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < TOLERANCE
    }

    #[test]
    fn alloc_calc_gives_400_equidistant_points() {
        let mut fit = loaded();
        fit.alloc(ScatteringType::Xray, 30.0, 0.0, 1.0, 20.0, 400)
            .unwrap();
        fit.calc().unwrap();
        let r = fit.get_r(1).unwrap();
        assert_eq!(r.len(), 400);
        assert!(close(r[0], 1.0));
        assert!(close(r[399], 20.0));
        let dr = r[1] - r[0];
        assert!(r.windows(2).all(|w| close(w[1] - w[0], dr)));
    }

    #[test]
    fn alloc_rejects_bad_grids_before_the_engine() {
        let mut fit = loaded();
        let err = fit
            .alloc(ScatteringType::Xray, 30.0, 0.0, 5.0, 1.0, 400)
            .unwrap_err();
        assert!(matches!(err, FitError::Config(_)));
        assert_eq!(fit.engine().num_datasets(), 0);
    }

    #[test]
    fn constrain_then_set_parameter_updates_the_variable() {
        let mut fit = loaded();
        fit.constrain(VariableAddress::x(1).unwrap(), 1usize).unwrap();
        fit.set_parameter(1, 0.5).unwrap();
        assert!(close(fit.get_variable("x(1)").unwrap(), 0.5));
    }

    #[test]
    fn default_modes_follow_the_target() {
        let mut fit = loaded();
        fit.constrain("x(2)", "0.5+@1").unwrap();
        fit.constrain("y(2)", 1usize).unwrap();
        let bindings = fit.engine().constraints();
        let x2 = ScopedVariable::phase(VariableAddress::x(2).unwrap(), 1);
        let y2 = ScopedVariable::phase(VariableAddress::y(2).unwrap(), 1);
        assert_eq!(bindings.get(&x2).unwrap().mode, ConstraintMode::FComp);
        assert_eq!(bindings.get(&y2).unwrap().mode, ConstraintMode::Ident);
    }

    #[test]
    fn explicit_mode_wins() {
        let mut fit = loaded();
        fit.constrain_with_mode("pscale", 2usize, ConstraintMode::FSqr)
            .unwrap();
        fit.set_parameter(2, 0.9).unwrap();
        assert!(close(fit.get_variable("pscale").unwrap(), 0.81));
    }

    #[test]
    fn named_bind_operations() {
        let mut fit = loaded();
        fit.bind_by_slot("u11(1)", 3).unwrap();
        fit.bind_by_formula("u22(1)", "@3 * 2").unwrap();
        fit.set_parameter(3, 0.01).unwrap();
        assert!(close(fit.get_variable("u22(1)").unwrap(), 0.02));
    }

    #[test]
    fn callable_addresses_are_invoked() {
        let mut fit = loaded();
        fit.constrain(VariableAddress::pscale, 4usize).unwrap();
        fit.set_parameter(4, 0.7).unwrap();
        assert!(close(fit.get_variable(VariableAddress::pscale).unwrap(), 0.7));
    }

    #[test]
    fn malformed_bindings_fail_locally() {
        let mut fit = loaded();
        let err = fit.constrain("x(1)", "0.5 +").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Constraint);
        let err = fit.constrain("x(1)", "0.5").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Constraint);
        let err = fit.constrain("x(1)", 0usize).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Constraint);
        let err = fit.constrain("x(1", 1usize).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Reference);
        let err = fit.constrain("lat(7)", 1usize).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Value);
        assert!(fit.engine().constraints().is_empty());
    }

    #[test]
    fn fix_all_then_free_one() {
        let mut fit = loaded();
        for slot in 1..=3 {
            fit.set_parameter(slot, 1.0).unwrap();
        }
        fit.fix("ALL").unwrap();
        fit.free(2).unwrap();
        assert_eq!(fit.free_parameters(), vec![2]);
        fit.free(ALL).unwrap();
        assert_eq!(fit.free_parameters(), vec![1, 2, 3]);
        assert!(fit.fix(9usize).unwrap_err().is_unassigned());
        assert!(fit.free("all but one").unwrap_err().is_value());
    }

    #[test]
    fn parameters_set_from_a_variable_follow_it() {
        let mut fit = loaded();
        fit.set_parameter_str(5, "lat(1)").unwrap();
        assert!(close(fit.get_parameter(5).unwrap(), 4.17));
        fit.set_variable("a", 4.20).unwrap();
        assert!(close(fit.get_parameter(5).unwrap(), 4.20));
        fit.set_parameter_str(5, " 1.5 ").unwrap();
        fit.set_variable("a", 4.30).unwrap();
        assert!(close(fit.get_parameter(5).unwrap(), 1.5));
        assert!(fit.set_parameter_str(6, "x(3)").unwrap_err().is_unassigned());
        assert!(fit.get_parameter(6).unwrap_err().is_value());
    }

    #[test]
    fn variables_report_scope_and_range_errors() {
        let mut fit = PdfFit::new();
        assert!(fit.get_variable("x(1)").unwrap_err().is_unassigned());
        fit.read_struct_string(ROCKSALT, "nio").unwrap();
        assert!(fit.set_variable("x(3)", 0.1).unwrap_err().is_value());
        assert!(fit.get_variable("qsig").unwrap_err().is_unassigned());
    }

    #[test]
    fn get_xyz_scales_by_cell_lengths() {
        let fit = loaded();
        let xyz = fit.get_xyz().unwrap();
        assert_eq!(xyz.len(), 2);
        assert_eq!(xyz[1].0, "O");
        assert!(xyz[1].1.iter().all(|&c| close(c, 2.085)));
    }

    #[test]
    fn session_records_names_and_reset_clears_them() {
        let mut fit = PdfFit::new();
        assert_eq!(fit.read_struct_string(ROCKSALT, "").unwrap(), 1);
        assert_eq!(fit.read_struct_string(ROCKSALT, "second").unwrap(), 2);
        assert_eq!(fit.session().structures(), ["NiO", "second"]);
        fit.read_data_lists(
            ScatteringType::Xray,
            30.0,
            0.0,
            &[1.0, 1.1, 1.2],
            &[0.0, 0.1, 0.2],
            None,
            "lists",
        )
        .unwrap();
        assert_eq!(fit.session().datasets(), ["lists"]);
        fit.reset();
        assert!(fit.session().structures().is_empty());
        assert_eq!(fit.engine().num_phases(), 0);
        assert_eq!(fit.rw(), 0.0);
    }

    #[test]
    fn mismatched_lists_are_rejected() {
        let mut fit = loaded();
        let err = fit
            .read_data_lists(
                ScatteringType::Neutron,
                30.0,
                0.0,
                &[1.0, 1.1],
                &[0.0],
                None,
                "bad",
            )
            .unwrap_err();
        assert!(err.is_value());
        assert!(fit.session().datasets().is_empty());
    }

    #[test]
    fn outputs_round_trip_through_files() {
        let dir = tempdir().unwrap();
        let mut fit = loaded();
        fit.alloc(ScatteringType::Neutron, 30.0, 0.0, 1.0, 10.0, 91)
            .unwrap();
        fit.calc().unwrap();

        let pdf = dir.path().join("nio.fgr");
        fit.save_pdf(1, &pdf).unwrap();
        fit.read_data(&pdf, ScatteringType::Neutron, 30.0, 0.0)
            .unwrap();
        assert_eq!(fit.current_dataset(), Some(2));
        fit.calc().unwrap();
        assert!(fit.rw() < 1e-6);

        let stru = dir.path().join("nio.toml");
        fit.save_struct(1, &stru).unwrap();
        assert_eq!(fit.read_struct(&stru).unwrap(), 2);
        assert_eq!(fit.show_struct(2).unwrap(), fit.save_struct_string(1).unwrap());
        assert!(fit.save_res_string().unwrap().contains("dataset 2"));
    }

    #[test]
    fn partial_pdfs_through_type_selection() {
        let mut fit = loaded();
        fit.alloc(ScatteringType::Neutron, 30.0, 0.0, 1.5, 6.0, 100)
            .unwrap();
        fit.idesel(1, "ALL").unwrap();
        fit.jdesel(1, "ALL").unwrap();
        fit.isel(1, "Ni").unwrap();
        fit.jsel(1, "O").unwrap();
        fit.calc().unwrap();
        let r = fit.get_r(1).unwrap();
        let g = fit.get_pdf_fit(1).unwrap();
        // Only Ni-O pairs remain, so nothing peaks at the Ni-Ni distance.
        let nini = 4.17 / 2f64.sqrt();
        let at = r.iter().position(|&x| x >= nini).unwrap();
        let nio = 4.17 / 2.0;
        let peak = r.iter().position(|&x| x >= nio).unwrap();
        assert!(g[peak] > g[at]);
    }
}
