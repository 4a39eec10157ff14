use super::config::CalculationConfig;
use super::constraints::{ConstraintMode, ConstraintTarget};
use super::error::FitError;
use crate::core::address::VariableAddress;
use crate::core::scattering::ScatteringType;
use crate::core::selection::Selector;
use std::fmt;
use std::path::Path;

/// Radiation and resolution of a dataset being loaded.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DataSpec {
    pub stype: ScatteringType,
    pub qmax: f64,
    pub qsig: f64,
}

impl DataSpec {
    pub fn new(stype: ScatteringType, qmax: f64, qsig: f64) -> Self {
        Self { stype, qmax, qsig }
    }
}

/// One interatomic distance reported by `blen_range`.
#[derive(Debug, Clone, PartialEq)]
pub struct BondLength {
    pub first: usize,
    pub second: usize,
    pub first_element: String,
    pub second_element: String,
    pub distance: f64,
}

impl fmt::Display for BondLength {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({:>3}) - {} ({:>3}) = {:8.4} A",
            self.first_element, self.first, self.second_element, self.second, self.distance
        )
    }
}

/// The computational engine behind a fitting session.
///
/// All indices are 1-based. "Active" phase and dataset refer to the last
/// ones loaded or selected with [`Engine::setphase`] / [`Engine::setdata`];
/// phase- and dataset-scoped variables resolve against them.
///
/// Persistence methods return the rendered text and also write it when a
/// destination is given.
pub trait Engine {
    /// Drops every phase, dataset, parameter and constraint.
    fn reset(&mut self);

    /// Loads a structure file as a new phase and makes it active. Returns
    /// the structure title.
    fn read_struct(&mut self, path: &Path) -> Result<String, FitError>;
    fn read_struct_string(&mut self, text: &str) -> Result<String, FitError>;

    /// Loads a data file as a new dataset and makes it active.
    fn read_data(&mut self, path: &Path, spec: DataSpec) -> Result<(), FitError>;
    fn read_data_string(&mut self, text: &str, spec: DataSpec, name: &str) -> Result<(), FitError>;
    fn read_data_arrays(
        &mut self,
        spec: DataSpec,
        r: &[f64],
        g: &[f64],
        dg: Option<&[f64]>,
        name: &str,
    ) -> Result<(), FitError>;

    /// Creates a calculation-only dataset on the given grid. Requires a
    /// loaded structure.
    fn alloc(&mut self, config: &CalculationConfig) -> Result<(), FitError>;
    /// Applies constraints and recalculates every dataset.
    fn calc(&mut self) -> Result<(), FitError>;
    fn pdfrange(&mut self, iset: Selector, rmin: f64, rmax: f64) -> Result<(), FitError>;

    /// One refinement iteration; returns `true` once converged.
    fn refine_step(&mut self, tolerance: f64) -> Result<bool, FitError>;

    fn constrain(
        &mut self,
        address: VariableAddress,
        target: ConstraintTarget,
        mode: Option<ConstraintMode>,
    ) -> Result<(), FitError>;
    fn setpar(&mut self, slot: usize, value: f64) -> Result<(), FitError>;
    fn setpar_from_variable(&mut self, slot: usize, address: VariableAddress) -> Result<(), FitError>;
    fn setvar(&mut self, address: VariableAddress, value: f64) -> Result<(), FitError>;
    fn getvar(&self, address: VariableAddress) -> Result<f64, FitError>;
    fn getpar(&self, slot: usize) -> Result<f64, FitError>;
    fn fixpar(&mut self, selector: Selector) -> Result<(), FitError>;
    fn freepar(&mut self, selector: Selector) -> Result<(), FitError>;
    /// Slots the least-squares step may currently vary.
    fn free_parameters(&self) -> Vec<usize>;

    fn setphase(&mut self, ip: usize) -> Result<(), FitError>;
    fn setdata(&mut self, iset: usize) -> Result<(), FitError>;
    fn current_phase(&self) -> Option<usize>;
    fn current_dataset(&self) -> Option<usize>;
    fn num_phases(&self) -> usize;
    fn num_datasets(&self) -> usize;

    /// Includes phases in the total PDF of the active dataset.
    fn psel(&mut self, ip: Selector) -> Result<(), FitError>;
    fn pdesel(&mut self, ip: Selector) -> Result<(), FitError>;
    /// Includes an atom type (or `"ALL"`) at the first end of counted pairs.
    fn isel(&mut self, ip: Selector, element: &str) -> Result<(), FitError>;
    fn idesel(&mut self, ip: Selector, element: &str) -> Result<(), FitError>;
    /// Same as [`Engine::isel`] for the second end of counted pairs.
    fn jsel(&mut self, ip: Selector, element: &str) -> Result<(), FitError>;
    fn jdesel(&mut self, ip: Selector, element: &str) -> Result<(), FitError>;

    /// Rw of the active dataset; 0 before any calculation.
    fn getrw(&self) -> f64;
    fn get_r(&self, iset: usize) -> Result<Vec<f64>, FitError>;
    fn getpdf_fit(&self, iset: usize) -> Result<Vec<f64>, FitError>;
    fn getpdf_obs(&self, iset: usize) -> Result<Vec<f64>, FitError>;
    fn get_atoms(&self, ip: usize) -> Result<Vec<String>, FitError>;
    fn num_atoms(&self, ip: usize) -> Result<usize, FitError>;

    /// Bond angle i-j-k in degrees, nearest images, active phase.
    fn bang(&self, i: usize, j: usize, k: usize) -> Result<f64, FitError>;
    /// Shortest periodic distance between atoms i and j, active phase.
    fn blen(&self, i: usize, j: usize) -> Result<f64, FitError>;
    /// Every distance in `[lower, upper]` between atoms of the two types
    /// (element names or `"ALL"`), active phase.
    fn blen_range(
        &self,
        first: &str,
        second: &str,
        lower: f64,
        upper: f64,
    ) -> Result<Vec<BondLength>, FitError>;

    /// Scattering factors of the active phase's atom types.
    fn show_scat(&self, stype: ScatteringType) -> Result<String, FitError>;
    fn set_scat(&mut self, stype: ScatteringType, element: &str, value: f64) -> Result<(), FitError>;
    fn reset_scat(&mut self, element: &str) -> Result<(), FitError>;

    fn save_pdf(&self, iset: usize, destination: Option<&Path>) -> Result<String, FitError>;
    fn save_dif(&self, iset: usize, destination: Option<&Path>) -> Result<String, FitError>;
    fn save_res(&self, destination: Option<&Path>) -> Result<String, FitError>;
    fn save_struct(&self, ip: usize, destination: Option<&Path>) -> Result<String, FitError>;
}
