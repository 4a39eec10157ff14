//! Pair distribution function of a periodic structure.
//!
//! The model is a sum of Gaussian peaks, one per atom pair within the
//! calculation cutoff, normalized per atom and weighted by the scattering
//! factors:
//!
//! ```text
//! R(r) = 1/N sum_ij (c_i c_j / <c>^2) gauss(r; d_ij, s_ij)
//! G(r) = [R(r)/r - 4 pi rho0 r f] exp(-(qsig r)^2 / 2) * pscale
//! ```
//!
//! where `c_i = occ_i b_i`, `f` is the selected fraction of the pair
//! weight, and the peak width `s_ij` is projected from the displacement
//! tensors and sharpened with `delta`, `gamma`, `qalp` and `srat`.

use crate::core::models::dataset::DatasetParameters;
use crate::core::models::phase::Phase;
use crate::core::models::structure::StructureError;
use crate::core::utils::geometry::{GeometryError, translation_bounds, translations};
use nalgebra::{Matrix3, Vector3};
use std::f64::consts::PI;
use thiserror::Error;
use tracing::{debug, instrument};

#[cfg(feature = "parallel")]
use rayon::prelude::*;

/// Peaks are summed out to this many standard deviations.
const PEAK_EXTENT: f64 = 5.0;
/// Minimum margin added to `rmax` when collecting pairs.
const MIN_CUTOFF_MARGIN: f64 = 3.0;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum PdfError {
    #[error("Structure has no atoms")]
    NoAtoms,
    #[error("No scattering factor for element '{0}'")]
    UnknownScatterer(String),
    #[error("Average scattering factor is zero")]
    ZeroScattering,
    #[error("Peak width for atoms {first} and {second} at r = {distance:.4} is not positive (s^2 = {width2:.4e})")]
    NonPositiveWidth {
        first: usize,
        second: usize,
        distance: f64,
        width2: f64,
    },
    #[error(transparent)]
    Structure(#[from] StructureError),
    #[error(transparent)]
    Geometry(#[from] GeometryError),
}

struct Site {
    element: String,
    cartesian: Vector3<f64>,
    u: Matrix3<f64>,
    weight: f64,
}

/// Everything needed to sum the peaks of one phase on one grid.
struct PhaseCalculation<'a> {
    phase: &'a Phase,
    data: &'a DatasetParameters,
    r: &'a [f64],
    sites: Vec<Site>,
    lattice_matrix: Matrix3<f64>,
    cutoff: f64,
    bounds: [i32; 3],
    norm: f64,
}

impl<'a> PhaseCalculation<'a> {
    fn new(phase: &'a Phase, data: &'a DatasetParameters, r: &'a [f64]) -> Result<Self, PdfError> {
        let structure = &phase.structure;
        structure.validate()?;
        if structure.atoms.is_empty() {
            return Err(PdfError::NoAtoms);
        }

        let lattice_matrix = structure.lattice.matrix();
        let mut sites = Vec::with_capacity(structure.num_atoms());
        for atom in &structure.atoms {
            let b = phase
                .scattering_factor(&atom.element, data.stype)
                .ok_or_else(|| PdfError::UnknownScatterer(atom.element.clone()))?;
            sites.push(Site {
                element: atom.element.clone(),
                cartesian: lattice_matrix * atom.position,
                u: atom.u_tensor(),
                weight: atom.occupancy * b,
            });
        }

        let total_occupancy: f64 = structure.atoms.iter().map(|a| a.occupancy).sum();
        let total_weight: f64 = sites.iter().map(|s| s.weight).sum();
        if total_occupancy == 0.0 || total_weight == 0.0 {
            return Err(PdfError::ZeroScattering);
        }
        let average = total_weight / total_occupancy;

        let widest = structure
            .atoms
            .iter()
            .flat_map(|a| a.u[..3].iter().copied())
            .fold(0.0_f64, f64::max);
        let sigma_estimate = (2.0 * widest).sqrt() * phase.params.srat.abs().max(1.0);
        let rmax = r.last().copied().unwrap_or(0.0);
        let cutoff = rmax + ((PEAK_EXTENT + 1.0) * sigma_estimate).max(MIN_CUTOFF_MARGIN);

        Ok(Self {
            phase,
            data,
            r,
            bounds: translation_bounds(&structure.lattice, cutoff)?,
            sites,
            lattice_matrix,
            cutoff,
            norm: average * average * total_occupancy,
        })
    }

    /// Fraction of the total pair weight carried by selected pairs.
    fn selected_fraction(&self) -> f64 {
        let total: f64 = self.sites.iter().map(|s| s.weight).sum();
        let mut selected = 0.0;
        for first in &self.sites {
            for second in &self.sites {
                if self.phase.pair_selected(&first.element, &second.element) {
                    selected += first.weight * second.weight;
                }
            }
        }
        selected / (total * total)
    }

    fn peak_width2(&self, i: usize, j: usize, separation: &Vector3<f64>, distance: f64) -> f64 {
        let params = &self.phase.params;
        let direction = separation / distance;
        let u = self.sites[i].u + self.sites[j].u;
        let sigma2 = (direction.transpose() * u * direction)[(0, 0)];
        let mut width2 = sigma2
            * (1.0 - params.delta / (distance * distance) - params.gamma / distance)
            + (self.data.qalp * distance).powi(2);
        if distance < params.rcut {
            width2 *= params.srat * params.srat;
        }
        width2
    }

    /// Peaks of every pair starting at site `i`, accumulated on the grid.
    fn row(&self, i: usize) -> Result<Vec<f64>, PdfError> {
        let mut acc = vec![0.0; self.r.len()];
        let origin = &self.sites[i];
        for (j, other) in self.sites.iter().enumerate() {
            if !self.phase.pair_selected(&origin.element, &other.element) {
                continue;
            }
            let weight = origin.weight * other.weight / self.norm;
            for t in translations(self.bounds) {
                let separation = other.cartesian + self.lattice_matrix * t - origin.cartesian;
                let distance = separation.norm();
                if distance < 1e-8 || distance > self.cutoff {
                    continue;
                }
                let width2 = self.peak_width2(i, j, &separation, distance);
                if width2 <= 0.0 {
                    return Err(PdfError::NonPositiveWidth {
                        first: i + 1,
                        second: j + 1,
                        distance,
                        width2,
                    });
                }
                add_gaussian(&mut acc, self.r, distance, width2.sqrt(), weight);
            }
        }
        Ok(acc)
    }

    fn compute(&self) -> Result<Vec<f64>, PdfError> {
        #[cfg(not(feature = "parallel"))]
        let iterator = 0..self.sites.len();

        #[cfg(feature = "parallel")]
        let iterator = (0..self.sites.len()).into_par_iter();

        let rows: Vec<Vec<f64>> = iterator
            .map(|i| self.row(i))
            .collect::<Result<_, _>>()?;

        let mut radial = vec![0.0; self.r.len()];
        for row in rows {
            for (total, value) in radial.iter_mut().zip(row) {
                *total += value;
            }
        }

        let rho0 = self.phase.structure.number_density();
        let fraction = self.selected_fraction();
        let params = &self.phase.params;
        Ok(self
            .r
            .iter()
            .zip(radial)
            .map(|(&r, rr)| {
                if r <= 0.0 {
                    return 0.0;
                }
                let g = rr / r - 4.0 * PI * rho0 * r * fraction;
                let damping = (-(self.data.qsig * r).powi(2) / 2.0).exp();
                g * damping * params.pscale
            })
            .collect())
    }
}

fn add_gaussian(acc: &mut [f64], r: &[f64], center: f64, sigma: f64, weight: f64) {
    let lo = r.partition_point(|&x| x < center - PEAK_EXTENT * sigma);
    let hi = r.partition_point(|&x| x <= center + PEAK_EXTENT * sigma);
    let scale = weight / ((2.0 * PI).sqrt() * sigma);
    for k in lo..hi {
        let z = (r[k] - center) / sigma;
        acc[k] += scale * (-0.5 * z * z).exp();
    }
}

/// PDF of one phase on the grid `r`, scaled by the phase's `pscale` but not
/// by the dataset scale.
#[instrument(skip_all, name = "phase_pdf")]
pub fn phase_pdf(phase: &Phase, data: &DatasetParameters, r: &[f64]) -> Result<Vec<f64>, PdfError> {
    let calculation = PhaseCalculation::new(phase, data, r)?;
    debug!(
        atoms = calculation.sites.len(),
        cutoff = calculation.cutoff,
        "Summing pair peaks."
    );
    calculation.compute()
}

/// Total PDF of `phases` on `r`: `dscale` times the sum of the phase PDFs.
pub fn total_pdf<'p>(
    phases: impl IntoIterator<Item = &'p Phase>,
    data: &DatasetParameters,
    r: &[f64],
) -> Result<Vec<f64>, PdfError> {
    let mut total = vec![0.0; r.len()];
    for phase in phases {
        for (acc, value) in total.iter_mut().zip(phase_pdf(phase, data, r)?) {
            *acc += value;
        }
    }
    total.iter_mut().for_each(|v| *v *= data.dscale);
    Ok(total)
}
