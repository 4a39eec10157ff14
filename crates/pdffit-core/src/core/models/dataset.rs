use crate::core::address::VariableKind;
use crate::core::scattering::ScatteringType;
use std::collections::BTreeSet;
use std::ops::Range;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum DatasetError {
    #[error("Dataset has no points")]
    Empty,
    #[error("Column lengths differ: {r} r values, {g} G values, {dg} dG values")]
    LengthMismatch { r: usize, g: usize, dg: usize },
    #[error("r values must be strictly increasing (at point {index})")]
    NotIncreasing { index: usize },
    #[error("Non-finite value at point {index}")]
    NonFinite { index: usize },
    #[error("Grid needs at least 2 bins (got {0})")]
    TooFewBins(usize),
    #[error("Invalid r range [{rmin}, {rmax}]")]
    InvalidRange { rmin: f64, rmax: f64 },
    #[error("qmax must not be negative (got {0})")]
    NegativeQmax(f64),
}

/// Dataset-wide scalars.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DatasetParameters {
    pub stype: ScatteringType,
    /// Q cutoff of the measurement, recorded with the data.
    pub qmax: f64,
    /// Q resolution damping.
    pub qsig: f64,
    /// Quadratic peak broadening.
    pub qalp: f64,
    pub dscale: f64,
}

impl DatasetParameters {
    pub fn new(stype: ScatteringType, qmax: f64, qsig: f64) -> Self {
        Self {
            stype,
            qmax,
            qsig,
            qalp: 0.0,
            dscale: 1.0,
        }
    }
}

/// An observed or calculation-only PDF on an r grid.
#[derive(Debug, Clone, PartialEq)]
pub struct PdfDataset {
    pub name: String,
    pub params: DatasetParameters,
    pub r: Vec<f64>,
    pub g_obs: Vec<f64>,
    /// Per-point uncertainties; zero where unknown.
    pub dg_obs: Vec<f64>,
    /// `false` for datasets created by `alloc`.
    pub observed: bool,
    pub fit_range: (f64, f64),
    /// Last calculated PDF; empty before any calculation.
    pub g_calc: Vec<f64>,
    excluded_phases: BTreeSet<usize>,
}

impl PdfDataset {
    /// Builds an observed dataset from columns. `dg` may be empty.
    pub fn from_columns(
        name: impl Into<String>,
        params: DatasetParameters,
        r: Vec<f64>,
        g: Vec<f64>,
        dg: Vec<f64>,
    ) -> Result<Self, DatasetError> {
        if r.is_empty() {
            return Err(DatasetError::Empty);
        }
        let dg = if dg.is_empty() { vec![0.0; r.len()] } else { dg };
        if r.len() != g.len() || r.len() != dg.len() {
            return Err(DatasetError::LengthMismatch {
                r: r.len(),
                g: g.len(),
                dg: dg.len(),
            });
        }
        for index in 0..r.len() {
            if !(r[index].is_finite() && g[index].is_finite() && dg[index].is_finite()) {
                return Err(DatasetError::NonFinite { index: index + 1 });
            }
            if index > 0 && r[index] <= r[index - 1] {
                return Err(DatasetError::NotIncreasing { index: index + 1 });
            }
        }
        if params.qmax < 0.0 {
            return Err(DatasetError::NegativeQmax(params.qmax));
        }
        let fit_range = (r[0], r[r.len() - 1]);
        Ok(Self {
            name: name.into(),
            params,
            r,
            g_obs: g,
            dg_obs: dg,
            observed: true,
            fit_range,
            g_calc: Vec::new(),
            excluded_phases: BTreeSet::new(),
        })
    }

    /// Calculation-only dataset on the inclusive grid `rmin..=rmax` with
    /// `bins` points.
    pub fn from_grid(
        name: impl Into<String>,
        params: DatasetParameters,
        rmin: f64,
        rmax: f64,
        bins: usize,
    ) -> Result<Self, DatasetError> {
        if bins < 2 {
            return Err(DatasetError::TooFewBins(bins));
        }
        if !(rmin.is_finite() && rmax.is_finite() && rmin >= 0.0 && rmax > rmin) {
            return Err(DatasetError::InvalidRange { rmin, rmax });
        }
        if params.qmax < 0.0 {
            return Err(DatasetError::NegativeQmax(params.qmax));
        }
        let dr = (rmax - rmin) / (bins - 1) as f64;
        let r: Vec<f64> = (0..bins).map(|i| rmin + dr * i as f64).collect();
        Ok(Self {
            name: name.into(),
            params,
            g_obs: vec![0.0; bins],
            dg_obs: vec![0.0; bins],
            observed: false,
            fit_range: (rmin, rmax),
            r,
            g_calc: Vec::new(),
            excluded_phases: BTreeSet::new(),
        })
    }

    pub fn len(&self) -> usize {
        self.r.len()
    }

    pub fn is_empty(&self) -> bool {
        self.r.is_empty()
    }

    pub fn rmin(&self) -> f64 {
        self.r.first().copied().unwrap_or(0.0)
    }

    pub fn rmax(&self) -> f64 {
        self.r.last().copied().unwrap_or(0.0)
    }

    /// Restricts the fit to `[rmin, rmax]`; the range must overlap the data.
    pub fn set_fit_range(&mut self, rmin: f64, rmax: f64) -> Result<(), DatasetError> {
        if !(rmin.is_finite() && rmax.is_finite() && rmax > rmin)
            || rmax < self.rmin()
            || rmin > self.rmax()
        {
            return Err(DatasetError::InvalidRange { rmin, rmax });
        }
        self.fit_range = (rmin, rmax);
        Ok(())
    }

    /// Indices of the points inside the fit range.
    pub fn fit_indices(&self) -> Range<usize> {
        let (lo, hi) = self.fit_range;
        let start = self.r.partition_point(|&r| r < lo);
        let end = self.r.partition_point(|&r| r <= hi);
        start..end.max(start)
    }

    /// Least-squares weight of point `index`: `1/dG` when known, else 1.
    pub fn weight(&self, index: usize) -> f64 {
        match self.dg_obs.get(index) {
            Some(&dg) if dg > 0.0 => 1.0 / dg,
            _ => 1.0,
        }
    }

    /// Weighted agreement factor over the fit range, 0 before any
    /// calculation.
    pub fn rw(&self) -> f64 {
        if self.g_calc.len() != self.r.len() {
            return 0.0;
        }
        let (mut num, mut den) = (0.0, 0.0);
        for i in self.fit_indices() {
            let w = self.weight(i).powi(2);
            num += w * (self.g_obs[i] - self.g_calc[i]).powi(2);
            den += w * self.g_obs[i].powi(2);
        }
        if den > 0.0 { (num / den).sqrt() } else { 0.0 }
    }

    pub fn variable(&self, kind: VariableKind) -> Option<f64> {
        match kind {
            VariableKind::DataScale => Some(self.params.dscale),
            VariableKind::QResolution => Some(self.params.qsig),
            VariableKind::QSharpening => Some(self.params.qalp),
            _ => None,
        }
    }

    pub fn set_variable(&mut self, kind: VariableKind, value: f64) -> bool {
        let slot = match kind {
            VariableKind::DataScale => &mut self.params.dscale,
            VariableKind::QResolution => &mut self.params.qsig,
            VariableKind::QSharpening => &mut self.params.qalp,
            _ => return false,
        };
        *slot = value;
        true
    }

    /// Whether phase `ip` (1-based) contributes to this dataset.
    pub fn phase_selected(&self, ip: usize) -> bool {
        !self.excluded_phases.contains(&ip)
    }

    pub fn set_phase_selected(&mut self, ip: usize, selected: bool) {
        if selected {
            self.excluded_phases.remove(&ip);
        } else {
            self.excluded_phases.insert(ip);
        }
    }
}
