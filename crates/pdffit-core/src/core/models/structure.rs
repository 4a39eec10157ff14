use crate::core::scattering::normalize_element;
use nalgebra::{Matrix3, Vector3};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum StructureError {
    #[error("Lattice length {name} must be positive (got {value})")]
    NonPositiveLength { name: &'static str, value: f64 },
    #[error("Lattice angle {name} must lie in (0, 180) degrees (got {value})")]
    InvalidAngle { name: &'static str, value: f64 },
    #[error("Lattice angles do not describe a valid cell")]
    DegenerateCell,
    #[error("Atom {index} has an empty element label")]
    EmptyElement { index: usize },
    #[error("Atom {index} has a non-finite {field}")]
    NonFinite { index: usize, field: &'static str },
}

const LATTICE_NAMES: [&str; 6] = ["a", "b", "c", "alpha", "beta", "gamma"];

/// Unit cell: lengths in Angstroms, angles in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Lattice {
    pub a: f64,
    pub b: f64,
    pub c: f64,
    pub alpha: f64,
    pub beta: f64,
    pub gamma: f64,
}

impl Default for Lattice {
    fn default() -> Self {
        Self::cubic(1.0)
    }
}

impl Lattice {
    pub fn new(a: f64, b: f64, c: f64, alpha: f64, beta: f64, gamma: f64) -> Self {
        Self {
            a,
            b,
            c,
            alpha,
            beta,
            gamma,
        }
    }

    pub fn cubic(a: f64) -> Self {
        Self::new(a, a, a, 90.0, 90.0, 90.0)
    }

    /// Constant at `position` (1 = a ... 6 = gamma).
    pub fn get(&self, position: usize) -> Option<f64> {
        Some(match position {
            1 => self.a,
            2 => self.b,
            3 => self.c,
            4 => self.alpha,
            5 => self.beta,
            6 => self.gamma,
            _ => return None,
        })
    }

    /// Sets the constant at `position`; returns `false` when out of range.
    pub fn set(&mut self, position: usize, value: f64) -> bool {
        let slot = match position {
            1 => &mut self.a,
            2 => &mut self.b,
            3 => &mut self.c,
            4 => &mut self.alpha,
            5 => &mut self.beta,
            6 => &mut self.gamma,
            _ => return false,
        };
        *slot = value;
        true
    }

    fn cosines(&self) -> (f64, f64, f64) {
        (
            self.alpha.to_radians().cos(),
            self.beta.to_radians().cos(),
            self.gamma.to_radians().cos(),
        )
    }

    /// Cell volume in cubic Angstroms.
    pub fn volume(&self) -> f64 {
        let (ca, cb, cg) = self.cosines();
        let factor = 1.0 - ca * ca - cb * cb - cg * cg + 2.0 * ca * cb * cg;
        self.a * self.b * self.c * factor.max(0.0).sqrt()
    }

    /// Matrix whose columns are the cell vectors in Cartesian coordinates,
    /// `a` along x and `b` in the xy plane.
    pub fn matrix(&self) -> Matrix3<f64> {
        let (ca, cb, cg) = self.cosines();
        let sg = self.gamma.to_radians().sin();
        let cx = self.c * cb;
        let cy = self.c * (ca - cb * cg) / sg;
        let cz = (self.c * self.c - cx * cx - cy * cy).max(0.0).sqrt();
        Matrix3::new(
            self.a,
            self.b * cg,
            cx,
            0.0,
            self.b * sg,
            cy,
            0.0,
            0.0,
            cz,
        )
    }

    pub fn to_cartesian(&self, fractional: &Vector3<f64>) -> Vector3<f64> {
        self.matrix() * fractional
    }

    /// Distance between two fractional positions, without periodic images.
    pub fn distance(&self, u: &Vector3<f64>, v: &Vector3<f64>) -> f64 {
        self.to_cartesian(&(v - u)).norm()
    }

    /// Angle at `vertex` in degrees.
    pub fn angle(&self, first: &Vector3<f64>, vertex: &Vector3<f64>, second: &Vector3<f64>) -> f64 {
        let d1 = self.to_cartesian(&(first - vertex));
        let d2 = self.to_cartesian(&(second - vertex));
        let cos = d1.dot(&d2) / (d1.norm() * d2.norm());
        cos.clamp(-1.0, 1.0).acos().to_degrees()
    }

    pub fn validate(&self) -> Result<(), StructureError> {
        for (name, value) in LATTICE_NAMES.iter().zip([self.a, self.b, self.c]) {
            if !(value.is_finite() && value > 0.0) {
                return Err(StructureError::NonPositiveLength { name, value });
            }
        }
        for (name, value) in LATTICE_NAMES[3..]
            .iter()
            .zip([self.alpha, self.beta, self.gamma])
        {
            if !(value.is_finite() && value > 0.0 && value < 180.0) {
                return Err(StructureError::InvalidAngle { name, value });
            }
        }
        if self.volume() <= 0.0 {
            return Err(StructureError::DegenerateCell);
        }
        Ok(())
    }
}

/// An atom of the asymmetric content of a cell.
#[derive(Debug, Clone, PartialEq)]
pub struct Atom {
    /// Normalized element label, e.g. `"Ni"`.
    pub element: String,
    /// Fractional coordinates.
    pub position: Vector3<f64>,
    /// Displacement tensor elements in the order u11, u22, u33, u12, u13, u23
    /// (square Angstroms).
    pub u: [f64; 6],
    pub occupancy: f64,
}

impl Atom {
    pub fn new(element: &str, position: Vector3<f64>) -> Self {
        Self {
            element: normalize_element(element),
            position,
            u: [0.0; 6],
            occupancy: 1.0,
        }
    }

    pub fn with_isotropic_u(mut self, uiso: f64) -> Self {
        self.u = [uiso, uiso, uiso, 0.0, 0.0, 0.0];
        self
    }

    pub fn with_occupancy(mut self, occupancy: f64) -> Self {
        self.occupancy = occupancy;
        self
    }

    /// Symmetric displacement tensor built from [`Atom::u`].
    pub fn u_tensor(&self) -> Matrix3<f64> {
        let [u11, u22, u33, u12, u13, u23] = self.u;
        Matrix3::new(u11, u12, u13, u12, u22, u23, u13, u23, u33)
    }
}

/// A crystal structure: cell plus atoms.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Structure {
    pub title: String,
    pub lattice: Lattice,
    pub atoms: Vec<Atom>,
}

impl Structure {
    pub fn new(title: impl Into<String>, lattice: Lattice) -> Self {
        Self {
            title: title.into(),
            lattice,
            atoms: Vec::new(),
        }
    }

    pub fn with_atom(mut self, atom: Atom) -> Self {
        self.atoms.push(atom);
        self
    }

    pub fn num_atoms(&self) -> usize {
        self.atoms.len()
    }

    /// 1-based atom access.
    pub fn atom(&self, index: usize) -> Option<&Atom> {
        index.checked_sub(1).and_then(|i| self.atoms.get(i))
    }

    pub fn atom_mut(&mut self, index: usize) -> Option<&mut Atom> {
        index.checked_sub(1).and_then(|i| self.atoms.get_mut(i))
    }

    /// Distinct element labels in order of first appearance.
    pub fn atom_types(&self) -> Vec<String> {
        let mut types: Vec<String> = Vec::new();
        for atom in &self.atoms {
            if !types.contains(&atom.element) {
                types.push(atom.element.clone());
            }
        }
        types
    }

    /// 1-based index of `element` within [`Structure::atom_types`].
    pub fn type_index(&self, element: &str) -> Option<usize> {
        let element = normalize_element(element);
        self.atom_types()
            .iter()
            .position(|t| *t == element)
            .map(|p| p + 1)
    }

    /// Number density of atoms weighted by occupancy, per cubic Angstrom.
    pub fn number_density(&self) -> f64 {
        let volume = self.lattice.volume();
        if volume <= 0.0 {
            return 0.0;
        }
        self.atoms.iter().map(|a| a.occupancy).sum::<f64>() / volume
    }

    pub fn validate(&self) -> Result<(), StructureError> {
        self.lattice.validate()?;
        for (i, atom) in self.atoms.iter().enumerate() {
            let index = i + 1;
            if atom.element.is_empty() {
                return Err(StructureError::EmptyElement { index });
            }
            if !atom.position.iter().all(|v| v.is_finite()) {
                return Err(StructureError::NonFinite {
                    index,
                    field: "position",
                });
            }
            if !atom.u.iter().all(|v| v.is_finite()) {
                return Err(StructureError::NonFinite { index, field: "u" });
            }
            if !atom.occupancy.is_finite() {
                return Err(StructureError::NonFinite {
                    index,
                    field: "occupancy",
                });
            }
        }
        Ok(())
    }
}
