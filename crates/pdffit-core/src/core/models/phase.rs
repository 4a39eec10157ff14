use super::structure::Structure;
use crate::core::address::VariableKind;
use crate::core::scattering::{ScatteringType, normalize_element, scattering_factor};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Phase-wide scalars entering the PDF peak shape and scale.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PhaseParameters {
    /// Scale factor of this phase's contribution.
    pub pscale: f64,
    /// Peak width ratio applied below `rcut`.
    pub srat: f64,
    /// Quadratic (1/r^2) peak sharpening.
    pub delta: f64,
    /// Linear (1/r) peak sharpening.
    pub gamma: f64,
    /// Distance below which `srat` applies.
    pub rcut: f64,
}

impl Default for PhaseParameters {
    fn default() -> Self {
        Self {
            pscale: 1.0,
            srat: 1.0,
            delta: 0.0,
            gamma: 0.0,
            rcut: 0.0,
        }
    }
}

/// Which end of an atom pair a type selection applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairEnd {
    First,
    Second,
}

/// A loaded structure together with its refinable phase scalars and the
/// per-phase pair selections and scattering overrides.
#[derive(Debug, Clone, PartialEq)]
pub struct Phase {
    pub structure: Structure,
    pub params: PhaseParameters,
    excluded_first: BTreeSet<String>,
    excluded_second: BTreeSet<String>,
    scattering_overrides: BTreeMap<(ScatteringType, String), f64>,
}

impl Phase {
    pub fn new(structure: Structure) -> Self {
        Self {
            structure,
            params: PhaseParameters::default(),
            excluded_first: BTreeSet::new(),
            excluded_second: BTreeSet::new(),
            scattering_overrides: BTreeMap::new(),
        }
    }

    pub fn with_params(mut self, params: PhaseParameters) -> Self {
        self.params = params;
        self
    }

    /// Current value of a lattice, atom or phase variable. `None` when
    /// `atom` is out of range or `kind` is a dataset variable.
    pub fn variable(&self, kind: VariableKind, atom: Option<usize>) -> Option<f64> {
        if let Some(position) = kind.lattice_position() {
            return self.structure.lattice.get(position);
        }
        match kind {
            VariableKind::PhaseScale => Some(self.params.pscale),
            VariableKind::SigmaRatio => Some(self.params.srat),
            VariableKind::DeltaSharpening => Some(self.params.delta),
            VariableKind::GammaSharpening => Some(self.params.gamma),
            VariableKind::RCut => Some(self.params.rcut),
            VariableKind::DataScale | VariableKind::QResolution | VariableKind::QSharpening => {
                None
            }
            atom_kind => {
                let atom = self.structure.atom(atom?)?;
                Some(match atom_kind {
                    VariableKind::AtomX => atom.position.x,
                    VariableKind::AtomY => atom.position.y,
                    VariableKind::AtomZ => atom.position.z,
                    VariableKind::U11 => atom.u[0],
                    VariableKind::U22 => atom.u[1],
                    VariableKind::U33 => atom.u[2],
                    VariableKind::U12 => atom.u[3],
                    VariableKind::U13 => atom.u[4],
                    VariableKind::U23 => atom.u[5],
                    _ => atom.occupancy,
                })
            }
        }
    }

    /// Writes a variable; returns `false` when it does not exist in this
    /// phase.
    pub fn set_variable(&mut self, kind: VariableKind, atom: Option<usize>, value: f64) -> bool {
        if let Some(position) = kind.lattice_position() {
            return self.structure.lattice.set(position, value);
        }
        let slot = match kind {
            VariableKind::PhaseScale => &mut self.params.pscale,
            VariableKind::SigmaRatio => &mut self.params.srat,
            VariableKind::DeltaSharpening => &mut self.params.delta,
            VariableKind::GammaSharpening => &mut self.params.gamma,
            VariableKind::RCut => &mut self.params.rcut,
            VariableKind::DataScale | VariableKind::QResolution | VariableKind::QSharpening => {
                return false;
            }
            atom_kind => {
                let Some(atom) = atom.and_then(|i| self.structure.atom_mut(i)) else {
                    return false;
                };
                match atom_kind {
                    VariableKind::AtomX => &mut atom.position.x,
                    VariableKind::AtomY => &mut atom.position.y,
                    VariableKind::AtomZ => &mut atom.position.z,
                    VariableKind::U11 => &mut atom.u[0],
                    VariableKind::U22 => &mut atom.u[1],
                    VariableKind::U33 => &mut atom.u[2],
                    VariableKind::U12 => &mut atom.u[3],
                    VariableKind::U13 => &mut atom.u[4],
                    VariableKind::U23 => &mut atom.u[5],
                    _ => &mut atom.occupancy,
                }
            }
        };
        *slot = value;
        true
    }

    /// Includes or excludes an element at one end of the counted pairs.
    pub fn set_type_selected(&mut self, end: PairEnd, element: &str, selected: bool) {
        let set = match end {
            PairEnd::First => &mut self.excluded_first,
            PairEnd::Second => &mut self.excluded_second,
        };
        let element = normalize_element(element);
        if selected {
            set.remove(&element);
        } else {
            set.insert(element);
        }
    }

    pub fn is_type_selected(&self, end: PairEnd, element: &str) -> bool {
        let set = match end {
            PairEnd::First => &self.excluded_first,
            PairEnd::Second => &self.excluded_second,
        };
        !set.contains(&normalize_element(element))
    }

    /// Whether the pair (i, j) contributes, checking both orderings.
    pub fn pair_selected(&self, first: &str, second: &str) -> bool {
        let forward = !self.excluded_first.contains(first) && !self.excluded_second.contains(second);
        let reverse = !self.excluded_first.contains(second) && !self.excluded_second.contains(first);
        forward || reverse
    }

    /// Scattering factor of `element` in this phase: the override if one is
    /// set, else the tabulated value.
    pub fn scattering_factor(&self, element: &str, stype: ScatteringType) -> Option<f64> {
        let element = normalize_element(element);
        self.scattering_overrides
            .get(&(stype, element.clone()))
            .copied()
            .or_else(|| scattering_factor(&element, stype))
    }

    pub fn set_scattering_factor(&mut self, element: &str, stype: ScatteringType, value: f64) {
        self.scattering_overrides
            .insert((stype, normalize_element(element)), value);
    }

    /// Drops the overrides of `element` for both radiation types.
    pub fn reset_scattering_factor(&mut self, element: &str) {
        let element = normalize_element(element);
        self.scattering_overrides.retain(|(_, e), _| *e != element);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::models::structure::{Atom, Lattice};
    use nalgebra::Vector3;

    fn nio() -> Phase {
        Phase::new(
            Structure::new("NiO", Lattice::cubic(4.17))
                .with_atom(Atom::new("Ni", Vector3::zeros()).with_isotropic_u(0.004))
                .with_atom(Atom::new("O", Vector3::new(0.5, 0.5, 0.5)).with_isotropic_u(0.006)),
        )
    }

    #[test]
    fn variables_read_and_write_through_the_model() {
        let mut phase = nio();
        assert_eq!(phase.variable(VariableKind::LatticeA, None), Some(4.17));
        assert!(phase.set_variable(VariableKind::AtomY, Some(2), 0.25));
        assert_eq!(phase.structure.atoms[1].position.y, 0.25);
        assert!(phase.set_variable(VariableKind::U13, Some(1), 0.001));
        assert_eq!(phase.structure.atoms[0].u[4], 0.001);
        assert!(phase.set_variable(VariableKind::PhaseScale, None, 0.7));
        assert_eq!(phase.variable(VariableKind::PhaseScale, None), Some(0.7));
    }

    #[test]
    fn missing_atoms_and_dataset_kinds_are_not_phase_variables() {
        let mut phase = nio();
        assert_eq!(phase.variable(VariableKind::AtomX, Some(3)), None);
        assert!(!phase.set_variable(VariableKind::Occupancy, Some(3), 0.5));
        assert_eq!(phase.variable(VariableKind::DataScale, None), None);
        assert!(!phase.set_variable(VariableKind::QResolution, None, 0.1));
    }

    #[test]
    fn pair_selection_is_symmetric() {
        let mut phase = nio();
        assert!(phase.pair_selected("Ni", "O"));
        phase.set_type_selected(PairEnd::First, "Ni", false);
        assert!(phase.pair_selected("Ni", "O"));
        assert!(phase.pair_selected("O", "Ni"));
        assert!(!phase.pair_selected("Ni", "Ni"));
        phase.set_type_selected(PairEnd::Second, "O", false);
        assert!(phase.pair_selected("O", "Ni"));
        assert!(!phase.pair_selected("O", "O"));
        assert!(!phase.pair_selected("Ni", "Ni"));
        phase.set_type_selected(PairEnd::First, "ni", true);
        assert!(phase.is_type_selected(PairEnd::First, "Ni"));
    }

    #[test]
    fn scattering_overrides_take_precedence_until_reset() {
        let mut phase = nio();
        assert_eq!(phase.scattering_factor("O", ScatteringType::Xray), Some(8.0));
        phase.set_scattering_factor("o", ScatteringType::Xray, 7.5);
        assert_eq!(phase.scattering_factor("O", ScatteringType::Xray), Some(7.5));
        assert_eq!(phase.scattering_factor("O", ScatteringType::Neutron), Some(5.803));
        phase.reset_scattering_factor("O");
        assert_eq!(phase.scattering_factor("O", ScatteringType::Xray), Some(8.0));
    }
}
