//! TOML structure files.
//!
//! ```toml
//! title = "Ni fcc"
//!
//! [lattice]
//! a = 3.52
//! b = 3.52
//! c = 3.52
//! alpha = 90.0
//! beta = 90.0
//! gamma = 90.0
//!
//! [phase]          # optional, defaults shown by PhaseParameters::default
//! pscale = 1.0
//!
//! [[atom]]
//! element = "Ni"
//! xyz = [0.0, 0.0, 0.0]
//! uiso = 0.005     # or u = [u11, u22, u33, u12, u13, u23]
//! occ = 1.0
//! ```

use crate::core::io::traits::ModelFile;
use crate::core::models::phase::PhaseParameters;
use crate::core::models::structure::{Atom, Lattice, Structure, StructureError};
use nalgebra::Vector3;
use serde::{Deserialize, Serialize};
use std::io::{self, BufRead, Read, Write};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StruError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("Invalid structure file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Failed to serialize structure: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("Atom {atom} gives both 'u' and 'uiso'")]
    ConflictingDisplacement { atom: usize },
    #[error(transparent)]
    Invalid(#[from] StructureError),
}

fn default_occupancy() -> f64 {
    1.0
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct AtomRecord {
    element: String,
    xyz: [f64; 3],
    #[serde(default, skip_serializing_if = "Option::is_none")]
    uiso: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    u: Option<[f64; 6]>,
    #[serde(default = "default_occupancy")]
    occ: f64,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct StructureDocument {
    #[serde(default)]
    title: String,
    lattice: Lattice,
    #[serde(default)]
    phase: PhaseParameters,
    #[serde(default, rename = "atom")]
    atoms: Vec<AtomRecord>,
}

impl StructureDocument {
    fn into_model(self) -> Result<(Structure, PhaseParameters), StruError> {
        let mut structure = Structure::new(self.title, self.lattice);
        for (i, record) in self.atoms.into_iter().enumerate() {
            let [x, y, z] = record.xyz;
            let mut atom = Atom::new(&record.element, Vector3::new(x, y, z))
                .with_occupancy(record.occ);
            match (record.u, record.uiso) {
                (Some(_), Some(_)) => return Err(StruError::ConflictingDisplacement { atom: i + 1 }),
                (Some(u), None) => atom.u = u,
                (None, Some(uiso)) => atom = atom.with_isotropic_u(uiso),
                (None, None) => {}
            }
            structure.atoms.push(atom);
        }
        structure.validate()?;
        Ok((structure, self.phase))
    }

    fn from_model(structure: &Structure, params: &PhaseParameters) -> Self {
        let atoms = structure
            .atoms
            .iter()
            .map(|atom| {
                let [u11, u22, u33, u12, u13, u23] = atom.u;
                let isotropic = u11 == u22 && u22 == u33 && u12 == 0.0 && u13 == 0.0 && u23 == 0.0;
                AtomRecord {
                    element: atom.element.clone(),
                    xyz: [atom.position.x, atom.position.y, atom.position.z],
                    uiso: isotropic.then_some(u11),
                    u: (!isotropic).then_some(atom.u),
                    occ: atom.occupancy,
                }
            })
            .collect();
        Self {
            title: structure.title.clone(),
            lattice: structure.lattice,
            phase: *params,
            atoms,
        }
    }
}

pub struct StructureFile;

impl ModelFile for StructureFile {
    type Model = Structure;
    type Metadata = PhaseParameters;
    type Error = StruError;

    fn read_from(reader: &mut impl BufRead) -> Result<(Structure, PhaseParameters), StruError> {
        let mut text = String::new();
        reader.read_to_string(&mut text)?;
        let document: StructureDocument = toml::from_str(&text)?;
        document.into_model()
    }

    fn write_to(
        structure: &Structure,
        params: &PhaseParameters,
        writer: &mut impl Write,
    ) -> Result<(), StruError> {
        let text = toml::to_string(&StructureDocument::from_model(structure, params))?;
        writer.write_all(text.as_bytes())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    const NICKEL: &str = r#"
title = "Ni"

[lattice]
a = 3.52
b = 3.52
c = 3.52
alpha = 90.0
beta = 90.0
gamma = 90.0

[phase]
delta = 1.5

[[atom]]
element = "NI"
xyz = [0.0, 0.0, 0.0]
uiso = 0.005

[[atom]]
element = "Ni"
xyz = [0.5, 0.5, 0.0]
u = [0.004, 0.005, 0.006, 0.0, 0.0, 0.001]
occ = 0.9
"#;

    #[test]
    fn reads_atoms_lattice_and_phase() {
        let (structure, params) = StructureFile::read_from_str(NICKEL).unwrap();
        assert_eq!(structure.title, "Ni");
        assert_eq!(structure.lattice, Lattice::cubic(3.52));
        assert_eq!(structure.num_atoms(), 2);
        assert_eq!(structure.atoms[0].element, "Ni");
        assert_eq!(structure.atoms[0].u, [0.005, 0.005, 0.005, 0.0, 0.0, 0.0]);
        assert_eq!(structure.atoms[1].u[5], 0.001);
        assert_eq!(structure.atoms[1].occupancy, 0.9);
        assert_eq!(params.delta, 1.5);
        assert_eq!(params.pscale, 1.0);
    }

    #[test]
    fn written_text_reads_back() {
        let (structure, params) = StructureFile::read_from_str(NICKEL).unwrap();
        let text = StructureFile::write_to_string(&structure, &params).unwrap();
        assert!(text.contains("[[atom]]"));
        let (again, again_params) = StructureFile::read_from_str(&text).unwrap();
        assert_eq!(again, structure);
        assert_eq!(again_params, params);
    }

    #[test]
    fn path_round_trip_uses_the_filesystem() {
        let (structure, params) = StructureFile::read_from_str(NICKEL).unwrap();
        let file = NamedTempFile::new().unwrap();
        StructureFile::write_to_path(&structure, &params, file.path()).unwrap();
        let (again, _) = StructureFile::read_from_path(file.path()).unwrap();
        assert_eq!(again.num_atoms(), 2);
    }

    #[test]
    fn rejects_unknown_keys_and_conflicting_displacements() {
        let unknown = NICKEL.replace("title", "titel");
        assert!(matches!(
            StructureFile::read_from_str(&unknown),
            Err(StruError::Parse(_))
        ));
        let conflicting = NICKEL.replace("occ = 0.9", "occ = 0.9\nuiso = 0.01");
        assert!(matches!(
            StructureFile::read_from_str(&conflicting),
            Err(StruError::ConflictingDisplacement { atom: 2 })
        ));
    }

    #[test]
    fn rejects_invalid_cells() {
        let flat = NICKEL.replace("a = 3.52", "a = -1.0");
        assert!(matches!(
            StructureFile::read_from_str(&flat),
            Err(StruError::Invalid(StructureError::NonPositiveLength { .. }))
        ));
    }
}
