use phf::{Map, phf_map};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ScatteringType {
    #[serde(rename = "X")]
    Xray,
    #[serde(rename = "N")]
    Neutron,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("Unknown scattering type '{0}' (expected 'X' or 'N')")]
pub struct UnknownScatteringType(pub String);

impl FromStr for ScatteringType {
    type Err = UnknownScatteringType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "X" => Ok(ScatteringType::Xray),
            "N" => Ok(ScatteringType::Neutron),
            _ => Err(UnknownScatteringType(s.to_string())),
        }
    }
}

impl fmt::Display for ScatteringType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ScatteringType::Xray => "X",
            ScatteringType::Neutron => "N",
        })
    }
}

// (atomic number, coherent neutron scattering length in fm)
static ELEMENTS: Map<&'static str, (f64, f64)> = phf_map! {
    "H" => (1.0, -3.739),
    "D" => (1.0, 6.671),
    "He" => (2.0, 3.26),
    "Li" => (3.0, -1.90),
    "Be" => (4.0, 7.79),
    "B" => (5.0, 5.30),
    "C" => (6.0, 6.646),
    "N" => (7.0, 9.36),
    "O" => (8.0, 5.803),
    "F" => (9.0, 5.654),
    "Na" => (11.0, 3.63),
    "Mg" => (12.0, 5.375),
    "Al" => (13.0, 3.449),
    "Si" => (14.0, 4.1491),
    "P" => (15.0, 5.13),
    "S" => (16.0, 2.847),
    "Cl" => (17.0, 9.577),
    "K" => (19.0, 3.67),
    "Ca" => (20.0, 4.70),
    "Ti" => (22.0, -3.438),
    "V" => (23.0, -0.3824),
    "Cr" => (24.0, 3.635),
    "Mn" => (25.0, -3.73),
    "Fe" => (26.0, 9.45),
    "Co" => (27.0, 2.49),
    "Ni" => (28.0, 10.3),
    "Cu" => (29.0, 7.718),
    "Zn" => (30.0, 5.680),
    "Ga" => (31.0, 7.288),
    "Ge" => (32.0, 8.185),
    "As" => (33.0, 6.58),
    "Se" => (34.0, 7.970),
    "Sr" => (38.0, 7.02),
    "Y" => (39.0, 7.75),
    "Zr" => (40.0, 7.16),
    "Nb" => (41.0, 7.054),
    "Mo" => (42.0, 6.715),
    "Ag" => (47.0, 5.922),
    "Cd" => (48.0, 4.87),
    "In" => (49.0, 4.065),
    "Sn" => (50.0, 6.225),
    "Sb" => (51.0, 5.57),
    "Te" => (52.0, 5.80),
    "I" => (53.0, 5.28),
    "Ba" => (56.0, 5.07),
    "La" => (57.0, 8.24),
    "Ce" => (58.0, 4.84),
    "Ta" => (73.0, 6.91),
    "W" => (74.0, 4.86),
    "Pt" => (78.0, 9.60),
    "Au" => (79.0, 7.63),
    "Pb" => (82.0, 9.405),
    "Bi" => (83.0, 8.532),
};

/// Normalizes an element label: `"NI"`, `"ni"` and `"Ni2+"` all become `"Ni"`.
pub fn normalize_element(label: &str) -> String {
    label
        .trim()
        .chars()
        .take_while(|c| c.is_ascii_alphabetic())
        .enumerate()
        .map(|(i, c)| {
            if i == 0 {
                c.to_ascii_uppercase()
            } else {
                c.to_ascii_lowercase()
            }
        })
        .collect()
}

pub fn is_known_element(label: &str) -> bool {
    ELEMENTS.contains_key(normalize_element(label).as_str())
}

/// Scattering factor of an element at Q = 0: the atomic number for X-rays,
/// the coherent scattering length (fm) for neutrons.
pub fn scattering_factor(label: &str, stype: ScatteringType) -> Option<f64> {
    ELEMENTS
        .get(normalize_element(label).as_str())
        .map(|&(z, b)| match stype {
            ScatteringType::Xray => z,
            ScatteringType::Neutron => b,
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scattering_type_parses_case_insensitively() {
        assert_eq!("x".parse::<ScatteringType>().unwrap(), ScatteringType::Xray);
        assert_eq!(" N ".parse::<ScatteringType>().unwrap(), ScatteringType::Neutron);
        assert!("E".parse::<ScatteringType>().is_err());
    }

    #[test]
    fn element_labels_are_normalized() {
        assert_eq!(normalize_element("NI"), "Ni");
        assert_eq!(normalize_element("o2-"), "O");
        assert_eq!(normalize_element(" Fe3+ "), "Fe");
        assert_eq!(normalize_element("12"), "");
    }

    #[test]
    fn factors_depend_on_radiation() {
        assert_eq!(scattering_factor("Ni", ScatteringType::Xray), Some(28.0));
        assert_eq!(scattering_factor("Ni", ScatteringType::Neutron), Some(10.3));
        assert_eq!(scattering_factor("Xx", ScatteringType::Xray), None);
        assert!(is_known_element("si"));
    }
}
