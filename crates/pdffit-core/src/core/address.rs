use phf::{Map, phf_map};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Errors raised while building or parsing a [`VariableAddress`].
///
/// The variants split into two classes: malformed references (bad syntax,
/// a non-integer or missing index) and failed lookups (an unknown name or
/// a lattice index outside `1..=6`). See [`AddressError::is_lookup`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AddressError {
    #[error("Malformed variable reference '{0}'")]
    Malformed(String),

    #[error("Invalid index '{index}' in variable reference '{text}'")]
    InvalidIndex { text: String, index: String },

    #[error("Variable '{name}' requires a positive index")]
    MissingIndex { name: &'static str },

    #[error("Variable '{name}' does not take an index")]
    UnexpectedIndex { name: &'static str },

    #[error("Atom index must be a positive integer (got {0})")]
    NonPositiveIndex(usize),

    #[error("Unknown variable name '{0}'")]
    UnknownName(String),

    #[error("Unknown lattice parameter name '{0}'")]
    UnknownLatticeName(String),

    #[error("Lattice parameter index {0} is out of range (expected 1..6)")]
    LatticeIndexOutOfRange(usize),
}

impl AddressError {
    /// Returns `true` for name-table lookup failures, `false` for syntax and
    /// index-format failures.
    pub fn is_lookup(&self) -> bool {
        matches!(
            self,
            AddressError::UnknownName(_)
                | AddressError::UnknownLatticeName(_)
                | AddressError::LatticeIndexOutOfRange(_)
        )
    }
}

/// Which part of the model a variable lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VariableScope {
    /// Unit-cell constants of the active phase.
    Lattice,
    /// Per-atom quantities of the active phase.
    Atom,
    /// Phase-wide scalars of the active phase.
    Phase,
    /// Scalars of the active dataset.
    Dataset,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum VariableKind {
    LatticeA,
    LatticeB,
    LatticeC,
    LatticeAlpha,
    LatticeBeta,
    LatticeGamma,
    AtomX,
    AtomY,
    AtomZ,
    U11,
    U22,
    U33,
    U12,
    U13,
    U23,
    Occupancy,
    PhaseScale,
    SigmaRatio,
    DeltaSharpening,
    GammaSharpening,
    DataScale,
    QResolution,
    QSharpening,
    RCut,
}

const LATTICE_KINDS: [VariableKind; 6] = [
    VariableKind::LatticeA,
    VariableKind::LatticeB,
    VariableKind::LatticeC,
    VariableKind::LatticeAlpha,
    VariableKind::LatticeBeta,
    VariableKind::LatticeGamma,
];

impl VariableKind {
    /// Name used by the textual form, e.g. `"x"` in `"x(3)"`.
    pub fn name(self) -> &'static str {
        match self {
            VariableKind::LatticeA
            | VariableKind::LatticeB
            | VariableKind::LatticeC
            | VariableKind::LatticeAlpha
            | VariableKind::LatticeBeta
            | VariableKind::LatticeGamma => "lat",
            VariableKind::AtomX => "x",
            VariableKind::AtomY => "y",
            VariableKind::AtomZ => "z",
            VariableKind::U11 => "u11",
            VariableKind::U22 => "u22",
            VariableKind::U33 => "u33",
            VariableKind::U12 => "u12",
            VariableKind::U13 => "u13",
            VariableKind::U23 => "u23",
            VariableKind::Occupancy => "occ",
            VariableKind::PhaseScale => "pscale",
            VariableKind::SigmaRatio => "srat",
            VariableKind::DeltaSharpening => "delta",
            VariableKind::GammaSharpening => "gamma",
            VariableKind::DataScale => "dscale",
            VariableKind::QResolution => "qsig",
            VariableKind::QSharpening => "qalp",
            VariableKind::RCut => "rcut",
        }
    }

    pub fn scope(self) -> VariableScope {
        match self {
            VariableKind::LatticeA
            | VariableKind::LatticeB
            | VariableKind::LatticeC
            | VariableKind::LatticeAlpha
            | VariableKind::LatticeBeta
            | VariableKind::LatticeGamma => VariableScope::Lattice,
            VariableKind::AtomX
            | VariableKind::AtomY
            | VariableKind::AtomZ
            | VariableKind::U11
            | VariableKind::U22
            | VariableKind::U33
            | VariableKind::U12
            | VariableKind::U13
            | VariableKind::U23
            | VariableKind::Occupancy => VariableScope::Atom,
            VariableKind::PhaseScale
            | VariableKind::SigmaRatio
            | VariableKind::DeltaSharpening
            | VariableKind::GammaSharpening
            | VariableKind::RCut => VariableScope::Phase,
            VariableKind::DataScale | VariableKind::QResolution | VariableKind::QSharpening => {
                VariableScope::Dataset
            }
        }
    }

    pub fn requires_index(self) -> bool {
        self.scope() == VariableScope::Atom
    }

    /// Position `1..=6` of a lattice kind in `a, b, c, alpha, beta, gamma`.
    pub fn lattice_position(self) -> Option<usize> {
        LATTICE_KINDS.iter().position(|&k| k == self).map(|p| p + 1)
    }

    fn lattice_from_position(position: usize) -> Result<Self, AddressError> {
        position
            .checked_sub(1)
            .and_then(|p| LATTICE_KINDS.get(p))
            .copied()
            .ok_or(AddressError::LatticeIndexOutOfRange(position))
    }
}

#[derive(Debug, Clone, Copy)]
enum NameEntry {
    Lattice,
    Atom(VariableKind),
    Scalar(VariableKind),
}

static VARIABLE_NAMES: Map<&'static str, NameEntry> = phf_map! {
    "lat" => NameEntry::Lattice,
    "x" => NameEntry::Atom(VariableKind::AtomX),
    "y" => NameEntry::Atom(VariableKind::AtomY),
    "z" => NameEntry::Atom(VariableKind::AtomZ),
    "u11" => NameEntry::Atom(VariableKind::U11),
    "u22" => NameEntry::Atom(VariableKind::U22),
    "u33" => NameEntry::Atom(VariableKind::U33),
    "u12" => NameEntry::Atom(VariableKind::U12),
    "u13" => NameEntry::Atom(VariableKind::U13),
    "u23" => NameEntry::Atom(VariableKind::U23),
    "occ" => NameEntry::Atom(VariableKind::Occupancy),
    "pscale" => NameEntry::Scalar(VariableKind::PhaseScale),
    "pfrac" => NameEntry::Scalar(VariableKind::PhaseScale),
    "srat" => NameEntry::Scalar(VariableKind::SigmaRatio),
    "delta" => NameEntry::Scalar(VariableKind::DeltaSharpening),
    "gamma" => NameEntry::Scalar(VariableKind::GammaSharpening),
    "dscale" => NameEntry::Scalar(VariableKind::DataScale),
    "qsig" => NameEntry::Scalar(VariableKind::QResolution),
    "qalp" => NameEntry::Scalar(VariableKind::QSharpening),
    "rcut" => NameEntry::Scalar(VariableKind::RCut),
};

static LATTICE_NAMES: Map<&'static str, usize> = phf_map! {
    "a" => 1,
    "b" => 2,
    "c" => 3,
    "alpha" => 4,
    "beta" => 5,
    "gamma" => 6,
};

/// A refinable quantity of the model: a lattice constant, an atomic
/// coordinate, a thermal tensor element, an occupancy, or a phase/dataset
/// scalar.
///
/// Addresses are only built through the named constructors below (or by
/// parsing the textual form), so an existing address always carries a valid
/// index for its kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VariableAddress {
    kind: VariableKind,
    atom: Option<usize>,
}

macro_rules! atom_constructors {
    ($($(#[$doc:meta])* $fn_name:ident => $kind:ident),* $(,)?) => {
        $(
            $(#[$doc])*
            pub fn $fn_name(atom: usize) -> Result<Self, AddressError> {
                Self::atom_variable(VariableKind::$kind, atom)
            }
        )*
    };
}

macro_rules! scalar_constructors {
    ($($(#[$doc:meta])* $fn_name:ident => $kind:ident),* $(,)?) => {
        $(
            $(#[$doc])*
            pub fn $fn_name() -> Self {
                Self { kind: VariableKind::$kind, atom: None }
            }
        )*
    };
}

impl VariableAddress {
    /// Lattice parameter by position: `1..=6` for `a, b, c, alpha, beta, gamma`.
    pub fn lat(position: usize) -> Result<Self, AddressError> {
        Ok(Self {
            kind: VariableKind::lattice_from_position(position)?,
            atom: None,
        })
    }

    /// Lattice parameter by name: one of `a, b, c, alpha, beta, gamma`.
    pub fn lat_named(name: &str) -> Result<Self, AddressError> {
        let position = LATTICE_NAMES
            .get(name.trim())
            .copied()
            .ok_or_else(|| AddressError::UnknownLatticeName(name.trim().to_string()))?;
        Self::lat(position)
    }

    atom_constructors! {
        /// Fractional x coordinate of atom `atom`.
        x => AtomX,
        /// Fractional y coordinate of atom `atom`.
        y => AtomY,
        /// Fractional z coordinate of atom `atom`.
        z => AtomZ,
        u11 => U11,
        u22 => U22,
        u33 => U33,
        u12 => U12,
        u13 => U13,
        u23 => U23,
        /// Site occupancy of atom `atom`.
        occ => Occupancy,
    }

    scalar_constructors! {
        /// Fraction of the total PDF contributed by the active phase.
        pscale => PhaseScale,
        /// Sigma ratio applied to peak widths below `rcut`.
        srat => SigmaRatio,
        /// Quadratic (1/r²) peak sharpening.
        delta => DeltaSharpening,
        /// Linear (1/r) peak sharpening.
        gamma => GammaSharpening,
        /// Scale factor of the active dataset.
        dscale => DataScale,
        /// Instrumental Q-resolution damping of the active dataset.
        qsig => QResolution,
        /// Q-dependent peak broadening of the active dataset.
        qalp => QSharpening,
        /// Distance below which `srat` applies.
        rcut => RCut,
    }

    /// Synonym of [`VariableAddress::pscale`].
    pub fn pfrac() -> Self {
        Self::pscale()
    }

    fn atom_variable(kind: VariableKind, atom: usize) -> Result<Self, AddressError> {
        if atom == 0 {
            return Err(AddressError::NonPositiveIndex(atom));
        }
        Ok(Self {
            kind,
            atom: Some(atom),
        })
    }

    pub fn kind(&self) -> VariableKind {
        self.kind
    }

    pub fn scope(&self) -> VariableScope {
        self.kind.scope()
    }

    /// 1-based atom number for atom kinds.
    pub fn atom(&self) -> Option<usize> {
        self.atom
    }

    /// The numeric index of the textual form: the atom number for atom
    /// kinds, the lattice position for lattice kinds, `None` for scalars.
    pub fn index(&self) -> Option<usize> {
        self.atom.or_else(|| self.kind.lattice_position())
    }

    /// Parses the textual form `name` or `name(index)`.
    pub fn parse(text: &str) -> Result<Self, AddressError> {
        let trimmed = text.trim();
        match trimmed.find('(') {
            Some(open) => {
                let Some(inner) = trimmed[open + 1..].strip_suffix(')') else {
                    return Err(AddressError::Malformed(text.to_string()));
                };
                let name = trimmed[..open].trim_end();
                let argument = inner.trim();
                if !is_identifier(name) || inner.contains(['(', ')']) {
                    return Err(AddressError::Malformed(text.to_string()));
                }
                Self::parse_indexed(text, name, argument)
            }
            None => {
                if !is_identifier(trimmed) {
                    return Err(AddressError::Malformed(text.to_string()));
                }
                Self::parse_bare(trimmed)
            }
        }
    }

    fn parse_indexed(text: &str, name: &str, argument: &str) -> Result<Self, AddressError> {
        let entry = VARIABLE_NAMES
            .get(name)
            .ok_or_else(|| AddressError::UnknownName(name.to_string()))?;
        match *entry {
            NameEntry::Lattice if is_identifier(argument) && !is_decimal(argument) => {
                Self::lat_named(argument)
            }
            NameEntry::Lattice => Self::lat(parse_index(text, argument)?),
            NameEntry::Atom(kind) => Self::atom_variable(kind, parse_index(text, argument)?),
            NameEntry::Scalar(kind) => Err(AddressError::UnexpectedIndex { name: kind.name() }),
        }
    }

    fn parse_bare(name: &str) -> Result<Self, AddressError> {
        match VARIABLE_NAMES.get(name) {
            Some(NameEntry::Scalar(kind)) => Ok(Self {
                kind: *kind,
                atom: None,
            }),
            Some(NameEntry::Lattice) => Err(AddressError::MissingIndex { name: "lat" }),
            Some(NameEntry::Atom(kind)) => Err(AddressError::MissingIndex { name: kind.name() }),
            None => match LATTICE_NAMES.get(name) {
                Some(&position) => Self::lat(position),
                None => Err(AddressError::UnknownName(name.to_string())),
            },
        }
    }
}

fn is_identifier(text: &str) -> bool {
    !text.is_empty() && text.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn is_decimal(text: &str) -> bool {
    !text.is_empty() && text.bytes().all(|b| b.is_ascii_digit())
}

fn parse_index(text: &str, argument: &str) -> Result<usize, AddressError> {
    let invalid = || AddressError::InvalidIndex {
        text: text.to_string(),
        index: argument.to_string(),
    };
    if !is_decimal(argument) {
        return Err(invalid());
    }
    argument.parse().map_err(|_| invalid())
}

impl fmt::Display for VariableAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.index() {
            Some(index) => write!(f, "{}({})", self.kind.name(), index),
            None => f.write_str(self.kind.name()),
        }
    }
}

impl FromStr for VariableAddress {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Anything that names a variable: a built address, its textual form, or a
/// zero-argument constructor such as `VariableAddress::pscale`, which is
/// invoked to obtain the address.
pub trait IntoAddress {
    fn into_address(self) -> Result<VariableAddress, AddressError>;
}

impl IntoAddress for VariableAddress {
    fn into_address(self) -> Result<VariableAddress, AddressError> {
        Ok(self)
    }
}

impl IntoAddress for &VariableAddress {
    fn into_address(self) -> Result<VariableAddress, AddressError> {
        Ok(*self)
    }
}

impl IntoAddress for &str {
    fn into_address(self) -> Result<VariableAddress, AddressError> {
        VariableAddress::parse(self)
    }
}

impl IntoAddress for String {
    fn into_address(self) -> Result<VariableAddress, AddressError> {
        VariableAddress::parse(&self)
    }
}

impl IntoAddress for &String {
    fn into_address(self) -> Result<VariableAddress, AddressError> {
        VariableAddress::parse(self)
    }
}

impl<F> IntoAddress for F
where
    F: FnOnce() -> VariableAddress,
{
    fn into_address(self) -> Result<VariableAddress, AddressError> {
        Ok(self())
    }
}

/// Resolves any [`IntoAddress`] token into an address without touching
/// engine state.
pub fn resolve(token: impl IntoAddress) -> Result<VariableAddress, AddressError> {
    token.into_address()
}

#[cfg(test)]
mod tests {
    use super::*;

    const ATOM_KINDS: [fn(usize) -> Result<VariableAddress, AddressError>; 10] = [
        VariableAddress::x,
        VariableAddress::y,
        VariableAddress::z,
        VariableAddress::u11,
        VariableAddress::u22,
        VariableAddress::u33,
        VariableAddress::u12,
        VariableAddress::u13,
        VariableAddress::u23,
        VariableAddress::occ,
    ];

    #[test]
    fn indexed_addresses_round_trip_through_text() {
        for build in ATOM_KINDS {
            for atom in [1, 2, 17, 1024] {
                let address = build(atom).unwrap();
                assert_eq!(resolve(address.to_string().as_str()).unwrap(), address);
            }
        }
        for position in 1..=6 {
            let address = VariableAddress::lat(position).unwrap();
            assert_eq!(address.to_string(), format!("lat({})", position));
            assert_eq!(resolve(address.to_string()).unwrap(), address);
        }
    }

    #[test]
    fn scalar_addresses_round_trip_through_text() {
        let scalars = [
            VariableAddress::pscale(),
            VariableAddress::srat(),
            VariableAddress::delta(),
            VariableAddress::gamma(),
            VariableAddress::dscale(),
            VariableAddress::qsig(),
            VariableAddress::qalp(),
            VariableAddress::rcut(),
        ];
        for address in scalars {
            assert_eq!(address.index(), None);
            assert_eq!(resolve(address.to_string()).unwrap(), address);
        }
    }

    #[test]
    fn lattice_synonyms_match_numeric_positions() {
        for (name, position) in [
            ("a", 1),
            ("b", 2),
            ("c", 3),
            ("alpha", 4),
            ("beta", 5),
        ] {
            let numeric = resolve(format!("lat({})", position)).unwrap();
            assert_eq!(resolve(name).unwrap(), numeric);
            assert_eq!(resolve(format!("lat({})", name)).unwrap(), numeric);
            assert_eq!(VariableAddress::lat_named(name).unwrap(), numeric);
        }
        assert_eq!(
            resolve("lat(gamma)").unwrap(),
            VariableAddress::lat(6).unwrap()
        );
    }

    #[test]
    fn bare_gamma_is_the_sharpening_scalar() {
        assert_eq!(resolve("gamma").unwrap(), VariableAddress::gamma());
        assert_eq!(
            resolve("gamma").unwrap().kind(),
            VariableKind::GammaSharpening
        );
    }

    #[test]
    fn lattice_index_out_of_range_is_a_lookup_error() {
        let err = resolve("lat(7)").unwrap_err();
        assert_eq!(err, AddressError::LatticeIndexOutOfRange(7));
        assert!(err.is_lookup());
        assert!(resolve("lat(0)").unwrap_err().is_lookup());
    }

    #[test]
    fn unknown_lattice_name_differs_from_malformed_integer() {
        let unknown = resolve("lat(delta)").unwrap_err();
        assert_eq!(unknown, AddressError::UnknownLatticeName("delta".into()));
        assert!(unknown.is_lookup());

        let malformed = resolve("x(1.5)").unwrap_err();
        assert!(matches!(malformed, AddressError::InvalidIndex { .. }));
        assert!(!malformed.is_lookup());
    }

    #[test]
    fn whitespace_is_allowed_around_name_and_index() {
        assert_eq!(
            resolve("  x ( 3 ) ").unwrap(),
            VariableAddress::x(3).unwrap()
        );
    }

    #[test]
    fn malformed_forms_are_rejected() {
        for text in ["", "x(", "x)", "x(1", "x((1))", "x(1)y", "(1)", "x-1", "x(+1)"] {
            let err = resolve(text).unwrap_err();
            assert!(!err.is_lookup(), "{text:?} gave {err:?}");
        }
    }

    #[test]
    fn index_requirements_are_enforced() {
        assert_eq!(
            resolve("x").unwrap_err(),
            AddressError::MissingIndex { name: "x" }
        );
        assert_eq!(
            resolve("pscale(1)").unwrap_err(),
            AddressError::UnexpectedIndex { name: "pscale" }
        );
        assert_eq!(
            resolve("occ(0)").unwrap_err(),
            AddressError::NonPositiveIndex(0)
        );
        assert!(VariableAddress::u23(0).is_err());
    }

    #[test]
    fn unknown_names_are_lookup_errors() {
        let err = resolve("foo(1)").unwrap_err();
        assert_eq!(err, AddressError::UnknownName("foo".into()));
        assert!(err.is_lookup());
    }

    #[test]
    fn pfrac_is_a_synonym_for_pscale() {
        assert_eq!(resolve("pfrac").unwrap(), VariableAddress::pscale());
        assert_eq!(VariableAddress::pfrac().to_string(), "pscale");
    }

    #[test]
    fn constructors_can_be_passed_uncalled() {
        assert_eq!(
            resolve(VariableAddress::qsig).unwrap(),
            VariableAddress::qsig()
        );
        let address = VariableAddress::z(4).unwrap();
        assert_eq!(resolve(|| address).unwrap(), address);
    }

    #[test]
    fn scopes_follow_kind() {
        assert_eq!(VariableAddress::lat(2).unwrap().scope(), VariableScope::Lattice);
        assert_eq!(VariableAddress::occ(1).unwrap().scope(), VariableScope::Atom);
        assert_eq!(VariableAddress::rcut().scope(), VariableScope::Phase);
        assert_eq!(VariableAddress::dscale().scope(), VariableScope::Dataset);
    }
}
