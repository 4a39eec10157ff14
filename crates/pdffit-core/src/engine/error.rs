use thiserror::Error;

use super::config::ConfigError;
use crate::core::address::AddressError;
use crate::core::formula::FormulaError;
use crate::core::io::data::DataError;
use crate::core::io::stru::StruError;
use crate::core::models::dataset::DatasetError;
use crate::core::models::structure::StructureError;
use crate::core::pdf::PdfError;
use crate::core::selection::SelectionError;
use crate::core::utils::geometry::GeometryError;

/// Coarse classification of a [`FitError`], matching the error families a
/// caller is expected to distinguish.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The engine could not compute the model.
    Calculation,
    /// Structure data is missing or malformed.
    Structure,
    /// A constraint or its formula is invalid.
    Constraint,
    /// A referenced object (phase, dataset, parameter, variable) does not
    /// exist yet.
    Unassigned,
    /// A value or index is out of range, or a name is unknown.
    Value,
    /// A variable reference is syntactically malformed.
    Reference,
    Io,
}

#[derive(Debug, Error)]
pub enum FitError {
    #[error("Calculation failed: {0}")]
    Calculation(String),

    #[error("Structure error: {0}")]
    Structure(String),

    #[error("Constraint error: {0}")]
    Constraint(String),

    #[error("Unassigned: {0}")]
    Unassigned(String),

    #[error("Invalid value: {0}")]
    Value(String),

    #[error("Invalid variable reference: {0}")]
    Address(#[from] AddressError),

    #[error("Invalid constraint formula: {0}")]
    Formula(#[from] FormulaError),

    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl FitError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            FitError::Calculation(_) => ErrorKind::Calculation,
            FitError::Structure(_) => ErrorKind::Structure,
            FitError::Constraint(_) | FitError::Formula(_) => ErrorKind::Constraint,
            FitError::Unassigned(_) => ErrorKind::Unassigned,
            FitError::Value(_) | FitError::Config(_) => ErrorKind::Value,
            FitError::Address(e) if e.is_lookup() => ErrorKind::Value,
            FitError::Address(_) => ErrorKind::Reference,
            FitError::Io(_) => ErrorKind::Io,
        }
    }

    pub fn is_calculation(&self) -> bool {
        self.kind() == ErrorKind::Calculation
    }

    pub fn is_structure(&self) -> bool {
        self.kind() == ErrorKind::Structure
    }

    pub fn is_constraint(&self) -> bool {
        self.kind() == ErrorKind::Constraint
    }

    pub fn is_unassigned(&self) -> bool {
        self.kind() == ErrorKind::Unassigned
    }

    pub fn is_value(&self) -> bool {
        self.kind() == ErrorKind::Value
    }

    pub(crate) fn unassigned(what: impl Into<String>) -> Self {
        FitError::Unassigned(what.into())
    }

    pub(crate) fn value(what: impl Into<String>) -> Self {
        FitError::Value(what.into())
    }
}

impl From<SelectionError> for FitError {
    fn from(err: SelectionError) -> Self {
        FitError::Value(err.to_string())
    }
}

impl From<StructureError> for FitError {
    fn from(err: StructureError) -> Self {
        FitError::Structure(err.to_string())
    }
}

impl From<GeometryError> for FitError {
    fn from(err: GeometryError) -> Self {
        FitError::Value(err.to_string())
    }
}

impl From<DatasetError> for FitError {
    fn from(err: DatasetError) -> Self {
        FitError::Value(err.to_string())
    }
}

impl From<PdfError> for FitError {
    fn from(err: PdfError) -> Self {
        match err {
            PdfError::Structure(e) => e.into(),
            other => FitError::Calculation(other.to_string()),
        }
    }
}

impl From<StruError> for FitError {
    fn from(err: StruError) -> Self {
        match err {
            StruError::Io(e) => FitError::Io(e),
            other => FitError::Structure(other.to_string()),
        }
    }
}

impl From<DataError> for FitError {
    fn from(err: DataError) -> Self {
        match err {
            DataError::Io(e) => FitError::Io(e),
            other => FitError::Value(other.to_string()),
        }
    }
}
