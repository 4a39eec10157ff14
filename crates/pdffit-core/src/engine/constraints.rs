use super::error::FitError;
use crate::core::address::{VariableAddress, VariableScope};
use crate::core::formula::{Formula, FormulaError};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

/// A variable address pinned to the phase or dataset that was active when
/// it was referenced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ScopedVariable {
    pub address: VariableAddress,
    pub phase: Option<usize>,
    pub dataset: Option<usize>,
}

impl ScopedVariable {
    pub fn phase(address: VariableAddress, phase: usize) -> Self {
        Self {
            address,
            phase: Some(phase),
            dataset: None,
        }
    }

    pub fn dataset(address: VariableAddress, dataset: usize) -> Self {
        Self {
            address,
            phase: None,
            dataset: Some(dataset),
        }
    }
}

impl fmt::Display for ScopedVariable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.address.scope(), self.phase, self.dataset) {
            (VariableScope::Dataset, _, Some(set)) => write!(f, "{} [dataset {}]", self.address, set),
            (_, Some(phase), _) => write!(f, "{} [phase {}]", self.address, phase),
            _ => write!(f, "{}", self.address),
        }
    }
}

/// How a constraint target is turned into an expression for its variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConstraintMode {
    /// The target as written; an integer target is a literal constant.
    User,
    /// `var = @n`.
    Ident,
    /// `var = formula`.
    FComp,
    /// `var = (target)^2`.
    FSqr,
}

impl FromStr for ConstraintMode {
    type Err = FitError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "USER" => Ok(ConstraintMode::User),
            "IDENT" => Ok(ConstraintMode::Ident),
            "FCOMP" => Ok(ConstraintMode::FComp),
            "FSQR" => Ok(ConstraintMode::FSqr),
            _ => Err(FitError::Constraint(format!("unknown constraint mode '{}'", s))),
        }
    }
}

impl fmt::Display for ConstraintMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ConstraintMode::User => "USER",
            ConstraintMode::Ident => "IDENT",
            ConstraintMode::FComp => "FCOMP",
            ConstraintMode::FSqr => "FSQR",
        })
    }
}

/// Right-hand side of a constraint: a parameter slot or a formula over
/// `@n` references.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConstraintTarget {
    Slot(usize),
    Formula(String),
}

impl ConstraintTarget {
    pub fn default_mode(&self) -> ConstraintMode {
        match self {
            ConstraintTarget::Slot(_) => ConstraintMode::Ident,
            ConstraintTarget::Formula(_) => ConstraintMode::FComp,
        }
    }
}

impl From<usize> for ConstraintTarget {
    fn from(slot: usize) -> Self {
        ConstraintTarget::Slot(slot)
    }
}

impl From<&str> for ConstraintTarget {
    fn from(formula: &str) -> Self {
        ConstraintTarget::Formula(formula.to_string())
    }
}

impl From<String> for ConstraintTarget {
    fn from(formula: String) -> Self {
        ConstraintTarget::Formula(formula)
    }
}

impl fmt::Display for ConstraintTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConstraintTarget::Slot(n) => write!(f, "{}", n),
            ConstraintTarget::Formula(s) => f.write_str(s),
        }
    }
}

/// A validated constraint: `variable = expression`.
#[derive(Debug, Clone, PartialEq)]
pub struct Binding {
    pub variable: ScopedVariable,
    pub target: ConstraintTarget,
    pub mode: ConstraintMode,
    expression: Formula,
}

impl Binding {
    /// Validates `target` and builds the expression implied by `mode` (or
    /// the target's default mode).
    pub fn new(
        variable: ScopedVariable,
        target: ConstraintTarget,
        mode: Option<ConstraintMode>,
    ) -> Result<Self, FitError> {
        let mode = mode.unwrap_or_else(|| target.default_mode());
        let base = match (&target, mode) {
            (ConstraintTarget::Slot(0), _) => {
                return Err(FitError::Constraint(
                    "parameter slots are numbered from 1".to_string(),
                ));
            }
            (ConstraintTarget::Slot(n), ConstraintMode::User) => Formula::constant(*n as f64),
            (ConstraintTarget::Slot(n), _) => Formula::parameter(*n),
            (ConstraintTarget::Formula(text), _) => Formula::parse(text)?,
        };
        let expression = match mode {
            ConstraintMode::FSqr => base.squared(),
            _ => base,
        };
        Ok(Self {
            variable,
            target,
            mode,
            expression,
        })
    }

    pub fn expression(&self) -> &Formula {
        &self.expression
    }

    pub fn parameters(&self) -> BTreeSet<usize> {
        self.expression.parameters()
    }

    pub fn evaluate(&self, lookup: impl Fn(usize) -> Option<f64>) -> Result<f64, FormulaError> {
        self.expression.evaluate(lookup)
    }
}

impl fmt::Display for Binding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} = {} ({})", self.variable, self.expression, self.mode)
    }
}

/// Active constraints, at most one per variable, in binding order.
#[derive(Debug, Clone, Default)]
pub struct ConstraintSet {
    bindings: Vec<Binding>,
}

impl ConstraintSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `binding`, replacing any earlier binding of the same variable.
    pub fn bind(&mut self, binding: Binding) {
        match self
            .bindings
            .iter_mut()
            .find(|b| b.variable == binding.variable)
        {
            Some(existing) => *existing = binding,
            None => self.bindings.push(binding),
        }
    }

    pub fn get(&self, variable: &ScopedVariable) -> Option<&Binding> {
        self.bindings.iter().find(|b| b.variable == *variable)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Binding> {
        self.bindings.iter()
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    pub fn clear(&mut self) {
        self.bindings.clear();
    }

    /// Every parameter slot referenced by some binding.
    pub fn parameters(&self) -> BTreeSet<usize> {
        self.bindings.iter().flat_map(|b| b.parameters()).collect()
    }
}
