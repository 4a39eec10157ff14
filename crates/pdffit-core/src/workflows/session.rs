use crate::engine::state::RefinementState;

/// Bookkeeping kept next to the engine: what was loaded, in order, and how
/// the last refinement ended.
///
/// The names are informational only. Anything the engine can answer
/// (active phase, parameter values, Rw) is always asked from the engine.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionState {
    structures: Vec<String>,
    datasets: Vec<String>,
    refinement: RefinementState,
}

impl SessionState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a loaded structure and returns its 1-based phase index.
    pub fn add_structure(&mut self, name: impl Into<String>) -> usize {
        self.structures.push(name.into());
        self.structures.len()
    }

    /// Records a loaded or allocated dataset and returns its 1-based index.
    pub fn add_dataset(&mut self, name: impl Into<String>) -> usize {
        self.datasets.push(name.into());
        self.datasets.len()
    }

    pub fn structures(&self) -> &[String] {
        &self.structures
    }

    pub fn datasets(&self) -> &[String] {
        &self.datasets
    }

    pub fn structure_name(&self, ip: usize) -> Option<&str> {
        ip.checked_sub(1)
            .and_then(|i| self.structures.get(i))
            .map(String::as_str)
    }

    pub fn dataset_name(&self, iset: usize) -> Option<&str> {
        iset.checked_sub(1)
            .and_then(|i| self.datasets.get(i))
            .map(String::as_str)
    }

    pub fn refinement_state(&self) -> RefinementState {
        self.refinement
    }

    pub(crate) fn set_refinement_state(&mut self, state: RefinementState) {
        self.refinement = state;
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}
