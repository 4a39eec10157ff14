use super::constraints::ScopedVariable;
use super::error::FitError;
use crate::core::selection::Selector;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum RefineStatus {
    Fixed,
    #[default]
    Free,
}

/// One numbered parameter slot.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Parameter {
    /// `None` until the slot is given a value.
    pub value: Option<f64>,
    pub status: RefineStatus,
    /// Variable the slot currently mirrors, if it was set from one.
    pub tracking: Option<ScopedVariable>,
}

impl Parameter {
    pub fn is_free(&self) -> bool {
        self.status == RefineStatus::Free
    }
}

/// Numbered parameter slots (1-based, sparse).
#[derive(Debug, Clone, Default)]
pub struct ParameterStore {
    slots: BTreeMap<usize, Parameter>,
}

impl ParameterStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn clear(&mut self) {
        self.slots.clear();
    }

    pub fn get(&self, slot: usize) -> Option<&Parameter> {
        self.slots.get(&slot)
    }

    pub fn contains(&self, slot: usize) -> bool {
        self.slots.contains_key(&slot)
    }

    /// Creates `slot` without a value if it does not exist yet.
    pub fn ensure(&mut self, slot: usize) -> &mut Parameter {
        self.slots.entry(slot).or_default()
    }

    /// Stores a numeric value, ending any variable tracking.
    pub fn set(&mut self, slot: usize, value: f64) {
        let parameter = self.ensure(slot);
        parameter.value = Some(value);
        parameter.tracking = None;
    }

    /// Makes `slot` mirror `variable` until it is next set numerically.
    pub fn track(&mut self, slot: usize, variable: ScopedVariable, current: f64) {
        let parameter = self.ensure(slot);
        parameter.value = Some(current);
        parameter.tracking = Some(variable);
    }

    /// Stops tracking and keeps `value` as the slot's own value.
    pub fn materialize(&mut self, slot: usize, value: f64) {
        if let Some(parameter) = self.slots.get_mut(&slot) {
            parameter.value = Some(value);
            parameter.tracking = None;
        }
    }

    pub fn fix(&mut self, selector: Selector) -> Result<(), FitError> {
        self.set_status(selector, RefineStatus::Fixed)
    }

    pub fn free(&mut self, selector: Selector) -> Result<(), FitError> {
        self.set_status(selector, RefineStatus::Free)
    }

    fn set_status(&mut self, selector: Selector, status: RefineStatus) -> Result<(), FitError> {
        match selector {
            Selector::All => {
                self.slots.values_mut().for_each(|p| p.status = status);
                Ok(())
            }
            Selector::Index(slot) => {
                let parameter = self
                    .slots
                    .get_mut(&slot)
                    .ok_or_else(|| FitError::unassigned(format!("parameter {} is not defined", slot)))?;
                parameter.status = status;
                Ok(())
            }
        }
    }

    /// Slots the least-squares step may vary, ascending.
    pub fn free_slots(&self) -> Vec<usize> {
        self.slots
            .iter()
            .filter(|(_, p)| p.is_free())
            .map(|(&slot, _)| slot)
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, &Parameter)> {
        self.slots.iter().map(|(&slot, p)| (slot, p))
    }

    pub fn tracking_slots(&self) -> Vec<(usize, ScopedVariable)> {
        self.slots
            .iter()
            .filter_map(|(&slot, p)| p.tracking.map(|v| (slot, v)))
            .collect()
    }
}
