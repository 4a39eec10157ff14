//! # Core Models Module
//!
//! Plain data describing what is being fitted: crystal structures, the
//! phases wrapping them, and the PDF datasets they are compared against.
//!
//! ## Key Components
//!
//! - [`structure`] - Unit cell, atoms and their refinable quantities
//! - [`phase`] - A structure plus phase scalars, pair selections and
//!   scattering overrides
//! - [`dataset`] - Observed or calculation-only PDFs on an r grid
//!
//! Every model exposes 1-based accessors so indices coming from variable
//! addresses can be used directly.

pub mod dataset;
pub mod phase;
pub mod structure;
