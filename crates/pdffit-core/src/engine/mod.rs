//! # Engine Module
//!
//! This module implements the stateful computational engine behind a
//! fitting session: the parameter store, constraint bindings, the PDF
//! recalculation, and the Levenberg-Marquardt refinement step.
//!
//! ## Overview
//!
//! Everything above this layer talks to the engine through the narrow
//! [`traits::Engine`] interface, using typed variable addresses and
//! explicit parameter slots. [`memory::MemoryEngine`] is the in-process
//! implementation used by default.
//!
//! ## Architecture
//!
//! - **Interface** ([`traits`]) - The `Engine` trait and its small value types
//! - **Implementation** ([`memory`]) - Phases, datasets, and the refinement loop body
//! - **Parameters** ([`parameters`]) - Numbered slots with refine status and variable tracking
//! - **Constraints** ([`constraints`]) - Validated bindings from variables to formulas
//! - **Minimizer** ([`lm`]) - One damped least-squares iteration
//! - **Configuration** ([`config`]) - Calculation grid and minimizer settings
//! - **State Tracking** ([`state`]) - Refinement controller states and summaries
//! - **Progress Monitoring** ([`progress`]) - Step observers and throttling
//! - **Error Handling** ([`error`]) - The error taxonomy shared by every layer

pub mod config;
pub mod constraints;
pub mod error;
pub(crate) mod lm;
pub mod memory;
pub mod parameters;
pub mod progress;
pub mod state;
pub mod traits;
