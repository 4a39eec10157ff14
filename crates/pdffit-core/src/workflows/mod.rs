//! # Workflows Module
//!
//! This module provides the session-level API that users of the library
//! hold on to while building and refining a model.
//!
//! ## Overview
//!
//! [`fit::PdfFit`] owns one engine and the bookkeeping around it. Callers
//! load structures and data, bind variables to parameters, and then drive
//! the refinement either one step at a time or to convergence with an
//! optional observer.
//!
//! ## Architecture
//!
//! - **Session Handle** ([`fit`]) - Loading, constraints, parameters, queries and output
//! - **Refinement Controller** ([`refine`]) - `step`, `run_to_convergence` and `refine`
//! - **Session State** ([`session`]) - Loaded names and the last refinement state

pub mod fit;
pub mod refine;
pub mod session;
