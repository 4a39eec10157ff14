//! # Core Module
//!
//! Stateless building blocks of a fitting session. Nothing in here owns
//! session state; the [`crate::engine`] layer combines these pieces into a
//! running refinement.
//!
//! ## Architecture
//!
//! - **Addressing** ([`address`], [`selection`]) - The closed set of
//!   refinable variables, their textual grammar, and the `ALL` selection
//!   alias
//! - **Constraint formulas** ([`formula`]) - Arithmetic over `@n` parameter
//!   references
//! - **Models** ([`models`]) - Structures, phases and PDF datasets
//! - **File I/O** ([`io`]) - TOML structures and column data files
//! - **Physics** ([`scattering`], [`pdf`]) - Scattering factor tables and the
//!   pair distribution function calculator
//! - **Geometry** ([`utils`]) - Periodic images, bond lengths and cell
//!   translations

pub mod address;
pub mod formula;
pub mod io;
pub mod models;
pub mod pdf;
pub mod scattering;
pub mod selection;
pub mod utils;
