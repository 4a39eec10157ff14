//! # PDFfit Core Library
//!
//! Constrained least-squares refinement of crystal-structure models
//! against pair distribution function (PDF) data.
//!
//! ## Architectural Philosophy
//!
//! The library keeps the same three-layer split throughout:
//!
//! - **[`core`]: The Foundation.** Stateless pieces: the typed
//!   `VariableAddress` and its parser, selection aliases, constraint
//!   formulas, structure and dataset models, file formats, and the PDF
//!   calculator.
//!
//! - **[`engine`]: The Logic Core.** The stateful computational engine
//!   behind the narrow [`engine::traits::Engine`] interface: parameter
//!   store, constraint bindings, the Levenberg-Marquardt step, and the
//!   error taxonomy shared by every layer.
//!
//! - **[`workflows`]: The Public API.** The [`workflows::fit::PdfFit`]
//!   session handle, which validates input locally, keeps the session
//!   bookkeeping, and drives the refinement controller.
//!
//! ```no_run
//! use pdffit::core::address::VariableAddress;
//! use pdffit::core::scattering::ScatteringType;
//! use pdffit::workflows::fit::PdfFit;
//!
//! # fn main() -> Result<(), pdffit::engine::error::FitError> {
//! let mut fit = PdfFit::new();
//! fit.read_struct("ni.toml")?;
//! fit.read_data("ni.gr", ScatteringType::Neutron, 26.0, 0.003)?;
//! for edge in ["a", "b", "c"] {
//!     fit.constrain(edge, 1usize)?;
//! }
//! fit.constrain(VariableAddress::pscale, "@2")?;
//! fit.set_parameter(1, 3.52)?;
//! fit.set_parameter(2, 1.0)?;
//! let summary = fit.refine(None)?;
//! println!("{} steps, Rw = {:.4}", summary.steps, fit.rw());
//! # Ok(())
//! # }
//! ```

pub mod core;
pub mod engine;
pub mod workflows;
