//! Provides input/output for the text formats a fitting session reads and
//! writes.
//!
//! Structures are TOML documents ([`stru`]); PDF data and calculated
//! curves are whitespace-separated columns ([`data`]). Both share the
//! [`traits::ModelFile`] interface, which adds string and path helpers on
//! top of the reader/writer pair each format implements.

pub mod data;
pub mod stru;
pub mod traits;
