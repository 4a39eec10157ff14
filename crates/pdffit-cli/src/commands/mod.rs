pub mod calc;
pub mod fit;
