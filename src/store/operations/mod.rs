pub mod encounters;
pub mod engagement;
