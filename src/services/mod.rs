pub mod content;
pub mod transport;
