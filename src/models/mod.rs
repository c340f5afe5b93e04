pub mod candidate;
pub mod descriptor;

pub use candidate::*;
pub use descriptor::*;
