pub mod bits;
pub mod hash;
pub mod mphf;

pub use bits::*;
pub use hash::*;
pub use mphf::*;
