//! Shipped key policies. A key decides what unfinished cells become.

pub mod constant;
pub mod default;

pub use constant::ConstKey;
pub use default::DefaultKey;
