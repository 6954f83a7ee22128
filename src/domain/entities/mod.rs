pub mod variable;

pub use variable::*;
