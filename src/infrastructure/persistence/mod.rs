pub mod variable_lock;

pub use variable_lock::Locks;
