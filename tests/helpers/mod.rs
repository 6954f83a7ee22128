#![allow(unused_imports)]
#![allow(dead_code)]
pub mod clock;
pub mod lock_service;
pub mod variable_server;

pub use clock::*;
pub use lock_service::*;
pub use variable_server::*;
