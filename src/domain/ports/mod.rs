pub mod locker;
pub mod time_service;
pub mod write_client;
