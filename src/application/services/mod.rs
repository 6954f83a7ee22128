pub mod lock_leaser;

pub use lock_leaser::{
    ConflictPolicy, InitialDelay, LeaserOptions, LockLeaser, DEFAULT_MAX_INITIAL_DELAY,
    DEFAULT_RENEWAL_FACTOR, DEFAULT_WAIT_FACTOR,
};
