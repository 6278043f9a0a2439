//! Core data structures and collaborator traits of quarry.

use ahash::{AHashMap, AHashSet};

pub mod coverage;
pub mod exec;
pub mod mutation;
pub mod queue;
pub mod sample;

pub type HashMap<K, V> = AHashMap<K, V>;
pub type HashSet<V> = AHashSet<V>;
pub type RngType = rand::rngs::SmallRng;

/// Hard cap on the size of any sample the engine executes.
pub const MAX_SAMPLE_SIZE: usize = 1 << 20;

/// Extra executions of the same sample used to separate stable edges
/// from flaky ones.
pub const SAMPLE_RETRY_TIMES: usize = 4;

/// How many times a crashing sample is re-run before the crash is
/// declared flaky.
pub const CRASH_REPRODUCE_TIMES: usize = 10;

/// Starting step of the binary back-off used when trimming samples.
pub const TRIM_STEP_INITIAL: usize = 1024;
