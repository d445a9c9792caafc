pub mod collect;
pub mod comm;
pub mod config;
pub mod detection;
pub mod error;
pub mod merge;
pub mod part_file;
pub mod rendezvous;
pub mod report;
pub mod shard;
pub mod worker_loop;

pub use collect::{collect_results, run_distributed, run_single, CollectOptions};
pub use comm::Communicator;
pub use error::*;

/// Install the `tracing` subscriber used by the binaries. `RUST_LOG` overrides
/// the default `info` level.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
