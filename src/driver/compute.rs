// geoinv/src/driver/compute.rs

use crate::params::InversionParams;
use log::{info, warn};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Once;

static POOL: Once = Once::new();
static POOL_THREADS: AtomicUsize = AtomicUsize::new(0);

/// Thread count and chunk size of the numerical kernels.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ComputeConfig {
    n_cpu: usize,
    max_chunk_size: f64,
}

impl ComputeConfig {
    pub fn from_params(params: &InversionParams) -> Self {
        let n_cpu = if params.parallelized {
            params.n_cpu.filter(|n| *n > 0).unwrap_or_else(default_n_cpu)
        } else {
            1
        };
        Self {
            n_cpu,
            max_chunk_size: params.max_chunk_size,
        }
    }

    pub fn n_cpu(&self) -> usize {
        self.n_cpu
    }

    /// Chunk size of sensitivity blocks in MiB.
    pub fn max_chunk_size(&self) -> f64 {
        self.max_chunk_size
    }

    /// Configure the process-wide rayon pool. Only the first request in a
    /// process takes effect.
    pub fn configure(&self) -> usize {
        let requested = self.n_cpu;
        POOL.call_once(|| {
            match rayon::ThreadPoolBuilder::new()
                .num_threads(requested)
                .build_global()
            {
                Ok(()) => {
                    info!(
                        "Thread pool configured with {} threads, {} MiB chunks",
                        requested, self.max_chunk_size
                    );
                    POOL_THREADS.store(requested, Ordering::SeqCst);
                }
                Err(e) => {
                    warn!("Could not configure the thread pool: {}", e);
                    POOL_THREADS.store(rayon::current_num_threads(), Ordering::SeqCst);
                }
            }
        });
        let configured = POOL_THREADS.load(Ordering::SeqCst);
        if configured != requested {
            warn!(
                "Thread pool already runs {} threads; ignoring request for {}",
                configured, requested
            );
        }
        configured
    }
}

/// Half of the logical cores, at least one.
pub fn default_n_cpu() -> usize {
    let cores = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(2);
    (cores / 2).max(1)
}
