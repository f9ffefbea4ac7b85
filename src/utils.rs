//! Parallelism switch and thread pool setup.

use rayon::prelude::*;
use tracing::warn;

// =============================================================================
// Parallelism Configuration
// =============================================================================

/// Whether parallel execution is allowed.
///
/// Passed down to kernels and query evaluation. When `Parallel`, callees may
/// use `rayon` parallel iterators; when `Sequential` they must not. The
/// thread pool itself is set up once through [`run_with_threads`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Parallelism {
    Sequential,
    Parallel,
}

impl Parallelism {
    /// Create from thread count semantics.
    ///
    /// - 0 = auto (parallel if the rayon pool has multiple threads)
    /// - 1 = sequential
    /// - >1 = parallel
    #[inline]
    pub fn from_threads(n_threads: usize) -> Self {
        if n_threads == 1 || (n_threads == 0 && rayon::current_num_threads() == 1) {
            Parallelism::Sequential
        } else {
            Parallelism::Parallel
        }
    }

    /// `Parallel` when `enabled`, `Sequential` otherwise.
    #[inline]
    pub fn from_flag(enabled: bool) -> Self {
        if enabled {
            Parallelism::Parallel
        } else {
            Parallelism::Sequential
        }
    }

    #[inline]
    pub fn is_parallel(self) -> bool {
        matches!(self, Parallelism::Parallel)
    }

    /// Map over `iter`, preserving input order in the output.
    #[inline]
    pub fn maybe_par_map<T, B, I, F>(self, iter: I, f: F) -> Vec<B>
    where
        T: Send,
        B: Send,
        I: IntoIterator<Item = T> + IntoParallelIterator<Item = T>,
        F: Fn(T) -> B + Sync + Send,
    {
        if self.is_parallel() {
            iter.into_par_iter().map(f).collect()
        } else {
            iter.into_iter().map(f).collect()
        }
    }

    /// Fallible map; the first error in input order wins.
    #[inline]
    pub fn maybe_par_try_map<T, B, E, I, F>(self, iter: I, f: F) -> Result<Vec<B>, E>
    where
        T: Send,
        B: Send,
        E: Send,
        I: IntoIterator<Item = T> + IntoParallelIterator<Item = T>,
        F: Fn(T) -> Result<B, E> + Sync + Send,
    {
        self.maybe_par_map(iter, f).into_iter().collect()
    }
}

// =============================================================================
// Thread Pool Setup
// =============================================================================

/// Run a closure with the appropriate thread pool.
///
/// Thread count semantics:
/// - `0` = auto (use all available cores)
/// - `1` = sequential (no thread pool)
/// - `n > 1` = use exactly `n` threads
///
/// If the pool cannot be built the closure runs on the global pool.
#[inline]
pub fn run_with_threads<T: Send>(n_threads: usize, f: impl FnOnce(Parallelism) -> T + Send) -> T {
    match Parallelism::from_threads(n_threads) {
        Parallelism::Sequential => f(Parallelism::Sequential),
        Parallelism::Parallel => match rayon::ThreadPoolBuilder::new().num_threads(n_threads).build() {
            Ok(pool) => pool.install(|| f(Parallelism::Parallel)),
            Err(err) => {
                warn!(n_threads, %err, "thread pool unavailable, using the global pool");
                f(Parallelism::Parallel)
            }
        },
    }
}
