//! Phase synchronization across participants.
//!
//! Every timed phase boundary goes through one [`Aggregator`]: a barrier so
//! all participants start together, then a max-reduction so the coordinating
//! participant (rank 0) sees the slowest participant's time.
//!
//! - [`Solo`]: one participant; barrier is a no-op.
//! - [`LocalGroup`]: participants are threads of one process.
//! - `MpiAggregator` (feature `mpi`): participants are MPI ranks.

use std::sync::{Arc, Barrier, Mutex};

use crate::error::{Error, ErrorKind, Result};

/// Barrier and reductions over the participants of a run.
pub trait Aggregator {
    /// This participant's rank in `0..participants()`.
    fn rank(&self) -> usize;

    /// Number of participants.
    fn participants(&self) -> usize;

    fn is_root(&self) -> bool {
        self.rank() == 0
    }

    /// Block until every participant has called `barrier`.
    fn barrier(&self);

    /// Maximum of `value` over all participants, `Some` at the root only.
    fn reduce_max_to_root(&self, value: f64) -> Option<f64>;

    /// Whether every participant passed the same `value`. Known to all.
    fn all_equal(&self, value: u64) -> bool;
}

/// A single participant.
#[derive(Debug, Default, Clone, Copy)]
pub struct Solo;

impl Aggregator for Solo {
    fn rank(&self) -> usize {
        0
    }

    fn participants(&self) -> usize {
        1
    }

    fn barrier(&self) {}

    fn reduce_max_to_root(&self, value: f64) -> Option<f64> {
        Some(value)
    }

    fn all_equal(&self, _value: u64) -> bool {
        true
    }
}

struct Shared {
    barrier: Barrier,
    floats: Mutex<Vec<f64>>,
    words: Mutex<Vec<u64>>,
}

/// One participant of a group of threads in this process.
///
/// Create the whole group with [`LocalGroup::new`] and move one member into
/// each thread. Every member must take part in every collective call, in the
/// same order.
pub struct LocalGroup {
    rank: usize,
    size: usize,
    shared: Arc<Shared>,
}

impl LocalGroup {
    /// Create `participants` members, ordered by rank.
    pub fn new(participants: usize) -> Vec<LocalGroup> {
        let size = participants.max(1);
        let shared = Arc::new(Shared {
            barrier: Barrier::new(size),
            floats: Mutex::new(vec![0.0; size]),
            words: Mutex::new(vec![0; size]),
        });
        (0..size)
            .map(|rank| LocalGroup {
                rank,
                size,
                shared: Arc::clone(&shared),
            })
            .collect()
    }

    fn publish<T: Copy>(&self, slots: &Mutex<Vec<T>>, value: T) {
        let mut guard = match slots.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard[self.rank] = value;
    }

    fn snapshot<T: Copy>(&self, slots: &Mutex<Vec<T>>) -> Vec<T> {
        match slots.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl Aggregator for LocalGroup {
    fn rank(&self) -> usize {
        self.rank
    }

    fn participants(&self) -> usize {
        self.size
    }

    fn barrier(&self) {
        self.shared.barrier.wait();
    }

    fn reduce_max_to_root(&self, value: f64) -> Option<f64> {
        self.publish(&self.shared.floats, value);
        self.barrier();
        let result = self
            .is_root()
            .then(|| self.snapshot(&self.shared.floats).into_iter().fold(f64::MIN, f64::max));
        // Slots are reused by the next reduction.
        self.barrier();
        result
    }

    fn all_equal(&self, value: u64) -> bool {
        self.publish(&self.shared.words, value);
        self.barrier();
        let words = self.snapshot(&self.shared.words);
        self.barrier();
        words.iter().all(|&w| w == words[0])
    }
}

impl std::fmt::Debug for LocalGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalGroup")
            .field("rank", &self.rank)
            .field("participants", &self.size)
            .finish()
    }
}

/// Make a local outcome collective. Every participant must call it.
///
/// A local error is returned unchanged. A participant that succeeded while
/// any peer failed gets a `peer_kind` error instead, so all participants
/// leave the phase together and stay in step for the next collective call.
pub fn agree<T>(
    aggregator: &dyn Aggregator,
    local: Result<T>,
    peer_kind: ErrorKind,
    operation: &'static str,
) -> Result<T> {
    let all_ok = aggregator.all_equal(local.is_ok() as u64);
    match local {
        Err(e) => Err(e),
        Ok(_) if !all_ok => Err(Error::new(peer_kind, "a peer participant failed")
            .with_operation(operation)
            .with_context("rank", aggregator.rank().to_string())),
        ok => ok,
    }
}

#[cfg(feature = "mpi")]
pub use self::mpi_impl::MpiAggregator;

#[cfg(feature = "mpi")]
mod mpi_impl {
    use mpi::collective::SystemOperation;
    use mpi::topology::SimpleCommunicator;
    use mpi::traits::*;

    use super::Aggregator;
    use crate::error::{Error, ErrorKind, Result};

    /// Participants are the ranks of `MPI_COMM_WORLD`.
    pub struct MpiAggregator {
        world: SimpleCommunicator,
        // Finalizes MPI on drop, so it must outlive `world`.
        _universe: mpi::environment::Universe,
    }

    impl MpiAggregator {
        /// Initialize MPI. Fails if it was already initialized.
        pub fn init() -> Result<Self> {
            let universe = mpi::initialize().ok_or_else(|| {
                Error::new(ErrorKind::Unexpected, "MPI was already initialized")
                    .with_operation("MpiAggregator::init")
            })?;
            let world = universe.world();
            Ok(Self {
                world,
                _universe: universe,
            })
        }
    }

    impl Aggregator for MpiAggregator {
        fn rank(&self) -> usize {
            self.world.rank() as usize
        }

        fn participants(&self) -> usize {
            self.world.size() as usize
        }

        fn barrier(&self) {
            self.world.barrier();
        }

        fn reduce_max_to_root(&self, value: f64) -> Option<f64> {
            let root = self.world.process_at_rank(0);
            if self.is_root() {
                let mut max = 0.0f64;
                root.reduce_into_root(&value, &mut max, SystemOperation::max());
                Some(max)
            } else {
                root.reduce_into(&value, SystemOperation::max());
                None
            }
        }

        fn all_equal(&self, value: u64) -> bool {
            let mut min = 0u64;
            let mut max = 0u64;
            self.world
                .all_reduce_into(&value, &mut min, SystemOperation::min());
            self.world
                .all_reduce_into(&value, &mut max, SystemOperation::max());
            min == max
        }
    }
}
