//! Synchronisation between the processes of one tree

pub mod barrier;

pub use barrier::{Barrier, BarrierError, SignalBarrier, MAX_PARTIES};
