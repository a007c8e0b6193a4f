//! Readiness notification and cross-thread wakeups

pub mod poller;

pub use poller::{Note, Notifier, Poller, Ready, Registrar};
