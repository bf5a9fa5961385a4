//! `pilot-kernel` – interruption and mutual-exclusion primitives.
//!
//! The kernel does not decide anything; it keeps the deciders from stepping
//! on each other.  It carries no async runtime: everything here is plain
//! synchronous state inspected from the cooperative control loop.
//!
//! # Modules
//!
//! - [`action_lock`] – [`ActionLock`][action_lock::ActionLock]: advisory,
//!   priority-leveled, self-expiring mutex over the shared actuator.
//! - [`reflex_stack`] – [`ReflexStack`][reflex_stack::ReflexStack]: LIFO
//!   reflex frames that freeze goal arbitration while non-empty, via the
//!   [`ArbitrationGate`][reflex_stack::ArbitrationGate] seam.
//! - [`cancel`] – [`CancelFlag`][cancel::CancelFlag]: cooperative
//!   cancellation token polled at safe points by long-running operations.

pub mod action_lock;
pub mod cancel;
pub mod reflex_stack;

pub use action_lock::{ActionLock, LockHolder};
pub use cancel::CancelFlag;
pub use reflex_stack::{ArbitrationGate, ReflexFrame, ReflexStack};
