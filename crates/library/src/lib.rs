//! Comic archive lifecycle.
//!
//! - [`PathRegistry`]: which file backs each comic right now, with
//!   reference-counted handles so files are only deleted once idle.
//! - [`migrate`]: relocation jobs that copy, extract or re-compress an
//!   archive into the library's canonical `{key}.zip` layout.
//! - [`Supervisor`]: at most one job per comic, composition of overlapping
//!   move requests, and crash recovery from the pending-move journal.
//! - [`Library`]: the above wired together behind import, remove and
//!   relocate, plus the startup graph that brings everything up in order.

pub mod error;
mod library;
pub mod migrate;
mod registry;
mod supervisor;
mod title;

pub use crate::library::{Import, Library, UNIT_RECOVERY, UNIT_REGISTRY, UNIT_STORE};
pub use crate::registry::{Bind, PathHandle, PathRegistry, Reservation};
pub use crate::supervisor::{Recovery, Request, Supervisor};
pub use crate::title::{canonical_path, title_from_path};
