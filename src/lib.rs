//! Cooperative multi-peer file-tree synchronization engine.
//!
//! A session groups any number of peers around one shared plan of
//! [`action::ActionGroup`]s. Each peer runs the plan through an
//! [`executor::ActionExecutor`]: namespace and metadata operators act on
//! local roots, content copies are applied in place or shipped to other
//! peers as batched archives or delta streams built against published
//! [`signature::FileSignature`]s. A central [`session::Coordinator`] keeps
//! the authoritative completion ledger and pushes progress and the single
//! end event to every member.

pub mod action;
pub mod archive;
pub mod checksum;
pub mod config;
pub mod delta;
pub mod errors;
pub mod executor;
pub mod ledger;
pub mod monitor;
pub mod receiver;
pub mod replace;
pub mod reporter;
pub mod session;
pub mod signature;
pub mod transport;

#[cfg(test)]
pub(crate) mod testutil;

pub use errors::{Result, SyncError};
