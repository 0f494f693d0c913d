//! Session and dispatch core for controlling Pioneer AVRs over their
//! line-oriented ASCII TCP control protocol.
//!
//! This crate owns the hard engineering around a single persistent session
//! to a constrained embedded device: framing and reconnect ([`connection`]),
//! request/response correlation against an interleaved unsolicited event
//! stream ([`responder`]), a rate-limited multi-queue command scheduler
//! ([`queue`]), a periodic refresh scheduler ([`updater`]), a layered
//! parameter engine ([`params`]), a zone-indexed property cache
//! ([`properties`]), and the command/decoder registry abstraction
//! ([`codes`]) that an embedding application populates with the actual
//! per-command wire table and per-response decoders. [`facade::Facade`] is
//! the typed entry point composing all of the above.

// =============================================================================
// Lints - Enforce code quality and consistency
// =============================================================================

#![deny(unsafe_code)]
#![deny(unused_must_use)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![deny(clippy::todo)]
#![deny(clippy::unimplemented)]

// Note: clippy::pedantic, clippy::nursery, and clippy::cargo are NOT enabled
// because they have hundreds of existing violations. Enable incrementally.

pub mod codes;
pub mod connection;
pub mod error;
pub mod facade;
pub mod model;
pub mod params;
pub mod properties;
pub mod queue;
pub mod responder;
pub mod updater;

pub use error::{AvrError, AvrResult};
pub use facade::Facade;
pub use model::{CommandItem, Scalar, Tristate, TunerBand, Zone};
