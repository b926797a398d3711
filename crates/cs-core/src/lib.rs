//! cs-core: stable foundation for the circstep crates.
//!
//! Contains:
//! - numeric (Real + tolerances + float helpers + error weights)
//! - comm (collective reductions and the norms built on them)
//! - error (shared error types)

pub mod comm;
pub mod error;
pub mod numeric;

pub use comm::{Communicator, SerialComm, inf_norm, two_norm, weighted_rms_norm, wrms_partial_sum};
pub use error::{CoreError, CoreResult};
pub use numeric::*;
