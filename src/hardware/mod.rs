//! Instrument drivers.
//!
//! Only the simulated bench ships here; real drivers plug in behind the
//! capability traits in [`crate::capabilities`].

pub mod mock;
