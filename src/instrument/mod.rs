//! Instrument implementations.
//!
//! Real vendor drivers plug in behind the capability traits in [`crate::core`].
//! This module ships the mock implementations used by tests and the demo
//! binary; hardware backends live out of tree with the vendor SDKs.

pub mod mock;
