//! Property-Based Tests Entry Point
//!
//! Uses proptest to verify invariants of the projection fold that must hold
//! for every valid event stream.

mod property;
