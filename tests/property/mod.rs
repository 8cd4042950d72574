//! Property-Based Tests Module

mod fold_properties;
