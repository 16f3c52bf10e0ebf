//! Replacement policy engine.

pub(crate) mod cart;
