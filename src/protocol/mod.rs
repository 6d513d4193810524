//! Protocol families shipped with the crate.

pub mod example;
