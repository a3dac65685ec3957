#![doc = include_str!("../README.md")]

mod allocator;
mod id;
mod status;
mod time;

#[cfg(test)]
mod tests;

pub use crate::allocator::*;
pub use crate::id::*;
pub use crate::status::*;
pub use crate::time::*;
