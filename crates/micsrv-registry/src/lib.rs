#![doc = include_str!("../README.md")]

mod cache;
mod client;
mod config;
mod error;
mod select;
mod wire;

pub use crate::cache::*;
pub use crate::client::*;
pub use crate::config::*;
pub use crate::error::*;
pub use crate::select::*;
pub use crate::wire::*;
