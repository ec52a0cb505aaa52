#[macro_use]
extern crate serde;

mod claim;
mod config;
mod error;
mod hash;
mod indexer;
mod proof;
mod registry;
pub mod serde_base64;
mod store;
mod tally;
mod tree;

pub use claim::*;
pub use config::*;
pub use error::*;
pub use hash::*;
pub use indexer::*;
pub use proof::*;
pub use registry::*;
pub use store::*;
pub use tally::*;
pub use tree::*;
