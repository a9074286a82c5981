// vim: tw=80

// I don't find this lint very helpful
#![allow(clippy::type_complexity)]

pub mod raid;
pub mod types;
pub mod uri;
pub mod util;
pub mod zbd;

pub use crate::types::*;
pub use crate::util::*;
