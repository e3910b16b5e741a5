//! Medrota Core - Entity Types
//!
//! Pure data structures shared by the data access layer: typed identifiers,
//! the records returned by batch loads, load options, and domain errors.
//! This crate performs no I/O.

pub mod entities;
pub mod enums;
pub mod error;
pub mod filter;
pub mod health;
pub mod identity;
pub mod merge;

pub use entities::*;
pub use enums::*;
pub use error::*;
pub use filter::*;
pub use health::*;
pub use identity::*;
pub use merge::*;
