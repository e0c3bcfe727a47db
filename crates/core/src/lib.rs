//! Reflector core types: object references and annotation-driven reflection policy.
//!
//! Everything here is pure. Policy is derived from an object's metadata at the moment it is
//! observed and never cached by this crate.

#![forbid(unsafe_code)]

pub mod annotations;
mod patterns;
mod properties;
mod reference;

pub use patterns::PatternList;
pub use properties::{MirroringProperties, ReflectionStamp};
pub use reference::{NamespacedName, ReferenceError};
