//! # hwmgr-id
//!
//! Validated name types for the hardware manager.
//!
//! ## Design Principles
//!
//! - Names are user-controlled and double as object names in the store
//! - Names are kept exactly as written; comparison is case-sensitive
//! - Names are typed to prevent mixing a node name with a profile name
//!
//! ## Name Format
//!
//! Any string of 1 to 253 characters without control characters.
//!
//! Examples:
//! - `edge-profile`
//! - `cloud-1`
//! - `profile-spr-single-processor-64G`

mod error;
mod macros;
mod types;

pub use error::IdError;
pub use types::*;
