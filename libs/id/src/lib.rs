//! # skiff-id
//!
//! Typed ID types for the skiff scheduler platform.
//!
//! ## Design Principles
//!
//! - IDs are stable and server-generated; names are user-controlled labels
//! - All IDs have a canonical string representation with strict parsing
//! - IDs support roundtrip serialization (parse → format → parse)
//! - IDs are typed so an allocation ID can never be passed where an
//!   evaluation ID is expected
//!
//! ## ID Format
//!
//! All resource IDs use a prefixed format: `{prefix}_{ulid}`
//!
//! Examples:
//! - `alloc_01HV4Z2WQXKJNM8GPQY6VBKC3D`
//! - `eval_01HV4Z3MXNKPQR9HSTZ7WCLD4E`
//! - `node_01HV4Z4NYPLTRS0JTUA8XDME5F`

mod error;
mod macros;
mod types;

pub use error::IdError;
pub use types::*;

/// Re-export ulid for consumers that need raw ULID operations
pub use ulid::Ulid;
