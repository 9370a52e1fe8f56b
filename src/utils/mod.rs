//! # Utility Modules
//!
//! Small collaborator seams kept in-crate.
//!
//! ## Components
//! - **Uri**: URI parsing into host/port/path/secure/query and flat
//!   query-map encoding/decoding

pub mod uri;

pub use uri::{decode_query, encode_query, ParsedUri};
