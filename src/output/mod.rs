//! Round reporting
//!
//! - `text`: console report
//! - `json`: JSON report file

pub mod json;
pub mod text;
