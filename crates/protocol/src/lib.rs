//! # Render Stats Protocol Library
//!
//! Wire-level types shared by the status server and its clients. Nothing in
//! this crate performs I/O.
//!
//! ## Overview
//!
//! - **Snapshot Schema**: [`ProgressSnapshot`] and its fixed JSON encoding
//! - **HTTP Framing**: request-line parsing, query lookup and response encoding
//!
//! ## Example Usage
//!
//! ```rust
//! use protocol::{HttpRequest, HttpResponse, ProgressSnapshot};
//!
//! let request = HttpRequest::parse(b"GET /stats?key=abc HTTP/1.1\r\n\r\n").unwrap();
//! assert_eq!(request.path(), "/stats");
//! assert_eq!(request.query_param("key"), Some("abc"));
//!
//! let snapshot = ProgressSnapshot::from_counts(50, 200, 0.1, true);
//! let response = HttpResponse::json(snapshot.to_json().unwrap());
//! assert!(response.to_bytes().starts_with(b"HTTP/1.1 200 OK\r\n"));
//! ```
//!
//! ## Modules
//!
//! - [`http`]: HTTP/1.1 request parsing and response encoding
//! - [`snapshot`]: Progress snapshot schema
//! - [`error`]: Error types

pub mod error;
pub mod http;
pub mod snapshot;

pub use error::{ProtocolError, Result};
pub use http::{
    find_header_end, HttpRequest, HttpResponse, StatusCode, CONTENT_TYPE_HTML, CONTENT_TYPE_JSON,
    CONTENT_TYPE_TEXT, HEADER_TERMINATOR,
};
pub use snapshot::ProgressSnapshot;
