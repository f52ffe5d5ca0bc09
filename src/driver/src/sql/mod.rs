pub mod client_parser;
pub mod escape;

pub use client_parser::{rewrite_query, ClientPrepareResult};
pub use escape::{native_sql, EscapeContext};
