//! ICS payload generation and parsing.
//!
//! This module handles reading and writing iCalendar objects according to RFC 5545.

mod generate;
mod parse;

pub use generate::generate_payload;
pub use parse::parse_payload;
