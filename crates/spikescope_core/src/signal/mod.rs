//! Signal processing.

mod filtering;

pub use filtering::{apply_filter, apply_filter_with_buffer, FilterConfig, FilterKind};
