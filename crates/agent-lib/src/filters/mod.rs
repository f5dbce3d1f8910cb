//! Matching logic shared by the writer and monitor outputs
//!
//! Filter values come in three flavours:
//! - static strings (`cpu.utilization`)
//! - globs (`cpu.*`, `memory.?sed`)
//! - regular expressions wrapped in slashes (`/^disk\.(read|write)$/`)
//!
//! Any value may be prefixed with `!` to invert it.

mod datapoint;
mod dimprops;
mod string;

pub use datapoint::{DatapointFilter, FilterSet, MetricFilter, StringOrList};
pub use dimprops::{DimPropsFilter, PropertyFilterConfig};
pub use string::{StringFilter, StringMapFilter};

#[cfg(test)]
mod tests;
