//! Output formatting for the container tree.
//!
//! - [`report`] - per-container block listing and totals

mod report;

pub use report::{print_report, report_rows, BlockTotals, ReportRow};
