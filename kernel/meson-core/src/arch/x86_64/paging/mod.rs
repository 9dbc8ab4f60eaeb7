//! Page-table walking and mapping.

mod mapper;

pub use mapper::{MapError, PageTableMapper, TranslateResult};
