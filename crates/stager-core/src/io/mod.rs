//! Memory-mapped table files backing the request and worker tables.

mod table;

pub use table::{FOOTER_SIZE, TableFile, TableFooter, TableLayout, TableOpen};
