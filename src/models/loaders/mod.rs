pub mod invoice_loader;

pub use invoice_loader::{load_all_invoices, load_invoice};
