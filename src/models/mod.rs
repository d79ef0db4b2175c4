pub mod cdc;
pub mod invoice;
pub mod loaders;
pub mod response;
pub mod status;

pub use cdc::{Cdc, CdcFields};
pub use invoice::{InvoiceInput, InvoiceItem, IvaRate};
pub use loaders::{load_all_invoices, load_invoice};
pub use response::{DocumentResult, LotResponse, ResultMessage, SendResponse};
pub use status::{classify, CodeClass, DocumentState, SifenCode};
