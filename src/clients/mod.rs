pub mod retry;
pub mod sifen_client;

pub use retry::RetryPolicy;
pub use sifen_client::{SifenClient, SifenTransport};
