pub mod error;
pub mod interceptor;
pub mod transaction;

pub use error::TransactionError;
pub use interceptor::TransactionalPublisher;
pub use transaction::{TransactionReceipt, TransactionSpec};
