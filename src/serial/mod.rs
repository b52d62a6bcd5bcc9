pub mod adapter;
pub mod autobaud;
pub mod channel;

pub use adapter::{ReadOutcome, SerialAdapter};
pub use autobaud::AutobaudResult;
