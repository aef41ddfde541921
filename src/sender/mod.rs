pub mod http;
pub mod traits;

pub use http::{classify_status, HttpSender, StatusClass};
pub use traits::{LogSender, SendError, SendOutcome, SendRequest, SuspensionSignal};
