mod envelope;
mod event;
mod status;

pub use envelope::{decode, encode, CodecError, RetryEnvelope};
pub use event::{Event, Headers, Message, HEADER_MESSAGE_ROUTE};
pub use status::ProcessStatus;
