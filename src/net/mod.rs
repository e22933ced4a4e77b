//! Networking: source address selection, the transport capability, and the
//! rate-limit-aware fetch layer.

mod addr;
mod fetcher;
mod transport;

pub use addr::AddressPool;
pub use fetcher::{BackoffPolicy, DocKind, Fetcher};
pub use transport::{HttpTransport, Transport, TransportReply};
