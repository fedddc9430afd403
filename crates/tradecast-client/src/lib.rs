pub mod backoff;
pub mod error;
pub mod history;
pub mod options;
pub mod session;
pub mod transport;

pub use backoff::ReconnectPolicy;
pub use error::ClientError;
pub use history::History;
pub use options::{Backoff, SessionOptions};
pub use session::{ConnectionState, SessionHandlers, SseSession};
pub use transport::{ByteStream, Connector, HttpConnector};
pub use session::WAITING_STATUS;
