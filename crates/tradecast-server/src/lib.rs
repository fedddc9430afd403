pub mod channel;
pub mod gateway;
pub mod registry;
pub mod relay;
pub mod server;
pub mod sink;
pub mod upload;

pub use channel::{
    BroadcastChannel, ChannelError, FileMailbox, MemoryChannel, Publisher, Subscription,
};
pub use gateway::{PublishError, PublishGateway, PublishOutcome};
pub use registry::RelayRegistry;
pub use relay::{RelayConfig, RelayOutcome, RelaySession};
pub use server::{build_router, start, AppState, ServerConfig, ServerHandle};
pub use upload::{UploadError, UploadForwarder, UploadReceipt};
