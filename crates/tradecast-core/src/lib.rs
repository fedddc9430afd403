pub mod analysis;
pub mod codec;
pub mod dispatcher;
pub mod envelope;
pub mod errors;
pub mod ids;

pub use analysis::{classify_payload, AnalysisOutcome, AnalysisResult, Signal, TakeProfitLevel};
pub use codec::{decode_frames, encode_comment, encode_frame, Frame, RawFrame};
pub use dispatcher::{StreamBuffer, DEFAULT_MAX_PENDING};
pub use envelope::Envelope;
pub use errors::StreamError;
pub use ids::{SessionId, SubscriptionId};
