pub mod conversation;
pub mod errors;
pub mod frame;
pub mod ids;
pub mod mock;
pub mod step;
pub mod task;

pub use conversation::{
    Activity, ChannelAccount, ContinuationFn, ConversationAccount, ConversationAdapter,
    ConversationReference, ResourceResponse, TurnContext,
};
pub use errors::{BridgeError, TaskError};
pub use frame::Frame;
pub use ids::{ConnectionId, Identity};
pub use step::{Step, StepOutput};
pub use task::{StepCallback, TaskAgent, TaskEngine, TaskOutcome};
