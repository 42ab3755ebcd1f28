//! strand: an embeddable AI-agent runtime.
//!
//! The engine drives a streaming model conversation loop with permissioned
//! tool dispatch and publishes fine-grained events with stable cursor
//! ordering; the pool, room, and scheduler coordinate many agents inside
//! one process. Stores, sandboxes, and model providers plug in through
//! contracts.

pub mod agent;
pub mod bus;
pub mod config;
pub mod error;
pub mod events;
pub mod permission;
pub mod pool;
pub mod provider;
pub mod room;
pub mod sandbox;
pub mod scheduler;
pub mod store;
pub mod template;
pub mod testing;
pub mod tools;
pub mod types;

pub use agent::{Agent, Dependencies};
pub use bus::{BusOptions, EventBus, SubscribeOptions, Subscription};
pub use error::{Error, Result};
pub use events::{AgentEvent, ApprovalDecision, Channel, EventEnvelope, ReplyHandle};
pub use permission::{PermissionDecision, PermissionManager, PermissionMode, PermissionOptions};
pub use pool::{Pool, PoolOptions};
pub use room::Room;
pub use scheduler::{Scheduler, SchedulerOptions};
pub use types::{
    AgentState, AgentStatus, Bookmark, Breakpoint, ContentBlock, Message, Role, ToolCallRecord,
    ToolCallState,
};
