pub mod agents;
pub mod broker;
pub mod dispatch;
pub mod error;
pub mod fanout;
pub mod store;
pub mod tasks;
pub mod terminal;

pub use agents::AgentRegistry;
pub use dispatch::{JobDispatcher, JobRequest};
pub use error::{HiveError, Result};
pub use fanout::{EventGateway, EventSubscriber, OverflowPolicy, publish_event};
pub use store::{MemoryStore, RedisStore, StateStore, Subscription};
pub use tasks::{TaskSource, TaskWatcher};
pub use terminal::{BridgeState, ClientFrame, CloseReason, PtyBridge, TerminalSpec};
