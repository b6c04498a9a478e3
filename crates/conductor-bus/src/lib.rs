//! conductor-bus - message routing between agents
//!
//! Point-to-point delivery to subscribed handlers, correlated
//! request/response with timeouts, fan-out broadcast, and the adapter
//! that exposes an [`Agent`] through the broker.

pub mod agent;
pub mod broker;

pub use agent::{Agent, AgentHandler};
pub use broker::{BroadcastReport, MessageBroker, MessageHandler, Subscription, handler_fn};
