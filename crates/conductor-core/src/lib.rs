//! conductor-core - shared foundation of the conductor orchestration stack
//!
//! This crate provides:
//! - Agent, capability, message and response types
//! - The error taxonomy used across every conductor crate
//! - The in-memory agent registry

pub mod error;
pub mod registry;
pub mod types;

pub use error::{OrchestrationError, Result};
pub use registry::AgentRegistry;
pub use types::{
    AgentDescriptor, Capability, CapabilityInvocation, Message, MessageKind, Permission,
    RateLimit, Response, ResponseError,
};
