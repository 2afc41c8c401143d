//! Agent-relayed host support
//!
//! Remote hosts without a reachable Docker API run a small on-host agent
//! that dials in over WebSocket. Commands flow out as `{id, type, payload}`
//! frames; responses and unsolicited events flow back on the same socket.

mod channel;
mod registry;

pub use channel::{AgentChannel, AgentError, AgentEvent, AgentHello};
pub use registry::{AgentRegistry, RegistrationRequest, RegistrationResponse};
