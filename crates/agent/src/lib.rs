pub mod error;
pub mod gate;
pub mod roles;
pub mod session;
pub mod types;

pub use error::AgentError;
pub use gate::{CommandGate, GateDecision, PermissiveGate};
pub use roles::AgentRole;
pub use session::{AgentClient, AgentSession};
pub use types::{
    AgentMessage, ResultSubtype, SessionOptions, SessionOutcome, SubAgentDefinition,
};
