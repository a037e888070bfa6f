//! Call orchestration: the state machine, participant registry, stream
//! assembly and the manager that ties them to signaling and media.

pub mod error;
pub mod handler;
pub mod manager;
pub mod participants;
pub mod state;
pub mod streams;

pub use error::CallError;
pub use manager::{
    AcceptTrigger, CallCapabilities, CallManager, CallManagerConfig, RemotePeer,
};
pub use participants::{Participant, ParticipantRegistry, ParticipantStatus};
pub use state::{CallPhase, CallTransition, CurrentCall};
pub use streams::StreamAssembler;
