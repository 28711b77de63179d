// Capture rounds: completion signals, output sinks, the round coordinator
// and the session facade.

pub mod coordinator;
pub mod session;
pub mod signal;
pub mod sink;
