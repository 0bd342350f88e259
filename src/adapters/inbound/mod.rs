mod push_server;

pub use push_server::{HealthResponse, PushParams, PushServer, PushState};
