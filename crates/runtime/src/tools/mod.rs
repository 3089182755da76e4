//! Tool-server connections and call routing.

mod manager;
mod name;
mod session;
mod types;

pub use manager::{ConnectionManager, LiveConnection};
pub use name::{QualifiedName, SEPARATOR};
pub use session::{Connector, McpConnector, ToolSession};
pub use types::{
    ConnectedServer, ConnectionResult, ConnectionStatus, LiveTool, ServerOutcome, ToolOutcome,
};
