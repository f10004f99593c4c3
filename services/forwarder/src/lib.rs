pub mod config;
pub mod error;
pub mod forwards;
pub mod proxy;
pub mod reload;

pub use error::{ForwardError, GlueError, RegistryError};
pub use forwards::{ForwardTable, TableError};
pub use proxy::{
    ClientConfig, Connector, ListenerRegistry, PipeStats, ServerConfig, Session, SessionState,
    SharedListenerRegistry, Target, TcpConnector,
};
pub use reload::Reloader;
