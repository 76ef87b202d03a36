pub mod config_providers;
pub mod connector;
pub mod copy;
pub mod pool;
pub mod refresher;
pub mod relay;
pub mod resolver;
pub mod session;

/// Re-export commonly used types from adapters
pub use config_providers::FileConfigProvider;
pub use connector::TcpConnector;
pub use pool::OriginPool;
pub use refresher::HostRefresher;
pub use relay::RelayServer;
pub use resolver::SystemResolver;
pub use session::{RelayError, RelayResult, SessionContext, SessionSettings};
