pub mod config_provider;
pub mod connector;
pub mod resolver;

pub use config_provider::ConfigProvider;
pub use connector::{BoxedTransport, Connector, ConnectorError, ConnectorResult, Transport};
pub use resolver::{Resolver, ResolverError, ResolverResult};
