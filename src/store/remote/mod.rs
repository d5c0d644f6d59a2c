pub mod backend;
pub mod endpoint;
#[cfg(test)]
pub mod memory;
pub mod session;
pub mod ssh;
pub mod transport;

pub use backend::RemoteBackend;
pub use endpoint::{Auth, Endpoint, HostKeyPolicy, RemoteTarget};
pub use session::{ConnectionStatus, RemoteSession};
pub use ssh::SshConnector;
pub use transport::Timeouts;
