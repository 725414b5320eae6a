pub mod outbox;
pub mod protocol;
pub mod registry;
pub mod socket;
pub mod subscriptions;

pub use outbox::{Outbound, Outbox};
pub use protocol::{ProtocolHandler, Session, SessionState};
pub use registry::{Connection, ConnectionRegistry, RegistryStats};
pub use subscriptions::SubscriptionManager;
