//! sidelink-services — chunk queues, stream links, and the session manager
//! that ties serializers, peers, and transfers together.

pub mod chunk_queue;
pub mod link;
pub mod peer;
pub mod session;
pub mod transfer;
pub mod transport;

pub use chunk_queue::{ChunkQueue, Delivered};
pub use link::{LinkConfig, StreamLink};
pub use peer::{new_registry, PeerEntry, PeerRegistry};
pub use session::{SessionError, SessionEvent, SessionHandle, SessionManager};
pub use transfer::{
    IncomingTransfer, ListenerControl, MessageScheduler, OutgoingState, OutgoingTransfer,
    SubscriptionId, TransferRegistry,
};
pub use transport::{ConnectionStatus, PeerId, TransportError, TransportEvent};
