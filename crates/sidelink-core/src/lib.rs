//! sidelink-core — wire format, session messages, and the incremental
//! serializer/deserializer pair. All other sidelink crates depend on this one.

pub mod config;
pub mod deserializer;
pub mod message;
pub mod peer;
pub mod serializer;
pub mod sink;
pub mod wire;

pub use deserializer::{DeserializeError, DeserializerEvent, DeserializerListener, DeserializerState, SessionMessageDeserializer};
pub use message::{Body, DataTransferMessage, Headers, MessageKind, Payload, SessionMessage, Status};
pub use peer::{Peer, PublicKey};
pub use serializer::{DeliveryProgress, SessionMessageSerializer};
pub use sink::{FileSinkFactory, OverflowSink, OverflowSinkFactory};
