pub mod buffer;
pub mod connection;
pub mod fragment;
pub mod message_router;
pub mod packet;
pub mod reliable;
pub mod transport;

pub use buffer::{MessageBuffer, MessageBufferConfig};
pub use connection::{ConnectionPool, ConnectionState, NetworkConnection};
pub use message_router::{FabricSender, MessageRouter};
pub use packet::{seq_delta, ForwardingContext, Packet, PacketType, MAX_HOPS};
pub use reliable::{ReliableConfig, ReliableTransport};
pub use transport::DatagramTransport;
