//! succinct-services — the store-and-forward engine: record logs, fragment
//! assembly, scheduling, acknowledgement, transports and link liveness.

pub mod ack;
pub mod assembler;
pub mod file_store;
pub mod fragment_log;
pub mod liveness;
pub mod queue;
pub mod reassembly;
pub mod relay;
pub mod roster;
pub mod scheduler;
pub mod store;
pub mod transport;

pub use assembler::FragmentAssembler;
pub use file_store::FileStore;
pub use fragment_log::{Fragment, FragmentLog};
pub use liveness::{Alarm, IpInterface, LivenessTracker};
pub use queue::{MessageQueue, QueueError};
pub use reassembly::Reassembler;
pub use relay::{RelayClient, RelayError};
pub use roster::Roster;
pub use scheduler::SourceScheduler;
pub use store::{LogCursor, LogKey, Record, RecordStore, StoreError, Stream};
pub use transport::{negotiate_mtu, SendStatus, Transport, TransportRegistry, Waker};
