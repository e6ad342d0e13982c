//! The event-loop core: a single thread owns every socket, multiplexes
//! readiness and buffers outbound data when the kernel socket is full.

pub mod buffer;
pub mod chann;
pub mod chunk;
pub mod poll;
pub mod support;

pub use self::buffer::Buffer;
pub use self::chann::{ChannId, ChannState};
pub use self::poll::{ChannEvent, Event, EventLoop};
pub use self::support::{ErrorType, ErrorUtils, NetworkError, NetworkResult};
