use crate::net::chunk::SendQueue;
use mio::net::{TcpListener, TcpStream, UdpSocket};
use mio::Ready;
use std::net::SocketAddr;

/// Index of a socket channel in its event loop's table. Stale ids (a
/// channel already destroyed) are tolerated by every accessor; owners drop
/// their mappings when the CLOSE event arrives.
pub type ChannId = usize;

/// Socket channel lifecycle.
///
/// ```text
/// CLOSED -> CONNECTING -> CONNECTED -> CLOSING -> (destroyed)
/// CLOSED -> LISTENING -> CLOSING -> (destroyed)
/// ```
///
/// Datagram channels skip CONNECTING. A channel in CLOSING is torn down by
/// the event loop at the end of the poll iteration.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ChannState {
    Closed,
    Connecting,
    Connected,
    Listening,
    Closing,
}

pub(crate) enum Sock {
    Stream(TcpStream),
    Listener(TcpListener),
    Dgram(UdpSocket),
}

/// One socket endpoint owned by the event loop: the OS handle, lifecycle
/// state and the outbound byte FIFO drained on write readiness.
pub struct Chann {
    pub(crate) sock: Sock,
    pub(crate) state: ChannState,
    pub(crate) out: SendQueue,
    pub(crate) send_notify: bool,
    pub(crate) registered: Option<Ready>,
    pub(crate) peer: Option<SocketAddr>,
}

impl Chann {
    pub(crate) fn stream(stream: TcpStream, state: ChannState, peer: Option<SocketAddr>) -> Chann {
        Chann {
            sock: Sock::Stream(stream),
            state,
            out: SendQueue::new(),
            send_notify: false,
            registered: None,
            peer,
        }
    }

    pub(crate) fn listener(listener: TcpListener) -> Chann {
        Chann {
            sock: Sock::Listener(listener),
            state: ChannState::Listening,
            out: SendQueue::new(),
            send_notify: false,
            registered: None,
            peer: None,
        }
    }

    pub(crate) fn dgram(socket: UdpSocket, peer: SocketAddr) -> Chann {
        Chann {
            sock: Sock::Dgram(socket),
            state: ChannState::Connected,
            out: SendQueue::new(),
            send_notify: false,
            registered: None,
            peer: Some(peer),
        }
    }

    /// Readiness interest for the next poll, per state: listeners and
    /// connected channels read; a connected channel with queued output or a
    /// requested SEND notification also writes; a connecting channel waits
    /// on writability to learn the connect outcome.
    pub(crate) fn interest(&self) -> Ready {
        match self.state {
            ChannState::Listening => Ready::readable(),
            ChannState::Connecting => Ready::writable(),
            ChannState::Connected => {
                if !self.out.is_empty() || self.send_notify {
                    Ready::readable() | Ready::writable()
                } else {
                    Ready::readable()
                }
            }
            ChannState::Closed | ChannState::Closing => Ready::empty(),
        }
    }
}
