use crate::logging;
use crate::net::buffer::{Buffer, IngressEnd};
use crate::net::chann::{Chann, ChannId, ChannState, Sock};
use crate::net::chunk::ChunkPool;
use crate::net::support::{ErrorType, NetworkError, NetworkResult};
use mio::net::{TcpListener, TcpStream, UdpSocket};
use mio::{Events, Poll, PollOpt, Ready, Token};
use std::io;
use std::io::Write;
use std::net::SocketAddr;
use std::time::Duration;

const EVENT_CAPACITY: usize = 4096;

/// Upper bound on bytes queued behind one channel. A consumer slow enough
/// to hit this is cut off rather than growing the queue without bound.
const MAX_SEND_QUEUE: usize = 64 * crate::CHANN_BUF_SIZE;

/// Readiness outcome delivered to the channel owner. At most one event per
/// readiness flag per channel per poll; CLOSE is always the final event a
/// channel produces.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Event {
    /// A listener produced a new connected channel.
    Accept(ChannId),
    /// An outbound connect completed.
    Connect,
    /// An outbound connect failed (`SO_ERROR` set).
    Disconnect,
    /// The channel has data to read.
    Recv,
    /// The outbound queue drained and the owner asked for send readiness.
    Send,
    /// The channel was destroyed; its id is stale after this.
    Close,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct ChannEvent {
    pub id: ChannId,
    pub event: Event,
}

/// Single-threaded readiness multiplex over every socket channel. Owners
/// never block inside event handling; anything needing I/O is expressed as
/// state changes on channels and picked up on the next readiness pass.
pub struct EventLoop {
    poll: Poll,
    events: Events,
    channs: Vec<Option<Chann>>,
    free: Vec<ChannId>,
    retired: Vec<ChannId>,
    pool: ChunkPool,
    log: logging::Logger,
}

impl EventLoop {
    pub fn new(log: &logging::Logger) -> NetworkResult<EventLoop> {
        Ok(EventLoop {
            poll: Poll::new()?,
            events: Events::with_capacity(EVENT_CAPACITY),
            channs: Vec::new(),
            free: Vec::new(),
            retired: Vec::new(),
            pool: ChunkPool::new(),
            log: log.new(logging::o!("module" => "net")),
        })
    }

    /// Count of live channels.
    pub fn chann_count(&self) -> usize {
        self.channs.iter().filter(|slot| slot.is_some()).count()
    }

    /// Open a stream listener.
    pub fn listen(&mut self, addr: &SocketAddr) -> NetworkResult<ChannId> {
        let listener = TcpListener::bind(addr)?;
        let id = self.install(Chann::listener(listener));

        logging::debug!(self.log, "listener open"; "chann" => id, "addr" => %addr);
        Ok(id)
    }

    /// Start an outbound stream connect; the channel sits in CONNECTING
    /// until the CONNECT or DISCONNECT event fires.
    pub fn connect(&mut self, addr: &SocketAddr) -> NetworkResult<ChannId> {
        let stream = TcpStream::connect(addr)?;
        let id = self.install(Chann::stream(stream, ChannState::Connecting, Some(*addr)));

        logging::debug!(self.log, "connecting"; "chann" => id, "addr" => %addr);
        Ok(id)
    }

    /// Open a connected datagram channel; broadcast sockets get the
    /// broadcast option set. Datagram channels are CONNECTED immediately.
    pub fn connect_datagram(&mut self, addr: &SocketAddr, broadcast: bool) -> NetworkResult<ChannId> {
        let bind = "0.0.0.0:0".parse::<SocketAddr>().expect("Static bind address must parse");
        let socket = UdpSocket::bind(&bind)?;

        if broadcast {
            socket.set_broadcast(true)?;
        }
        socket.connect(*addr)?;

        Ok(self.install(Chann::dgram(socket, *addr)))
    }

    /// Request teardown. Idempotent; the owner receives a final CLOSE event
    /// at the end of a poll iteration and the slot is recycled afterwards.
    pub fn close(&mut self, id: ChannId) {
        if let Some(slot) = self.channs.get_mut(id) {
            if let Some(ch) = slot.as_mut() {
                if ch.state != ChannState::Closing {
                    logging::trace!(self.log, "closing"; "chann" => id);
                    ch.state = ChannState::Closing;
                }
            }
        }
    }

    pub fn state(&self, id: ChannId) -> ChannState {
        match self.channs.get(id) {
            Some(Some(ch)) => ch.state,
            _ => ChannState::Closed,
        }
    }

    /// Peer address: the accepted/connected remote end.
    pub fn peer_addr(&self, id: ChannId) -> Option<SocketAddr> {
        match self.channs.get(id) {
            Some(Some(ch)) => match ch.sock {
                Sock::Stream(ref stream) => stream.peer_addr().ok().or(ch.peer),
                _ => ch.peer,
            },
            _ => None,
        }
    }

    pub fn local_addr(&self, id: ChannId) -> Option<SocketAddr> {
        match self.channs.get(id) {
            Some(Some(ch)) => match ch.sock {
                Sock::Stream(ref stream) => stream.local_addr().ok(),
                Sock::Listener(ref listener) => listener.local_addr().ok(),
                Sock::Dgram(ref socket) => socket.local_addr().ok(),
            },
            _ => None,
        }
    }

    /// Bytes currently queued behind the channel.
    pub fn queued(&self, id: ChannId) -> usize {
        match self.channs.get(id) {
            Some(Some(ch)) => ch.out.len(),
            _ => 0,
        }
    }

    /// Enable the user-requested SEND event: fired on write readiness once
    /// the outbound queue is empty.
    pub fn set_send_notify(&mut self, id: ChannId, active: bool) {
        if let Some(slot) = self.channs.get_mut(id) {
            if let Some(ch) = slot.as_mut() {
                ch.send_notify = active;
            }
        }
    }

    /// Queue or directly write bytes. Bytes handed over are delivered in
    /// order and in full unless the channel ends up CLOSING; a refused
    /// direct write parks the remainder in the queue for the next write
    /// readiness.
    pub fn send(&mut self, id: ChannId, data: &[u8]) -> NetworkResult<usize> {
        let EventLoop {
            ref mut channs,
            ref mut pool,
            ref log,
            ..
        } = *self;

        let ch = match channs.get_mut(id) {
            Some(Some(ch)) => ch,
            // Stale id: the channel is gone and so is the data
            _ => return Ok(data.len()),
        };

        match ch.state {
            ChannState::Connecting | ChannState::Connected => (),
            _ => return Ok(data.len()),
        }

        if ch.out.len() + data.len() > MAX_SEND_QUEUE {
            logging::error!(log, "send queue overflow"; "chann" => id, "queued" => ch.out.len());
            ch.state = ChannState::Closing;
            return Err(NetworkError::Fatal(ErrorType::QueueOverflow));
        }

        let Chann {
            ref mut out,
            ref sock,
            ref mut state,
            ..
        } = *ch;

        // FIFO order: never write directly past queued bytes
        if !out.is_empty() || *state == ChannState::Connecting {
            out.push(pool, data);
            return Ok(data.len());
        }

        match *sock {
            Sock::Stream(ref stream) => {
                let mut written = 0;
                let mut writer = stream;

                while written < data.len() {
                    match writer.write(&data[written..]) {
                        Ok(0) => {
                            *state = ChannState::Closing;
                            return Err(NetworkError::Fatal(ErrorType::WriteZero));
                        }
                        Ok(count) => written += count,
                        Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {
                            out.push(pool, &data[written..]);
                            return Ok(data.len());
                        }
                        Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                        Err(err) => {
                            logging::debug!(log, "send error"; "chann" => id, "err" => %err);
                            *state = ChannState::Closing;
                            return Err(NetworkError::Fatal(ErrorType::Io));
                        }
                    }
                }

                Ok(written)
            }
            Sock::Dgram(ref socket) => {
                // Datagram semantics: a refused packet is dropped
                let _ = socket.send(data);
                Ok(data.len())
            }
            Sock::Listener(_) => Ok(data.len()),
        }
    }

    /// Read everything available into the supplied buffer. A would-block
    /// stop is normal; a peer close transitions the channel to CLOSING (the
    /// CLOSE event follows) after returning the bytes that did arrive.
    pub fn recv_into(&mut self, id: ChannId, buf: &mut Buffer) -> NetworkResult<usize> {
        let ch = match self.channs.get_mut(id) {
            Some(Some(ch)) => ch,
            _ => return Ok(0),
        };

        if ch.state != ChannState::Connected {
            return Ok(0);
        }

        match ch.sock {
            Sock::Stream(ref stream) => match buf.ingress(stream) {
                Ok((count, IngressEnd::Eof)) => {
                    ch.state = ChannState::Closing;
                    Ok(count)
                }
                Ok((count, _)) => Ok(count),
                Err(err) => {
                    logging::debug!(self.log, "recv error"; "chann" => id, "err" => %err);
                    ch.state = ChannState::Closing;
                    Err(NetworkError::Fatal(ErrorType::Io))
                }
            },
            Sock::Dgram(ref socket) => {
                let mut total = 0;
                loop {
                    let space = buf.write_slice();
                    if space.is_empty() {
                        return Ok(total);
                    }
                    match socket.recv(space) {
                        Ok(count) => {
                            buf.move_tail(count);
                            total += count;
                        }
                        Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(total),
                        Err(_) => return Ok(total),
                    }
                }
            }
            Sock::Listener(_) => Ok(0),
        }
    }

    /// One readiness pass. `None` blocks until something is ready, a zero
    /// duration is a non-blocking check. Returns the typed events in
    /// dispatch order; channels that entered CLOSING are issued their CLOSE
    /// event last and destroyed before this returns, and their ids are not
    /// reused until the following iteration.
    pub fn poll(&mut self, timeout: Option<Duration>) -> NetworkResult<Vec<ChannEvent>> {
        // Ids retired last pass become reusable once their CLOSE has been seen
        self.free.append(&mut self.retired);

        self.refresh_registrations()?;

        loop {
            match self.poll.poll(&mut self.events, timeout) {
                Ok(_) => break,
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err.into()),
            }
        }

        let ready_list: Vec<(usize, Ready)> = self
            .events
            .iter()
            .map(|event| (event.token().0, event.readiness()))
            .collect();

        let mut out = Vec::new();

        for (id, ready) in ready_list {
            let state = match self.channs.get(id) {
                Some(Some(ch)) => ch.state,
                _ => continue,
            };

            match state {
                ChannState::Listening => {
                    if ready.is_readable() {
                        self.accept_one(id, &mut out);
                    }
                }
                ChannState::Connecting => {
                    // Error conditions may surface without read/write bits,
                    // so any readiness on a connecting channel is the probe
                    self.finish_connect(id, &mut out);
                }
                ChannState::Connected => {
                    if ready.is_readable() {
                        out.push(ChannEvent { id, event: Event::Recv });
                    }
                    if ready.is_writable() {
                        self.flush_or_notify(id, &mut out);
                    }
                }
                _ => (),
            }
        }

        self.reap(&mut out);

        Ok(out)
    }

    fn install(&mut self, chann: Chann) -> ChannId {
        match self.free.pop() {
            Some(id) => {
                self.channs[id] = Some(chann);
                id
            }
            None => {
                self.channs.push(Some(chann));
                self.channs.len() - 1
            }
        }
    }

    fn refresh_registrations(&mut self) -> NetworkResult<()> {
        let EventLoop {
            ref poll,
            ref mut channs,
            ..
        } = *self;

        for (id, slot) in channs.iter_mut().enumerate() {
            let ch = match slot.as_mut() {
                Some(ch) => ch,
                None => continue,
            };

            let want = ch.interest();

            match ch.registered {
                None if !want.is_empty() => {
                    register_sock(poll, id, &ch.sock, want, false)?;
                    ch.registered = Some(want);
                }
                Some(_) if want.is_empty() => {
                    deregister_sock(poll, &ch.sock);
                    ch.registered = None;
                }
                Some(current) if current != want => {
                    register_sock(poll, id, &ch.sock, want, true)?;
                    ch.registered = Some(want);
                }
                _ => (),
            }
        }

        Ok(())
    }

    fn accept_one(&mut self, id: ChannId, out: &mut Vec<ChannEvent>) {
        let accepted = match self.channs[id] {
            Some(ref ch) => match ch.sock {
                Sock::Listener(ref listener) => match listener.accept() {
                    Ok(pair) => Some(pair),
                    Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => None,
                    Err(err) => {
                        logging::error!(self.log, "accept error"; "chann" => id, "err" => %err);
                        None
                    }
                },
                _ => None,
            },
            None => None,
        };

        if let Some((stream, peer)) = accepted {
            let new_id = self.install(Chann::stream(stream, ChannState::Connected, Some(peer)));

            logging::debug!(self.log, "accepted"; "listener" => id, "chann" => new_id, "peer" => %peer);
            out.push(ChannEvent {
                id,
                event: Event::Accept(new_id),
            });
        }
    }

    fn finish_connect(&mut self, id: ChannId, out: &mut Vec<ChannEvent>) {
        let ch = match self.channs.get_mut(id) {
            Some(Some(ch)) => ch,
            _ => return,
        };

        let outcome = match ch.sock {
            Sock::Stream(ref stream) => stream.take_error(),
            _ => return,
        };

        match outcome {
            Ok(None) => {
                ch.state = ChannState::Connected;
                logging::debug!(self.log, "connected"; "chann" => id);
                out.push(ChannEvent {
                    id,
                    event: Event::Connect,
                });
            }
            Ok(Some(err)) => {
                logging::debug!(self.log, "connect failed"; "chann" => id, "err" => %err);
                ch.state = ChannState::Closing;
                out.push(ChannEvent {
                    id,
                    event: Event::Disconnect,
                });
            }
            Err(err) => {
                logging::debug!(self.log, "connect probe failed"; "chann" => id, "err" => %err);
                ch.state = ChannState::Closing;
                out.push(ChannEvent {
                    id,
                    event: Event::Disconnect,
                });
            }
        }
    }

    /// Write readiness on a connected channel: drain queued bytes first,
    /// then surface the user SEND event once nothing is pending.
    fn flush_or_notify(&mut self, id: ChannId, out: &mut Vec<ChannEvent>) {
        let EventLoop {
            ref mut channs,
            ref mut pool,
            ref log,
            ..
        } = *self;

        let ch = match channs.get_mut(id) {
            Some(Some(ch)) => ch,
            _ => return,
        };

        let Chann {
            out: ref mut queue,
            ref sock,
            ref mut state,
            ref send_notify,
            ..
        } = *ch;

        if !queue.is_empty() {
            let result = match *sock {
                Sock::Stream(ref stream) => queue.drain(stream, pool),
                _ => Ok(0),
            };

            if let Err(err) = result {
                logging::debug!(log, "flush error"; "chann" => id, "err" => %err);
                *state = ChannState::Closing;
            }
        } else if *send_notify {
            out.push(ChannEvent {
                id,
                event: Event::Send,
            });
        }
    }

    fn reap(&mut self, out: &mut Vec<ChannEvent>) {
        for id in 0..self.channs.len() {
            let closing = match self.channs[id] {
                Some(ref ch) => ch.state == ChannState::Closing,
                None => false,
            };

            if !closing {
                continue;
            }

            let mut ch = self.channs[id].take().expect("Closing slot must be live");

            if ch.registered.is_some() {
                deregister_sock(&self.poll, &ch.sock);
            }
            ch.out.clear(&mut self.pool);

            logging::debug!(self.log, "chann destroyed"; "chann" => id);
            out.push(ChannEvent {
                id,
                event: Event::Close,
            });
            self.retired.push(id);
        }
    }
}

fn register_sock(poll: &Poll, id: ChannId, sock: &Sock, interest: Ready, again: bool) -> io::Result<()> {
    macro_rules! hook {
        ($evented:expr) => {
            if again {
                poll.reregister($evented, Token(id), interest, PollOpt::level())
            } else {
                poll.register($evented, Token(id), interest, PollOpt::level())
            }
        };
    }

    match *sock {
        Sock::Stream(ref stream) => hook!(stream),
        Sock::Listener(ref listener) => hook!(listener),
        Sock::Dgram(ref socket) => hook!(socket),
    }
}

fn deregister_sock(poll: &Poll, sock: &Sock) {
    let _ = match *sock {
        Sock::Stream(ref stream) => poll.deregister(stream),
        Sock::Listener(ref listener) => poll.deregister(listener),
        Sock::Dgram(ref socket) => poll.deregister(socket),
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging;

    fn pump(lp: &mut EventLoop, iterations: usize) -> Vec<ChannEvent> {
        let mut all = Vec::new();
        for _ in 0..iterations {
            let events = lp.poll(Some(Duration::from_millis(20))).unwrap();
            all.extend(events);
        }
        all
    }

    fn wait_for(lp: &mut EventLoop, pred: impl Fn(&ChannEvent) -> bool) -> Vec<ChannEvent> {
        let mut all = Vec::new();
        for _ in 0..100 {
            all.extend(lp.poll(Some(Duration::from_millis(20))).unwrap());
            if all.iter().any(&pred) {
                return all;
            }
        }
        panic!("Expected event never arrived: {:?}", all);
    }

    fn loopback(lp: &mut EventLoop) -> (ChannId, ChannId, ChannId) {
        let addr = "127.0.0.1:0".parse().unwrap();
        let listener = lp.listen(&addr).unwrap();
        let bound = lp.local_addr(listener).unwrap();

        let client = lp.connect(&bound).unwrap();

        let events = wait_for(lp, |ev| match ev.event {
            Event::Accept(_) => true,
            _ => false,
        });

        let accepted = events
            .iter()
            .filter_map(|ev| match ev.event {
                Event::Accept(new_id) => Some(new_id),
                _ => None,
            })
            .next()
            .unwrap();

        // The connect completion must have fired as well by now or shortly
        if !events.iter().any(|ev| ev.event == Event::Connect) {
            wait_for(lp, |ev| ev.id == client && ev.event == Event::Connect);
        }

        (listener, client, accepted)
    }

    #[test]
    fn test_accept_and_connect_events() {
        let log = logging::discard();
        let mut lp = EventLoop::new(&log).unwrap();

        let (listener, client, accepted) = loopback(&mut lp);

        assert_eq!(lp.state(listener), ChannState::Listening);
        assert_eq!(lp.state(client), ChannState::Connected);
        assert_eq!(lp.state(accepted), ChannState::Connected);
        assert_eq!(lp.chann_count(), 3);
    }

    #[test]
    fn test_send_recv_roundtrip() {
        let log = logging::discard();
        let mut lp = EventLoop::new(&log).unwrap();

        let (_listener, client, accepted) = loopback(&mut lp);

        let sent = lp.send(client, b"hello burrow").unwrap();
        assert_eq!(sent, 12);

        let events = wait_for(&mut lp, |ev| ev.id == accepted && ev.event == Event::Recv);
        assert!(events.iter().any(|ev| ev.id == accepted));

        let mut buf = Buffer::new(65536);
        let count = lp.recv_into(accepted, &mut buf).unwrap();

        assert_eq!(count, 12);
        assert_eq!(buf.read_slice(), b"hello burrow");
    }

    #[test]
    fn test_close_is_deferred_and_slot_recycled_later() {
        let log = logging::discard();
        let mut lp = EventLoop::new(&log).unwrap();

        let (_listener, client, _accepted) = loopback(&mut lp);

        lp.close(client);
        assert_eq!(lp.state(client), ChannState::Closing);

        let events = wait_for(&mut lp, |ev| ev.id == client && ev.event == Event::Close);
        assert!(events.iter().any(|ev| ev.id == client && ev.event == Event::Close));
        assert_eq!(lp.state(client), ChannState::Closed);

        // Double close on a dead id is a no-op
        lp.close(client);
    }

    #[test]
    fn test_peer_close_emits_close_event() {
        let log = logging::discard();
        let mut lp = EventLoop::new(&log).unwrap();

        let (_listener, client, accepted) = loopback(&mut lp);

        lp.close(client);
        pump(&mut lp, 2);

        // The accepted side sees readable-with-eof, then its CLOSE
        let events = wait_for(&mut lp, |ev| ev.id == accepted && ev.event == Event::Recv);
        assert!(events.iter().any(|ev| ev.id == accepted));

        let mut buf = Buffer::new(4096);
        lp.recv_into(accepted, &mut buf).unwrap();
        assert_eq!(lp.state(accepted), ChannState::Closing);

        wait_for(&mut lp, |ev| ev.id == accepted && ev.event == Event::Close);
    }

    #[test]
    fn test_send_notify_fires_when_queue_empty() {
        let log = logging::discard();
        let mut lp = EventLoop::new(&log).unwrap();

        let (_listener, client, _accepted) = loopback(&mut lp);

        lp.set_send_notify(client, true);
        let events = wait_for(&mut lp, |ev| ev.id == client && ev.event == Event::Send);
        assert!(events.iter().any(|ev| ev.id == client));

        lp.set_send_notify(client, false);
    }

    #[test]
    fn test_connect_refused_disconnects() {
        let log = logging::discard();
        let mut lp = EventLoop::new(&log).unwrap();

        // Bind a listener to grab a port, close it, then dial the dead port
        let addr = "127.0.0.1:0".parse().unwrap();
        let listener = lp.listen(&addr).unwrap();
        let bound = lp.local_addr(listener).unwrap();
        lp.close(listener);
        pump(&mut lp, 2);

        // A synchronous refusal proves the point just as well
        let client = match lp.connect(&bound) {
            Ok(id) => id,
            Err(_) => return,
        };

        let events = wait_for(&mut lp, |ev| ev.id == client && ev.event == Event::Disconnect);
        assert!(events.iter().any(|ev| ev.id == client && ev.event == Event::Disconnect));

        // Teardown follows in the same pass
        assert!(events.iter().any(|ev| ev.id == client && ev.event == Event::Close));
    }

    #[test]
    fn test_datagram_roundtrip() {
        let log = logging::discard();
        let mut lp = EventLoop::new(&log).unwrap();

        let peer = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        peer.set_nonblocking(true).unwrap();

        let chann = lp
            .connect_datagram(&peer.local_addr().unwrap(), false)
            .unwrap();
        assert_eq!(lp.state(chann), ChannState::Connected);

        lp.send(chann, b"ping").unwrap();

        let mut tmp = [0u8; 64];
        let mut got = None;
        for _ in 0..100 {
            pump(&mut lp, 1);
            match peer.recv_from(&mut tmp) {
                Ok(pair) => {
                    got = Some(pair);
                    break;
                }
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => (),
                Err(err) => panic!("Peer recv failed: {}", err),
            }
        }

        let (count, from) = got.expect("Datagram never arrived");
        assert_eq!(&tmp[..count], b"ping");

        peer.send_to(b"pong", from).unwrap();
        wait_for(&mut lp, |ev| ev.id == chann && ev.event == Event::Recv);

        let mut buf = Buffer::new(65536);
        lp.recv_into(chann, &mut buf).unwrap();
        assert_eq!(buf.read_slice(), b"pong");
    }

    #[test]
    fn test_send_to_stale_id_is_dropped() {
        let log = logging::discard();
        let mut lp = EventLoop::new(&log).unwrap();

        let result = lp.send(99, b"into the void").unwrap();
        assert_eq!(result, 13);
    }
}
