//! Remote role: accepts carrier connections from local front-ends, opens
//! the real target sockets (resolving domains off-thread) and shuttles DATA
//! frames between carrier and targets.

use crate::config::{Config, Mode};
use crate::crypto;
use crate::dns::{DnsAnswer, DnsQuery, DnsService};
use crate::logging;
use crate::net::{Buffer, ChannEvent, ChannId, ErrorType, ErrorUtils, Event, EventLoop};
use crate::net::{NetworkError, NetworkResult};
use crate::proto::{self, Cmd, FrameHeader};
use crate::time::timestamp_secs;
use crate::{CHANN_BUF_SIZE, CHANN_MAX_COUNT, CLIENT_MAX_COUNT};
use hashbrown::HashMap;
use std::mem;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::{Duration, Instant};

/// Carriers whose `data_mark` stays zero across one sweep are culled.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

const CARRIER_BUF_SIZE: usize = 2 * CHANN_BUF_SIZE;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum ClientState {
    /// Carrier accepted, first frame (AUTH) still outstanding.
    None,
    /// Authorized; channel traffic flows.
    Accept,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum Phase {
    /// Domain handed to the resolver; no socket yet.
    Query,
    /// Target connect in flight.
    Connecting,
    /// Relaying data.
    Connected,
    /// Torn down, waiting for the socket to finish closing.
    Disconnect,
}

struct TargetChann {
    magic: u32,
    phase: Phase,
    tcpout: Option<ChannId>,
}

struct Client {
    serial: u64,
    tcpin: ChannId,
    bufin: Buffer,
    state: ClientState,
    data_mark: u32,
    channs: Vec<Option<TargetChann>>,
}

#[derive(Debug, Copy, Clone)]
enum Owner {
    Listener,
    Carrier(usize),
    Target { client: usize, slot: usize },
}

pub struct Remote {
    conf: Config,
    key: u64,
    listener: ChannId,
    clients: Vec<Option<Client>>,
    owners: HashMap<ChannId, Owner>,
    dns: DnsService,
    serial_code: u64,
    last_sweep: Instant,
    scratch: Vec<u8>,
    read_buf: Buffer,
    log: logging::Logger,
}

impl Remote {
    pub fn open(conf: Config, lp: &mut EventLoop, log: &logging::Logger) -> NetworkResult<Remote> {
        let listen_addr = sock_addr(&conf.local_ip, conf.local_port)?;

        let key = crypto::hash_key(&conf.password);
        let listener = lp.listen(&listen_addr)?;

        let remote_log = log.new(logging::o!("module" => "remote"));
        logging::info!(remote_log, "remote open"; "listen" => %listen_addr, "mode" => ?conf.mode);

        let dns = DnsService::start(log);

        let mut remote = Remote {
            conf,
            key,
            listener,
            clients: (0..CLIENT_MAX_COUNT).map(|_| None).collect(),
            owners: HashMap::new(),
            dns,
            serial_code: 0,
            last_sweep: Instant::now(),
            scratch: Vec::new(),
            read_buf: Buffer::new(CARRIER_BUF_SIZE),
            log: remote_log,
        };

        remote.owners.insert(listener, Owner::Listener);
        Ok(remote)
    }

    /// Address the carrier listener actually bound (useful with port 0).
    pub fn listen_addr(&self, lp: &EventLoop) -> Option<SocketAddr> {
        lp.local_addr(self.listener)
    }

    /// One loop turn: poll, dispatch every event, then collect resolver
    /// answers and run the sweep.
    pub fn drive(&mut self, lp: &mut EventLoop, timeout: Option<Duration>) -> NetworkResult<()> {
        let events = lp.poll(timeout)?;

        for event in events {
            self.handle(lp, event);
        }

        self.tick(lp, Instant::now());
        Ok(())
    }

    pub fn handle(&mut self, lp: &mut EventLoop, ev: ChannEvent) {
        let owner = match self.owners.get(&ev.id) {
            Some(owner) => *owner,
            None => return,
        };

        match owner {
            Owner::Listener => {
                if let Event::Accept(new_id) = ev.event {
                    self.on_accept(lp, new_id);
                }
            }
            Owner::Carrier(client) => match ev.event {
                Event::Recv => self.on_carrier_recv(lp, client, ev.id),
                Event::Close => self.destroy_client(lp, client, ev.id),
                _ => (),
            },
            Owner::Target { client, slot } => match ev.event {
                Event::Connect => self.target_connected(lp, client, slot),
                Event::Disconnect => self.target_refused(lp, client, slot),
                Event::Recv => self.target_data(lp, client, slot, ev.id),
                Event::Close => self.target_closed(lp, client, slot, ev.id),
                _ => (),
            },
        }
    }

    /// Resolver handoff and the carrier sweep.
    pub fn tick(&mut self, lp: &mut EventLoop, now: Instant) {
        for answer in self.dns.drain() {
            self.on_dns_answer(lp, answer);
        }

        if now.duration_since(self.last_sweep) < SWEEP_INTERVAL {
            return;
        }
        self.last_sweep = now;

        for client in 0..self.clients.len() {
            let (dead, tcpin) = match self.clients[client] {
                Some(ref mut entry) => {
                    let dead = entry.data_mark == 0;
                    entry.data_mark = 0;
                    (dead, entry.tcpin)
                }
                None => continue,
            };

            if dead {
                logging::info!(self.log, "culling silent carrier"; "client" => client);
                self.destroy_client(lp, client, tcpin);
            }
        }
    }

    fn on_accept(&mut self, lp: &mut EventLoop, new_id: ChannId) {
        let slot = match self.clients.iter().position(|entry| entry.is_none()) {
            Some(slot) => slot,
            None => {
                logging::error!(self.log, "carrier cap reached, refusing");
                lp.close(new_id);
                return;
            }
        };

        self.serial_code += 1;

        self.clients[slot] = Some(Client {
            serial: self.serial_code,
            tcpin: new_id,
            bufin: Buffer::new(CARRIER_BUF_SIZE),
            state: ClientState::None,
            // Counts the accept itself so a fresh carrier survives a sweep
            // landing right after it connected
            data_mark: 1,
            channs: (0..CHANN_MAX_COUNT).map(|_| None).collect(),
        });
        self.owners.insert(new_id, Owner::Carrier(slot));

        logging::info!(self.log, "carrier accepted"; "client" => slot, "serial" => self.serial_code);
    }

    /// Tear down a carrier and every logical channel it owns.
    fn destroy_client(&mut self, lp: &mut EventLoop, client: usize, tcpin: ChannId) {
        let entry = match self.clients[client].take() {
            Some(entry) if entry.tcpin == tcpin => entry,
            Some(entry) => {
                self.clients[client] = Some(entry);
                return;
            }
            None => return,
        };

        self.owners.remove(&entry.tcpin);
        lp.close(entry.tcpin);

        let mut dropped = 0;
        for chann in entry.channs.into_iter().flatten() {
            if let Some(tcpout) = chann.tcpout {
                self.owners.remove(&tcpout);
                lp.close(tcpout);
                dropped += 1;
            }
        }

        logging::info!(self.log, "carrier destroyed"; "client" => client, "channels" => dropped);
    }

    fn on_carrier_recv(&mut self, lp: &mut EventLoop, client: usize, id: ChannId) {
        {
            let entry = match self.clients[client].as_mut() {
                Some(entry) if entry.tcpin == id => entry,
                _ => return,
            };
            let _ = lp.recv_into(id, &mut entry.bufin);
        }

        loop {
            let total = {
                let entry = match self.clients[client].as_mut() {
                    Some(entry) => entry,
                    None => return,
                };

                match proto::frame_len(entry.bufin.read_slice()) {
                    Ok(Some(total)) => total,
                    Ok(None) => return,
                    Err(err) => {
                        self.drop_carrier(lp, client, "bad frame length", err);
                        return;
                    }
                }
            };

            let bucket = crypto::time_bucket(timestamp_secs());

            let header = {
                let entry = self.clients[client].as_mut().expect("Client must be live");

                if entry.bufin.len() < total {
                    return;
                }

                let frame = &mut entry.bufin.data_slice()[..total];
                match proto::decrypt_frame(frame, self.key, bucket) {
                    Ok(header) => header,
                    Err(err) => {
                        self.drop_carrier(lp, client, "malformed frame", err);
                        return;
                    }
                }
            };

            self.scratch.clear();
            {
                let entry = self.clients[client].as_mut().expect("Client must be live");
                self.scratch
                    .extend_from_slice(&entry.bufin.read_slice()[proto::HEADER_LEN..total]);
                entry.bufin.move_head(total);
                entry.data_mark += 1;
            }

            let payload = mem::replace(&mut self.scratch, Vec::new());
            let keep_going = self.process_frame(lp, client, header, &payload);
            self.scratch = payload;

            if !keep_going {
                return;
            }
        }
    }

    /// Dispatch one decrypted carrier frame. Returns false once the carrier
    /// is gone.
    fn process_frame(
        &mut self,
        lp: &mut EventLoop,
        client: usize,
        header: FrameHeader,
        payload: &[u8],
    ) -> bool {
        let state = match self.clients[client] {
            Some(ref entry) => entry.state,
            None => return false,
        };

        // The first frame on a carrier must be AUTH
        if state == ClientState::None {
            if header.cmd != Cmd::Auth {
                self.drop_carrier(lp, client, "first frame not auth", proto::FrameError::BadCommand);
                return false;
            }
            return self.authorize(lp, client, payload);
        }

        match header.cmd {
            Cmd::Echo => {
                logging::trace!(self.log, "echo request"; "client" => client);
                self.send_frame(lp, client, proto::echo_frame());
            }
            Cmd::Auth => {
                logging::debug!(self.log, "stray auth frame ignored"; "client" => client);
            }
            Cmd::Connect => return self.open_channel(lp, client, header, payload),
            Cmd::Close => self.close_channel(lp, client, header),
            Cmd::Data => self.channel_data(lp, client, header, payload),
        }

        true
    }

    fn authorize(&mut self, lp: &mut EventLoop, client: usize, payload: &[u8]) -> bool {
        let granted = match proto::parse_auth_request(payload) {
            Ok(auth) => {
                auth.auth_type == 1
                    && auth.username == &padded_credential(&self.conf.username)[..]
                    && auth.password == &padded_credential(&self.conf.password)[..]
            }
            Err(_) => false,
        };

        if granted {
            logging::info!(self.log, "carrier authorized"; "client" => client);
            if let Some(entry) = self.clients[client].as_mut() {
                entry.state = ClientState::Accept;
            }
            self.send_frame(lp, client, proto::auth_response(true));
            true
        } else {
            logging::error!(self.log, "authorization rejected"; "client" => client);
            self.send_frame(lp, client, proto::auth_response(false));
            self.drop_carrier(lp, client, "auth rejected", proto::FrameError::BadCommand);
            false
        }
    }

    /// CONNECT request: occupy the slot, then either dial the target right
    /// away (dotted quad) or park the channel on the resolver.
    fn open_channel(
        &mut self,
        lp: &mut EventLoop,
        client: usize,
        header: FrameHeader,
        payload: &[u8],
    ) -> bool {
        let request = match proto::parse_connect_request(payload) {
            Ok(request) => request,
            Err(err) => {
                self.drop_carrier(lp, client, "malformed connect", err);
                return false;
            }
        };

        let slot = header.chann_id as usize;
        if slot >= CHANN_MAX_COUNT {
            self.drop_carrier(lp, client, "channel id out of range", proto::FrameError::BadLength);
            return false;
        }

        let occupied = match self.clients[client] {
            Some(ref entry) => entry.channs[slot].is_some(),
            None => return false,
        };
        if occupied {
            logging::error!(self.log, "connect for occupied slot ignored";
                            "client" => client,
                            "chann" => slot);
            return true;
        }

        // FORWARD mode pins every channel to the configured upstream
        let (addr, port) = if self.conf.mode == Mode::RemoteForward {
            (self.conf.forward_ip.clone(), self.conf.forward_port)
        } else {
            (request.addr.to_string(), request.port)
        };

        logging::debug!(self.log, "connect request";
                        "client" => client,
                        "chann" => slot,
                        "magic" => header.magic,
                        "addr" => %addr,
                        "port" => port,
                        "type" => ?request.addr_type);

        match addr.parse::<Ipv4Addr>() {
            Ok(ip) => self.dial_target(lp, client, slot, header.magic, ip, port),
            Err(_) => {
                let serial = match self.clients[client] {
                    Some(ref entry) => entry.serial,
                    None => return false,
                };

                if let Some(entry) = self.clients[client].as_mut() {
                    entry.channs[slot] = Some(TargetChann {
                        magic: header.magic,
                        phase: Phase::Query,
                        tcpout: None,
                    });
                }

                self.dns.query(DnsQuery {
                    domain: addr,
                    port,
                    chann_id: slot as u32,
                    magic: header.magic,
                    client: serial,
                });
            }
        }

        true
    }

    fn dial_target(
        &mut self,
        lp: &mut EventLoop,
        client: usize,
        slot: usize,
        magic: u32,
        ip: Ipv4Addr,
        port: u16,
    ) {
        let addr = SocketAddr::V4(SocketAddrV4::new(ip, port));

        match lp.connect(&addr) {
            Ok(tcpout) => {
                if let Some(entry) = self.clients[client].as_mut() {
                    entry.channs[slot] = Some(TargetChann {
                        magic,
                        phase: Phase::Connecting,
                        tcpout: Some(tcpout),
                    });
                }
                self.owners.insert(tcpout, Owner::Target { client, slot });
            }
            Err(err) => {
                logging::error!(self.log, "target dial failed";
                                "client" => client,
                                "chann" => slot,
                                "err" => ?err);
                let frame = proto::connect_response(slot as u32, magic, None);
                self.send_frame(lp, client, frame);
            }
        }
    }

    /// CLOSE request from the local side.
    fn close_channel(&mut self, lp: &mut EventLoop, client: usize, header: FrameHeader) {
        let slot = header.chann_id as usize;
        if slot >= CHANN_MAX_COUNT {
            return;
        }

        let entry = match self.clients[client].as_mut() {
            Some(entry) => entry,
            None => return,
        };

        let matched = match entry.channs[slot] {
            Some(ref chann) => chann.magic == header.magic,
            None => false,
        };

        if !matched {
            logging::error!(self.log, "close for unknown channel";
                            "client" => client,
                            "chann" => header.chann_id,
                            "magic" => header.magic);
            return;
        }

        let phase = entry.channs[slot].as_ref().expect("Matched slot must be live").phase;
        let teardown = if phase == Phase::Query {
            // Cancel a pending resolution outright
            entry.channs[slot] = None;
            None
        } else {
            let chann = entry.channs[slot].as_mut().expect("Matched slot must be live");
            chann.phase = Phase::Disconnect;
            chann.tcpout
        };

        logging::debug!(self.log, "local close"; "client" => client, "chann" => slot);

        let frame = proto::close_frame(slot as u32, header.magic, false);
        self.send_frame(lp, client, frame);

        if let Some(tcpout) = teardown {
            lp.close(tcpout);
        }
    }

    /// DATA frame from the local side, relayed to the target socket.
    fn channel_data(&mut self, lp: &mut EventLoop, client: usize, header: FrameHeader, payload: &[u8]) {
        let slot = header.chann_id as usize;
        if slot >= CHANN_MAX_COUNT {
            return;
        }

        let tcpout = match self.clients[client] {
            Some(ref entry) => match entry.channs[slot] {
                Some(ref chann) if chann.magic == header.magic => {
                    if chann.phase == Phase::Connected {
                        chann.tcpout
                    } else {
                        return;
                    }
                }
                _ => {
                    // Stale frame for a recycled slot: discarded, the
                    // carrier stays up
                    logging::error!(self.log, "data for unknown channel";
                                    "client" => client,
                                    "chann" => header.chann_id,
                                    "magic" => header.magic);
                    return;
                }
            },
            None => return,
        };

        if let Some(tcpout) = tcpout {
            let _ = lp.send(tcpout, payload);
        }
    }

    fn on_dns_answer(&mut self, lp: &mut EventLoop, answer: DnsAnswer) {
        let DnsAnswer { query, addr } = answer;

        // The carrier may have gone away while the worker resolved
        let client = match self
            .clients
            .iter()
            .position(|entry| match entry {
                Some(entry) => entry.serial == query.client,
                None => false,
            }) {
            Some(client) => client,
            None => {
                logging::debug!(self.log, "dropping answer for dead carrier"; "domain" => %query.domain);
                return;
            }
        };

        let slot = query.chann_id as usize;

        // ... and so may the channel itself
        let parked = match self.clients[client] {
            Some(ref entry) => match entry.channs[slot] {
                Some(ref chann) => chann.magic == query.magic && chann.phase == Phase::Query,
                None => false,
            },
            None => false,
        };
        if !parked {
            logging::debug!(self.log, "dropping answer for dead channel";
                            "chann" => slot,
                            "magic" => query.magic);
            return;
        }

        match addr {
            Some(ip) => {
                if let Some(entry) = self.clients[client].as_mut() {
                    entry.channs[slot] = None;
                }
                self.dial_target(lp, client, slot, query.magic, ip, query.port);
            }
            None => {
                if let Some(entry) = self.clients[client].as_mut() {
                    entry.channs[slot] = None;
                }
                let frame = proto::connect_response(slot as u32, query.magic, None);
                self.send_frame(lp, client, frame);
            }
        }
    }

    fn target_connected(&mut self, lp: &mut EventLoop, client: usize, slot: usize) {
        let (magic, tcpout) = match self.clients[client] {
            Some(ref mut entry) => match entry.channs[slot] {
                Some(ref mut chann) if chann.phase == Phase::Connecting => {
                    chann.phase = Phase::Connected;
                    (chann.magic, chann.tcpout)
                }
                _ => return,
            },
            None => return,
        };

        let peer = tcpout.and_then(|id| lp.peer_addr(id));
        let result = match peer {
            Some(SocketAddr::V4(v4)) => Some((v4.port(), *v4.ip())),
            _ => Some((0, Ipv4Addr::UNSPECIFIED)),
        };

        logging::debug!(self.log, "channel connected";
                        "client" => client,
                        "chann" => slot,
                        "magic" => magic);

        let frame = proto::connect_response(slot as u32, magic, result);
        self.send_frame(lp, client, frame);
    }

    /// Target connect failed: report and give the slot back.
    fn target_refused(&mut self, lp: &mut EventLoop, client: usize, slot: usize) {
        let magic = match self.clients[client] {
            Some(ref mut entry) => match entry.channs[slot] {
                Some(ref mut chann) if chann.phase == Phase::Connecting => {
                    chann.phase = Phase::Disconnect;
                    chann.magic
                }
                _ => return,
            },
            None => return,
        };

        logging::debug!(self.log, "target connect failed"; "client" => client, "chann" => slot);

        let frame = proto::connect_response(slot as u32, magic, None);
        self.send_frame(lp, client, frame);
    }

    /// Bytes from the target socket, wrapped into DATA frames.
    fn target_data(&mut self, lp: &mut EventLoop, client: usize, slot: usize, id: ChannId) {
        let magic = match self.clients[client] {
            Some(ref entry) => match entry.channs[slot] {
                Some(ref chann) if chann.phase == Phase::Connected && chann.tcpout == Some(id) => {
                    chann.magic
                }
                _ => return,
            },
            None => return,
        };

        self.read_buf.clear();
        let _ = lp.recv_into(id, &mut self.read_buf);

        loop {
            let frame = {
                if self.read_buf.is_empty() {
                    break;
                }
                let take = self.read_buf.len().min(proto::MAX_DATA_LEN);
                let frame = proto::data_frame(slot as u32, magic, &self.read_buf.read_slice()[..take]);
                self.read_buf.move_head(take);
                frame
            };

            self.send_frame(lp, client, frame);
        }
    }

    fn target_closed(&mut self, lp: &mut EventLoop, client: usize, slot: usize, id: ChannId) {
        self.owners.remove(&id);

        let closed = match self.clients[client] {
            Some(ref mut entry) => {
                let matched = match entry.channs[slot] {
                    Some(ref chann) => chann.tcpout == Some(id),
                    None => false,
                };

                if matched {
                    let chann = entry.channs[slot].take().expect("Matched slot must be live");
                    Some((chann.magic, chann.phase))
                } else {
                    None
                }
            }
            None => None,
        };

        let (magic, phase) = match closed {
            Some(parted) => parted,
            None => return,
        };

        logging::debug!(self.log, "channel closed";
                        "client" => client,
                        "chann" => slot,
                        "magic" => magic);

        // The target went away on its own; tell the local side
        if phase == Phase::Connected {
            let frame = proto::close_frame(slot as u32, magic, false);
            self.send_frame(lp, client, frame);
        }
    }

    fn drop_carrier(
        &mut self,
        lp: &mut EventLoop,
        client: usize,
        reason: &'static str,
        err: proto::FrameError,
    ) {
        logging::error!(self.log, "dropping carrier";
                        "client" => client,
                        "reason" => reason,
                        "err" => ?err);

        if let Some(ref entry) = self.clients[client] {
            lp.close(entry.tcpin);
        }
    }

    /// Encrypt a plaintext frame and put it on a carrier.
    fn send_frame(&mut self, lp: &mut EventLoop, client: usize, mut frame: Vec<u8>) {
        let tcpin = match self.clients[client] {
            Some(ref entry) => entry.tcpin,
            None => return,
        };

        let bucket = crypto::time_bucket(timestamp_secs());
        crypto::encrypt(&mut frame[3..], self.key, bucket);

        if lp.send(tcpin, &frame).has_failed() {
            logging::error!(self.log, "carrier send failed"; "client" => client);
        }
    }
}

fn padded_credential(value: &str) -> [u8; proto::AUTH_FIELD_LEN] {
    let mut field = [0u8; proto::AUTH_FIELD_LEN];
    let bytes = value.as_bytes();
    let count = bytes.len().min(proto::AUTH_FIELD_LEN);

    field[..count].copy_from_slice(&bytes[..count]);
    field
}

fn sock_addr(ip: &str, port: u16) -> NetworkResult<SocketAddr> {
    format!("{}:{}", ip, port)
        .parse::<SocketAddr>()
        .map_err(|_| NetworkError::Fatal(ErrorType::AddrInvalid))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_padded_credential() {
        let field = padded_credential("user");

        assert_eq!(&field[..4], b"user");
        assert_eq!(&field[4..], &[0u8; 12]);

        // Overlong credentials clamp to the field width
        let field = padded_credential("abcdefghijklmnopqrstuvwxyz");
        assert_eq!(&field[..], b"abcdefghijklmnop");
    }
}
