//! Local role: accepts SOCKS5 clients, multiplexes them onto one carrier
//! connection to the remote role, and reconciles the SOCKS5 negotiation with
//! CONNECT/CLOSE results coming back over the carrier.

use crate::config::Config;
use crate::crypto;
use crate::logging;
use crate::net::{Buffer, ChannEvent, ChannId, ErrorUtils, Event, EventLoop, NetworkResult};
use crate::net::{ErrorType, NetworkError};
use crate::proto::{self, AddrType, Cmd, FrameHeader};
use crate::time::timestamp_secs;
use crate::{CHANN_BUF_SIZE, CHANN_MAX_COUNT};
use hashbrown::HashMap;
use std::mem;
use std::net::{Ipv4Addr, SocketAddr};
use std::time::{Duration, Instant};

/// Echo keepalive cadence on the local side.
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(15);

/// The carrier assembly buffer must hold a maximal frame plus a partial
/// successor.
const CARRIER_BUF_SIZE: usize = 2 * CHANN_BUF_SIZE;

const SOCKS_ACCEPT: [u8; 2] = [0x05, 0x00];
const SOCKS_REJECT: [u8; 2] = [0x05, 0x02];
const SOCKS_CONNECT_FAILED: [u8; 10] = [0x05, 0x05, 0x00, 0x01, 0, 0, 0, 0, 0, 0];

/// Carrier handshake progress.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum FrontState {
    None,
    Connected,
    Authorized,
}

/// Per-client logical channel state.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum Phase {
    /// Waiting for the SOCKS5 greeting.
    WaitLocal,
    /// Greeting accepted, waiting for the SOCKS5 request.
    Accept,
    /// CONNECT sent, waiting for the remote result.
    WaitRemote,
    /// Relaying data.
    Connected,
    /// Torn down; the slot recycles when the socket finishes closing.
    Disconnect,
}

struct SocksChann {
    phase: Phase,
    magic: u32,
    tcpin: ChannId,
    bufin: Buffer,
}

#[derive(Debug, Copy, Clone)]
enum Owner {
    Listener,
    Carrier,
    Client(usize),
}

pub struct Local {
    conf: Config,
    key: u64,
    listener: ChannId,
    carrier_addr: SocketAddr,
    carrier: Option<ChannId>,
    front: FrontState,
    carrier_buf: Buffer,
    channs: Vec<Option<SocksChann>>,
    owners: HashMap<ChannId, Owner>,
    magic_code: u32,
    data_mark: u32,
    last_tick: Instant,
    scratch: Vec<u8>,
    log: logging::Logger,
}

impl Local {
    /// Bind the SOCKS listener and dial the carrier.
    pub fn open(conf: Config, lp: &mut EventLoop, log: &logging::Logger) -> NetworkResult<Local> {
        let listen_addr = sock_addr(&conf.local_ip, conf.local_port)?;
        let carrier_addr = sock_addr(&conf.remote_ip, conf.remote_port)?;

        let key = crypto::hash_key(&conf.password);
        let listener = lp.listen(&listen_addr)?;

        let local_log = log.new(logging::o!("module" => "local"));
        logging::info!(local_log, "local open"; "listen" => %listen_addr, "remote" => %carrier_addr);

        let mut local = Local {
            conf,
            key,
            listener,
            carrier_addr,
            carrier: None,
            front: FrontState::None,
            carrier_buf: Buffer::new(CARRIER_BUF_SIZE),
            channs: (0..CHANN_MAX_COUNT).map(|_| None).collect(),
            owners: HashMap::new(),
            magic_code: 0,
            data_mark: 0,
            last_tick: Instant::now(),
            scratch: Vec::new(),
            log: local_log,
        };

        local.owners.insert(listener, Owner::Listener);
        local.dial_carrier(lp);

        Ok(local)
    }

    /// Address the SOCKS listener actually bound (useful with port 0).
    pub fn listen_addr(&self, lp: &EventLoop) -> Option<SocketAddr> {
        lp.local_addr(self.listener)
    }

    /// True once the carrier handshake finished and clients are admitted.
    pub fn is_authorized(&self) -> bool {
        self.front == FrontState::Authorized
    }

    /// One loop turn: poll, dispatch every event, then run the timers.
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
            Owner::Carrier => match ev.event {
                Event::Connect => self.on_carrier_connect(lp),
                Event::Disconnect => {
                    logging::error!(self.log, "carrier connect failed"; "addr" => %self.carrier_addr);
                }
                Event::Recv => self.on_carrier_recv(lp),
                Event::Close => self.on_carrier_close(lp, ev.id),
                _ => (),
            },
            Owner::Client(slot) => match ev.event {
                Event::Recv => self.on_client_recv(lp, slot, ev.id),
                Event::Close => self.on_client_close(lp, slot, ev.id),
                _ => (),
            },
        }
    }

    /// Keepalive and carrier upkeep, at most once per interval: echo when no
    /// frames arrived since the previous tick, redial a dead carrier.
    pub fn tick(&mut self, lp: &mut EventLoop, now: Instant) {
        if now.duration_since(self.last_tick) < KEEPALIVE_INTERVAL {
            return;
        }
        self.last_tick = now;

        if self.carrier.is_none() {
            logging::info!(self.log, "redialing carrier"; "addr" => %self.carrier_addr);
            self.dial_carrier(lp);
            return;
        }

        if self.front == FrontState::Authorized && self.data_mark == 0 {
            logging::debug!(self.log, "sending echo keepalive");
            self.send_frame(lp, proto::echo_frame());
        }
        self.data_mark = 0;
    }

    /// Dial the carrier. An immediate refusal is not fatal; the keepalive
    /// tick retries.
    fn dial_carrier(&mut self, lp: &mut EventLoop) {
        match lp.connect(&self.carrier_addr) {
            Ok(id) => {
                self.carrier = Some(id);
                self.front = FrontState::None;
                self.owners.insert(id, Owner::Carrier);
            }
            Err(err) => {
                logging::error!(self.log, "carrier dial failed";
                                "addr" => %self.carrier_addr,
                                "err" => ?err);
            }
        }
    }

    fn on_accept(&mut self, lp: &mut EventLoop, new_id: ChannId) {
        let slot = match self.channs.iter().position(|entry| entry.is_none()) {
            Some(slot) => slot,
            None => {
                logging::error!(self.log, "channel slots exhausted, refusing client");
                lp.close(new_id);
                return;
            }
        };

        self.magic_code += 1;

        self.channs[slot] = Some(SocksChann {
            phase: Phase::WaitLocal,
            magic: self.magic_code,
            tcpin: new_id,
            bufin: Buffer::new(CHANN_BUF_SIZE),
        });
        self.owners.insert(new_id, Owner::Client(slot));

        logging::debug!(self.log, "client open"; "chann" => slot, "magic" => self.magic_code);
    }

    fn on_client_recv(&mut self, lp: &mut EventLoop, slot: usize, id: ChannId) {
        {
            let chann = match self.channs[slot].as_mut() {
                Some(chann) if chann.tcpin == id => chann,
                _ => return,
            };

            // A fatal read marks the socket CLOSING; the CLOSE event that
            // follows recycles the slot.
            let _ = lp.recv_into(id, &mut chann.bufin);
        }

        self.drive_client(lp, slot, id);
    }

    /// Advance the per-client state machine as far as the buffered bytes
    /// allow. Phases can chain when the client pipelines its negotiation.
    fn drive_client(&mut self, lp: &mut EventLoop, slot: usize, id: ChannId) {
        loop {
            let phase = match self.channs[slot] {
                Some(ref chann) if chann.tcpin == id => chann.phase,
                _ => return,
            };

            let advanced = match phase {
                Phase::WaitLocal => self.client_greeting(lp, slot, id),
                Phase::Accept => self.client_request(lp, slot, id),
                Phase::Connected => {
                    self.client_data(lp, slot);
                    false
                }
                Phase::WaitRemote | Phase::Disconnect => false,
            };

            if !advanced {
                return;
            }
        }
    }

    /// SOCKS5 greeting `05 01 00`: accepted only once the carrier is
    /// authorized; otherwise the client is told no method is acceptable.
    fn client_greeting(&mut self, lp: &mut EventLoop, slot: usize, id: ChannId) -> bool {
        let authorized = self.front == FrontState::Authorized;

        let verdict = {
            let chann = self.channs[slot].as_mut().expect("Client slot must be live");

            if chann.bufin.len() < 3 {
                return false;
            }

            let ok = {
                let data = chann.bufin.read_slice();
                data[0] == 0x05 && data[1] == 0x01 && data[2] == 0x00
            };
            chann.bufin.move_head(3);

            if ok && authorized {
                chann.phase = Phase::Accept;
            } else {
                chann.phase = Phase::Disconnect;
            }
            ok
        };

        if !verdict {
            logging::debug!(self.log, "bad socks greeting"; "chann" => slot);
            lp.close(id);
            return false;
        }

        if authorized {
            let _ = lp.send(id, &SOCKS_ACCEPT);
            true
        } else {
            logging::error!(self.log, "not authorized, rejecting client"; "chann" => slot);
            let _ = lp.send(id, &SOCKS_REJECT);
            lp.close(id);
            false
        }
    }

    /// SOCKS5 request `05 01 00 <type> <addr> <port>`: translated into a
    /// CONNECT frame; only IPv4 and domain address types are consumed.
    fn client_request(&mut self, lp: &mut EventLoop, slot: usize, id: ChannId) -> bool {
        enum Verdict {
            NeedMore,
            Bad,
            Connect(AddrType, u16, String),
        }

        let verdict = {
            let chann = self.channs[slot].as_mut().expect("Client slot must be live");
            let data = chann.bufin.read_slice();

            if data.len() < 4 {
                Verdict::NeedMore
            } else if data[0] != 0x05 || data[1] != 0x01 || data[2] != 0x00 {
                Verdict::Bad
            } else {
                match data[3] {
                    // IPv4: 4 address bytes + port
                    0x01 => {
                        if data.len() < 10 {
                            Verdict::NeedMore
                        } else {
                            let addr = Ipv4Addr::new(data[4], data[5], data[6], data[7]);
                            let port = (u16::from(data[8]) << 8) | u16::from(data[9]);
                            chann.bufin.move_head(10);
                            Verdict::Connect(AddrType::Ip, port, addr.to_string())
                        }
                    }
                    // Domain: length-prefixed name + port
                    0x03 => {
                        let dlen = data[4] as usize;
                        if data.len() < 5 + dlen + 2 {
                            Verdict::NeedMore
                        } else {
                            let port =
                                (u16::from(data[5 + dlen]) << 8) | u16::from(data[6 + dlen]);
                            let domain = match std::str::from_utf8(&data[5..5 + dlen]) {
                                Ok(domain) if !domain.is_empty() && !domain.contains('\0') => {
                                    Some(domain.to_string())
                                }
                                _ => None,
                            };

                            match domain {
                                Some(domain) => {
                                    chann.bufin.move_head(5 + dlen + 2);
                                    Verdict::Connect(AddrType::Domain, port, domain)
                                }
                                None => Verdict::Bad,
                            }
                        }
                    }
                    _ => Verdict::Bad,
                }
            }
        };

        match verdict {
            Verdict::NeedMore => false,
            Verdict::Bad => {
                logging::debug!(self.log, "bad socks request"; "chann" => slot);
                let _ = lp.send(id, &SOCKS_CONNECT_FAILED);
                self.channs[slot].as_mut().expect("Client slot must be live").phase =
                    Phase::Disconnect;
                lp.close(id);
                false
            }
            Verdict::Connect(addr_type, port, addr) => {
                let magic = {
                    let chann = self.channs[slot].as_mut().expect("Client slot must be live");
                    chann.phase = Phase::WaitRemote;
                    chann.magic
                };

                logging::debug!(self.log, "connect request";
                                "chann" => slot,
                                "magic" => magic,
                                "addr" => %addr,
                                "port" => port);

                let frame = proto::connect_request(slot as u32, magic, addr_type, port, &addr);
                self.send_frame(lp, frame);
                true
            }
        }
    }

    /// Relay buffered client bytes to the remote as DATA frames.
    fn client_data(&mut self, lp: &mut EventLoop, slot: usize) {
        loop {
            let frame = {
                let chann = match self.channs[slot].as_mut() {
                    Some(chann) => chann,
                    None => return,
                };

                if chann.bufin.is_empty() {
                    return;
                }

                let take = chann.bufin.len().min(proto::MAX_DATA_LEN);
                let frame =
                    proto::data_frame(slot as u32, chann.magic, &chann.bufin.read_slice()[..take]);
                chann.bufin.move_head(take);
                frame
            };

            self.send_frame(lp, frame);
        }
    }

    fn on_client_close(&mut self, lp: &mut EventLoop, slot: usize, id: ChannId) {
        self.owners.remove(&id);

        let (phase, magic) = match self.channs[slot].take() {
            Some(chann) if chann.tcpin == id => (chann.phase, chann.magic),
            Some(chann) => {
                // Stale event for a recycled slot
                self.channs[slot] = Some(chann);
                return;
            }
            None => return,
        };

        logging::debug!(self.log, "client close"; "chann" => slot, "magic" => magic);

        // Client-initiated teardown tells the remote to drop its end
        if phase == Phase::WaitRemote || phase == Phase::Connected {
            let frame = proto::close_frame(slot as u32, magic, true);
            self.send_frame(lp, frame);
        }
    }

    fn on_carrier_connect(&mut self, lp: &mut EventLoop) {
        self.front = FrontState::Connected;

        logging::info!(self.log, "carrier connected, sending auth");
        let frame = proto::auth_request(&self.conf.username, &self.conf.password);
        self.send_frame(lp, frame);
    }

    fn on_carrier_recv(&mut self, lp: &mut EventLoop) {
        let carrier = match self.carrier {
            Some(id) => id,
            None => return,
        };

        let _ = lp.recv_into(carrier, &mut self.carrier_buf);

        loop {
            let total = match proto::frame_len(self.carrier_buf.read_slice()) {
                Ok(Some(total)) => total,
                Ok(None) => return,
                Err(err) => {
                    self.drop_carrier(lp, "bad frame length", err);
                    return;
                }
            };

            if self.carrier_buf.len() < total {
                return;
            }

            let bucket = crypto::time_bucket(timestamp_secs());
            let header = {
                let frame = &mut self.carrier_buf.data_slice()[..total];
                match proto::decrypt_frame(frame, self.key, bucket) {
                    Ok(header) => header,
                    Err(err) => {
                        self.drop_carrier(lp, "malformed frame", err);
                        return;
                    }
                }
            };

            self.scratch.clear();
            self.scratch
                .extend_from_slice(&self.carrier_buf.read_slice()[proto::HEADER_LEN..total]);
            self.carrier_buf.move_head(total);

            let payload = mem::replace(&mut self.scratch, Vec::new());
            let keep_going = self.process_frame(lp, header, &payload);
            self.scratch = payload;

            if !keep_going {
                return;
            }
        }
    }

    /// Dispatch one decrypted carrier frame. Returns false once the carrier
    /// is gone.
    fn process_frame(&mut self, lp: &mut EventLoop, header: FrameHeader, payload: &[u8]) -> bool {
        match self.front {
            FrontState::Authorized => self.process_authorized(lp, header, payload),
            FrontState::Connected => {
                // Only the AUTH response may arrive before authorization
                if header.cmd != Cmd::Auth {
                    self.drop_carrier(lp, "frame before authorization", proto::FrameError::BadCommand);
                    return false;
                }

                if payload[0] == 1 {
                    logging::info!(self.log, "carrier authorized");
                    self.front = FrontState::Authorized;
                    true
                } else {
                    logging::error!(self.log, "authorization rejected");
                    if let Some(id) = self.carrier {
                        lp.close(id);
                    }
                    false
                }
            }
            FrontState::None => {
                self.drop_carrier(lp, "frame before carrier connect", proto::FrameError::BadCommand);
                false
            }
        }
    }

    fn process_authorized(&mut self, lp: &mut EventLoop, header: FrameHeader, payload: &[u8]) -> bool {
        if header.cmd == Cmd::Echo {
            logging::trace!(self.log, "echo response");
            return true;
        }

        self.data_mark += 1;

        if header.cmd == Cmd::Auth {
            logging::debug!(self.log, "stray auth frame ignored");
            return true;
        }

        let slot = header.chann_id as usize;

        // Demux strictly by (chann_id, magic); anything stale is discarded
        let matched = slot < CHANN_MAX_COUNT
            && match self.channs[slot] {
                Some(ref chann) => chann.magic == header.magic,
                None => false,
            };

        if !matched {
            logging::error!(self.log, "frame for unknown channel";
                            "chann" => header.chann_id,
                            "magic" => header.magic,
                            "cmd" => ?header.cmd);
            return true;
        }

        match header.cmd {
            Cmd::Data => {
                let chann = self.channs[slot].as_ref().expect("Matched slot must be live");
                if chann.phase == Phase::Connected {
                    let _ = lp.send(chann.tcpin, payload);
                }
            }
            Cmd::Connect => self.connect_result(lp, slot, payload),
            Cmd::Close => {
                let chann = self.channs[slot].as_mut().expect("Matched slot must be live");

                logging::debug!(self.log, "remote close"; "chann" => slot, "magic" => chann.magic);
                chann.phase = Phase::Disconnect;
                lp.close(chann.tcpin);
            }
            _ => (),
        }

        true
    }

    /// CONNECT response: answer the waiting SOCKS5 client.
    fn connect_result(&mut self, lp: &mut EventLoop, slot: usize, payload: &[u8]) {
        let chann = self.channs[slot].as_mut().expect("Matched slot must be live");

        if chann.phase != Phase::WaitRemote {
            logging::error!(self.log, "connect result in wrong state";
                            "chann" => slot,
                            "phase" => ?chann.phase);
            return;
        }

        match proto::parse_connect_response(payload) {
            Ok(resp) if resp.ok => {
                let octets = resp.addr.octets();
                let reply = [
                    0x05,
                    0x00,
                    0x00,
                    0x01,
                    octets[0],
                    octets[1],
                    octets[2],
                    octets[3],
                    (resp.port >> 8) as u8,
                    resp.port as u8,
                ];

                chann.phase = Phase::Connected;
                let _ = lp.send(chann.tcpin, &reply);

                logging::debug!(self.log, "channel connected";
                                "chann" => slot,
                                "addr" => %resp.addr,
                                "port" => resp.port);
            }
            _ => {
                logging::debug!(self.log, "remote connect failed"; "chann" => slot);
                chann.phase = Phase::Disconnect;
                let _ = lp.send(chann.tcpin, &SOCKS_CONNECT_FAILED);
                lp.close(chann.tcpin);
            }
        }
    }

    fn on_carrier_close(&mut self, lp: &mut EventLoop, id: ChannId) {
        self.owners.remove(&id);
        self.carrier = None;
        self.front = FrontState::None;
        self.carrier_buf.clear();

        logging::info!(self.log, "carrier closed, dropping all channels");

        // SOCKS5 clients observe the carrier loss as a connection reset
        for slot in 0..self.channs.len() {
            if let Some(ref mut chann) = self.channs[slot] {
                chann.phase = Phase::Disconnect;
                lp.close(chann.tcpin);
            }
        }
    }

    fn drop_carrier(&mut self, lp: &mut EventLoop, reason: &'static str, err: proto::FrameError) {
        logging::error!(self.log, "dropping carrier"; "reason" => reason, "err" => ?err);

        if let Some(id) = self.carrier {
            lp.close(id);
        }
    }

    /// Encrypt a plaintext frame and put it on the carrier.
    fn send_frame(&mut self, lp: &mut EventLoop, mut frame: Vec<u8>) {
        let carrier = match self.carrier {
            Some(id) => id,
            None => return,
        };

        let bucket = crypto::time_bucket(timestamp_secs());
        crypto::encrypt(&mut frame[3..], self.key, bucket);

        if lp.send(carrier, &frame).has_failed() {
            logging::error!(self.log, "carrier send failed");
        }
    }
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
    fn test_sock_addr_parses_ipv4() {
        let addr = sock_addr("127.0.0.1", 1080).unwrap();
        assert_eq!(addr.port(), 1080);
    }

    #[test]
    fn test_sock_addr_rejects_names() {
        assert!(sock_addr("not-an-ip", 1080).is_err());
    }
}
