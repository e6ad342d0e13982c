//! Asynchronous name resolution for the remote role. Blocking lookups run
//! on a background worker; the event loop hands queries over and collects
//! answers through a pair of lock-protected FIFO queues, so resolution never
//! stalls the readiness loop. Failures travel back as values, never across
//! the thread boundary as panics.

use crate::logging;
use crate::time::timestamp_secs;
use hashbrown::HashMap;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::net::{Ipv4Addr, SocketAddr, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

const RESOLVE_ATTEMPTS: usize = 8;
const CACHE_EXPIRY_SECS: u64 = 7200;
const IDLE_WAIT: Duration = Duration::from_secs(1);

/// One resolution request, keyed back to the logical channel that asked.
#[derive(Debug)]
pub struct DnsQuery {
    pub domain: String,
    pub port: u16,
    pub chann_id: u32,
    pub magic: u32,
    /// Serial of the carrier that originated the query; the drain side
    /// validates it against the live carrier list before acting.
    pub client: u64,
}

/// Resolution outcome. `addr` is `None` when the name did not resolve to an
/// IPv4 address within the retry limit.
#[derive(Debug)]
pub struct DnsAnswer {
    pub query: DnsQuery,
    pub addr: Option<Ipv4Addr>,
}

struct Shared {
    inbox: Mutex<VecDeque<DnsQuery>>,
    outbox: Mutex<VecDeque<DnsAnswer>>,
    kick: Condvar,
    shutdown: AtomicBool,
}

/// Handle to the resolver worker. Dropping the service shuts the worker
/// down and joins it.
pub struct DnsService {
    shared: Arc<Shared>,
    worker: Option<thread::JoinHandle<()>>,
}

impl DnsService {
    pub fn start(log: &logging::Logger) -> DnsService {
        let shared = Arc::new(Shared {
            inbox: Mutex::new(VecDeque::new()),
            outbox: Mutex::new(VecDeque::new()),
            kick: Condvar::new(),
            shutdown: AtomicBool::new(false),
        });

        let worker_shared = shared.clone();
        let worker_log = log.new(logging::o!("module" => "dns"));

        let worker = thread::Builder::new()
            .name("dns-worker".into())
            .spawn(move || worker_loop(worker_shared, worker_log))
            .expect("Error spawning dns worker");

        DnsService {
            shared,
            worker: Some(worker),
        }
    }

    /// Hand a query over to the worker. Ownership of the query moves across
    /// the thread boundary; the answer comes back through `drain`.
    pub fn query(&self, query: DnsQuery) {
        self.shared.inbox.lock().push_back(query);
        self.shared.kick.notify_one();
    }

    /// Collect all finished answers. Called once per poll iteration by the
    /// event-loop side.
    pub fn drain(&self) -> Vec<DnsAnswer> {
        let mut outbox = self.shared.outbox.lock();
        outbox.drain(..).collect()
    }
}

impl Drop for DnsService {
    fn drop(&mut self) {
        self.shared.shutdown.store(true, Ordering::Relaxed);
        self.shared.kick.notify_one();

        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

struct CacheEntry {
    addr: Ipv4Addr,
    stamp: u64,
}

fn worker_loop(shared: Arc<Shared>, log: logging::Logger) {
    let mut cache: HashMap<String, CacheEntry> = HashMap::new();

    loop {
        let query = {
            let mut inbox = shared.inbox.lock();
            loop {
                if shared.shutdown.load(Ordering::Relaxed) {
                    return;
                }
                if let Some(query) = inbox.pop_front() {
                    break query;
                }
                let _ = shared.kick.wait_for(&mut inbox, IDLE_WAIT);
            }
        };

        let addr = resolve(&query.domain, query.port, &mut cache, &log);

        if addr.is_none() {
            logging::info!(log, "resolution failed"; "domain" => %query.domain);
        }

        shared.outbox.lock().push_back(DnsAnswer { query, addr });
    }
}

fn resolve(
    domain: &str,
    port: u16,
    cache: &mut HashMap<String, CacheEntry>,
    log: &logging::Logger,
) -> Option<Ipv4Addr> {
    // A dotted-quad "domain" needs no resolver round trip
    if let Ok(addr) = domain.parse::<Ipv4Addr>() {
        return Some(addr);
    }

    let now = timestamp_secs();

    let expired = match cache.get(domain) {
        Some(entry) if now.saturating_sub(entry.stamp) < CACHE_EXPIRY_SECS => {
            return Some(entry.addr);
        }
        Some(_) => true,
        None => false,
    };

    if expired {
        cache.remove(domain);
    }

    for attempt in 0..RESOLVE_ATTEMPTS {
        match (domain, port).to_socket_addrs() {
            Ok(addrs) => {
                for resolved in addrs {
                    if let SocketAddr::V4(v4) = resolved {
                        let addr = *v4.ip();

                        logging::debug!(log, "resolved"; "domain" => domain, "addr" => %addr);
                        cache.insert(
                            domain.to_string(),
                            CacheEntry { addr, stamp: now },
                        );
                        return Some(addr);
                    }
                }
            }
            Err(err) => {
                logging::trace!(log, "lookup attempt failed";
                                "domain" => domain,
                                "attempt" => attempt,
                                "err" => %err);
            }
        }
    }

    None
}
