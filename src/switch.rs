//! The switch node: routing-table lookup, flow-ECMP, engine dispatch, and
//! the counter snapshot surface.
//!
//! A `Switch` owns all of its state. Handling a packet or a timer returns
//! the packets to put on the wire as `Outgoing` actions; the embedding runs
//! its admission control (MMU) over them and may drop — the core never
//! buffers for back-pressure (except in VOQs) and never retries.

use std::collections::{BTreeSet, HashMap};

use tracing::debug;

use crate::config::{Config, LbMode};
use crate::conga::CongaRouting;
use crate::conweave::ConweaveRouting;
use crate::drill::Drill;
use crate::errors::{Error, Result, RoutingMissError};
use crate::letflow::LetflowRouting;
use crate::packet::{Packet, CONWEAVE_CTRL_DUMMY_INDEV, PROT_UDP};
use crate::path::{self, PathId};
use crate::sim::{EventQueue, Nanos, Timer};

/// What an engine decided to do with a packet.
#[derive(Debug)]
pub enum Step {
    /// Send out a specific egress chosen by the engine.
    Forward { pkt: Packet, port: u32 },
    /// Fall through to the routing table and flow-ECMP (also used for
    /// engine-emitted control packets and end-host delivery).
    Deliver { pkt: Packet },
}

/// A packet handed to the external MMU: `(packet, egress, priority class)`.
#[derive(Debug)]
pub struct Outgoing {
    pub pkt: Packet,
    pub port: u32,
    pub class: u16,
}

/// The engine a switch runs, selected once at construction.
pub enum Engine {
    Ecmp,
    Drill(Drill),
    Conga(CongaRouting),
    Letflow(LetflowRouting),
    Conweave(ConweaveRouting),
}

/// Per-switch statistics snapshot, aggregated across whatever engine the
/// switch runs. Fields that do not apply to the engine stay zero.
#[derive(Clone, Debug, Default)]
pub struct Counters {
    pub flowlet_timeouts: u64,
    pub reroutes: u64,
    pub out_of_order: u64,
    pub voq_flush_total: u64,
    pub voq_flush_by_tail: u64,
    pub timely_init_replies: u64,
    pub timely_tail_replies: u64,
    pub reply_init_sent: u64,
    pub reply_tail_sent: u64,
    pub notify_sent: u64,
    pub voq_size_history: Vec<u32>,
}

pub struct Switch {
    id: u32,
    is_tor: bool,
    ecmp_seed: u32,
    /// dstIP -> candidate egress interfaces. Static after construction.
    routes: HashMap<u32, Vec<u32>>,
    /// host IP -> its ToR switch id. Static after construction.
    host_to_tor: HashMap<u32, u32>,
    /// Egress queue occupancy in bytes, fed back by the embedding; read by
    /// DRILL as its load signal.
    egress_backlog: HashMap<u32, u64>,
    engine: Engine,
}

impl Switch {
    pub fn builder(id: u32) -> SwitchBuilder {
        SwitchBuilder::new(id)
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn is_tor(&self) -> bool {
        self.is_tor
    }

    /// Handle one arriving packet; returns everything to put on the wire.
    pub fn route_input(&mut self, pkt: Packet, q: &mut EventQueue) -> Result<Vec<Outgoing>> {
        let src_tor = self.tor_of(pkt.sip)?;
        let dst_tor = self.tor_of(pkt.dip)?;

        let steps = match &mut self.engine {
            Engine::Ecmp => vec![Step::Deliver { pkt }],
            Engine::Drill(drill) => {
                if pkt.is_control() || src_tor == dst_tor {
                    vec![Step::Deliver { pkt }]
                } else {
                    let hops = self
                        .routes
                        .get(&pkt.dip)
                        .ok_or(RoutingMissError(pkt.dip))?;
                    let port = drill.select(pkt.dip, hops, &self.egress_backlog);
                    debug!(switch = self.id, port, "drill");
                    vec![Step::Forward { pkt, port }]
                }
            }
            Engine::Conga(conga) => conga.route_input(pkt, src_tor, dst_tor, q)?,
            Engine::Letflow(lf) => {
                if pkt.l3_prot != PROT_UDP || src_tor == dst_tor {
                    vec![Step::Deliver { pkt }]
                } else {
                    lf.route_input(pkt, src_tor, dst_tor, q)?
                }
            }
            Engine::Conweave(cw) => cw.route_input(pkt, src_tor, dst_tor, q)?,
        };
        self.finalize(steps)
    }

    /// Handle a due timer; VOQ flushes can release buffered packets.
    pub fn on_timer(&mut self, timer: Timer, q: &mut EventQueue) -> Result<Vec<Outgoing>> {
        let steps = match (&mut self.engine, timer) {
            (Engine::Conga(c), Timer::CongaDre) => {
                c.on_dre_tick(q);
                vec![]
            }
            (Engine::Conga(c), Timer::CongaAging) => {
                c.on_aging(q);
                vec![]
            }
            (Engine::Letflow(l), Timer::LetflowAging) => {
                l.on_aging(q);
                vec![]
            }
            (Engine::Conweave(c), Timer::ConweaveAging) => {
                c.on_aging(q);
                vec![]
            }
            (Engine::Conweave(c), Timer::VoqFlush { flowkey }) => c.on_voq_flush(flowkey, q),
            (_, timer) => {
                return Err(Error(format!(
                    "switch {} got a timer {:?} for an engine it does not run",
                    self.id, timer
                )));
            }
        };
        self.finalize(steps)
    }

    fn finalize(&mut self, steps: Vec<Step>) -> Result<Vec<Outgoing>> {
        let mut out = Vec::with_capacity(steps.len());
        for step in steps {
            match step {
                Step::Forward { pkt, port } => {
                    let class = pkt.pg;
                    out.push(Outgoing { pkt, port, class });
                }
                Step::Deliver { pkt } => out.push(self.send_to_dev(pkt)?),
            }
        }
        Ok(out)
    }

    /// Routing-table lookup plus flow-ECMP, with the priority classing the
    /// egress scheduler expects: link-control and CONWEAVE control packets
    /// ride the highest class.
    fn send_to_dev(&self, pkt: Packet) -> Result<Outgoing> {
        let hops = self
            .routes
            .get(&pkt.dip)
            .ok_or(RoutingMissError(pkt.dip))?;
        let port = self.ecmp_port(&pkt, hops);
        let class = if pkt.is_control() || pkt.indev == CONWEAVE_CTRL_DUMMY_INDEV {
            0
        } else {
            pkt.pg
        };
        Ok(Outgoing { pkt, port, class })
    }

    /// Seeded 5-tuple hash over the candidate next hops.
    fn ecmp_port(&self, pkt: &Packet, hops: &[u32]) -> u32 {
        debug_assert!(!hops.is_empty());
        let mut buf = [0u8; 16];
        buf[0..4].copy_from_slice(&pkt.sip.to_le_bytes());
        buf[4..8].copy_from_slice(&pkt.dip.to_le_bytes());
        let ports = (pkt.sport as u32) | ((pkt.dport as u32) << 16);
        buf[8..12].copy_from_slice(&ports.to_le_bytes());
        buf[12..16].copy_from_slice(&(pkt.pg as u32).to_le_bytes());
        let h = path::hash32(&buf, self.ecmp_seed);
        hops[h as usize % hops.len()]
    }

    fn tor_of(&self, host_ip: u32) -> Result<u32> {
        self.host_to_tor
            .get(&host_ip)
            .copied()
            .ok_or_else(|| Error(format!("host ip {:#010x} maps to no ToR", host_ip)))
    }

    /// Feed the egress queue occupancy back from the MMU (DRILL's signal).
    pub fn note_egress_backlog(&mut self, port: u32, bytes: u64) {
        self.egress_backlog.insert(port, bytes);
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    /// The CONWEAVE engine, if this switch runs one.
    pub fn conweave(&self) -> Option<&ConweaveRouting> {
        match &self.engine {
            Engine::Conweave(c) => Some(c),
            _ => None,
        }
    }

    /// The CONGA engine, if this switch runs one.
    pub fn conga(&self) -> Option<&CongaRouting> {
        match &self.engine {
            Engine::Conga(c) => Some(c),
            _ => None,
        }
    }

    /// Statistics snapshot; the test harness aggregates across switches.
    pub fn counters(&self) -> Counters {
        let mut c = Counters::default();
        match &self.engine {
            Engine::Conga(conga) => c.flowlet_timeouts = conga.n_flowlet_timeout,
            Engine::Letflow(lf) => c.flowlet_timeouts = lf.n_flowlet_timeout,
            Engine::Conweave(cw) => {
                let cc = cw.counters();
                c.reroutes = cc.reroute;
                c.out_of_order = cc.out_of_order;
                c.voq_flush_total = cc.flush_voq_total;
                c.voq_flush_by_tail = cc.flush_voq_by_tail;
                c.timely_init_replies = cc.timely_init_replied;
                c.timely_tail_replies = cc.timely_tail_replied;
                c.reply_init_sent = cc.reply_init_sent;
                c.reply_tail_sent = cc.reply_tail_sent;
                c.notify_sent = cc.notify_sent;
                c.voq_size_history = cc.voq_size_history.clone();
            }
            Engine::Ecmp | Engine::Drill(_) => {}
        }
        c
    }
}

/// Construction-time surface: topology facts are installed here once and
/// are immutable on the built switch.
pub struct SwitchBuilder {
    id: u32,
    is_tor: bool,
    lb_mode: LbMode,
    config: Config,
    ecmp_seed: Option<u32>,
    rng_seed: u64,
    hosts: HashMap<u32, u32>,
    routes: HashMap<u32, Vec<u32>>,
    paths: HashMap<u32, BTreeSet<PathId>>,
    base_rtt: HashMap<u32, Nanos>,
    link_rates: HashMap<u32, u64>,
}

impl SwitchBuilder {
    fn new(id: u32) -> SwitchBuilder {
        SwitchBuilder {
            id,
            is_tor: false,
            lb_mode: LbMode::FlowEcmp,
            config: Config::default(),
            ecmp_seed: None,
            rng_seed: id as u64,
            hosts: HashMap::new(),
            routes: HashMap::new(),
            paths: HashMap::new(),
            base_rtt: HashMap::new(),
            link_rates: HashMap::new(),
        }
    }

    pub fn tor(mut self, is_tor: bool) -> Self {
        self.is_tor = is_tor;
        self
    }

    pub fn lb_mode(mut self, mode: LbMode) -> Self {
        self.lb_mode = mode;
        self
    }

    pub fn config(mut self, cfg: Config) -> Self {
        self.config = cfg;
        self
    }

    pub fn ecmp_seed(mut self, seed: u32) -> Self {
        self.ecmp_seed = Some(seed);
        self
    }

    pub fn rng_seed(mut self, seed: u64) -> Self {
        self.rng_seed = seed;
        self
    }

    /// Declare which ToR serves `host_ip`.
    pub fn host(mut self, host_ip: u32, tor: u32) -> Self {
        self.hosts.insert(host_ip, tor);
        self
    }

    /// Add a next-hop interface for `dip` (repeatable for multipath).
    pub fn route(mut self, dip: u32, port: u32) -> Self {
        self.routes.entry(dip).or_default().push(port);
        self
    }

    /// Enumerate an allowed path toward a destination ToR. Hop 0 must be
    /// non-zero (0 means "unset").
    pub fn path(mut self, dst_tor: u32, p: PathId) -> Self {
        assert!(path::port_of(p, 0) != 0, "hop 0 of a path must be non-zero");
        self.paths.entry(dst_tor).or_default().insert(p);
        self
    }

    pub fn base_rtt(mut self, dst_tor: u32, rtt: Nanos) -> Self {
        self.base_rtt.insert(dst_tor, rtt);
        self
    }

    pub fn link_rate(mut self, port: u32, bits_per_sec: u64) -> Self {
        self.link_rates.insert(port, bits_per_sec);
        self
    }

    pub fn build(self) -> Switch {
        let engine = match self.lb_mode {
            LbMode::FlowEcmp => Engine::Ecmp,
            LbMode::Drill => Engine::Drill(Drill::new(self.config.drill_sample, self.rng_seed)),
            LbMode::Conga => Engine::Conga(CongaRouting::new(
                self.id,
                self.is_tor,
                &self.config,
                self.paths,
                self.link_rates,
                self.rng_seed,
            )),
            LbMode::Letflow => Engine::Letflow(LetflowRouting::new(
                self.id,
                self.is_tor,
                &self.config,
                self.paths,
                self.rng_seed,
            )),
            LbMode::Conweave => Engine::Conweave(ConweaveRouting::new(
                self.id,
                self.is_tor,
                &self.config,
                self.paths,
                self.base_rtt,
                self.rng_seed,
            )),
        };
        Switch {
            id: self.id,
            is_tor: self.is_tor,
            ecmp_seed: self.ecmp_seed.unwrap_or(self.id),
            routes: self.routes,
            host_to_tor: self.hosts,
            egress_backlog: HashMap::new(),
            engine,
        }
    }
}
