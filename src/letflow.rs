//! LETFLOW: flowlet switching onto uniformly random paths. No congestion
//! state, no CE tagging; the packet carries only the path and the hop index.

use std::collections::{BTreeSet, HashMap};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::debug;

use crate::config::Config;
use crate::errors::{EmptyPathSetError, Error, MissingTagError, Result};
use crate::flowlet::FlowletTable;
use crate::packet::Packet;
use crate::path::{self, PathId};
use crate::sim::{EventQueue, Nanos, Timer};
use crate::switch::Step;
use crate::wire::{letflow, Tag};

pub struct LetflowRouting {
    switch_id: u32,
    is_tor: bool,

    flowlet_timeout: Nanos,
    aging_time: Nanos,

    /// dstToR -> enumerated paths. Static after construction.
    routing: HashMap<u32, BTreeSet<PathId>>,

    flowlets: FlowletTable,
    rng: StdRng,
    aging_armed: bool,

    pub(crate) n_flowlet_timeout: u64,
}

impl LetflowRouting {
    pub fn new(
        switch_id: u32,
        is_tor: bool,
        cfg: &Config,
        routing: HashMap<u32, BTreeSet<PathId>>,
        rng_seed: u64,
    ) -> LetflowRouting {
        LetflowRouting {
            switch_id,
            is_tor,
            flowlet_timeout: cfg.flowlet_timeout,
            aging_time: cfg.aging_time,
            routing,
            flowlets: FlowletTable::new(),
            rng: StdRng::seed_from_u64(rng_seed),
            aging_armed: false,
            n_flowlet_timeout: 0,
        }
    }

    /// Called for inter-pod DATA only; control and intra-pod traffic take
    /// flow-ECMP at the switch.
    pub fn route_input(
        &mut self,
        mut pkt: Packet,
        _src_tor: u32,
        dst_tor: u32,
        q: &mut EventQueue,
    ) -> Result<Vec<Step>> {
        let now = q.now();

        if !self.aging_armed {
            debug!(switch = self.switch_id, "starting letflow aging event");
            q.schedule_in(self.aging_time, self.switch_id, Timer::LetflowAging);
            self.aging_armed = true;
        }

        let tag = match pkt.tag.take() {
            Some(Tag::Letflow(t)) => Some(t),
            Some(other) => {
                return Err(Error(format!(
                    "letflow switch {} saw a foreign tag {:?}",
                    self.switch_id, other
                )));
            }
            None => None,
        };

        if self.is_tor {
            if tag.is_some() {
                // destination ToR: tag stripped, pass to the end-host interface
                return Ok(vec![Step::Deliver { pkt }]);
            }
            // source ToR
            let key = path::flowlet_key(pkt.dip, pkt.sport, pkt.dport, pkt.pg);
            let cached = match self.flowlets.get_mut(key) {
                Some(f) if now - f.active <= self.flowlet_timeout => {
                    f.touch(now);
                    Some(f.path)
                }
                Some(_) => {
                    self.n_flowlet_timeout += 1;
                    None
                }
                None => None,
            };
            let selected = match cached {
                Some(p) => p,
                None => {
                    let p = self.random_path(dst_tor)?;
                    self.flowlets.set_path(key, p, now);
                    p
                }
            };
            let out_port = path::port_of(selected, 0);
            debug!(
                switch = self.switch_id,
                path = selected,
                out_port,
                "letflow source tor"
            );
            pkt.tag = Some(Tag::Letflow(letflow::Tag {
                path: selected,
                hop: 0,
            }));
            return Ok(vec![Step::Forward { pkt, port: out_port }]);
        }

        // agg/core switch just advances the hop and indexes the path byte
        let mut t = tag.ok_or(MissingTagError)?;
        t.hop += 1;
        let out_port = path::port_of(t.path, t.hop);
        pkt.tag = Some(Tag::Letflow(t));
        Ok(vec![Step::Forward { pkt, port: out_port }])
    }

    fn random_path(&mut self, dst_tor: u32) -> Result<PathId> {
        let paths = match self.routing.get(&dst_tor) {
            Some(s) if !s.is_empty() => s,
            _ => return Err(EmptyPathSetError(dst_tor).into()),
        };
        let i = self.rng.gen_range(0..paths.len());
        Ok(*paths.iter().nth(i).expect("nonempty"))
    }

    /// Keeps the flowlet table as small as possible.
    pub fn on_aging(&mut self, q: &mut EventQueue) {
        self.flowlets.sweep(q.now(), self.aging_time);
        q.schedule_in(self.aging_time, self.switch_id, Timer::LetflowAging);
    }

    pub fn flowlets(&self) -> &FlowletTable {
        &self.flowlets
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn letflow_tor(paths: &[PathId]) -> LetflowRouting {
        let mut routing = HashMap::new();
        routing.insert(2u32, paths.iter().copied().collect::<BTreeSet<_>>());
        LetflowRouting::new(1, true, &Config::default(), routing, 7)
    }

    fn forwarded_port(steps: &[Step]) -> u32 {
        match steps {
            [Step::Forward { port, .. }] => *port,
            other => panic!("expected one forward, got {:?}", other),
        }
    }

    #[test]
    fn flowlet_gap_redraws_path_and_counts_timeout() {
        let mut lf = letflow_tor(&[0x01, 0x02, 0x03, 0x04]);
        let mut q = EventQueue::new();
        let pkt = || Packet::data(0x0b00_0101, 0x0b00_0201, 10000, 100, 3, 1000);

        let steps = lf.route_input(pkt(), 1, 2, &mut q).unwrap();
        forwarded_port(&steps);
        let first = lf.flowlets().get(path::flowlet_key(0x0b00_0201, 10000, 100, 3))
            .unwrap()
            .path;

        // past the flowlet timeout: an independent draw, counted
        q.advance_to(150_000);
        lf.route_input(pkt(), 1, 2, &mut q).unwrap();
        assert_eq!(lf.n_flowlet_timeout, 1);
        let second = lf.flowlets().get(path::flowlet_key(0x0b00_0201, 10000, 100, 3))
            .unwrap();
        assert_eq!(second.activated, 150_000);
        let _ = first; // paths are drawn independently; equality is allowed
    }

    #[test]
    fn transit_switch_advances_hop() {
        let mut routing = HashMap::new();
        routing.insert(2u32, [0x0201u32].iter().copied().collect::<BTreeSet<_>>());
        let mut lf = LetflowRouting::new(5, false, &Config::default(), routing, 7);
        let mut q = EventQueue::new();

        let mut pkt = Packet::data(0x0b00_0101, 0x0b00_0201, 10000, 100, 3, 1000);
        pkt.tag = Some(Tag::Letflow(letflow::Tag { path: 0x0201, hop: 0 }));
        let steps = lf.route_input(pkt, 1, 2, &mut q).unwrap();
        match &steps[..] {
            [Step::Forward { pkt, port }] => {
                assert_eq!(*port, 0x02);
                match &pkt.tag {
                    Some(Tag::Letflow(t)) => assert_eq!(t.hop, 1),
                    other => panic!("unexpected tag {:?}", other),
                }
            }
            other => panic!("expected one forward, got {:?}", other),
        }
    }

    #[test]
    fn untagged_at_transit_is_fatal() {
        let mut lf = LetflowRouting::new(5, false, &Config::default(), HashMap::new(), 7);
        let mut q = EventQueue::new();
        let pkt = Packet::data(0x0b00_0101, 0x0b00_0201, 10000, 100, 3, 1000);
        assert!(lf.route_input(pkt, 1, 2, &mut q).is_err());
    }
}
