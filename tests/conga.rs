//! CONGA across a leaf-spine-leaf chain: CE maximization along the path and
//! the leaf-table feedback loop.

use flowweave::wire::Tag;
use flowweave::{Config, EventQueue, LbMode, Outgoing, Packet, Switch};

const H1: u32 = 0x0b00_0101; // host under ToR 1
const H2: u32 = 0x0b00_0201; // host under ToR 2

// forward path: port 1 at ToR 1, port 2 at the spine
const FWD: u32 = 0x0201;
// reverse path: port 1 at ToR 2, port 3 at the spine
const REV: u32 = 0x0301;

const FAST: u64 = 100_000_000_000; // negligible quantized CE
const SLOW: u64 = 8_000_000; // a 1000B packet quantizes well above zero

fn build() -> (Switch, Switch, Switch, EventQueue) {
    let cfg = Config::default();
    let tor1 = Switch::builder(1)
        .tor(true)
        .lb_mode(LbMode::Conga)
        .config(cfg.clone())
        .host(H1, 1)
        .host(H2, 2)
        .route(H2, 1)
        .route(H1, 9)
        .path(2, FWD)
        .link_rate(1, FAST)
        .build();
    let spine = Switch::builder(5)
        .lb_mode(LbMode::Conga)
        .config(cfg.clone())
        .host(H1, 1)
        .host(H2, 2)
        .route(H2, 2)
        .route(H1, 3)
        .link_rate(2, SLOW)
        .link_rate(3, FAST)
        .build();
    let tor2 = Switch::builder(2)
        .tor(true)
        .lb_mode(LbMode::Conga)
        .config(cfg)
        .host(H1, 1)
        .host(H2, 2)
        .route(H2, 9)
        .route(H1, 1)
        .path(1, REV)
        .link_rate(1, FAST)
        .build();
    (tor1, spine, tor2, EventQueue::new())
}

fn one(mut steps: Vec<Outgoing>) -> Outgoing {
    assert_eq!(steps.len(), 1);
    steps.remove(0)
}

fn conga_tag(out: &Outgoing) -> flowweave::wire::conga::Tag {
    match &out.pkt.tag {
        Some(Tag::Conga(t)) => t.clone(),
        other => panic!("expected conga tag, got {:?}", other),
    }
}

#[test]
fn ce_is_maximized_along_the_path() {
    let (mut tor1, mut spine, mut tor2, mut q) = build();

    let pkt = Packet::data(H1, H2, 10_000, 100, 3, 1_000);
    let at_spine = one(tor1.route_input(pkt, &mut q).unwrap());
    let t0 = conga_tag(&at_spine);
    assert_eq!(t0.hop, 0);
    assert_eq!(t0.path, FWD);
    assert_eq!(at_spine.port, 1);

    let at_tor2 = one(spine.route_input(at_spine.pkt, &mut q).unwrap());
    let t1 = conga_tag(&at_tor2);
    assert_eq!(t1.hop, 1);
    assert_eq!(at_tor2.port, 2);
    // the slow spine link dominates: quantize(1000B * 8 / (8Mbps * 50us / 0.2)) * 8
    assert!(t1.ce > t0.ce);
    assert_eq!(t1.ce, t0.ce.max(t1.ce));

    let to_host = one(tor2.route_input(at_tor2.pkt, &mut q).unwrap());
    assert!(to_host.pkt.tag.is_none(), "tag must be stripped at the destination ToR");
    assert_eq!(to_host.port, 9);

    // the destination ToR recorded the arriving CE for this path
    let conga = tor2.conga().unwrap();
    assert_eq!(conga.from_leaf_metric(1, FWD), Some(t1.ce));
}

#[test]
fn feedback_piggybacks_on_reverse_traffic() {
    let (mut tor1, mut spine, mut tor2, mut q) = build();

    // forward packet seeds tor2's from-leaf table
    let pkt = Packet::data(H1, H2, 10_000, 100, 3, 1_000);
    let at_spine = one(tor1.route_input(pkt, &mut q).unwrap());
    let at_tor2 = one(spine.route_input(at_spine.pkt, &mut q).unwrap());
    let observed_ce = conga_tag(&at_tor2).ce;
    tor2.route_input(at_tor2.pkt, &mut q).unwrap();

    // reverse data from tor2 piggybacks that observation toward tor1
    q.advance_to(10_000);
    let rev = Packet::data(H2, H1, 20_000, 200, 3, 1_000);
    let rev_at_spine = one(tor2.route_input(rev, &mut q).unwrap());
    let t = conga_tag(&rev_at_spine);
    assert_eq!(t.fb_path, FWD);
    assert_eq!(t.fb_metric, observed_ce);

    let rev_at_tor1 = one(spine.route_input(rev_at_spine.pkt, &mut q).unwrap());
    tor1.route_input(rev_at_tor1.pkt, &mut q).unwrap();

    // tor1 now knows the remote congestion of its outbound path
    let conga = tor1.conga().unwrap();
    assert_eq!(conga.to_leaf_metric(2, FWD), Some(observed_ce));
}

#[test]
fn dre_decay_and_aging_run_on_switch_timers() {
    let (mut tor1, _, _, mut q) = build();

    let pkt = Packet::data(H1, H2, 10_000, 100, 3, 1_000);
    tor1.route_input(pkt, &mut q).unwrap();
    assert!(tor1.conga().unwrap().flowlets().len() == 1);

    // run every scheduled tick through two aging periods
    let horizon = Config::default().aging_time * 2 + 1;
    while let Some(firing) = q.pop_due(horizon) {
        assert_eq!(firing.switch, 1);
        tor1.on_timer(firing.timer, &mut q).unwrap();
    }

    // the idle flowlet was swept
    assert!(tor1.conga().unwrap().flowlets().is_empty());
}
