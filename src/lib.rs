//! Flowweave is the switch-resident load-balancing data plane of a
//! discrete-event RDMA fabric simulation. Each switch runs one of five
//! interchangeable engines that pick an egress interface per packet on a
//! multi-rooted leaf-spine topology:
//!
//! * flow-ECMP: stateless seeded 5-tuple hashing;
//! * DRILL: per-packet power-of-K choices over egress queue depth;
//! * CONGA: congestion-aware flowlet routing with leaf-to-leaf feedback;
//! * LETFLOW: flowlet switching onto uniformly random paths;
//! * CONWEAVE: proactive flowcut rerouting, with the reordering it causes
//!   repaired in-network by per-flow Virtual Output Queues at the
//!   destination ToR.
//!
//! The crate deliberately ends at the switch boundary. The event scheduler
//! is the in-crate virtual clock ([`sim::EventQueue`]); everything else the
//! data plane touches — RDMA endpoints, egress scheduling, shared-buffer
//! admission, PFC — is an external collaborator. A switch consumes packets
//! via [`Switch::route_input`] and due timers via [`Switch::on_timer`], and
//! returns [`Outgoing`] actions for the embedding's MMU to admit or drop.
//!
//! # Example
//!
//! ```
//! use flowweave::{Config, EventQueue, LbMode, Packet, Switch};
//!
//! // a ToR with two spine uplinks toward ToR 2
//! let mut tor = Switch::builder(1)
//!     .tor(true)
//!     .lb_mode(LbMode::Conweave)
//!     .config(Config::default())
//!     .host(0x0b00_0101, 1)
//!     .host(0x0b00_0201, 2)
//!     .route(0x0b00_0201, 1)
//!     .route(0x0b00_0201, 2)
//!     .path(2, 0x0000_0a01)
//!     .path(2, 0x0000_0b02)
//!     .base_rtt(2, 800)
//!     .build();
//!
//! let mut q = EventQueue::new();
//! let pkt = Packet::data(0x0b00_0101, 0x0b00_0201, 10_000, 100, 3, 1_000);
//! let out = tor.route_input(pkt, &mut q).unwrap();
//! assert_eq!(out.len(), 1);
//! ```

pub mod config;
pub mod conga;
pub mod conweave;
pub mod drill;
pub mod errors;
pub mod flowlet;
pub mod letflow;
pub mod packet;
pub mod path;
pub mod sim;
pub mod switch;
pub mod wire;

pub use crate::config::{Config, LbMode};
pub use crate::errors::{Error, Result};
pub use crate::packet::Packet;
pub use crate::sim::{EventQueue, Nanos, Timer};
pub use crate::switch::{Counters, Engine, Outgoing, Step, Switch, SwitchBuilder};
