//! The cluster layer: gossip membership and the balancer coordinator that
//! ties consensus, membership, the VIP provider, and the dataplane
//! reconciler together.

mod balancer;
mod gossip;

pub use balancer::{Balancer, Config};
pub use gossip::{Event, Gossip, Member, Role, Tags};
