//! Process groups implementing the `Collective` primitives.
//!
//! * `Solo` is the single worker group, every collective is the identity.
//! * `ThreadGroup` connects workers living in the same process.
//! * `TcpGroup` connects workers over the network through a hub at rank 0.
//! * `Tally` wraps any of the above and counts the collectives issued through it.

mod solo;
mod tally;
mod tcp;
mod threaded;

pub use solo::Solo;
pub use tally::{CollectiveStats, Tally};
pub use tcp::TcpGroup;
pub use threaded::{ThreadEndpoint, ThreadGroup};
