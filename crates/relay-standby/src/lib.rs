//! Hot-standby primary election over Redis.
//!
//! One instance holds a leased lock (`SET NX PX`); heartbeats extend the
//! lease while the holder is alive, and the lease expiring hands leadership
//! to whichever standby claims it next.

pub mod error;
pub mod leader;

pub use error::StandbyError;
pub use leader::{LeaderElection, LeaderElectionConfig, LeadershipStatus};

pub type Result<T> = std::result::Result<T, StandbyError>;
