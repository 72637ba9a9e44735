pub mod election;
pub mod health;
pub mod listener;
pub mod locator;
pub mod manager;
pub mod partition;
pub mod protocol;
pub mod state;
pub mod transport;
pub mod view_creator;

pub use election::{acting_coordinator, elect_coordinator, succession, view_coordinator};
pub use health::{FailureDetector, PeerStatus};
pub use listener::{ListenerSet, MembershipListener, MembershipObserver};
pub use locator::{DiscoveryResponse, Locator, LocatorConfig, LocatorRegistry, DEFAULT_LOCATOR_PORT};
pub use manager::{MemberState, MembershipBuilder, MembershipHandle};
pub use partition::{PartitionDetector, PartitionState, QuorumCheck};
pub use protocol::Message;
pub use state::{LocatorState, LocatorStateFile};

pub use datagrid_common::{
    GridError, LocatorEntry, Member, MemberKind, MembershipConfig, Result, SuspectRecord, View,
    ViewId,
};
