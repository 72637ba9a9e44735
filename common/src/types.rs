use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::SocketAddr;

/// Monotonically increasing view identifier
pub type ViewId = u64;

/// Milliseconds since the Unix epoch
pub fn now_millis() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}

/// What kind of process a member is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum MemberKind {
    /// Ordinary peer (cache server, application)
    Normal,

    /// Peer co-located with a locator
    Locator,

    /// Administrative member, carries no quorum weight
    Admin,
}

impl std::fmt::Display for MemberKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MemberKind::Normal => write!(f, "normal"),
            MemberKind::Locator => write!(f, "locator"),
            MemberKind::Admin => write!(f, "admin"),
        }
    }
}

/// Identity of a process participating in the group.
///
/// Immutable once created. A process that leaves and joins again gets a new
/// `joined_at_ms`, and therefore a new identity, even on the same address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Member {
    /// Membership endpoint (heartbeats, views, joins)
    pub addr: SocketAddr,

    /// When this identity joined, in milliseconds since the epoch
    pub joined_at_ms: u64,

    pub kind: MemberKind,
}

impl Member {
    pub fn new(addr: SocketAddr, kind: MemberKind) -> Self {
        Self {
            addr,
            joined_at_ms: now_millis(),
            kind,
        }
    }

    pub fn with_timestamp(addr: SocketAddr, kind: MemberKind, joined_at_ms: u64) -> Self {
        Self {
            addr,
            joined_at_ms,
            kind,
        }
    }

    pub fn is_locator(&self) -> bool {
        self.kind == MemberKind::Locator
    }

    /// Same logical endpoint, possibly a different incarnation
    pub fn same_endpoint(&self, other: &Member) -> bool {
        self.addr == other.addr
    }
}

impl std::fmt::Display for Member {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}({})<{}>", self.addr, self.kind, self.joined_at_ms)
    }
}

/// Ordered, versioned snapshot of the member set.
///
/// Views are never mutated once built; the coordinator creates a new one for
/// every membership change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct View {
    id: ViewId,
    creator: Member,
    members: Vec<Member>,
    crashed: Vec<Member>,
}

impl View {
    /// Build a view. Duplicate members are dropped, keeping the first
    /// occurrence so order is preserved.
    pub fn new(id: ViewId, creator: Member, members: Vec<Member>, crashed: Vec<Member>) -> Self {
        let mut seen = HashSet::with_capacity(members.len());
        let members = members
            .into_iter()
            .filter(|m| seen.insert(m.clone()))
            .collect();

        Self {
            id,
            creator,
            members,
            crashed,
        }
    }

    /// First view of a new group, containing only its creator
    pub fn initial(creator: Member) -> Self {
        Self::new(1, creator.clone(), vec![creator], Vec::new())
    }

    pub fn id(&self) -> ViewId {
        self.id
    }

    pub fn creator(&self) -> &Member {
        &self.creator
    }

    pub fn members(&self) -> &[Member] {
        &self.members
    }

    /// Members found crashed in the transition from the prior view
    pub fn crashed(&self) -> &[Member] {
        &self.crashed
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn contains(&self, member: &Member) -> bool {
        self.members.contains(member)
    }

    pub fn position(&self, member: &Member) -> Option<usize> {
        self.members.iter().position(|m| m == member)
    }

    /// Find the entry for an endpoint regardless of incarnation
    pub fn member_at(&self, addr: SocketAddr) -> Option<&Member> {
        self.members.iter().find(|m| m.addr == addr)
    }

    /// Members of this view that were not in `prior`
    pub fn joined_since(&self, prior: &View) -> Vec<Member> {
        self.members
            .iter()
            .filter(|m| !prior.contains(m))
            .cloned()
            .collect()
    }

    /// Members of `prior` that are not in this view
    pub fn departed_since(&self, prior: &View) -> Vec<Member> {
        prior
            .members
            .iter()
            .filter(|m| !self.contains(m))
            .cloned()
            .collect()
    }

    /// Earliest-joined normal member, used for lock-grantor placement
    pub fn lead_member(&self) -> Option<&Member> {
        self.members.iter().find(|m| m.kind == MemberKind::Normal)
    }
}

impl std::fmt::Display for View {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "View[{}|{}] [", self.creator, self.id)?;
        for (i, member) in self.members.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", member)?;
        }
        write!(f, "]")?;
        if !self.crashed.is_empty() {
            write!(f, " crashed={}", self.crashed.len())?;
        }
        Ok(())
    }
}

/// A suspicion raised against a member, kept until the member is confirmed
/// alive or removed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuspectRecord {
    pub suspect: Member,
    pub reporter: Member,
    pub reason: String,
    pub timestamp_ms: u64,
}

impl SuspectRecord {
    pub fn new(suspect: Member, reporter: Member, reason: impl Into<String>) -> Self {
        Self {
            suspect,
            reporter,
            reason: reason.into(),
            timestamp_ms: now_millis(),
        }
    }
}

/// Registry entry for a running locator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocatorEntry {
    pub endpoint: SocketAddr,

    /// Member hosted by the locator process, once it has joined
    pub member: Option<Member>,
}
