use dashmap::DashMap;
use datagrid_common::{Member, View};
use std::time::{Duration, Instant};

/// Reason attached to suspicions raised by missed heartbeats
pub const NO_HEARTBEAT_REASON: &str = "no heartbeat response within member-timeout";

/// Reason attached to suspicions raised by missing view acks
pub const NO_VIEW_ACK_REASON: &str = "failed to acknowledge a membership view";

/// Health of a watched peer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerStatus {
    Alive,
    Suspect,
    Crashed,
}

#[derive(Debug, Clone)]
struct PeerHealth {
    last_heard: Instant,
    status: PeerStatus,
    /// 1 for direct watches, +1 per hop of indirect suspicion
    depth: u32,
}

/// A status change produced by `FailureDetector::evaluate`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub member: Member,
    pub status: PeerStatus,
    pub silence: Duration,
    pub depth: u32,
}

/// Heartbeat bookkeeping for the peers this member watches.
///
/// Purely time-driven: the caller records when peers were heard from and
/// periodically asks which peers changed status.
pub struct FailureDetector {
    member_timeout: Duration,
    crash_multiplier: u32,
    peers: DashMap<Member, PeerHealth>,
}

impl FailureDetector {
    pub fn new(member_timeout: Duration, crash_multiplier: u32) -> Self {
        Self {
            member_timeout,
            crash_multiplier: crash_multiplier.max(1),
            peers: DashMap::new(),
        }
    }

    pub fn member_timeout(&self) -> Duration {
        self.member_timeout
    }

    /// Silence after which a peer becomes suspect
    pub fn suspect_after(&self) -> Duration {
        self.member_timeout
    }

    /// Silence after which a peer at the given watch depth is crashed.
    ///
    /// Each hop of an indirect watch chain has to time out before the next
    /// one starts, so the bound grows with depth.
    pub fn crash_after(&self, depth: u32) -> Duration {
        self.member_timeout * self.crash_multiplier * depth.max(1)
    }

    /// Replace the watch set. Peers already watched keep their history.
    pub fn watch(&self, targets: &[(Member, u32)], now: Instant) {
        self.peers
            .retain(|member, _| targets.iter().any(|(target, _)| target == member));

        for (member, depth) in targets {
            self.peers
                .entry(member.clone())
                .and_modify(|health| health.depth = *depth)
                .or_insert(PeerHealth {
                    last_heard: now,
                    status: PeerStatus::Alive,
                    depth: *depth,
                });
        }
    }

    /// Watch one more peer, typically the successor of a crashed one. An
    /// existing watch keeps its history and only ever gets deeper.
    pub fn extend(&self, member: Member, depth: u32, now: Instant) {
        self.peers
            .entry(member)
            .and_modify(|health| health.depth = health.depth.max(depth))
            .or_insert(PeerHealth {
                last_heard: now,
                status: PeerStatus::Alive,
                depth,
            });
    }

    pub fn clear(&self) {
        self.peers.clear();
    }

    /// Record that a peer answered. Returns the previous status when the
    /// peer was not considered alive.
    pub fn record_heard(&self, member: &Member, now: Instant) -> Option<PeerStatus> {
        let mut health = self.peers.get_mut(member)?;
        health.last_heard = now;

        if health.status == PeerStatus::Alive {
            return None;
        }

        let previous = health.status;
        health.status = PeerStatus::Alive;
        Some(previous)
    }

    /// Advance every watched peer's status according to its silence
    pub fn evaluate(&self, now: Instant) -> Vec<Transition> {
        let mut transitions = Vec::new();

        for mut entry in self.peers.iter_mut() {
            let silence = now.saturating_duration_since(entry.last_heard);
            let depth = entry.depth;

            let next = if silence >= self.crash_after(depth) {
                PeerStatus::Crashed
            } else if silence >= self.suspect_after() {
                PeerStatus::Suspect
            } else {
                PeerStatus::Alive
            };

            let escalates = matches!(
                (entry.status, next),
                (PeerStatus::Alive, PeerStatus::Suspect)
                    | (PeerStatus::Alive, PeerStatus::Crashed)
                    | (PeerStatus::Suspect, PeerStatus::Crashed)
            );

            if escalates {
                entry.status = next;
                transitions.push(Transition {
                    member: entry.key().clone(),
                    status: next,
                    silence,
                    depth,
                });
            }
        }

        transitions
    }

    pub fn status(&self, member: &Member) -> Option<PeerStatus> {
        self.peers.get(member).map(|health| health.status)
    }

    pub fn depth(&self, member: &Member) -> Option<u32> {
        self.peers.get(member).map(|health| health.depth)
    }

    pub fn watched(&self) -> Vec<Member> {
        self.peers.iter().map(|entry| entry.key().clone()).collect()
    }
}

/// Peers a member watches directly: the coordinator plus the next
/// `neighbors` members after it in view order (wrapping around)
pub fn watch_targets(
    view: &View,
    local: &Member,
    coordinator: Option<&Member>,
    excluded: &[Member],
    neighbors: usize,
) -> Vec<(Member, u32)> {
    let mut targets: Vec<(Member, u32)> = Vec::new();

    if let Some(coordinator) = coordinator {
        if coordinator != local {
            targets.push((coordinator.clone(), 1));
        }
    }

    for member in ring_after(view, local, excluded) {
        if targets.len() >= neighbors + usize::from(coordinator.is_some_and(|c| c != local)) {
            break;
        }
        if targets.iter().any(|(t, _)| t == &member) {
            continue;
        }
        targets.push((member, 1));
    }

    targets
}

/// Members following `start` in ring order, skipping `start` itself and
/// any excluded members
pub fn ring_after(view: &View, start: &Member, excluded: &[Member]) -> Vec<Member> {
    let members = view.members();
    let Some(position) = members.iter().position(|m| m == start) else {
        return members
            .iter()
            .filter(|m| !excluded.contains(m))
            .cloned()
            .collect();
    };

    (1..members.len())
        .map(|offset| &members[(position + offset) % members.len()])
        .filter(|m| !excluded.contains(m))
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use datagrid_common::MemberKind;

    fn member(port: u16) -> Member {
        Member::with_timestamp(
            format!("127.0.0.1:{}", port).parse().unwrap(),
            MemberKind::Normal,
            port as u64,
        )
    }

    #[test]
    fn test_suspect_then_crash() {
        let detector = FailureDetector::new(Duration::from_millis(100), 3);
        let start = Instant::now();
        let peer = member(5001);
        detector.watch(&[(peer.clone(), 1)], start);

        assert!(detector.evaluate(start + Duration::from_millis(50)).is_empty());

        let suspects = detector.evaluate(start + Duration::from_millis(120));
        assert_eq!(suspects.len(), 1);
        assert_eq!(suspects[0].status, PeerStatus::Suspect);

        // no repeated notification while still suspect
        assert!(detector.evaluate(start + Duration::from_millis(200)).is_empty());

        let crashes = detector.evaluate(start + Duration::from_millis(310));
        assert_eq!(crashes.len(), 1);
        assert_eq!(crashes[0].status, PeerStatus::Crashed);
        assert_eq!(detector.status(&peer), Some(PeerStatus::Crashed));
    }

    #[test]
    fn test_heartbeat_clears_suspicion() {
        let detector = FailureDetector::new(Duration::from_millis(100), 3);
        let start = Instant::now();
        let peer = member(5002);
        detector.watch(&[(peer.clone(), 1)], start);

        detector.evaluate(start + Duration::from_millis(150));
        assert_eq!(
            detector.record_heard(&peer, start + Duration::from_millis(160)),
            Some(PeerStatus::Suspect)
        );
        assert_eq!(detector.status(&peer), Some(PeerStatus::Alive));
        assert!(detector.evaluate(start + Duration::from_millis(250)).is_empty());
    }

    #[test]
    fn test_indirect_watch_waits_longer() {
        let detector = FailureDetector::new(Duration::from_millis(100), 3);
        let start = Instant::now();
        let direct = member(5003);
        let indirect = member(5004);
        detector.watch(&[(direct.clone(), 1)], start);
        detector.extend(indirect.clone(), 2, start);

        assert_eq!(detector.crash_after(2), Duration::from_millis(600));
        detector.extend(indirect.clone(), 1, start);
        assert_eq!(detector.depth(&indirect), Some(2));

        let at_400 = detector.evaluate(start + Duration::from_millis(400));
        let crashed: Vec<_> = at_400
            .iter()
            .filter(|t| t.status == PeerStatus::Crashed)
            .map(|t| t.member.clone())
            .collect();
        assert_eq!(crashed, vec![direct]);
        assert_eq!(detector.status(&indirect), Some(PeerStatus::Suspect));

        let at_600 = detector.evaluate(start + Duration::from_millis(600));
        assert_eq!(at_600[0].member, indirect);
        assert_eq!(at_600[0].status, PeerStatus::Crashed);
    }

    #[test]
    fn test_rewatch_keeps_history_and_drops_others() {
        let detector = FailureDetector::new(Duration::from_millis(100), 3);
        let start = Instant::now();
        let a = member(5005);
        let b = member(5006);
        detector.watch(&[(a.clone(), 1), (b.clone(), 1)], start);
        detector.evaluate(start + Duration::from_millis(150));

        detector.watch(&[(a.clone(), 1)], start + Duration::from_millis(160));
        assert_eq!(detector.status(&a), Some(PeerStatus::Suspect));
        assert_eq!(detector.status(&b), None);
    }

    #[test]
    fn test_crashed_peer_stays_crashed_until_heard() {
        let detector = FailureDetector::new(Duration::from_millis(100), 3);
        let start = Instant::now();
        let peer = member(5007);
        detector.watch(&[(peer.clone(), 1)], start);
        detector.evaluate(start + Duration::from_millis(350));

        detector.watch(&[(peer.clone(), 1)], start + Duration::from_millis(360));
        assert!(detector.evaluate(start + Duration::from_millis(700)).is_empty());
        assert_eq!(
            detector.record_heard(&peer, start + Duration::from_millis(710)),
            Some(PeerStatus::Crashed)
        );
        assert_eq!(detector.depth(&peer), Some(1));
    }

    #[test]
    fn test_watch_targets_cover_coordinator_and_successor() {
        let (c, a, b, d) = (member(6000), member(6001), member(6002), member(6003));
        let view = View::new(
            7,
            c.clone(),
            vec![c.clone(), a.clone(), b.clone(), d.clone()],
            vec![],
        );

        let targets: Vec<Member> = watch_targets(&view, &b, Some(&c), &[], 1)
            .into_iter()
            .map(|(m, _)| m)
            .collect();
        assert_eq!(targets, vec![c.clone(), d.clone()]);

        // the last member wraps around past the coordinator
        let targets: Vec<Member> = watch_targets(&view, &d, Some(&c), &[], 1)
            .into_iter()
            .map(|(m, _)| m)
            .collect();
        assert_eq!(targets, vec![c.clone(), a.clone()]);

        // the coordinator watches its successor only
        let targets: Vec<Member> = watch_targets(&view, &c, Some(&c), &[], 1)
            .into_iter()
            .map(|(m, _)| m)
            .collect();
        assert_eq!(targets, vec![a.clone()]);

        // crashed members are skipped
        let targets: Vec<Member> = watch_targets(&view, &a, Some(&c), &[b.clone()], 1)
            .into_iter()
            .map(|(m, _)| m)
            .collect();
        assert_eq!(targets, vec![c, d]);
    }
}
