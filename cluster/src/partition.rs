//! Network partition detection.
//!
//! When members crash, the coordinator weighs what is left of the prior view
//! against the whole of it. Crashes that happen close together are counted as
//! one event, so a partition that is noticed in several steps is still judged
//! against the membership from before it started.

use datagrid_common::{Member, MemberKind, SuspectRecord, View};
use serde::Serialize;
use std::collections::HashMap;
use std::time::{Duration, Instant};

pub const ADMIN_WEIGHT: u32 = 0;
pub const NORMAL_WEIGHT: u32 = 10;
pub const LOCATOR_WEIGHT: u32 = 15;
pub const LEAD_MEMBER_BONUS: u32 = 5;

/// Where the detector stands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PartitionState {
    Healthy,

    /// Suspicions are outstanding and crashes are being correlated
    SuspectWindow,

    /// Crashes happened but quorum held
    Recovered,

    /// Quorum was lost; only a fresh join leaves this state
    Partitioned,
}

impl std::fmt::Display for PartitionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PartitionState::Healthy => write!(f, "healthy"),
            PartitionState::SuspectWindow => write!(f, "suspect-window"),
            PartitionState::Recovered => write!(f, "recovered"),
            PartitionState::Partitioned => write!(f, "partitioned"),
        }
    }
}

/// Outcome of weighing a set of crashes against the prior view
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QuorumCheck {
    Healthy {
        remaining_weight: u32,
        total_weight: u32,
    },
    Lost {
        failed: Vec<Member>,
        remaining: Vec<Member>,
        remaining_weight: u32,
        total_weight: u32,
    },
}

impl QuorumCheck {
    pub fn is_lost(&self) -> bool {
        matches!(self, QuorumCheck::Lost { .. })
    }
}

/// Quorum weight of one member of `view`
pub fn member_weight(member: &Member, view: &View) -> u32 {
    let base = match member.kind {
        MemberKind::Admin => ADMIN_WEIGHT,
        MemberKind::Normal => NORMAL_WEIGHT,
        MemberKind::Locator => LOCATOR_WEIGHT,
    };

    if view.lead_member() == Some(member) {
        base + LEAD_MEMBER_BONUS
    } else {
        base
    }
}

/// Total quorum weight of a view
pub fn view_weight(view: &View) -> u32 {
    view.members().iter().map(|m| member_weight(m, view)).sum()
}

/// Per-member partition bookkeeping: open suspicions and the crashes of the
/// current loss-correlation window
pub struct PartitionDetector {
    threshold_percent: u8,
    window: Duration,
    state: PartitionState,
    suspects: HashMap<Member, SuspectRecord>,
    window_started: Option<Instant>,
    /// Members lost earlier in this window, with the weight they carried
    lost_in_window: Vec<(Member, u32)>,
}

impl PartitionDetector {
    pub fn new(threshold_percent: u8, window: Duration) -> Self {
        Self {
            threshold_percent: threshold_percent.min(100),
            window,
            state: PartitionState::Healthy,
            suspects: HashMap::new(),
            window_started: None,
            lost_in_window: Vec::new(),
        }
    }

    pub fn state(&self) -> PartitionState {
        self.state
    }

    pub fn suspects(&self) -> Vec<SuspectRecord> {
        self.suspects.values().cloned().collect()
    }

    pub fn is_suspect(&self, member: &Member) -> bool {
        self.suspects.contains_key(member)
    }

    /// Register a suspicion, opening the correlation window if needed
    pub fn record_suspect(&mut self, record: SuspectRecord, now: Instant) {
        if self.state == PartitionState::Partitioned {
            return;
        }

        self.open_window(now);
        self.state = PartitionState::SuspectWindow;
        self.suspects.insert(record.suspect.clone(), record);
    }

    /// Drop a suspicion because the member answered or was removed
    pub fn resolve_suspect(&mut self, member: &Member) -> Option<SuspectRecord> {
        let resolved = self.suspects.remove(member);

        if resolved.is_some()
            && self.suspects.is_empty()
            && self.state == PartitionState::SuspectWindow
        {
            self.state = if self.lost_in_window.is_empty() {
                PartitionState::Healthy
            } else {
                PartitionState::Recovered
            };
        }

        resolved
    }

    /// Weigh the members of `prior` that survive once `crashed` is removed.
    ///
    /// Members lost earlier in the same window still count towards the total,
    /// so a split noticed piecemeal is judged as a whole.
    pub fn evaluate(&mut self, prior: &View, crashed: &[Member], now: Instant) -> QuorumCheck {
        self.expire_window(now);

        let newly_lost: Vec<Member> = crashed
            .iter()
            .filter(|m| prior.contains(m))
            .cloned()
            .collect();

        let earlier_weight: u32 = self
            .lost_in_window
            .iter()
            .filter(|(m, _)| !prior.contains(m))
            .map(|(_, weight)| *weight)
            .sum();

        let total_weight = view_weight(prior) + earlier_weight;
        let remaining: Vec<Member> = prior
            .members()
            .iter()
            .filter(|m| !newly_lost.contains(m))
            .cloned()
            .collect();
        let remaining_weight: u32 = remaining.iter().map(|m| member_weight(m, prior)).sum();

        if newly_lost.is_empty() {
            return QuorumCheck::Healthy {
                remaining_weight,
                total_weight,
            };
        }

        self.open_window(now);
        for member in &newly_lost {
            self.suspects.remove(member);
            self.lost_in_window
                .push((member.clone(), member_weight(member, prior)));
        }

        let lost = (remaining_weight as u64) * 100
            < (self.threshold_percent as u64) * (total_weight as u64);

        if lost {
            self.state = PartitionState::Partitioned;

            let mut failed: Vec<Member> =
                self.lost_in_window.iter().map(|(m, _)| m.clone()).collect();
            failed.sort();
            failed.dedup();

            QuorumCheck::Lost {
                failed,
                remaining,
                remaining_weight,
                total_weight,
            }
        } else {
            self.state = if self.suspects.is_empty() {
                PartitionState::Recovered
            } else {
                PartitionState::SuspectWindow
            };

            QuorumCheck::Healthy {
                remaining_weight,
                total_weight,
            }
        }
    }

    /// Mark quorum as lost on behalf of another member's evaluation
    pub fn mark_partitioned(&mut self) {
        self.state = PartitionState::Partitioned;
    }

    /// Close an expired window. Returns true when the state changed.
    pub fn tick(&mut self, now: Instant) -> bool {
        let before = self.state;
        self.expire_window(now);
        before != self.state
    }

    /// Forget everything; used when the member joins again
    pub fn reset(&mut self) {
        self.state = PartitionState::Healthy;
        self.suspects.clear();
        self.window_started = None;
        self.lost_in_window.clear();
    }

    fn open_window(&mut self, now: Instant) {
        if self.window_started.is_none() {
            self.window_started = Some(now);
        }
    }

    fn expire_window(&mut self, now: Instant) {
        let Some(started) = self.window_started else {
            return;
        };
        if now.saturating_duration_since(started) < self.window {
            return;
        }

        self.lost_in_window.clear();
        self.suspects.clear();
        self.window_started = None;

        if self.state != PartitionState::Partitioned {
            self.state = PartitionState::Healthy;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn member(port: u16, kind: MemberKind) -> Member {
        Member::with_timestamp(
            format!("127.0.0.1:{}", port).parse().unwrap(),
            kind,
            port as u64,
        )
    }

    struct Group {
        l1: Member,
        l2: Member,
        m1: Member,
        m2: Member,
    }

    fn group() -> Group {
        Group {
            l1: member(7001, MemberKind::Locator),
            l2: member(7002, MemberKind::Locator),
            m1: member(7003, MemberKind::Normal),
            m2: member(7004, MemberKind::Normal),
        }
    }

    fn view(id: u64, members: &[&Member]) -> View {
        let members: Vec<Member> = members.iter().map(|m| (*m).clone()).collect();
        View::new(id, members[0].clone(), members, vec![])
    }

    #[test]
    fn test_weights_favor_locators_and_lead_member() {
        let g = group();
        let admin = member(7005, MemberKind::Admin);
        let v = view(1, &[&g.l1, &g.l2, &g.m1, &g.m2, &admin]);

        assert_eq!(member_weight(&g.l1, &v), 15);
        assert_eq!(member_weight(&g.m1, &v), 15);
        assert_eq!(member_weight(&g.m2, &v), 10);
        assert_eq!(member_weight(&admin, &v), 0);
        assert_eq!(view_weight(&v), 55);
    }

    #[test]
    fn test_losing_a_locator_and_a_member_keeps_quorum() {
        let g = group();
        let mut detector = PartitionDetector::new(51, Duration::from_secs(10));
        let prior = view(4, &[&g.l1, &g.l2, &g.m1, &g.m2]);

        let check = detector.evaluate(&prior, &[g.l2.clone(), g.m2.clone()], Instant::now());
        assert_eq!(
            check,
            QuorumCheck::Healthy {
                remaining_weight: 30,
                total_weight: 55
            }
        );
        assert_eq!(detector.state(), PartitionState::Recovered);
    }

    #[test]
    fn test_correlated_losses_declare_partition() {
        let g = group();
        let mut detector = PartitionDetector::new(51, Duration::from_secs(10));
        let start = Instant::now();

        let first = view(4, &[&g.l1, &g.l2, &g.m1, &g.m2]);
        assert!(!detector
            .evaluate(&first, &[g.l2.clone(), g.m2.clone()], start)
            .is_lost());

        let second = view(5, &[&g.l1, &g.m1]);
        match detector.evaluate(&second, &[g.m1.clone()], start + Duration::from_secs(1)) {
            QuorumCheck::Lost {
                failed,
                remaining,
                remaining_weight,
                total_weight,
            } => {
                assert_eq!(remaining, vec![g.l1.clone()]);
                assert_eq!(failed.len(), 3);
                assert!(failed.contains(&g.m1));
                assert_eq!(remaining_weight, 15);
                assert_eq!(total_weight, 55);
            }
            other => panic!("expected quorum loss, got {:?}", other),
        }
        assert_eq!(detector.state(), PartitionState::Partitioned);
    }

    #[test]
    fn test_window_expiry_forgets_earlier_losses() {
        let g = group();
        let mut detector = PartitionDetector::new(40, Duration::from_millis(100));
        let start = Instant::now();

        let first = view(4, &[&g.l1, &g.l2, &g.m1, &g.m2]);
        detector.evaluate(&first, &[g.l2.clone()], start);

        // judged against {l1, m1, m2} alone: 25 of 40 survive
        let second = view(5, &[&g.l1, &g.m1, &g.m2]);
        let check = detector.evaluate(&second, &[g.m1.clone()], start + Duration::from_secs(1));
        assert_eq!(
            check,
            QuorumCheck::Healthy {
                remaining_weight: 25,
                total_weight: 40
            }
        );
    }

    #[test]
    fn test_suspect_window_transitions() {
        let g = group();
        let mut detector = PartitionDetector::new(51, Duration::from_millis(100));
        let start = Instant::now();

        detector.record_suspect(
            SuspectRecord::new(g.m2.clone(), g.l1.clone(), "no heartbeat"),
            start,
        );
        assert_eq!(detector.state(), PartitionState::SuspectWindow);
        assert!(detector.is_suspect(&g.m2));

        detector.resolve_suspect(&g.m2);
        assert_eq!(detector.state(), PartitionState::Healthy);

        detector.record_suspect(
            SuspectRecord::new(g.m2.clone(), g.l1.clone(), "no heartbeat"),
            start,
        );
        assert!(detector.tick(start + Duration::from_millis(150)));
        assert_eq!(detector.state(), PartitionState::Healthy);
        assert!(detector.suspects().is_empty());
    }

    #[test]
    fn test_partitioned_is_terminal_until_reset() {
        let g = group();
        let mut detector = PartitionDetector::new(51, Duration::from_millis(100));
        let start = Instant::now();

        let prior = view(2, &[&g.l1, &g.m1]);
        assert!(detector.evaluate(&prior, &[g.m1.clone()], start).is_lost());

        detector.record_suspect(SuspectRecord::new(g.l2.clone(), g.l1.clone(), "late"), start);
        detector.tick(start + Duration::from_secs(1));
        assert_eq!(detector.state(), PartitionState::Partitioned);

        detector.reset();
        assert_eq!(detector.state(), PartitionState::Healthy);
    }
}
