//! Coordinator election.
//!
//! The rule is a pure function of member metadata every member already has,
//! so survivors of a coordinator failure converge on the same successor
//! without exchanging votes.

use datagrid_common::{Member, View};
use std::cmp::Ordering;

/// Order two candidates; `Ordering::Less` means `a` is the better coordinator.
///
/// Locators first (when preferred), then earliest join time, then the lowest
/// identifier.
pub fn compare_candidates(a: &Member, b: &Member, prefer_locators: bool) -> Ordering {
    let locator_rank = |m: &Member| if prefer_locators && m.is_locator() { 0u8 } else { 1u8 };

    locator_rank(a)
        .cmp(&locator_rank(b))
        .then_with(|| a.joined_at_ms.cmp(&b.joined_at_ms))
        .then_with(|| a.cmp(b))
}

/// Pick the coordinator among the given candidates
pub fn elect_coordinator<'a, I>(candidates: I, prefer_locators: bool) -> Option<&'a Member>
where
    I: IntoIterator<Item = &'a Member>,
{
    candidates
        .into_iter()
        .min_by(|a, b| compare_candidates(a, b, prefer_locators))
}

/// Coordinator of a view
pub fn view_coordinator(view: &View, prefer_locators: bool) -> Option<&Member> {
    elect_coordinator(view.members(), prefer_locators)
}

/// Coordinator of a view once `excluded` members are discounted
pub fn acting_coordinator<'a>(
    view: &'a View,
    excluded: &[Member],
    prefer_locators: bool,
) -> Option<&'a Member> {
    elect_coordinator(
        view.members().iter().filter(|m| !excluded.contains(m)),
        prefer_locators,
    )
}

/// Members of a view in succession order: the order in which they would
/// take over coordination
pub fn succession(view: &View, prefer_locators: bool) -> Vec<Member> {
    let mut members = view.members().to_vec();
    members.sort_by(|a, b| compare_candidates(a, b, prefer_locators));
    members
}

/// When two groups formed concurrently, decide which coordinator keeps its
/// group. Returns true when `ours` must yield to `theirs`.
pub fn should_yield(ours: &Member, theirs: &Member, prefer_locators: bool) -> bool {
    compare_candidates(theirs, ours, prefer_locators) == Ordering::Less
}

#[cfg(test)]
mod tests {
    use super::*;
    use datagrid_common::MemberKind;

    fn member(port: u16, kind: MemberKind, ts: u64) -> Member {
        Member::with_timestamp(format!("127.0.0.1:{}", port).parse().unwrap(), kind, ts)
    }

    #[test]
    fn test_locators_win_over_earlier_members() {
        let early_peer = member(2001, MemberKind::Normal, 10);
        let late_locator = member(2002, MemberKind::Locator, 50);

        let winner = elect_coordinator([&early_peer, &late_locator], true).unwrap();
        assert_eq!(winner, &late_locator);

        let winner = elect_coordinator([&early_peer, &late_locator], false).unwrap();
        assert_eq!(winner, &early_peer);
    }

    #[test]
    fn test_ties_break_on_join_time_then_identifier() {
        let a = member(2005, MemberKind::Normal, 10);
        let b = member(2003, MemberKind::Normal, 20);
        let c = member(2004, MemberKind::Normal, 10);

        assert_eq!(elect_coordinator([&a, &b, &c], true).unwrap(), &c);
    }

    #[test]
    fn test_election_is_order_independent() {
        let a = member(2001, MemberKind::Locator, 30);
        let b = member(2002, MemberKind::Normal, 10);
        let c = member(2003, MemberKind::Locator, 20);

        let first = elect_coordinator([&a, &b, &c], true).unwrap().clone();
        let second = elect_coordinator([&c, &a, &b], true).unwrap().clone();
        assert_eq!(first, second);
        assert_eq!(first, c);
    }

    #[test]
    fn test_acting_coordinator_skips_failed_members() {
        let loc = member(2001, MemberKind::Locator, 1);
        let p1 = member(2002, MemberKind::Normal, 2);
        let p2 = member(2003, MemberKind::Normal, 3);
        let view = View::new(4, loc.clone(), vec![loc.clone(), p1.clone(), p2.clone()], vec![]);

        assert_eq!(view_coordinator(&view, true), Some(&loc));
        assert_eq!(acting_coordinator(&view, &[loc.clone()], true), Some(&p1));
        assert_eq!(acting_coordinator(&view, &[loc, p1], true), Some(&p2));
        assert_eq!(succession(&view, true)[1], member(2002, MemberKind::Normal, 2));
    }

    #[test]
    fn test_yield_is_antisymmetric() {
        let l1 = member(3001, MemberKind::Locator, 100);
        let l2 = member(3002, MemberKind::Locator, 101);

        assert!(should_yield(&l2, &l1, true));
        assert!(!should_yield(&l1, &l2, true));
        assert!(!should_yield(&l1, &l1, true));
    }
}
