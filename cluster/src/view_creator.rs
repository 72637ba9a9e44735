//! View creation on the coordinator.
//!
//! Membership changes are queued to one task per member. The task only acts
//! while its member is the acting coordinator; it batches whatever is queued,
//! confirms crashes with a final probe, weighs the loss against the prior view
//! and then installs and broadcasts the next view.

use crate::health::NO_VIEW_ACK_REASON;
use crate::manager::Inner;
use crate::partition::QuorumCheck;
use crate::protocol::Message;
use datagrid_common::{Member, SuspectRecord, View};
use futures::future::join_all;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Pause after the first queued change so concurrent requests share a view
const BATCH_DELAY: Duration = Duration::from_millis(20);

/// A request for the coordinator to change the membership
#[derive(Debug)]
pub enum ViewChange {
    Join {
        member: Member,
        reply: oneshot::Sender<Message>,
    },
    Leave {
        member: Member,
        reason: String,
    },
    Remove {
        member: Member,
        reason: String,
        crashed: bool,
        reply: Option<oneshot::Sender<Message>>,
    },
}

/// The membership edits gathered into one view
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MembershipDelta {
    pub joins: Vec<Member>,
    pub leaves: Vec<Member>,
    pub removed: Vec<Member>,
    pub crashed: Vec<Member>,
}

impl MembershipDelta {
    pub fn is_empty(&self) -> bool {
        self.joins.is_empty()
            && self.leaves.is_empty()
            && self.removed.is_empty()
            && self.crashed.is_empty()
    }

    fn departing(&self, member: &Member) -> bool {
        self.leaves.contains(member)
            || self.removed.contains(member)
            || self.crashed.contains(member)
    }
}

fn push_unique(list: &mut Vec<Member>, member: Member) {
    if !list.contains(&member) {
        list.push(member);
    }
}

/// Compute the view that follows `prior` once `delta` is applied.
///
/// Departing members are dropped, an older incarnation at a joiner's address
/// is replaced, and joiners are appended in request order. Returns `None`
/// when the member list would not change.
pub fn next_view(prior: &View, creator: &Member, delta: &MembershipDelta) -> Option<View> {
    let replaced = |m: &Member| delta.joins.iter().any(|j| j.same_endpoint(m) && j != m);

    let mut members: Vec<Member> = prior
        .members()
        .iter()
        .filter(|m| !delta.departing(m) && !replaced(m))
        .cloned()
        .collect();

    for joiner in &delta.joins {
        if !members.contains(joiner) && !delta.departing(joiner) {
            members.push(joiner.clone());
        }
    }

    if members.as_slice() == prior.members() {
        return None;
    }

    let crashed: Vec<Member> = delta
        .crashed
        .iter()
        .filter(|m| prior.contains(m))
        .cloned()
        .collect();

    Some(View::new(prior.id() + 1, creator.clone(), members, crashed))
}

/// Queued changes along with the callers waiting on them
#[derive(Debug, Default)]
pub(crate) struct PendingChanges {
    delta: MembershipDelta,
    joiners: Vec<(Member, oneshot::Sender<Message>)>,
    reasons: Vec<(Member, String)>,
    replies: Vec<oneshot::Sender<Message>>,
}

impl PendingChanges {
    pub(crate) fn push(&mut self, change: ViewChange) {
        match change {
            ViewChange::Join { member, reply } => {
                push_unique(&mut self.delta.joins, member.clone());
                self.joiners.push((member, reply));
            }
            ViewChange::Leave { member, reason } => {
                debug!("Queued departure: member={}, reason={}", member, reason);
                push_unique(&mut self.delta.leaves, member);
            }
            ViewChange::Remove {
                member,
                reason,
                crashed,
                reply,
            } => {
                if crashed {
                    push_unique(&mut self.delta.crashed, member);
                } else {
                    push_unique(&mut self.delta.removed, member.clone());
                    self.reasons.push((member, reason));
                }
                if let Some(reply) = reply {
                    self.replies.push(reply);
                }
            }
        }
    }

    fn answer(self, join_reply: impl Fn(&Member) -> Message, reply: Message) {
        for (member, sender) in self.joiners {
            let _ = sender.send(join_reply(&member));
        }
        for sender in self.replies {
            let _ = sender.send(reply.clone());
        }
    }

    fn reject(self, reason: &str) {
        self.answer(
            |_| Message::JoinRejected {
                reason: reason.to_string(),
            },
            Message::error(reason),
        );
    }

    fn redirect(self, coordinator: Option<Member>) {
        let reply = Message::NotCoordinator { coordinator };
        self.answer(|_| reply.clone(), reply.clone());
    }

    /// Answer waiters once `view` is out. Removals only succeed when the
    /// view reached its acknowledgement quorum.
    fn complete(self, view: &View, committed: bool) {
        let reply = if committed {
            Message::Ok
        } else {
            Message::error(format!(
                "view {} was not acknowledged by a quorum of members",
                view.id()
            ))
        };

        self.answer(
            |member| {
                if view.contains(member) {
                    Message::JoinResponse { view: view.clone() }
                } else {
                    Message::JoinRejected {
                        reason: format!("{} was not admitted to view {}", member, view.id()),
                    }
                }
            },
            reply,
        );
    }
}

/// Acknowledgements, the coordinator's own included, needed to commit a
/// view of `members` members
pub fn required_acks(members: usize, fraction: f64) -> usize {
    ((members as f64) * fraction).ceil().max(1.0) as usize
}

/// Reason given to members leaving because quorum was lost
pub fn quorum_loss_reason(failed: &[Member]) -> String {
    let names: Vec<String> = failed.iter().map(|m| m.to_string()).collect();
    format!(
        "Possible loss of quorum due to the loss of {} members: [{}]",
        failed.len(),
        names.join(", ")
    )
}

impl Inner {
    /// Drain queued changes until the session ends
    pub(crate) async fn run_view_creator(
        self: Arc<Self>,
        mut changes: mpsc::UnboundedReceiver<ViewChange>,
        cancel: CancellationToken,
    ) {
        loop {
            let first = tokio::select! {
                _ = cancel.cancelled() => break,
                change = changes.recv() => match change {
                    Some(change) => change,
                    None => break,
                },
            };

            let mut pending = PendingChanges::default();
            pending.push(first);

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(BATCH_DELAY) => {}
            }
            while let Ok(change) = changes.try_recv() {
                pending.push(change);
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = self.process_changes(pending) => {}
            }
        }

        debug!("View creator stopped");
    }

    async fn process_changes(&self, pending: PendingChanges) {
        let _transition = self.view_lock.lock().await;

        let Some(prior) = self.current_view() else {
            pending.reject("no view installed yet");
            return;
        };
        let local = self.local_member();

        let acting = self.acting_coordinator();
        if acting.as_ref() != Some(&local) {
            debug!("Not the acting coordinator, redirecting changes to {:?}", acting);
            pending.redirect(acting);
            return;
        }

        let mut delta = pending.delta.clone();
        for member in self.failed_members() {
            push_unique(&mut delta.crashed, member);
        }
        for member in self.departing_members() {
            push_unique(&mut delta.leaves, member);
        }
        delta.crashed.retain(|m| prior.contains(m) && m != &local);
        delta.leaves.retain(|m| prior.contains(m) && m != &local);
        delta.removed.retain(|m| prior.contains(m));

        if !delta.crashed.is_empty() {
            self.final_check(&prior, &local, &mut delta).await;
        }

        if !delta.crashed.is_empty() {
            let check = self
                .partition
                .lock()
                .evaluate(&prior, &delta.crashed, Instant::now());

            match check {
                QuorumCheck::Healthy {
                    remaining_weight,
                    total_weight,
                } => {
                    info!(
                        "Quorum check passed: crashed={}, remaining_weight={}, total_weight={}",
                        delta.crashed.len(),
                        remaining_weight,
                        total_weight
                    );
                }
                QuorumCheck::Lost {
                    failed,
                    remaining,
                    remaining_weight,
                    total_weight,
                } => {
                    warn!(
                        "Quorum lost: remaining_weight={}, total_weight={}, threshold={}%",
                        remaining_weight, total_weight, self.config.loss_threshold_percent
                    );
                    self.declare_quorum_loss(&local, failed, remaining).await;

                    if self.config.enable_network_partition_detection {
                        pending.reject("quorum lost");
                        return;
                    }
                }
            }
        }

        let Some(view) = next_view(&prior, &local, &delta) else {
            pending.complete(&prior, true);
            return;
        };

        info!(
            "Creating view: view_id={}, joins={}, leaves={}, removed={}, crashed={}",
            view.id(),
            delta.joins.len(),
            delta.leaves.len(),
            delta.removed.len(),
            delta.crashed.len()
        );

        for (member, reason) in &pending.reasons {
            if prior.contains(member) && !view.contains(member) {
                self.notify_removed(member, reason).await;
            }
        }

        self.install_locked(view.clone());

        let unacked = self.broadcast_view(&view, &delta.leaves).await;
        let acked = view.len() - unacked.len();
        let required = required_acks(view.len(), self.config.ack_quorum_fraction);
        let committed = acked >= required;
        if committed {
            debug!(
                "View committed: view_id={}, acked={}/{}",
                view.id(),
                acked,
                view.len()
            );
        } else {
            warn!(
                "View acknowledged by too few members: view_id={}, acked={}/{}, required={}",
                view.id(),
                acked,
                view.len(),
                required
            );
        }

        self.announce(&view);

        // silent members are checked again and dropped by the next view
        for member in unacked {
            self.record_unacked(&member, &local);
            self.enqueue(ViewChange::Remove {
                member,
                reason: NO_VIEW_ACK_REASON.to_string(),
                crashed: true,
                reply: None,
            });
        }

        pending.complete(&view, committed);
    }

    /// Probe every member of the prior view. Crashed members that answer are
    /// kept; silent ones join the crashed set.
    async fn final_check(&self, prior: &View, local: &Member, delta: &mut MembershipDelta) {
        let probes = prior
            .members()
            .iter()
            .filter(|m| *m != local && !delta.leaves.contains(m) && !delta.removed.contains(m))
            .map(|member| async move { (member.clone(), self.probe(member, prior.id()).await) });

        for (member, alive) in join_all(probes).await {
            let suspected = delta.crashed.contains(&member);

            if alive && suspected {
                info!("Member answered the final check, keeping it: member={}", member);
                delta.crashed.retain(|m| m != &member);
                self.mark_alive(&member);
            } else if !alive && !suspected {
                warn!("Member silent during final check: member={}", member);
                delta.crashed.push(member.clone());
                self.mark_failed(&member);
            }
        }
    }

    /// True when `member` answers a heartbeat as the same incarnation
    pub(crate) async fn probe(&self, member: &Member, view_id: u64) -> bool {
        let heartbeat = Message::Heartbeat {
            member: self.local_member(),
            view_id,
        };

        match self.transport.request(member.addr, &heartbeat).await {
            Ok(Message::HeartbeatAck { member: answered, .. }) => &answered == member,
            _ => false,
        }
    }

    async fn declare_quorum_loss(
        &self,
        local: &Member,
        failed: Vec<Member>,
        remaining: Vec<Member>,
    ) {
        metrics::counter!("membership_quorum_lost_total").increment(1);
        self.listeners.quorum_lost(&failed, &remaining);

        let notice = Message::QuorumLostNotice {
            failed: failed.clone(),
            remaining: remaining.clone(),
        };
        let sends = remaining
            .iter()
            .filter(|m| *m != local)
            .map(|m| self.transport.request(m.addr, &notice));
        join_all(sends).await;

        if self.config.enable_network_partition_detection {
            self.begin_forced_disconnect(quorum_loss_reason(&failed));
        } else {
            warn!("Network partition detection is disabled, continuing without quorum");
        }
    }

    async fn notify_removed(&self, member: &Member, reason: &str) {
        let notice = Message::Removed {
            member: member.clone(),
            reason: reason.to_string(),
        };
        if let Err(e) = self.transport.request(member.addr, &notice).await {
            debug!("Removed member unreachable: member={}, error={}", member, e);
        }
    }

    /// Send the view to its members and to voluntarily departing members.
    /// Members that did not acknowledge get it once more when the quorum is
    /// short. Returns the members that never acknowledged.
    async fn broadcast_view(&self, view: &View, departed: &[Member]) -> Vec<Member> {
        let local = self.local_member();
        let targets: Vec<Member> = view
            .members()
            .iter()
            .chain(departed.iter())
            .filter(|m| **m != local)
            .cloned()
            .collect();

        let mut unacked = self.send_view(view, &targets).await;

        let required = required_acks(view.len(), self.config.ack_quorum_fraction);
        if !unacked.is_empty() && view.len() - unacked.len() < required {
            debug!(
                "Resending view: view_id={}, unacknowledged={}",
                view.id(),
                unacked.len()
            );
            unacked = self.send_view(view, &unacked).await;
        }

        unacked
    }

    /// Send `view` to `targets` concurrently; returns the view members
    /// among them that did not acknowledge it
    async fn send_view(&self, view: &View, targets: &[Member]) -> Vec<Member> {
        let timeout = self.config.view_ack_timeout();
        let message = Message::ViewMessage { view: view.clone() };

        let sends = targets.iter().map(|member| {
            let message = &message;
            async move {
                let reply = self
                    .transport
                    .request_with_timeout(member.addr, message, timeout)
                    .await;
                (member, reply)
            }
        });

        let mut unacked = Vec::new();
        for (member, reply) in join_all(sends).await {
            if !view.contains(member) {
                continue;
            }

            match reply {
                Ok(Message::Ack {
                    member: from,
                    view_id,
                }) if &from == member && view_id >= view.id() => {}
                Ok(other) => {
                    debug!("Unexpected view reply: member={}, reply={}", member, other.kind());
                    unacked.push(member.clone());
                }
                Err(e) => {
                    debug!("View not acknowledged: member={}, error={}", member, e);
                    unacked.push(member.clone());
                }
            }
        }
        unacked
    }

    fn record_unacked(&self, member: &Member, local: &Member) {
        metrics::counter!("membership_suspects_total").increment(1);
        self.partition.lock().record_suspect(
            SuspectRecord::new(member.clone(), local.clone(), NO_VIEW_ACK_REASON),
            Instant::now(),
        );
        self.listeners.suspect(member, local, NO_VIEW_ACK_REASON);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use datagrid_common::MemberKind;

    fn member(port: u16, ts: u64) -> Member {
        Member::with_timestamp(
            format!("127.0.0.1:{}", port).parse().unwrap(),
            MemberKind::Normal,
            ts,
        )
    }

    #[test]
    fn test_joins_append_and_bump_id() {
        let a = member(8001, 1);
        let b = member(8002, 2);
        let prior = View::initial(a.clone());

        let delta = MembershipDelta {
            joins: vec![b.clone()],
            ..Default::default()
        };
        let view = next_view(&prior, &a, &delta).unwrap();

        assert_eq!(view.id(), 2);
        assert_eq!(view.members(), &[a.clone(), b]);
        assert_eq!(view.creator(), &a);
    }

    #[test]
    fn test_crashes_are_recorded_in_the_view() {
        let (a, b, c) = (member(8001, 1), member(8002, 2), member(8003, 3));
        let prior = View::new(5, a.clone(), vec![a.clone(), b.clone(), c.clone()], vec![]);

        let delta = MembershipDelta {
            crashed: vec![b.clone()],
            leaves: vec![c.clone()],
            ..Default::default()
        };
        let view = next_view(&prior, &a, &delta).unwrap();

        assert_eq!(view.id(), 6);
        assert_eq!(view.members(), &[a]);
        assert_eq!(view.crashed(), &[b]);
    }

    #[test]
    fn test_rejoin_replaces_the_old_incarnation() {
        let a = member(8001, 1);
        let old = member(8002, 2);
        let new = member(8002, 9);
        let prior = View::new(3, a.clone(), vec![a.clone(), old.clone()], vec![]);

        let delta = MembershipDelta {
            joins: vec![new.clone()],
            ..Default::default()
        };
        let view = next_view(&prior, &a, &delta).unwrap();

        assert_eq!(view.members(), &[a, new]);
        assert!(view.crashed().is_empty());
    }

    #[test]
    fn test_no_change_yields_no_view() {
        let (a, b) = (member(8001, 1), member(8002, 2));
        let prior = View::new(3, a.clone(), vec![a.clone(), b.clone()], vec![]);

        let delta = MembershipDelta {
            joins: vec![b],
            crashed: vec![member(8009, 9)],
            ..Default::default()
        };
        assert!(next_view(&prior, &a, &delta).is_none());
    }

    #[test]
    fn test_pending_changes_answer_waiters() {
        let (a, b) = (member(8001, 1), member(8002, 2));
        let (join_tx, mut join_rx) = oneshot::channel();
        let (remove_tx, mut remove_rx) = oneshot::channel();

        let mut pending = PendingChanges::default();
        pending.push(ViewChange::Join {
            member: b.clone(),
            reply: join_tx,
        });
        pending.push(ViewChange::Remove {
            member: member(8003, 3),
            reason: "test".into(),
            crashed: false,
            reply: Some(remove_tx),
        });
        assert_eq!(pending.delta.joins, vec![b.clone()]);

        let view = View::new(2, a.clone(), vec![a, b], vec![]);
        pending.complete(&view, true);

        assert!(matches!(join_rx.try_recv(), Ok(Message::JoinResponse { .. })));
        assert!(matches!(remove_rx.try_recv(), Ok(Message::Ok)));
    }

    #[test]
    fn test_uncommitted_view_fails_removals() {
        let (a, b, c) = (member(8001, 1), member(8002, 2), member(8003, 3));
        let (join_tx, mut join_rx) = oneshot::channel();
        let (remove_tx, mut remove_rx) = oneshot::channel();

        let mut pending = PendingChanges::default();
        pending.push(ViewChange::Join {
            member: b.clone(),
            reply: join_tx,
        });
        pending.push(ViewChange::Remove {
            member: c,
            reason: "test".into(),
            crashed: false,
            reply: Some(remove_tx),
        });

        let view = View::new(4, a.clone(), vec![a, b], vec![]);
        pending.complete(&view, false);

        // the joiner is in the installed view either way
        assert!(matches!(join_rx.try_recv(), Ok(Message::JoinResponse { .. })));
        match remove_rx.try_recv() {
            Ok(Message::Error { reason }) => assert!(reason.contains("view 4")),
            other => panic!("expected an error reply, got {:?}", other),
        }
    }

    #[test]
    fn test_required_acks() {
        assert_eq!(required_acks(1, 0.51), 1);
        assert_eq!(required_acks(2, 0.51), 2);
        assert_eq!(required_acks(3, 0.51), 2);
        assert_eq!(required_acks(10, 0.51), 6);
        assert_eq!(required_acks(4, 1.0), 4);
    }

    #[test]
    fn test_quorum_loss_reason_names_members() {
        let reason = quorum_loss_reason(&[member(8001, 1), member(8002, 2)]);
        assert!(reason.starts_with("Possible loss of quorum"));
        assert!(reason.contains("127.0.0.1:8002"));
    }
}
