use async_trait::async_trait;
use datagrid_common::{Member, View};
use parking_lot::RwLock;
use std::sync::Arc;

/// Callbacks for components that follow membership changes.
///
/// Every method has an empty default so implementors only pick what they
/// need. Callbacks run inline on the membership tasks and must not block.
pub trait MembershipListener: Send + Sync {
    /// A new view was installed
    fn on_view_change(&self, _view: &View) {}

    fn on_member_joined(&self, _member: &Member) {}

    /// A member left the view, either crashed or by leaving/removal
    fn on_member_departed(&self, _member: &Member, _crashed: bool) {}

    fn on_suspect(&self, _suspect: &Member, _reporter: &Member, _reason: &str) {}

    /// Quorum was lost; `failed` are the members lost in the partition event
    fn on_quorum_lost(&self, _failed: &[Member], _remaining: &[Member]) {}

    /// The local member was forced out of the cluster
    fn on_forced_disconnect(&self, _reason: &str) {}
}

/// Hooks around a membership failure.
///
/// `before_membership_failure` runs after the failure cause is recorded but
/// before the member stops, so requests issued while it runs already fail.
#[async_trait]
pub trait MembershipObserver: Send + Sync {
    async fn before_membership_failure(&self, _reason: &str) {}

    async fn after_membership_failure(&self, _reason: &str) {}
}

/// Registered listeners, shared by every incarnation of a member
#[derive(Clone, Default)]
pub struct ListenerSet {
    listeners: Arc<RwLock<Vec<Arc<dyn MembershipListener>>>>,
}

impl ListenerSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, listener: Arc<dyn MembershipListener>) {
        self.listeners.write().push(listener);
    }

    pub fn len(&self) -> usize {
        self.listeners.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.read().is_empty()
    }

    /// Copy the list so callbacks run without the lock held
    fn snapshot(&self) -> Vec<Arc<dyn MembershipListener>> {
        self.listeners.read().clone()
    }

    /// Announce a view along with the joins and departures it implies
    pub fn view_installed(&self, prior: Option<&View>, view: &View) {
        let listeners = self.snapshot();

        let joined = match prior {
            Some(prior) => view.joined_since(prior),
            None => view.members().to_vec(),
        };
        let departed = prior.map(|prior| view.departed_since(prior)).unwrap_or_default();

        for listener in &listeners {
            for member in &departed {
                listener.on_member_departed(member, view.crashed().contains(member));
            }
            for member in &joined {
                listener.on_member_joined(member);
            }
            listener.on_view_change(view);
        }
    }

    pub fn suspect(&self, suspect: &Member, reporter: &Member, reason: &str) {
        for listener in self.snapshot() {
            listener.on_suspect(suspect, reporter, reason);
        }
    }

    pub fn quorum_lost(&self, failed: &[Member], remaining: &[Member]) {
        for listener in self.snapshot() {
            listener.on_quorum_lost(failed, remaining);
        }
    }

    pub fn forced_disconnect(&self, reason: &str) {
        for listener in self.snapshot() {
            listener.on_forced_disconnect(reason);
        }
    }
}
