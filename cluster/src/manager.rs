use crate::election::{acting_coordinator, succession};
use crate::health::{
    ring_after, watch_targets, FailureDetector, PeerStatus, Transition, NO_HEARTBEAT_REASON,
};
use crate::listener::{ListenerSet, MembershipListener, MembershipObserver};
use crate::partition::{PartitionDetector, PartitionState};
use crate::protocol::Message;
use crate::transport::{self, MessageHandler, Transport};
use crate::view_creator::{quorum_loss_reason, ViewChange};
use async_trait::async_trait;
use dashmap::DashMap;
use datagrid_common::{
    parse_locators, GridError, Member, MemberKind, MembershipConfig, Result, SuspectRecord, View,
    ViewId,
};
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

/// Pause between rounds of locator discovery while joining
const JOIN_RETRY_INTERVAL: Duration = Duration::from_millis(250);

/// Coordinator redirects followed before a request gives up
const MAX_REDIRECTS: usize = 4;

/// Lifecycle of the local member
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MemberState {
    Joining,
    Member,
    Coordinator,
    Left,
}

impl std::fmt::Display for MemberState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MemberState::Joining => write!(f, "joining"),
            MemberState::Member => write!(f, "member"),
            MemberState::Coordinator => write!(f, "coordinator"),
            MemberState::Left => write!(f, "left"),
        }
    }
}

/// Builder for a membership handle
pub struct MembershipBuilder {
    config: MembershipConfig,
    kind: MemberKind,
    listeners: Vec<Arc<dyn MembershipListener>>,
    observer: Option<Arc<dyn MembershipObserver>>,
    extra_locators: Vec<SocketAddr>,
    recovered: Vec<Member>,
}

impl MembershipBuilder {
    pub fn new(config: MembershipConfig) -> Self {
        Self {
            config,
            kind: MemberKind::Normal,
            listeners: Vec::new(),
            observer: None,
            extra_locators: Vec::new(),
            recovered: Vec::new(),
        }
    }

    /// Kind of member to join as (normal by default)
    pub fn kind(mut self, kind: MemberKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn listener(mut self, listener: Arc<dyn MembershipListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    /// Hooks run around a forced disconnect
    pub fn observer(mut self, observer: Arc<dyn MembershipObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Add a locator endpoint on top of the configured list
    pub fn locator(mut self, endpoint: SocketAddr) -> Self {
        self.extra_locators.push(endpoint);
        self
    }

    /// Members to try as coordinators before asking locators
    pub fn recovered_members(mut self, members: Vec<Member>) -> Self {
        self.recovered = members;
        self
    }

    /// Join the cluster. Blocks until a view containing this member is
    /// installed or the join timeout elapses.
    pub async fn connect(self) -> Result<MembershipHandle> {
        self.config.validate_settings()?;

        let mut locators = parse_locators(&self.config.locators)?;
        for endpoint in self.extra_locators {
            if !locators.contains(&endpoint) {
                locators.push(endpoint);
            }
        }
        if locators.is_empty() {
            return Err(GridError::Config(
                "no locators configured; set `locators` to host[port],...".to_string(),
            ));
        }

        let listener = bind_member_socket(&self.config).await?;
        let member = Member::new(listener.local_addr()?, self.kind);

        let listeners = ListenerSet::new();
        for listener in self.listeners {
            listeners.add(listener);
        }

        let config = self.config;
        let kind = self.kind;
        let recovered = self.recovered;
        let observer = self.observer;
        let local = member.clone();

        let inner = Arc::new_cyclic(|this| Inner {
            this: this.clone(),
            transport: Transport::new(config.member_timeout()),
            detector: FailureDetector::new(config.member_timeout(), config.crash_multiplier),
            partition: Mutex::new(PartitionDetector::new(
                config.loss_threshold_percent,
                config.loss_correlation_window(),
            )),
            config,
            kind,
            locators,
            recovered,
            local: RwLock::new(local),
            view_tx: watch::channel(None).0,
            state_tx: watch::channel(MemberState::Joining).0,
            listeners,
            observer,
            failed: Mutex::new(HashSet::new()),
            departing: Mutex::new(HashSet::new()),
            leaving: AtomicBool::new(false),
            unclean: AtomicBool::new(false),
            closed: CancellationToken::new(),
            forced: RwLock::new(None),
            session: Mutex::new(None),
            view_lock: tokio::sync::Mutex::new(()),
            in_flight: DashMap::new(),
        });

        info!(
            "Connecting to cluster: member={}, locators={:?}",
            member, inner.locators
        );
        inner.establish(listener, member, None).await?;

        Ok(MembershipHandle { inner })
    }
}

async fn bind_member_socket(config: &MembershipConfig) -> Result<TcpListener> {
    transport::bind(SocketAddr::new(config.bind_address, config.member_port)).await
}

/// Per-incarnation tasks and the queue feeding the view creator
struct Session {
    cancel: CancellationToken,
    changes: mpsc::UnboundedSender<ViewChange>,
}

/// Shared state of one member, across reconnects
pub(crate) struct Inner {
    this: Weak<Inner>,
    pub(crate) config: MembershipConfig,
    kind: MemberKind,
    locators: Vec<SocketAddr>,
    recovered: Vec<Member>,
    pub(crate) transport: Transport,
    local: RwLock<Member>,
    view_tx: watch::Sender<Option<Arc<View>>>,
    state_tx: watch::Sender<MemberState>,
    detector: FailureDetector,
    pub(crate) partition: Mutex<PartitionDetector>,
    pub(crate) listeners: ListenerSet,
    observer: Option<Arc<dyn MembershipObserver>>,
    /// Members locally known to have crashed
    failed: Mutex<HashSet<Member>>,
    /// Members that asked to leave
    departing: Mutex<HashSet<Member>>,
    leaving: AtomicBool,
    unclean: AtomicBool,
    /// Set once the handle is shut down for good; stops reconnects
    closed: CancellationToken,
    /// Cause of the most recent forced disconnect
    forced: RwLock<Option<String>>,
    session: Mutex<Option<Session>>,
    /// Serializes view transitions
    pub(crate) view_lock: tokio::sync::Mutex<()>,
    in_flight: DashMap<Member, ()>,
}

impl Inner {
    pub(crate) fn local_member(&self) -> Member {
        self.local.read().clone()
    }

    pub(crate) fn current_view(&self) -> Option<Arc<View>> {
        self.view_tx.borrow().clone()
    }

    pub(crate) fn state(&self) -> MemberState {
        *self.state_tx.borrow()
    }

    pub(crate) fn is_connected(&self) -> bool {
        matches!(self.state(), MemberState::Member | MemberState::Coordinator)
    }

    pub(crate) fn failed_members(&self) -> Vec<Member> {
        self.failed.lock().iter().cloned().collect()
    }

    pub(crate) fn departing_members(&self) -> Vec<Member> {
        self.departing.lock().iter().cloned().collect()
    }

    fn excluded(&self) -> Vec<Member> {
        let mut excluded = self.failed_members();
        excluded.extend(self.departing_members());
        excluded
    }

    /// Coordinator of the installed view once known failures are discounted
    pub(crate) fn acting_coordinator(&self) -> Option<Member> {
        let view = self.current_view()?;
        acting_coordinator(
            &view,
            &self.excluded(),
            self.config.locators_preferred_as_coordinators,
        )
        .cloned()
    }

    fn is_acting_coordinator(&self) -> bool {
        self.acting_coordinator().as_ref() == Some(&self.local_member())
    }

    pub(crate) fn mark_failed(&self, member: &Member) {
        self.failed.lock().insert(member.clone());
    }

    pub(crate) fn mark_alive(&self, member: &Member) {
        self.failed.lock().remove(member);
        self.partition.lock().resolve_suspect(member);
        self.refresh_role();
        self.refresh_watch();
    }

    pub(crate) fn enqueue(&self, change: ViewChange) -> bool {
        match self.session.lock().as_ref() {
            Some(session) => session.changes.send(change).is_ok(),
            None => false,
        }
    }

    fn end_session(&self) {
        if let Some(session) = self.session.lock().take() {
            session.cancel.cancel();
        }
    }

    fn refresh_role(&self) {
        let next = if self.is_acting_coordinator() {
            MemberState::Coordinator
        } else {
            MemberState::Member
        };

        let changed = self.state_tx.send_if_modified(|state| {
            if matches!(state, MemberState::Member | MemberState::Coordinator) && *state != next {
                *state = next;
                true
            } else {
                false
            }
        });

        if changed && next == MemberState::Coordinator {
            info!("Became acting coordinator: member={}", self.local_member());
        }
    }

    fn refresh_watch(&self) {
        let Some(view) = self.current_view() else {
            return;
        };
        let local = self.local_member();
        let excluded = self.excluded();
        let coordinator = acting_coordinator(
            &view,
            &excluded,
            self.config.locators_preferred_as_coordinators,
        );

        let mut targets = watch_targets(
            &view,
            &local,
            coordinator,
            &excluded,
            self.config.monitor_neighbors,
        );

        // crashed members stay watched until a view drops them, so an answer
        // from one that is still alive clears the report
        for member in self.failed_members() {
            if view.contains(&member) && !targets.iter().any(|(target, _)| target == &member) {
                let depth = self.detector.depth(&member).unwrap_or(1);
                targets.push((member, depth));
            }
        }
        self.detector.watch(&targets, Instant::now());
    }

    /// Start a new incarnation: serve on `listener` as `member` and join
    async fn establish(
        self: &Arc<Self>,
        listener: TcpListener,
        member: Member,
        hint: Option<Member>,
    ) -> Result<()> {
        if self.closed.is_cancelled() {
            return Err(GridError::State("membership handle is shut down".to_string()));
        }

        let cancel = CancellationToken::new();
        let (changes_tx, changes_rx) = mpsc::unbounded_channel();

        *self.local.write() = member.clone();
        self.failed.lock().clear();
        self.departing.lock().clear();
        self.detector.clear();
        self.in_flight.clear();
        self.partition.lock().reset();
        self.leaving.store(false, Ordering::SeqCst);
        self.view_tx.send_replace(None);
        self.state_tx.send_replace(MemberState::Joining);
        *self.session.lock() = Some(Session {
            cancel: cancel.clone(),
            changes: changes_tx,
        });

        let handler: Arc<dyn MessageHandler> = self.clone();
        tokio::spawn(transport::serve(listener, handler, cancel.clone()));
        tokio::spawn(self.clone().run_view_creator(changes_rx, cancel.clone()));
        tokio::spawn(self.clone().run_heartbeats(cancel.clone()));

        match self.join(&member, hint, &cancel).await {
            Ok(view) => {
                let self_elected = view.id() == 1 && view.creator() == &member;
                self.apply_view(view, false).await;

                match self.current_view() {
                    Some(view) if view.contains(&member) && self.is_connected() => {
                        if self_elected {
                            self.announce(&view);
                        }
                        info!(
                            "Joined cluster: member={}, view_id={}, members={}",
                            member,
                            view.id(),
                            view.len()
                        );
                        Ok(())
                    }
                    _ => {
                        self.end_session();
                        Err(GridError::Connect(format!(
                            "{} could not install its first view",
                            member
                        )))
                    }
                }
            }
            Err(e) => {
                self.end_session();
                self.state_tx.send_replace(MemberState::Left);
                Err(e)
            }
        }
    }

    /// Find the coordinator through the locators and ask to be admitted,
    /// forming a new group when every reachable locator allows it
    async fn join(
        &self,
        member: &Member,
        hint: Option<Member>,
        cancel: &CancellationToken,
    ) -> Result<View> {
        let timeout = self.config.join_timeout();
        let deadline = Instant::now() + timeout;
        let prefer = self.config.locators_preferred_as_coordinators;
        let mut locator_answered = false;
        let mut known_view_id = 0;
        let mut last_error = String::from("no locator answered");

        loop {
            if let Some(view) = self.current_view() {
                return Ok(view.as_ref().clone());
            }
            if cancel.is_cancelled() {
                return Err(GridError::Connect("join was cancelled".to_string()));
            }

            let mut candidates: Vec<SocketAddr> = Vec::new();
            if let Some(hint) = &hint {
                candidates.push(hint.addr);
            }
            candidates.extend(
                self.recovered
                    .iter()
                    .filter(|m| !m.same_endpoint(member))
                    .map(|m| m.addr),
            );

            let mut answered = 0usize;
            let mut grants = 0usize;
            let mut views_seen = false;

            for locator in &self.locators {
                let request = Message::FindCoordinator {
                    member: member.clone(),
                };
                match self.transport.request(*locator, &request).await {
                    Ok(Message::FindCoordinatorResponse {
                        view,
                        coordinator,
                        may_initiate,
                        ..
                    }) => {
                        answered += 1;
                        if may_initiate {
                            grants += 1;
                        }
                        if let Some(coordinator) = coordinator {
                            candidates.push(coordinator.addr);
                        }
                        if let Some(view) = view {
                            views_seen = true;
                            known_view_id = known_view_id.max(view.id());
                            candidates.extend(succession(&view, prefer).iter().map(|m| m.addr));
                        }
                    }
                    Ok(other) => {
                        last_error = format!("locator {} answered {}", locator, other.kind());
                    }
                    Err(e) => {
                        trace!("Locator unreachable: locator={}, error={}", locator, e);
                        last_error = e.to_string();
                    }
                }
            }
            locator_answered |= answered > 0;

            let mut seen = HashSet::new();
            candidates.retain(|addr| *addr != member.addr && seen.insert(*addr));

            for addr in candidates {
                if self.current_view().is_some() {
                    break;
                }
                match self.request_join(addr, member, known_view_id, deadline).await {
                    Ok(view) => return Ok(view),
                    Err(e) => {
                        debug!("Join attempt failed: target={}, error={}", addr, e);
                        last_error = e.to_string();
                    }
                }
            }

            if let Some(view) = self.current_view() {
                return Ok(view.as_ref().clone());
            }

            if answered > 0 && grants == answered && !views_seen {
                info!("No running cluster found, forming a new one: member={}", member);
                return Ok(View::initial(member.clone()));
            }

            let now = Instant::now();
            if now >= deadline {
                break;
            }
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(JOIN_RETRY_INTERVAL.min(deadline - now)) => {}
            }
        }

        if locator_answered {
            Err(GridError::Connect(format!(
                "no coordinator admitted {} within {:?}: {}",
                member, timeout, last_error
            )))
        } else {
            Err(GridError::Connect(format!(
                "unable to contact any locator at {:?} within {:?}: {}",
                self.locators, timeout, last_error
            )))
        }
    }

    async fn request_join(
        &self,
        addr: SocketAddr,
        member: &Member,
        known_view_id: ViewId,
        deadline: Instant,
    ) -> Result<View> {
        let mut target = addr;

        for _ in 0..MAX_REDIRECTS {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(GridError::Timeout("join timeout elapsed".to_string()));
            }

            let request = Message::JoinRequest {
                member: member.clone(),
                known_view_id,
            };
            match self.transport.request_with_timeout(target, &request, remaining).await? {
                Message::JoinResponse { view } if view.contains(member) => return Ok(view),
                Message::JoinResponse { view } => {
                    return Err(GridError::Protocol(format!(
                        "view {} from {} does not include the joiner",
                        view.id(),
                        target
                    )))
                }
                Message::NotCoordinator {
                    coordinator: Some(coordinator),
                } if coordinator.addr != target && &coordinator != member => {
                    target = coordinator.addr;
                }
                Message::NotCoordinator { .. } => {
                    return Err(GridError::Connect(format!(
                        "{} does not know the coordinator",
                        target
                    )))
                }
                Message::JoinRejected { reason } => {
                    return Err(GridError::Connect(format!(
                        "join rejected by {}: {}",
                        target, reason
                    )))
                }
                other => {
                    return Err(GridError::Protocol(format!(
                        "unexpected {} from {}",
                        other.kind(),
                        target
                    )))
                }
            }
        }

        Err(GridError::Connect("too many coordinator redirects".to_string()))
    }

    /// Install a view received from a peer. Returns true when installed.
    ///
    /// Views older than the installed one are dropped. A view that skips ids
    /// makes us pull the latest view from its creator first.
    pub(crate) async fn apply_view(&self, view: View, pull_on_gap: bool) -> bool {
        let _transition = self.view_lock.lock().await;
        let local = self.local_member();
        let mut view = view;

        match self.current_view() {
            Some(current) if view.id() <= current.id() => {
                trace!(
                    "Dropping stale view: view_id={}, installed={}",
                    view.id(),
                    current.id()
                );
                return false;
            }
            Some(current) if view.id() > current.id() + 1 && pull_on_gap => {
                debug!(
                    "View gap, pulling the latest view: installed={}, received={}",
                    current.id(),
                    view.id()
                );
                let request = Message::ViewRequest {
                    known_view_id: current.id(),
                };
                match self.transport.request(view.creator().addr, &request).await {
                    Ok(Message::ViewMessage { view: latest }) if latest.id() > view.id() => {
                        view = latest
                    }
                    Ok(_) => {}
                    Err(e) => debug!("View pull failed, installing the received view: {}", e),
                }
            }
            Some(_) => {}
            None => {
                if !view.contains(&local) {
                    return false;
                }
            }
        }

        self.install_locked(view)
    }

    /// Replace the installed view. Callers hold `view_lock`.
    pub(crate) fn install_locked(&self, view: View) -> bool {
        if self.state() == MemberState::Left {
            return false;
        }

        let local = self.local_member();
        if !view.contains(&local) {
            if self.leaving.load(Ordering::SeqCst) {
                info!("Departure confirmed: member={}, view_id={}", local, view.id());
                self.state_tx.send_replace(MemberState::Left);
            } else {
                self.begin_forced_disconnect(format!(
                    "Membership coordinator {} removed this member from view {}",
                    view.creator(),
                    view.id()
                ));
            }
            return false;
        }

        let prior = self.current_view();
        let view = Arc::new(view);
        self.view_tx.send_replace(Some(view.clone()));

        self.failed.lock().retain(|m| view.contains(m));
        self.departing.lock().retain(|m| view.contains(m));
        if let Some(prior) = &prior {
            let mut partition = self.partition.lock();
            for member in view.departed_since(prior) {
                partition.resolve_suspect(&member);
            }
        }

        let next = if self.is_acting_coordinator() {
            MemberState::Coordinator
        } else {
            MemberState::Member
        };
        self.state_tx.send_if_modified(|state| {
            if *state != MemberState::Left && *state != next {
                *state = next;
                true
            } else {
                false
            }
        });

        self.refresh_watch();

        metrics::counter!("membership_views_installed_total").increment(1);
        metrics::gauge!("membership_view_size").set(view.len() as f64);

        info!(
            "Installed view: view_id={}, members={}, coordinator={:?}, member={}",
            view.id(),
            view.len(),
            self.acting_coordinator().map(|c| c.to_string()),
            local
        );

        self.listeners.view_installed(prior.as_deref(), &view);
        true
    }

    /// Tell the locators about a view
    pub(crate) fn announce(&self, view: &View) {
        let Some(this) = self.this.upgrade() else {
            return;
        };
        let message = Message::ViewAnnouncement { view: view.clone() };

        tokio::spawn(async move {
            let sends = this
                .locators
                .iter()
                .map(|locator| this.transport.request(*locator, &message));
            for result in join_all(sends).await {
                if let Err(e) = result {
                    trace!("View announcement failed: {}", e);
                }
            }
        });
    }

    async fn run_heartbeats(self: Arc<Self>, cancel: CancellationToken) {
        let interval = self.config.heartbeat_interval();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }

            let Some(view) = self.current_view() else {
                continue;
            };
            if !self.is_connected() {
                continue;
            }

            for target in self.detector.watched() {
                if self.in_flight.insert(target.clone(), ()).is_some() {
                    continue;
                }

                let this = self.clone();
                let cancel = cancel.clone();
                let view_id = view.id();
                tokio::spawn(async move {
                    tokio::select! {
                        _ = cancel.cancelled() => {}
                        _ = this.heartbeat(&target, view_id) => {}
                    }
                    this.in_flight.remove(&target);
                });
            }

            let now = Instant::now();
            for transition in self.detector.evaluate(now) {
                self.on_transition(transition, &view);
            }
            self.partition.lock().tick(now);
        }

        debug!("Heartbeats stopped");
    }

    async fn heartbeat(&self, target: &Member, view_id: u64) {
        let request = Message::Heartbeat {
            member: self.local_member(),
            view_id,
        };

        match self.transport.request(target.addr, &request).await {
            Ok(Message::HeartbeatAck {
                member,
                view_id: peer_view,
            }) if &member == target => {
                self.heard_from(target);
                if peer_view > view_id {
                    debug!(
                        "Peer has a newer view, resynchronizing: peer={}, view_id={}",
                        target, peer_view
                    );
                    self.resync(target.addr).await;
                }
            }
            Ok(other) => trace!("Heartbeat answered with {}: peer={}", other.kind(), target),
            Err(e) => trace!("Heartbeat failed: peer={}, error={}", target, e),
        }
    }

    /// Pull the latest view from `addr`
    async fn resync(&self, addr: SocketAddr) {
        let known = self.current_view().map(|v| v.id()).unwrap_or(0);
        match self
            .transport
            .request(addr, &Message::ViewRequest { known_view_id: known })
            .await
        {
            Ok(Message::ViewMessage { view }) if view.id() > known => {
                self.apply_view(view, false).await;
            }
            Ok(_) => {}
            Err(e) => debug!("View pull failed: peer={}, error={}", addr, e),
        }
    }

    fn heard_from(&self, member: &Member) {
        let previous = self.detector.record_heard(member, Instant::now());
        let reported_crashed = self.failed.lock().contains(member);

        if reported_crashed || previous == Some(PeerStatus::Crashed) {
            info!(
                "Crashed member answered, keeping it: member={}, was={:?}",
                member, previous
            );
            self.mark_alive(member);
        } else if let Some(previous) = previous {
            info!("Member responsive again: member={}, was={:?}", member, previous);
            self.partition.lock().resolve_suspect(member);
        }
    }

    fn on_transition(&self, transition: Transition, view: &View) {
        let local = self.local_member();

        match transition.status {
            PeerStatus::Alive => {}
            PeerStatus::Suspect => {
                self.raise_suspicion(
                    transition.member,
                    local,
                    NO_HEARTBEAT_REASON.to_string(),
                    false,
                    true,
                );
            }
            PeerStatus::Crashed => {
                let reason = format!(
                    "{} (silent for {:?})",
                    NO_HEARTBEAT_REASON, transition.silence
                );
                self.raise_suspicion(transition.member.clone(), local.clone(), reason, true, true);

                let excluded = self.excluded();
                let next = ring_after(view, &transition.member, &excluded)
                    .into_iter()
                    .find(|m| m != &local);
                if let Some(next) = next {
                    debug!(
                        "Watching past crashed member: member={}, depth={}",
                        next,
                        transition.depth + 1
                    );
                    self.detector.extend(next, transition.depth + 1, Instant::now());
                }
            }
        }
    }

    /// Handle a suspicion raised locally or reported by a peer
    fn raise_suspicion(
        &self,
        suspect: Member,
        reporter: Member,
        reason: String,
        crashed: bool,
        broadcast: bool,
    ) {
        let local = self.local_member();
        if suspect == local {
            debug!("Suspected by a peer: reporter={}, reason={}", reporter, reason);
            return;
        }
        let Some(view) = self.current_view() else {
            return;
        };
        if !view.contains(&suspect) {
            return;
        }

        if crashed {
            if !self.failed.lock().insert(suspect.clone()) {
                return;
            }
            metrics::counter!("membership_crashes_detected_total").increment(1);
            warn!(
                "Member crashed: member={}, reporter={}, reason={}",
                suspect, reporter, reason
            );
        } else {
            metrics::counter!("membership_suspects_total").increment(1);
            info!(
                "Member suspected: member={}, reporter={}, reason={}",
                suspect, reporter, reason
            );
        }

        self.partition.lock().record_suspect(
            SuspectRecord::new(suspect.clone(), reporter.clone(), reason.clone()),
            Instant::now(),
        );
        self.listeners.suspect(&suspect, &reporter, &reason);

        if crashed {
            self.refresh_role();
            self.refresh_watch();
        }

        if broadcast {
            self.broadcast_suspicion(&view, &suspect, &reporter, &reason, crashed);
        }

        if crashed && self.is_acting_coordinator() {
            self.enqueue(ViewChange::Remove {
                member: suspect,
                reason,
                crashed: true,
                reply: None,
            });
        }
    }

    fn broadcast_suspicion(
        &self,
        view: &View,
        suspect: &Member,
        reporter: &Member,
        reason: &str,
        crashed: bool,
    ) {
        let Some(this) = self.this.upgrade() else {
            return;
        };

        let local = self.local_member();
        let targets: Vec<Member> = view
            .members()
            .iter()
            .filter(|m| *m != &local && *m != suspect)
            .cloned()
            .collect();
        let notice = Message::SuspectNotice {
            suspect: suspect.clone(),
            reporter: reporter.clone(),
            reason: reason.to_string(),
            crashed,
        };

        tokio::spawn(async move {
            let sends = targets.iter().map(|m| this.transport.request(m.addr, &notice));
            join_all(sends).await;
        });
    }

    /// Record the cause and leave the Member states right away, then finish
    /// the disconnect in the background. Returns false when already out.
    pub(crate) fn begin_forced_disconnect(&self, reason: String) -> bool {
        if !self.mark_forced(&reason) {
            return false;
        }

        if let Some(this) = self.this.upgrade() {
            tokio::spawn(this.complete_forced_disconnect(reason));
        }
        true
    }

    fn mark_forced(&self, reason: &str) -> bool {
        let mut forced = self.forced.write();
        let changed = self.state_tx.send_if_modified(|state| {
            if *state == MemberState::Left {
                false
            } else {
                *state = MemberState::Left;
                true
            }
        });
        if !changed {
            return false;
        }
        *forced = Some(reason.to_string());
        drop(forced);

        metrics::counter!("membership_forced_disconnects_total").increment(1);
        warn!(
            "Membership failure: member={}, reason={}",
            self.local_member(),
            reason
        );
        true
    }

    async fn complete_forced_disconnect(self: Arc<Self>, reason: String) {
        if let Some(observer) = &self.observer {
            observer.before_membership_failure(&reason).await;
        }

        self.end_session();
        self.detector.clear();
        self.listeners.forced_disconnect(&reason);

        if let Some(observer) = &self.observer {
            observer.after_membership_failure(&reason).await;
        }

        if self.config.disable_auto_reconnect
            || self.unclean.load(Ordering::SeqCst)
            || self.closed.is_cancelled()
        {
            info!("Not reconnecting after membership failure: member={}", self.local_member());
            return;
        }

        self.reconnect().await;
    }

    async fn reconnect(self: Arc<Self>) {
        let attempts = self.config.max_reconnect_attempts;

        for attempt in 1..=attempts {
            tokio::select! {
                _ = self.closed.cancelled() => return,
                _ = tokio::time::sleep(self.config.reconnect_wait()) => {}
            }

            info!("Reconnecting: attempt={}/{}", attempt, attempts);
            match self.rejoin(None).await {
                Ok(()) => {
                    info!("Reconnected: member={}", self.local_member());
                    return;
                }
                Err(e) => warn!("Reconnect attempt failed: attempt={}, error={}", attempt, e),
            }
        }

        error!("Giving up on reconnecting after {} attempts", attempts);
    }

    /// Join again under a fresh identity
    async fn rejoin(self: &Arc<Self>, hint: Option<Member>) -> Result<()> {
        let listener = bind_member_socket(&self.config).await?;
        let member = Member::new(listener.local_addr()?, self.kind);
        self.establish(listener, member, hint).await
    }

    /// Give up a singleton view formed concurrently with a better-ranked
    /// coordinator and join that coordinator instead
    pub(crate) async fn abandon_tentative_view(self: Arc<Self>, winner: Member) {
        {
            let _transition = self.view_lock.lock().await;
            let local = self.local_member();
            let tentative = self
                .current_view()
                .is_some_and(|view| view.len() == 1 && view.contains(&local));
            if !tentative || !self.is_connected() {
                return;
            }

            info!(
                "Discarding tentative view: member={}, coordinator={}",
                local, winner
            );
            self.end_session();
        }

        let rejoined = self.rejoin(Some(winner)).await;
        if let Err(e) = rejoined {
            warn!("Joining the surviving coordinator failed: {}", e);
            if !self.config.disable_auto_reconnect {
                self.reconnect().await;
            }
        }
    }

    fn disconnected_error(&self) -> GridError {
        match self.forced.read().clone() {
            Some(reason) => GridError::operation_failed(GridError::ForcedDisconnect(reason)),
            None => {
                GridError::operation_failed(GridError::State("member is not connected".to_string()))
            }
        }
    }

    fn ensure_connected(&self) -> Result<()> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(self.disconnected_error())
        }
    }

    async fn send_removal(&self, target: &Member, reason: &str) -> Result<()> {
        let local = self.local_member();

        for _ in 0..MAX_REDIRECTS {
            let coordinator = self.acting_coordinator().ok_or_else(|| {
                GridError::operation_failed(GridError::State("no coordinator known".to_string()))
            })?;

            let reply = if coordinator == local {
                let (tx, rx) = oneshot::channel();
                let queued = self.enqueue(ViewChange::Remove {
                    member: target.clone(),
                    reason: reason.to_string(),
                    crashed: false,
                    reply: Some(tx),
                });
                if !queued {
                    return Err(self.disconnected_error());
                }
                rx.await.map_err(|_| self.disconnected_error())?
            } else {
                let request = Message::RemoveMemberRequest {
                    target: target.clone(),
                    requester: local.clone(),
                    reason: reason.to_string(),
                };
                let timeout = self.config.view_ack_timeout() + self.config.member_timeout();
                self.transport
                    .request_with_timeout(coordinator.addr, &request, timeout)
                    .await
                    .map_err(GridError::operation_failed)?
            };

            match reply {
                Message::Ok => {
                    info!("Member removal confirmed: target={}, reason={}", target, reason);
                    return Ok(());
                }
                Message::NotCoordinator { .. } => {
                    tokio::time::sleep(JOIN_RETRY_INTERVAL).await;
                }
                Message::Error { reason } => {
                    return Err(GridError::operation_failed(GridError::Internal(reason)))
                }
                other => {
                    return Err(GridError::operation_failed(GridError::Protocol(format!(
                        "unexpected {} to a removal request",
                        other.kind()
                    ))))
                }
            }
        }

        Err(GridError::operation_failed(GridError::Connect(
            "the coordinator kept changing".to_string(),
        )))
    }

    /// Leave voluntarily, handing coordination to the successor first when
    /// this member coordinates
    async fn leave(self: &Arc<Self>) -> Result<()> {
        if self.state() == MemberState::Left {
            self.closed.cancel();
            self.end_session();
            return Ok(());
        }

        let local = self.local_member();
        let prefer = self.config.locators_preferred_as_coordinators;
        self.leaving.store(true, Ordering::SeqCst);

        if let Some(view) = self.current_view().filter(|v| v.len() > 1) {
            let was_coordinator = self.is_acting_coordinator();
            self.departing.lock().insert(local.clone());
            let excluded = self.excluded();

            let target = if was_coordinator {
                succession(&view, prefer)
                    .into_iter()
                    .find(|m| m != &local && !excluded.contains(m))
            } else {
                acting_coordinator(&view, &excluded, prefer).cloned()
            };

            if let Some(target) = target {
                info!(
                    "Leaving cluster: member={}, coordinator={}, handoff={}",
                    local, target, was_coordinator
                );

                let mut state_rx = self.state_tx.subscribe();
                let request = Message::LeaveRequest {
                    member: local.clone(),
                    reason: "graceful disconnect".to_string(),
                };

                match self.transport.request(target.addr, &request).await {
                    Ok(_) => {
                        let wait = self.config.view_ack_timeout() + self.config.member_timeout();
                        let confirmed = tokio::time::timeout(
                            wait,
                            state_rx.wait_for(|state| *state == MemberState::Left),
                        )
                        .await
                        .is_ok();
                        if !confirmed {
                            warn!("Departure not confirmed within {:?}, leaving anyway", wait);
                        }
                    }
                    Err(e) => warn!("Leave request failed: target={}, error={}", target, e),
                }
            }
        }

        self.state_tx.send_replace(MemberState::Left);
        self.closed.cancel();
        self.end_session();
        self.detector.clear();
        info!("Left the cluster: member={}", local);
        Ok(())
    }

    async fn shutdown_unclean(self: &Arc<Self>, reason: &str) {
        self.unclean.store(true, Ordering::SeqCst);
        self.closed.cancel();

        if self.mark_forced(reason) {
            self.clone().complete_forced_disconnect(reason.to_string()).await;
        } else {
            self.end_session();
        }
    }

    fn on_heartbeat(&self, member: &Member) -> Message {
        if self.state() == MemberState::Left {
            return Message::error("member has left the cluster");
        }

        self.heard_from(member);
        Message::HeartbeatAck {
            member: self.local_member(),
            view_id: self.current_view().map(|v| v.id()).unwrap_or(0),
        }
    }

    async fn on_join_request(&self, member: Member, known_view_id: ViewId) -> Message {
        let Some(view) = self.current_view().filter(|_| self.is_connected()) else {
            return Message::NotCoordinator { coordinator: None };
        };
        if view.contains(&member) {
            return Message::JoinResponse {
                view: view.as_ref().clone(),
            };
        }

        let acting = self.acting_coordinator();
        if acting.as_ref() != Some(&self.local_member()) {
            return Message::NotCoordinator { coordinator: acting };
        }

        debug!(
            "Join requested: member={}, known_view_id={}, view_id={}",
            member,
            known_view_id,
            view.id()
        );
        let (tx, rx) = oneshot::channel();
        if !self.enqueue(ViewChange::Join { member, reply: tx }) {
            return Message::JoinRejected {
                reason: "coordinator is shutting down".to_string(),
            };
        }

        rx.await.unwrap_or_else(|_| Message::JoinRejected {
            reason: "coordinator stopped before admitting the member".to_string(),
        })
    }

    async fn on_view_message(&self, view: View) -> Message {
        if self.state() == MemberState::Left {
            return Message::error("member has left the cluster");
        }

        self.apply_view(view, true).await;
        match self.current_view() {
            Some(current) => Message::Ack {
                member: self.local_member(),
                view_id: current.id(),
            },
            None => Message::error("view not accepted"),
        }
    }

    fn on_leave_request(&self, member: Member, reason: String) -> Message {
        let Some(view) = self.current_view() else {
            return Message::Ok;
        };
        if !view.contains(&member) {
            return Message::Ok;
        }

        info!("Member leaving: member={}, reason={}", member, reason);
        self.departing.lock().insert(member.clone());
        self.refresh_role();
        self.refresh_watch();

        if self.is_acting_coordinator() {
            self.enqueue(ViewChange::Leave { member, reason });
        } else if let (Some(coordinator), Some(this)) =
            (self.acting_coordinator(), self.this.upgrade())
        {
            let request = Message::LeaveRequest { member, reason };
            tokio::spawn(async move {
                if let Err(e) = this.transport.request(coordinator.addr, &request).await {
                    debug!("Forwarding leave request failed: {}", e);
                }
            });
        }

        Message::Ok
    }

    async fn on_remove_request(
        &self,
        target: Member,
        requester: Member,
        reason: String,
    ) -> Message {
        let acting = self.acting_coordinator();
        if !self.is_connected() || acting.as_ref() != Some(&self.local_member()) {
            return Message::NotCoordinator { coordinator: acting };
        }

        info!(
            "Removal requested: target={}, requester={}, reason={}",
            target, requester, reason
        );
        let (tx, rx) = oneshot::channel();
        let queued = self.enqueue(ViewChange::Remove {
            member: target,
            reason,
            crashed: false,
            reply: Some(tx),
        });
        if !queued {
            return Message::error("coordinator is shutting down");
        }

        rx.await
            .unwrap_or_else(|_| Message::error("coordinator stopped before removing the member"))
    }

    fn on_quorum_lost_notice(&self, failed: Vec<Member>, remaining: Vec<Member>) -> Message {
        if !self.is_connected() {
            return Message::Ok;
        }

        warn!(
            "Coordinator declared loss of quorum: failed={}, remaining={}",
            failed.len(),
            remaining.len()
        );
        self.partition.lock().mark_partitioned();
        metrics::counter!("membership_quorum_lost_total").increment(1);
        self.listeners.quorum_lost(&failed, &remaining);

        if self.config.enable_network_partition_detection {
            self.begin_forced_disconnect(quorum_loss_reason(&failed));
        }
        Message::Ok
    }
}

#[async_trait]
impl MessageHandler for Inner {
    async fn handle(&self, message: Message, _peer: SocketAddr) -> Message {
        match message {
            Message::Heartbeat { member, .. } => self.on_heartbeat(&member),
            Message::JoinRequest {
                member,
                known_view_id,
            } => self.on_join_request(member, known_view_id).await,
            Message::ViewMessage { view } => self.on_view_message(view).await,
            Message::ViewRequest { .. } => {
                match self.current_view().filter(|_| self.is_connected()) {
                    Some(view) => Message::ViewMessage {
                        view: view.as_ref().clone(),
                    },
                    None => Message::error("no view installed"),
                }
            }
            Message::LeaveRequest { member, reason } => self.on_leave_request(member, reason),
            Message::RemoveMemberRequest {
                target,
                requester,
                reason,
            } => self.on_remove_request(target, requester, reason).await,
            Message::Removed { member, reason } => {
                if member == self.local_member() {
                    self.begin_forced_disconnect(reason);
                }
                Message::Ok
            }
            Message::SuspectNotice {
                suspect,
                reporter,
                reason,
                crashed,
            } => {
                self.raise_suspicion(suspect, reporter, reason, crashed, false);
                Message::Ok
            }
            Message::QuorumLostNotice { failed, remaining } => {
                self.on_quorum_lost_notice(failed, remaining)
            }
            other => Message::error(format!("members do not handle {}", other.kind())),
        }
    }
}

/// Handle on the local member's view of the cluster
#[derive(Clone)]
pub struct MembershipHandle {
    inner: Arc<Inner>,
}

impl MembershipHandle {
    /// Join with default options
    pub async fn connect(config: MembershipConfig) -> Result<Self> {
        MembershipBuilder::new(config).connect().await
    }

    pub fn builder(config: MembershipConfig) -> MembershipBuilder {
        MembershipBuilder::new(config)
    }

    pub fn current_view(&self) -> Option<Arc<View>> {
        self.inner.current_view()
    }

    /// The acting coordinator: the elected member of the installed view once
    /// members known to have crashed or left are discounted
    pub fn coordinator(&self) -> Option<Member> {
        self.inner.acting_coordinator()
    }

    /// Earliest-joined normal member of the installed view
    pub fn lead_member(&self) -> Option<Member> {
        self.inner.current_view()?.lead_member().cloned()
    }

    pub fn local_member(&self) -> Member {
        self.inner.local_member()
    }

    pub fn state(&self) -> MemberState {
        self.inner.state()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.is_connected()
    }

    pub fn is_coordinator(&self) -> bool {
        self.inner.state() == MemberState::Coordinator
    }

    pub fn partition_state(&self) -> PartitionState {
        self.inner.partition.lock().state()
    }

    /// Suspicions not yet resolved
    pub fn suspects(&self) -> Vec<SuspectRecord> {
        self.inner.partition.lock().suspects()
    }

    /// Cause of the most recent forced disconnect, if any
    pub fn forced_disconnect_reason(&self) -> Option<String> {
        self.inner.forced.read().clone()
    }

    pub fn locators(&self) -> &[SocketAddr] {
        &self.inner.locators
    }

    pub fn config(&self) -> &MembershipConfig {
        &self.inner.config
    }

    pub fn add_listener(&self, listener: Arc<dyn MembershipListener>) {
        self.inner.listeners.add(listener);
    }

    /// Watch installed views
    pub fn subscribe_views(&self) -> watch::Receiver<Option<Arc<View>>> {
        self.inner.view_tx.subscribe()
    }

    /// Ask the coordinator to remove `target`.
    ///
    /// Fails with `OperationFailed` wrapping the `ForcedDisconnect` cause when
    /// this member has been, or while waiting is, forced out.
    pub async fn request_member_removal(&self, target: &Member, reason: &str) -> Result<()> {
        self.inner.ensure_connected()?;

        let mut state_rx = self.inner.state_tx.subscribe();
        let timeout = self.inner.config.view_ack_timeout() + self.inner.config.member_timeout() * 2;

        tokio::select! {
            result = tokio::time::timeout(timeout, self.inner.send_removal(target, reason)) => {
                match result {
                    Ok(result) => result,
                    Err(_) => Err(GridError::operation_failed(GridError::Timeout(format!(
                        "removal of {} not confirmed within {:?}",
                        target, timeout
                    )))),
                }
            }
            _ = state_rx.wait_for(|state| *state == MemberState::Left) => {
                Err(self.inner.disconnected_error())
            }
        }
    }

    /// Leave the cluster. A coordinator hands off to its successor first.
    pub async fn disconnect(&self) -> Result<()> {
        self.inner.leave().await
    }

    /// Stop at once without telling anyone; peers see a crash
    pub async fn shutdown_unclean(&self, reason: &str) {
        self.inner.shutdown_unclean(reason).await;
    }

    /// Wait until the installed view satisfies `predicate`
    pub async fn wait_for_view<F>(&self, predicate: F, timeout: Duration) -> Result<Arc<View>>
    where
        F: Fn(&View) -> bool,
    {
        let mut rx = self.inner.view_tx.subscribe();
        let wait = async {
            rx.wait_for(|view| view.as_deref().is_some_and(&predicate))
                .await
                .map(|view| (*view).clone())
        };

        match tokio::time::timeout(timeout, wait).await {
            Ok(Ok(Some(view))) => Ok(view),
            Ok(_) => Err(GridError::Internal("view channel closed".to_string())),
            Err(_) => Err(GridError::Timeout(format!(
                "no matching view within {:?}",
                timeout
            ))),
        }
    }

    /// Wait until `member` is no longer in the installed view
    pub async fn wait_for_departure(
        &self,
        member: &Member,
        timeout: Duration,
    ) -> Result<Arc<View>> {
        self.wait_for_view(|view| !view.contains(member), timeout).await
    }

    pub async fn wait_for_state(&self, state: MemberState, timeout: Duration) -> Result<()> {
        let mut rx = self.inner.state_tx.subscribe();
        let reached = tokio::time::timeout(timeout, async {
            rx.wait_for(|current| *current == state).await.is_ok()
        })
        .await;

        match reached {
            Ok(true) => Ok(()),
            Ok(false) => Err(GridError::Internal("state channel closed".to_string())),
            Err(_) => Err(GridError::Timeout(format!(
                "state {} not reached within {:?}",
                state, timeout
            ))),
        }
    }

    pub(crate) fn inner(&self) -> &Arc<Inner> {
        &self.inner
    }
}

impl std::fmt::Debug for MembershipHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MembershipHandle")
            .field("member", &self.local_member())
            .field("state", &self.state())
            .field("view_id", &self.current_view().map(|v| v.id()))
            .finish()
    }
}
