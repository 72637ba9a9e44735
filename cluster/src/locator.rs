//! Locators: the discovery rendezvous of the cluster.
//!
//! A locator answers `FindCoordinator` with the best view it knows of, keeps
//! in touch with the other configured locators, and usually hosts a member of
//! kind `Locator` so the cluster can form around it.

use crate::election::{elect_coordinator, should_yield, succession, view_coordinator};
use crate::listener::MembershipListener;
use crate::manager::{MembershipBuilder, MembershipHandle};
use crate::protocol::Message;
use crate::state::{LocatorState, LocatorStateFile};
use crate::transport::{self, MessageHandler, Transport};
use async_trait::async_trait;
use datagrid_common::{
    parse_locators, GridError, LocatorEntry, Member, MemberKind, MembershipConfig, Result, View,
};
use futures::future::join_all;
use once_cell::sync::Lazy;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::{Arc, Weak};
use std::time::Instant;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Default locator port
pub const DEFAULT_LOCATOR_PORT: u16 = 10334;

/// Locator settings; timing and the peer list come from `MembershipConfig`
#[derive(Debug, Clone)]
pub struct LocatorConfig {
    /// Port to listen on (0 picks an ephemeral port)
    pub port: u16,

    /// Overrides `MembershipConfig::bind_address`
    pub bind_address: Option<IpAddr>,

    /// Where to remember the last installed view
    pub state_file: Option<PathBuf>,

    /// Run a member of kind `Locator` in this process
    pub host_member: bool,
}

impl Default for LocatorConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_LOCATOR_PORT,
            bind_address: None,
            state_file: None,
            host_member: true,
        }
    }
}

impl LocatorConfig {
    pub fn new(port: u16) -> Self {
        Self {
            port,
            ..Self::default()
        }
    }
}

/// Answer to a discovery request
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiscoveryResponse {
    pub view: Option<View>,
    pub coordinator: Option<Member>,
    pub hosted: Option<Member>,

    /// The requester may form a new cluster: no view is known and it is the
    /// best-ranked member recently seen asking
    pub may_initiate: bool,
}

#[derive(Default)]
enum Slot {
    #[default]
    Empty,
    Starting,
    Running(Arc<LocatorShared>),
}

/// The locator of one process. At most one locator runs per registry.
#[derive(Clone, Default)]
pub struct LocatorRegistry {
    slot: Arc<Mutex<Slot>>,
}

static GLOBAL_REGISTRY: Lazy<LocatorRegistry> = Lazy::new(LocatorRegistry::new);

impl LocatorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry shared by the whole process
    pub fn global() -> &'static LocatorRegistry {
        &GLOBAL_REGISTRY
    }

    fn reserve(&self) -> Result<()> {
        let mut slot = self.slot.lock();
        match &*slot {
            Slot::Empty => {
                *slot = Slot::Starting;
                Ok(())
            }
            Slot::Starting => Err(GridError::State(
                "a locator is already starting in this process".to_string(),
            )),
            Slot::Running(shared) => Err(GridError::State(format!(
                "a locator is already running in this process at {}",
                shared.endpoint
            ))),
        }
    }

    fn occupy(&self, shared: Arc<LocatorShared>) {
        *self.slot.lock() = Slot::Running(shared);
    }

    fn release(&self, shared: Option<&Arc<LocatorShared>>) {
        let mut slot = self.slot.lock();
        let owned = match (&*slot, shared) {
            (Slot::Starting, _) => true,
            (Slot::Running(running), Some(shared)) => Arc::ptr_eq(running, shared),
            _ => false,
        };
        if owned {
            *slot = Slot::Empty;
        }
    }

    /// Locators running in this process
    pub fn locators(&self) -> Vec<LocatorEntry> {
        match &*self.slot.lock() {
            Slot::Running(shared) => vec![LocatorEntry {
                endpoint: shared.endpoint,
                member: shared.hosted_handle().map(|handle| handle.local_member()),
            }],
            _ => Vec::new(),
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(&*self.slot.lock(), Slot::Running(_))
    }
}

/// Where a peer view came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ViewSource {
    Sync,
    Announcement,
}

struct LocatorShared {
    this: Weak<LocatorShared>,
    endpoint: SocketAddr,
    membership: MembershipConfig,
    peers: Vec<SocketAddr>,
    transport: Transport,
    view: RwLock<Option<View>>,
    hosted: RwLock<Option<MembershipHandle>>,
    /// Members that asked for a coordinator while no view was known
    requesters: Mutex<HashMap<Member, Instant>>,
    recovered: Vec<Member>,
    /// Latest state for the state file writer
    states: Option<watch::Sender<Option<LocatorState>>>,
    stopped: CancellationToken,
}

impl LocatorShared {
    fn prefer_locators(&self) -> bool {
        self.membership.locators_preferred_as_coordinators
    }

    fn current_view(&self) -> Option<View> {
        self.view.read().clone()
    }

    fn hosted_handle(&self) -> Option<MembershipHandle> {
        self.hosted.read().clone()
    }

    fn hosted_connected(&self) -> Option<MembershipHandle> {
        self.hosted_handle().filter(|handle| handle.is_connected())
    }

    fn find_coordinator(&self, requester: &Member) -> DiscoveryResponse {
        metrics::counter!("locator_discovery_requests_total").increment(1);
        let hosted = self.hosted_handle().map(|handle| handle.local_member());

        if let Some(view) = self.current_view() {
            let coordinator = view_coordinator(&view, self.prefer_locators()).cloned();
            trace!(
                "Discovery answered: requester={}, view_id={}, coordinator={:?}",
                requester,
                view.id(),
                coordinator.as_ref().map(|c| c.to_string())
            );
            return DiscoveryResponse {
                view: Some(view),
                coordinator,
                hosted,
                may_initiate: false,
            };
        }

        let now = Instant::now();
        let window = self.membership.member_timeout() * 2;
        let mut requesters = self.requesters.lock();
        requesters.retain(|member, seen| {
            now.saturating_duration_since(*seen) < window
                && !(member.same_endpoint(requester) && member != requester)
        });
        requesters.insert(requester.clone(), now);

        let may_initiate =
            elect_coordinator(requesters.keys(), self.prefer_locators()) == Some(requester);
        debug!(
            "Discovery without a view: requester={}, may_initiate={}, requesters={}",
            requester,
            may_initiate,
            requesters.len()
        );

        DiscoveryResponse {
            view: None,
            coordinator: None,
            hosted,
            may_initiate,
        }
    }

    fn adopt(&self, view: View) {
        debug!(
            "Locator adopting view: locator={}, view_id={}, members={}",
            self.endpoint,
            view.id(),
            view.len()
        );
        *self.view.write() = Some(view.clone());
        self.requesters.lock().clear();
        self.persist(view);
    }

    fn persist(&self, view: View) {
        if let Some(states) = &self.states {
            states.send_replace(Some(LocatorState::new(self.endpoint, view)));
        }
    }

    /// Merge a view learned from a peer locator or a coordinator
    fn absorb_view(&self, peer: View, source: ViewSource) {
        let Some(ours) = self.current_view() else {
            self.adopt(peer);
            return;
        };

        let overlapping = peer.members().iter().any(|m| ours.contains(m));
        if overlapping {
            if peer.id() > ours.id() {
                self.adopt(peer);
            }
            return;
        }

        let prefer = self.prefer_locators();
        let (Some(our_coordinator), Some(their_coordinator)) =
            (view_coordinator(&ours, prefer), view_coordinator(&peer, prefer))
        else {
            return;
        };

        if should_yield(our_coordinator, their_coordinator, prefer) {
            match self.hosted_connected() {
                Some(handle) if handle.current_view().is_some_and(|v| v.len() == 1) => {
                    info!(
                        "Concurrent cluster found, yielding: locator={}, ours={}, theirs={}",
                        self.endpoint, our_coordinator, their_coordinator
                    );
                    let inner = handle.inner().clone();
                    tokio::spawn(inner.abandon_tentative_view(their_coordinator.clone()));
                    self.adopt(peer);
                }
                Some(_) => {
                    warn!(
                        "Two coordinators persist: locator={}, ours={} (view {}), \
                         theirs={} (view {})",
                        self.endpoint,
                        our_coordinator,
                        ours.id(),
                        their_coordinator,
                        peer.id()
                    );
                }
                None => self.adopt(peer),
            }
        } else if source == ViewSource::Announcement && self.hosted_connected().is_none() {
            self.adopt(peer);
        }
    }

    async fn run_gossip(self: Arc<Self>) {
        let interval = self.membership.member_timeout() / 2;

        loop {
            tokio::select! {
                _ = self.stopped.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }

            self.sync_peers().await;
            if self.hosted_connected().is_none() {
                self.verify_view().await;
            }
        }

        debug!("Locator gossip stopped: locator={}", self.endpoint);
    }

    /// Exchange views with the other configured locators
    async fn sync_peers(&self) {
        if self.peers.is_empty() {
            return;
        }

        let message = Message::LocatorSync {
            view: self.current_view(),
        };
        let replies = join_all(
            self.peers
                .iter()
                .map(|peer| self.transport.request(*peer, &message)),
        )
        .await;

        for reply in replies {
            match reply {
                Ok(Message::LocatorSync { view: Some(view) }) => {
                    self.absorb_view(view, ViewSource::Sync)
                }
                Ok(_) => {}
                Err(e) => trace!("Locator sync failed: {}", e),
            }
        }
    }

    /// Check the view still has a live member, otherwise forget it; with no
    /// view, ask the members recorded in the state file
    async fn verify_view(&self) {
        let candidates: Vec<Member> = match self.current_view() {
            Some(view) => succession(&view, self.prefer_locators()),
            None if !self.recovered.is_empty() => self.recovered.clone(),
            None => return,
        };

        let known = self.current_view().map(|v| v.id()).unwrap_or(0);
        let request = Message::ViewRequest { known_view_id: known };
        let replies = join_all(
            candidates
                .iter()
                .map(|member| self.transport.request(member.addr, &request)),
        )
        .await;

        let latest = replies
            .into_iter()
            .filter_map(|reply| match reply {
                Ok(Message::ViewMessage { view }) => Some(view),
                _ => None,
            })
            .max_by_key(|view| view.id());

        match latest {
            Some(view) => self.absorb_view(view, ViewSource::Announcement),
            None if known > 0 => {
                info!(
                    "No member of view {} answers, forgetting it: locator={}",
                    known, self.endpoint
                );
                *self.view.write() = None;
            }
            None => {}
        }
    }

    fn stop(&self) {
        self.stopped.cancel();
    }
}

#[async_trait]
impl MessageHandler for LocatorShared {
    async fn handle(&self, message: Message, peer: SocketAddr) -> Message {
        match message {
            Message::FindCoordinator { member } => {
                let response = self.find_coordinator(&member);
                Message::FindCoordinatorResponse {
                    view: response.view,
                    coordinator: response.coordinator,
                    hosted: response.hosted,
                    may_initiate: response.may_initiate,
                }
            }
            Message::LocatorSync { view } => {
                let ours = self.current_view();
                if let Some(view) = view {
                    self.absorb_view(view, ViewSource::Sync);
                }
                Message::LocatorSync { view: ours }
            }
            Message::ViewAnnouncement { view } => {
                trace!("View announced: view_id={}, from={}", view.id(), peer);
                self.absorb_view(view, ViewSource::Announcement);
                Message::Ok
            }
            other => Message::error(format!("locators do not handle {}", other.kind())),
        }
    }
}

/// Keeps the locator's view in step with its hosted member
struct HostedListener {
    locator: Weak<LocatorShared>,
}

impl MembershipListener for HostedListener {
    fn on_view_change(&self, view: &View) {
        if let Some(locator) = self.locator.upgrade() {
            *locator.view.write() = Some(view.clone());
            locator.persist(view.clone());
        }
    }

    fn on_forced_disconnect(&self, reason: &str) {
        if let Some(locator) = self.locator.upgrade() {
            info!(
                "Hosted member forced out, clearing locator view: locator={}, reason={}",
                locator.endpoint, reason
            );
            *locator.view.write() = None;
        }
    }
}

/// A running locator
pub struct Locator {
    registry: LocatorRegistry,
    shared: Arc<LocatorShared>,
}

impl Locator {
    /// Start the locator of this process, hosting a member when configured.
    ///
    /// Fails with `GridError::State` when `registry` already runs a locator
    /// and with `GridError::Bind` when the port is taken.
    pub async fn start(
        registry: &LocatorRegistry,
        config: LocatorConfig,
        membership: MembershipConfig,
    ) -> Result<Locator> {
        registry.reserve()?;

        match Self::launch(registry, config, membership).await {
            Ok(locator) => Ok(locator),
            Err(e) => {
                registry.release(None);
                Err(e)
            }
        }
    }

    async fn launch(
        registry: &LocatorRegistry,
        config: LocatorConfig,
        membership: MembershipConfig,
    ) -> Result<Locator> {
        membership.validate_settings()?;

        let ip = config.bind_address.unwrap_or(membership.bind_address);
        let listener = transport::bind(SocketAddr::new(ip, config.port)).await?;
        let endpoint = advertised(listener.local_addr()?);

        let mut peers = parse_locators(&membership.locators)?;
        peers.retain(|peer| *peer != endpoint);

        let state_file = config.state_file.clone().map(LocatorStateFile::new);
        let restored = match &state_file {
            Some(file) => match file.load().await {
                Ok(state) => state,
                Err(e) => {
                    warn!(
                        "Ignoring unreadable locator state: path={}, error={}",
                        file.path().display(),
                        e
                    );
                    None
                }
            },
            None => None,
        };
        let recovered: Vec<Member> = restored
            .map(|state| {
                info!(
                    "Recovered locator state: view_id={}, members={}",
                    state.view.id(),
                    state.view.len()
                );
                state.view.members().to_vec()
            })
            .unwrap_or_default();

        let states = state_file.map(|file| {
            let (tx, rx) = watch::channel(None);
            tokio::spawn(write_states(file, rx));
            tx
        });

        let shared = Arc::new_cyclic(|this| LocatorShared {
            this: this.clone(),
            endpoint,
            transport: Transport::new(membership.member_timeout()),
            membership: membership.clone(),
            peers,
            view: RwLock::new(None),
            hosted: RwLock::new(None),
            requesters: Mutex::new(HashMap::new()),
            recovered: recovered.clone(),
            states,
            stopped: CancellationToken::new(),
        });

        let handler: Arc<dyn MessageHandler> = shared.clone();
        tokio::spawn(transport::serve(listener, handler, shared.stopped.clone()));
        tokio::spawn(shared.clone().run_gossip());
        registry.occupy(shared.clone());

        info!(
            "Locator started: endpoint={}, peers={:?}, host_member={}",
            endpoint, shared.peers, config.host_member
        );

        if config.host_member {
            let listener = Arc::new(HostedListener {
                locator: shared.this.clone(),
            });
            let connected = MembershipBuilder::new(membership)
                .kind(MemberKind::Locator)
                .locator(endpoint)
                .recovered_members(recovered)
                .listener(listener)
                .connect()
                .await;

            match connected {
                Ok(handle) => *shared.hosted.write() = Some(handle),
                Err(e) => {
                    shared.stop();
                    registry.release(Some(&shared));
                    return Err(e);
                }
            }
        }

        Ok(Locator {
            registry: registry.clone(),
            shared,
        })
    }

    pub fn endpoint(&self) -> SocketAddr {
        self.shared.endpoint
    }

    /// Discovery as seen by a member asking this locator
    pub fn join(&self, member: &Member) -> DiscoveryResponse {
        self.shared.find_coordinator(member)
    }

    /// Best view this locator knows of
    pub fn current_view(&self) -> Option<View> {
        self.shared.current_view()
    }

    /// The member hosted by this locator
    pub fn hosted_member(&self) -> Option<MembershipHandle> {
        self.shared.hosted_handle()
    }

    /// Leave gracefully (the hosted member hands coordination off first),
    /// then release the port and the registry slot
    pub async fn stop(&self) -> Result<()> {
        let hosted = self.shared.hosted.write().take();
        if let Some(handle) = hosted {
            handle.disconnect().await?;
        }

        self.shared.stop();
        self.registry.release(Some(&self.shared));
        info!("Locator stopped: endpoint={}", self.shared.endpoint);
        Ok(())
    }

    /// Stop without telling anyone, as if the process crashed
    pub async fn shutdown_unclean(&self, reason: &str) {
        if let Some(handle) = self.shared.hosted_handle() {
            handle.shutdown_unclean(reason).await;
        }

        self.shared.stop();
        self.registry.release(Some(&self.shared));
        info!("Locator killed: endpoint={}, reason={}", self.shared.endpoint, reason);
    }
}

impl Drop for Locator {
    fn drop(&mut self) {
        self.shared.stop();
        self.registry.release(Some(&self.shared));
    }
}

impl std::fmt::Debug for Locator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Locator")
            .field("endpoint", &self.shared.endpoint)
            .field("view_id", &self.shared.current_view().map(|v| v.id()))
            .finish()
    }
}

/// Save locator states one at a time. States published while a save is in
/// progress collapse into the latest one.
async fn write_states(file: LocatorStateFile, mut states: watch::Receiver<Option<LocatorState>>) {
    while states.changed().await.is_ok() {
        let state = states.borrow_and_update().clone();
        let Some(state) = state else {
            continue;
        };

        if let Err(e) = file.save(&state).await {
            warn!(
                "Failed to save locator state: path={}, error={}",
                file.path().display(),
                e
            );
        }
    }
}

/// Replace a wildcard bind address with one peers can dial
fn advertised(addr: SocketAddr) -> SocketAddr {
    if addr.ip().is_unspecified() {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), addr.port())
    } else {
        addr
    }
}
