#![allow(dead_code)]

use datagrid_cluster::{
    Locator, LocatorConfig, LocatorRegistry, Member, MembershipConfig, MembershipHandle,
    MembershipListener, View,
};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

/// Generous bound for anything the failure detector has to notice
pub const SETTLE: Duration = Duration::from_secs(15);

pub fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

pub fn locator_list(ports: &[u16]) -> String {
    ports
        .iter()
        .map(|port| format!("localhost[{}]", port))
        .collect::<Vec<_>>()
        .join(",")
}

/// Fast timings so crashes are noticed within a second or two
pub fn fast_config(ports: &[u16]) -> MembershipConfig {
    let mut config = MembershipConfig::with_locators(locator_list(ports));
    config.member_timeout_ms = 300;
    config.join_timeout_ms = 8000;
    config.reconnect_wait_ms = 200;
    config
}

/// A locator in its own simulated process
pub struct LocatorProcess {
    pub registry: LocatorRegistry,
    pub locator: Locator,
}

impl LocatorProcess {
    pub async fn start(port: u16, config: MembershipConfig) -> Self {
        let registry = LocatorRegistry::new();
        let locator = Locator::start(&registry, LocatorConfig::new(port), config)
            .await
            .unwrap();
        Self { registry, locator }
    }

    pub fn member(&self) -> MembershipHandle {
        self.locator.hosted_member().unwrap()
    }
}

#[derive(Default)]
pub struct Recorder {
    pub views: Mutex<Vec<u64>>,
    pub joined: Mutex<Vec<Member>>,
    pub departed: Mutex<Vec<(Member, bool)>>,
    pub suspects: Mutex<Vec<(Member, String)>>,
    pub quorum_lost: Mutex<Vec<(Vec<Member>, Vec<Member>)>>,
    pub forced: Mutex<Vec<String>>,
}

impl Recorder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

impl MembershipListener for Recorder {
    fn on_view_change(&self, view: &View) {
        self.views.lock().push(view.id());
    }

    fn on_member_joined(&self, member: &Member) {
        self.joined.lock().push(member.clone());
    }

    fn on_member_departed(&self, member: &Member, crashed: bool) {
        self.departed.lock().push((member.clone(), crashed));
    }

    fn on_suspect(&self, suspect: &Member, _reporter: &Member, reason: &str) {
        self.suspects.lock().push((suspect.clone(), reason.to_string()));
    }

    fn on_quorum_lost(&self, failed: &[Member], remaining: &[Member]) {
        self.quorum_lost.lock().push((failed.to_vec(), remaining.to_vec()));
    }

    fn on_forced_disconnect(&self, reason: &str) {
        self.forced.lock().push(reason.to_string());
    }
}
