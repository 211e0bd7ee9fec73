//! Shared fixtures for the integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use device_keeper::connection::device::{ConnectionContext, ConnectionSettings};
use device_keeper::connection::registry::ConnectionRegistry;
use device_keeper::connection::scheduler::Scheduler;
use device_keeper::connection::transport::{Dialer, Link, LinkError, LinkPeer, SocketEvent};
use device_keeper::directory::adapter::{ConnectionTarget, DeviceAddress, DeviceProfile, Platform};
use device_keeper::directory::memory::MemoryDirectory;
use device_keeper::sync::{DeviceSync, SyncError, SyncOutcome};

/// What the scripted dialer does for one attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Accept,
    Refuse,
    /// Accept once the delay has elapsed
    AcceptAfter(Duration),
}

/// Dialer following a script, then falling back to a default step.
/// Accepted links hand their peer side to the test.
pub struct ScriptedDialer {
    script: Mutex<VecDeque<Step>>,
    fallback: Step,
    dials: Mutex<Vec<String>>,
    peers: mpsc::UnboundedSender<(String, LinkPeer)>,
}

impl ScriptedDialer {
    pub fn new(
        script: impl IntoIterator<Item = Step>,
        fallback: Step,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<(String, LinkPeer)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let dialer = Arc::new(Self {
            script: Mutex::new(script.into_iter().collect()),
            fallback,
            dials: Mutex::new(Vec::new()),
            peers: tx,
        });
        (dialer, rx)
    }

    pub fn dial_count(&self) -> usize {
        self.dials.lock().len()
    }

    pub fn dials_to(&self, url: &str) -> usize {
        self.dials.lock().iter().filter(|u| u.as_str() == url).count()
    }

    pub fn dials(&self) -> Vec<String> {
        self.dials.lock().clone()
    }
}

#[async_trait]
impl Dialer for ScriptedDialer {
    async fn dial(&self, url: &str) -> Result<Link, LinkError> {
        self.dials.lock().push(url.to_string());
        let step = self.script.lock().pop_front().unwrap_or(self.fallback);

        match step {
            Step::Refuse => return Err(LinkError::Handshake("connection refused".to_string())),
            Step::AcceptAfter(delay) => tokio::time::sleep(delay).await,
            Step::Accept => {}
        }

        let (link, peer) = Link::channel(16);
        let _ = self.peers.send((url.to_string(), peer));
        Ok(link)
    }
}

/// Sync recording every call
#[derive(Default)]
pub struct RecordingSync {
    pub ready: Mutex<Vec<(String, String)>>,
    pub heartbeats: Mutex<Vec<(String, Vec<String>)>>,
    pub forgotten: Mutex<Vec<String>>,
}

#[async_trait]
impl DeviceSync for RecordingSync {
    async fn device_ready(
        &self,
        target: &ConnectionTarget,
        address: &DeviceAddress,
    ) -> Result<SyncOutcome, SyncError> {
        self.ready
            .lock()
            .push((target.device_id.clone(), address.endpoint()));
        Ok(SyncOutcome::Written)
    }

    async fn heartbeat(&self, agent_host: &str, device_ids: &[String]) -> Result<(), SyncError> {
        self.heartbeats
            .lock()
            .push((agent_host.to_string(), device_ids.to_vec()));
        Ok(())
    }

    fn forget(&self, device_id: &str) {
        self.forgotten.lock().push(device_id.to_string());
    }
}

pub fn target(device_id: &str, platform: Platform) -> ConnectionTarget {
    ConnectionTarget {
        host: "10.0.0.5".to_string(),
        port: 7777,
        platform,
        secret_key: "secret".to_string(),
        device_id: device_id.to_string(),
        auth_token: "token".to_string(),
        profile: DeviceProfile::default(),
    }
}

/// Settings used by the connection tests: five retries, default timings
pub fn settings() -> ConnectionSettings {
    ConnectionSettings {
        max_retries: Some(5),
        ..ConnectionSettings::default()
    }
}

pub struct Fixture {
    pub directory: Arc<MemoryDirectory>,
    pub sync: Arc<RecordingSync>,
    pub dialer: Arc<ScriptedDialer>,
    pub peers: mpsc::UnboundedReceiver<(String, LinkPeer)>,
}

impl Fixture {
    pub fn new(script: impl IntoIterator<Item = Step>, fallback: Step) -> Self {
        let (dialer, peers) = ScriptedDialer::new(script, fallback);
        Self {
            directory: Arc::new(MemoryDirectory::new()),
            sync: Arc::new(RecordingSync::default()),
            dialer,
            peers,
        }
    }

    pub fn registry(&self, settings: ConnectionSettings) -> ConnectionRegistry {
        ConnectionRegistry::new(ConnectionContext {
            scheduler: Scheduler::new(4),
            dialer: self.dialer.clone(),
            sink: self.directory.clone(),
            sync: self.sync.clone(),
            settings,
        })
    }

    /// Next accepted link, in dial order
    pub async fn next_peer(&mut self) -> (String, LinkPeer) {
        self.next_peer_within(Duration::from_millis(500)).await
    }

    pub async fn next_peer_within(&mut self, wait: Duration) -> (String, LinkPeer) {
        tokio::time::timeout(wait, self.peers.recv())
            .await
            .expect("no link accepted in time")
            .expect("dialer dropped")
    }
}

/// Let spawned tasks run without crossing any backoff or heartbeat deadline
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(10)).await;
}

pub async fn push(peer: &LinkPeer, event: SocketEvent) {
    peer.events.send(event).await.expect("connection reader gone");
}
