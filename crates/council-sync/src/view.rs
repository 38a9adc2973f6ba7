//! The mounted session view.
//!
//! Owns one channel client per purpose for the current session plus one
//! amendment-vote channel per watched amendment, routes their bodies into
//! the [`VoteBoard`] or a refetch, and turns user actions into REST calls
//! followed by a publish so other clients get a fresh snapshot.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use council_bus::Connector;
use metrics::counter;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::backend::{BackendError, CouncilBackend};
use crate::channel::{
    ChannelClient, ChannelError, ChannelPurpose, ConnectionState, ReconnectPolicy, SendOutcome,
    Visibility, VisibilitySignal,
};
use crate::lifecycle::{LifecycleError, Transition};
use crate::message::{self, ChannelMessage, Notice};
use crate::model::{
    Amendment, EntityId, EntityKey, EntityKind, EntityStatus, SessionId, Tally, TallySnapshot,
    Topic, VoteType,
};
use crate::reconcile::{Reconciled, VoteBoard, VoteDecision};

const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ViewEvent {
    TallyUpdated {
        key: EntityKey,
        tally: Tally,
        status: EntityStatus,
    },
    VotingChanged {
        key: EntityKey,
        enabled: bool,
    },
    OwnVoteReset {
        key: EntityKey,
    },
    PresenterChanged(Option<EntityId>),
    TopicsRefreshed(Vec<Topic>),
    AmendmentsRefreshed {
        topic: EntityId,
        amendments: Vec<Amendment>,
    },
    AmendmentDeleted(EntityId),
    /// `amendment` is set for amendment-vote channels.
    Connection {
        purpose: ChannelPurpose,
        amendment: Option<EntityId>,
        state: ConnectionState,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoteOutcome {
    Cast,
    /// Same value as the current vote; no request was made.
    Unchanged,
}

#[derive(Debug, Error)]
pub enum ViewError {
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error("{key} is {status}, voting is closed")]
    VotingClosed { key: EntityKey, status: EntityStatus },
    #[error("{0} is not known to this view")]
    UnknownEntity(EntityKey),
    #[error("no session is mounted")]
    NotMounted,
    #[error("session view is closed")]
    Closed,
}

/// A body tagged with the scope (session or amendment id) its channel was
/// open for when it arrived.
struct Inbound {
    scope: u64,
    purpose: ChannelPurpose,
    body: Bytes,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Refetch {
    Topics,
    Amendments,
}

/// Builds channel clients whose bodies all land in the view's router.
struct ChannelFactory {
    connector: Arc<dyn Connector>,
    policy: ReconnectPolicy,
    visibility: VisibilitySignal,
    inbound: mpsc::UnboundedSender<Inbound>,
}

impl ChannelFactory {
    fn build(&self, purpose: ChannelPurpose) -> ChannelClient {
        let client = ChannelClient::for_purpose(
            purpose,
            Arc::clone(&self.connector),
            self.policy.clone(),
            self.visibility.subscribe(),
        );
        let inbound = self.inbound.clone();
        client.subscribe_scoped(move |scope, body| {
            let _ = inbound.send(Inbound {
                scope,
                purpose,
                body: body.clone(),
            });
        });
        client
    }
}

struct AmendmentChannel {
    client: Arc<ChannelClient>,
    forward: JoinHandle<()>,
}

impl AmendmentChannel {
    fn close(self) {
        self.forward.abort();
        self.client.close();
    }
}

struct SessionChannels {
    vote: ChannelClient,
    presenter: ChannelClient,
    new_topics: ChannelClient,
    new_amendments: ChannelClient,
}

impl SessionChannels {
    fn all(&self) -> [&ChannelClient; 4] {
        [
            &self.vote,
            &self.presenter,
            &self.new_topics,
            &self.new_amendments,
        ]
    }

    fn get(&self, purpose: ChannelPurpose) -> Option<&ChannelClient> {
        self.all().into_iter().find(|client| client.purpose() == purpose)
    }
}

struct ViewShared {
    backend: Arc<dyn CouncilBackend>,
    factory: ChannelFactory,
    channels: SessionChannels,
    amendment_channels: Mutex<HashMap<EntityId, AmendmentChannel>>,
    /// Held while switching sessions and while applying anything scoped to
    /// the current one.
    session: Mutex<Option<SessionId>>,
    /// Bumped on every session switch; refetches started earlier are dropped.
    epoch: AtomicU64,
    refetch: mpsc::UnboundedSender<Refetch>,
    board: Mutex<VoteBoard>,
    topics: Mutex<Vec<Topic>>,
    amendments: Mutex<BTreeMap<EntityId, Vec<Amendment>>>,
    watched: Mutex<BTreeSet<EntityId>>,
    presented: watch::Sender<Option<EntityId>>,
    events: broadcast::Sender<ViewEvent>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

pub struct SessionView {
    shared: Arc<ViewShared>,
}

impl SessionView {
    /// Creates an unmounted view. Must be called inside a tokio runtime.
    pub fn new(
        connector: Arc<dyn Connector>,
        backend: Arc<dyn CouncilBackend>,
        policy: ReconnectPolicy,
    ) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (refetch_tx, refetch_rx) = mpsc::unbounded_channel();
        let factory = ChannelFactory {
            connector,
            policy,
            visibility: VisibilitySignal::new(),
            inbound: inbound_tx,
        };
        let channels = SessionChannels {
            vote: factory.build(ChannelPurpose::Vote),
            presenter: factory.build(ChannelPurpose::Presenter),
            new_topics: factory.build(ChannelPurpose::NewTopic),
            new_amendments: factory.build(ChannelPurpose::NewAmendment),
        };
        let (presented, _) = watch::channel(None);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        let shared = Arc::new(ViewShared {
            backend,
            factory,
            channels,
            amendment_channels: Mutex::new(HashMap::new()),
            session: Mutex::new(None),
            epoch: AtomicU64::new(0),
            refetch: refetch_tx,
            board: Mutex::new(VoteBoard::new()),
            topics: Mutex::new(Vec::new()),
            amendments: Mutex::new(BTreeMap::new()),
            watched: Mutex::new(BTreeSet::new()),
            presented,
            events,
            tasks: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        });

        let mut tasks = vec![
            tokio::spawn(route(Arc::clone(&shared), inbound_rx)),
            tokio::spawn(refetch(Arc::clone(&shared), refetch_rx)),
        ];
        for client in shared.channels.all() {
            tasks.push(forward_state(&shared.events, client, None));
        }
        shared.tasks.lock().extend(tasks);

        Self { shared }
    }

    /// Opens the session channels and seeds the board from the topic list.
    ///
    /// Mounting another session discards everything known about the old
    /// one, including queued publishes.
    pub async fn mount(&self, session: SessionId) -> Result<Vec<Topic>, ViewError> {
        let shared = &self.shared;
        if shared.is_closed() {
            return Err(ViewError::Closed);
        }
        let previous = {
            let mut current = shared.session.lock();
            let previous = current.replace(session);
            if previous != Some(session) {
                shared.epoch.fetch_add(1, Ordering::SeqCst);
                shared.reset();
            }
            previous
        };
        if previous != Some(session) {
            info!(
                target = "council.view",
                session,
                previous = ?previous,
                "mounting session"
            );
        }
        for client in shared.channels.all() {
            client.open(session);
        }
        Ok(shared.refresh_topics().await?)
    }

    pub async fn switch_session(&self, session: SessionId) -> Result<Vec<Topic>, ViewError> {
        self.mount(session).await
    }

    pub fn session(&self) -> Option<SessionId> {
        *self.shared.session.lock()
    }

    /// Fetches the topic's amendments and keeps one live channel per
    /// amendment until the topic is unwatched.
    pub async fn watch_amendments(&self, topic: EntityId) -> Result<Vec<Amendment>, ViewError> {
        let shared = &self.shared;
        if shared.is_closed() {
            return Err(ViewError::Closed);
        }
        shared.require_session()?;
        shared.watched.lock().insert(topic);
        Ok(shared.refresh_amendments(topic).await?)
    }

    pub fn unwatch_amendments(&self, topic: EntityId) {
        let shared = &self.shared;
        if !shared.watched.lock().remove(&topic) {
            return;
        }
        let amendments = shared.amendments.lock().remove(&topic).unwrap_or_default();
        for amendment in amendments {
            shared.forget_amendment(amendment.id);
        }
    }

    pub async fn cast_vote(&self, topic: EntityId, vote: VoteType) -> Result<VoteOutcome, ViewError> {
        self.vote(EntityKey::topic(topic), vote).await
    }

    pub async fn cast_amendment_vote(
        &self,
        amendment: EntityId,
        vote: VoteType,
    ) -> Result<VoteOutcome, ViewError> {
        self.vote(EntityKey::amendment(amendment), vote).await
    }

    async fn vote(&self, key: EntityKey, vote: VoteType) -> Result<VoteOutcome, ViewError> {
        let shared = &self.shared;
        if shared.is_closed() {
            return Err(ViewError::Closed);
        }
        let previous = {
            let mut board = shared.board.lock();
            match board.prepare_vote(key, vote) {
                VoteDecision::Proceed { previous } => {
                    board.record_vote(key, vote);
                    previous
                }
                VoteDecision::AlreadyRecorded => {
                    debug!(target = "council.view", %key, %vote, "vote unchanged, skipping request");
                    return Ok(VoteOutcome::Unchanged);
                }
                VoteDecision::Closed(status) => {
                    return Err(ViewError::VotingClosed { key, status });
                }
                VoteDecision::Unknown => return Err(ViewError::UnknownEntity(key)),
            }
        };

        if let Err(err) = shared.backend.cast_vote(key, vote).await {
            {
                let mut board = shared.board.lock();
                // A restart broadcast may have reset the vote meanwhile.
                if board.current_vote(key) == vote {
                    board.restore_vote(key, previous);
                }
            }
            if err.is_conflict() {
                warn!(target = "council.view", %key, %vote, error = %err, "vote rejected by server");
            } else {
                warn!(target = "council.view", %key, %vote, error = %err, "vote request failed");
            }
            return Err(err.into());
        }

        info!(target = "council.view", %key, %vote, "vote cast");
        shared.publish(key).await;
        Ok(VoteOutcome::Cast)
    }

    /// Validates the transition against the known status, then asks the
    /// backend to perform it.
    pub async fn transition(&self, key: EntityKey, transition: Transition) -> Result<(), ViewError> {
        let shared = &self.shared;
        if shared.is_closed() {
            return Err(ViewError::Closed);
        }
        let known = shared.board.lock().status(key);
        match known {
            Some(status) => {
                status.apply(transition)?;
            }
            None => return Err(ViewError::UnknownEntity(key)),
        }
        shared.backend.transition(key, transition).await.map_err(|err| {
            warn!(target = "council.view", %key, %transition, error = %err, "transition failed");
            err
        })?;
        info!(target = "council.view", %key, %transition, "transition requested");
        shared.publish(key).await;
        Ok(())
    }

    pub async fn start(&self, key: EntityKey) -> Result<(), ViewError> {
        self.transition(key, Transition::Start).await
    }

    pub async fn finish(&self, key: EntityKey) -> Result<(), ViewError> {
        self.transition(key, Transition::Finish).await
    }

    pub async fn restart(&self, key: EntityKey) -> Result<(), ViewError> {
        self.transition(key, Transition::Restart).await
    }

    /// Moves the presenter display to `topic`.
    pub async fn present(&self, topic: EntityId) -> Result<SendOutcome, ViewError> {
        self.send_on(ChannelPurpose::Presenter, topic.to_string()).await
    }

    pub async fn announce_new_topic(&self) -> Result<SendOutcome, ViewError> {
        self.send_on(ChannelPurpose::NewTopic, Notice::NewTopic.to_wire())
            .await
    }

    pub async fn announce_new_amendment(&self) -> Result<SendOutcome, ViewError> {
        self.send_on(ChannelPurpose::NewAmendment, Notice::NewAmendment.to_wire())
            .await
    }

    pub async fn announce_amendment_deleted(
        &self,
        amendment: EntityId,
    ) -> Result<SendOutcome, ViewError> {
        let body = Notice::DeleteAmendment(amendment).to_wire();
        self.send_on(ChannelPurpose::NewAmendment, body).await
    }

    async fn send_on(&self, purpose: ChannelPurpose, body: String) -> Result<SendOutcome, ViewError> {
        let shared = &self.shared;
        if shared.is_closed() {
            return Err(ViewError::Closed);
        }
        shared.require_session()?;
        let client = shared
            .channels
            .get(purpose)
            .ok_or(ChannelError::NotOpen(purpose))?;
        Ok(client.send(body).await?)
    }

    /// Forwarded to every channel supervisor of this view.
    pub fn set_visibility(&self, visibility: Visibility) {
        self.shared.factory.visibility.set(visibility);
    }

    pub fn events(&self) -> broadcast::Receiver<ViewEvent> {
        self.shared.events.subscribe()
    }

    pub fn presented(&self) -> Option<EntityId> {
        *self.shared.presented.borrow()
    }

    pub fn presented_changes(&self) -> watch::Receiver<Option<EntityId>> {
        self.shared.presented.subscribe()
    }

    pub fn tally(&self, key: EntityKey) -> Option<Tally> {
        self.shared.board.lock().tally(key)
    }

    pub fn status(&self, key: EntityKey) -> Option<EntityStatus> {
        self.shared.board.lock().status(key)
    }

    pub fn current_vote(&self, key: EntityKey) -> VoteType {
        self.shared.board.lock().current_vote(key)
    }

    pub fn voting_enabled(&self, key: EntityKey) -> bool {
        self.shared.board.lock().voting_enabled(key)
    }

    pub fn topics(&self) -> Vec<Topic> {
        self.shared.topics.lock().clone()
    }

    pub fn amendments(&self, topic: EntityId) -> Vec<Amendment> {
        self.shared
            .amendments
            .lock()
            .get(&topic)
            .cloned()
            .unwrap_or_default()
    }

    pub fn connection(&self, purpose: ChannelPurpose) -> ConnectionState {
        self.shared
            .channels
            .get(purpose)
            .map_or(ConnectionState::Disconnected, ChannelClient::state)
    }

    pub fn amendment_connection(&self, amendment: EntityId) -> Option<ConnectionState> {
        self.shared
            .amendment_channels
            .lock()
            .get(&amendment)
            .map(|channel| channel.client.state())
    }

    /// Closes every channel and stops routing. Idempotent.
    pub fn close(&self) {
        let shared = &self.shared;
        if shared.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        for task in shared.tasks.lock().drain(..) {
            task.abort();
        }
        for client in shared.channels.all() {
            client.close();
        }
        for (_, channel) in shared.amendment_channels.lock().drain() {
            channel.close();
        }
        info!(target = "council.view", session = ?*shared.session.lock(), "session view closed");
    }
}

impl Drop for SessionView {
    fn drop(&mut self) {
        self.close();
    }
}

impl ViewShared {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    fn require_session(&self) -> Result<SessionId, ViewError> {
        (*self.session.lock()).ok_or(ViewError::NotMounted)
    }

    fn emit(&self, event: ViewEvent) {
        // No receivers is fine.
        let _ = self.events.send(event);
    }

    fn reset(&self) {
        for (_, channel) in self.amendment_channels.lock().drain() {
            channel.close();
        }
        self.board.lock().clear();
        self.topics.lock().clear();
        self.amendments.lock().clear();
        self.watched.lock().clear();
        self.presented.send_replace(None);
    }

    fn reconcile(&self, kind: EntityKind, snapshot: &TallySnapshot) {
        let merged = self.board.lock().apply_snapshot(kind, snapshot);
        self.emit_reconciled(merged);
    }

    fn emit_reconciled(&self, merged: Reconciled) {
        let key = merged.key;
        if merged.tally_changed || merged.status_changed() {
            self.emit(ViewEvent::TallyUpdated {
                key,
                tally: merged.tally,
                status: merged.status,
            });
        }
        let was_enabled = merged.previous_status.map(EntityStatus::accepts_votes);
        if was_enabled != Some(merged.voting_enabled) {
            debug!(
                target = "council.view",
                %key,
                status = %merged.status,
                enabled = merged.voting_enabled,
                "voting state changed"
            );
            self.emit(ViewEvent::VotingChanged {
                key,
                enabled: merged.voting_enabled,
            });
        }
        if merged.own_vote_reset {
            info!(target = "council.view", %key, "entity restarted, own vote reset");
            self.emit(ViewEvent::OwnVoteReset { key });
        }
    }

    fn set_presented(&self, topic: Option<EntityId>) {
        let changed = self.presented.send_if_modified(|current| {
            if *current == topic {
                false
            } else {
                *current = topic;
                true
            }
        });
        if changed {
            self.emit(ViewEvent::PresenterChanged(topic));
        }
    }

    async fn refresh_topics(&self) -> Result<Vec<Topic>, BackendError> {
        let (session, epoch) = {
            let current = self.session.lock();
            match *current {
                Some(session) => (session, self.epoch()),
                None => return Ok(Vec::new()),
            }
        };
        let topics = self.backend.list_topics(session).await?;
        let merged: Vec<Reconciled> = {
            let _current = self.session.lock();
            if epoch != self.epoch() || self.is_closed() {
                return Ok(topics);
            }
            let merged = {
                let mut board = self.board.lock();
                topics.iter().map(|topic| board.seed(topic)).collect()
            };
            *self.topics.lock() = topics.clone();
            merged
        };
        for entry in merged {
            self.emit_reconciled(entry);
        }
        debug!(target = "council.view", session, count = topics.len(), "topics refreshed");
        self.emit(ViewEvent::TopicsRefreshed(topics.clone()));
        Ok(topics)
    }

    async fn refresh_amendments(&self, topic: EntityId) -> Result<Vec<Amendment>, BackendError> {
        let epoch = self.epoch();
        let amendments = self.backend.list_amendments(topic).await?;
        let merged: Vec<Reconciled> = {
            let _current = self.session.lock();
            if epoch != self.epoch() || self.is_closed() || !self.watched.lock().contains(&topic) {
                return Ok(amendments);
            }

            let current: BTreeSet<EntityId> = amendments.iter().map(|a| a.id).collect();
            let previous = self
                .amendments
                .lock()
                .insert(topic, amendments.clone())
                .unwrap_or_default();
            for gone in previous.iter().filter(|a| !current.contains(&a.id)) {
                self.forget_amendment(gone.id);
            }

            let merged = {
                let mut board = self.board.lock();
                amendments.iter().map(|a| board.seed(a)).collect()
            };

            let mut channels = self.amendment_channels.lock();
            for amendment in &amendments {
                if channels.contains_key(&amendment.id) {
                    continue;
                }
                let client = Arc::new(self.factory.build(ChannelPurpose::AmendmentVote));
                client.open(amendment.id);
                let forward = forward_state(&self.events, &client, Some(amendment.id));
                channels.insert(amendment.id, AmendmentChannel { client, forward });
            }
            merged
        };
        for entry in merged {
            self.emit_reconciled(entry);
        }

        debug!(target = "council.view", topic, count = amendments.len(), "amendments refreshed");
        self.emit(ViewEvent::AmendmentsRefreshed {
            topic,
            amendments: amendments.clone(),
        });
        Ok(amendments)
    }

    async fn refresh_watched(&self) {
        let watched: Vec<EntityId> = self.watched.lock().iter().copied().collect();
        for topic in watched {
            if let Err(err) = self.refresh_amendments(topic).await {
                warn!(target = "council.view", topic, error = %err, "amendment refetch failed");
            }
        }
    }

    fn request_refetch(&self, request: Refetch) {
        let _ = self.refetch.send(request);
    }

    /// Drops an amendment from the board and closes its channel.
    fn forget_amendment(&self, amendment: EntityId) -> bool {
        let channel = self.amendment_channels.lock().remove(&amendment);
        let had_channel = channel.is_some();
        if let Some(channel) = channel {
            channel.close();
        }
        let removed = self.board.lock().remove(EntityKey::amendment(amendment));
        for list in self.amendments.lock().values_mut() {
            list.retain(|a| a.id != amendment);
        }
        removed || had_channel
    }

    /// Applies one inbound body if it still belongs to the mounted session.
    fn dispatch(&self, inbound: Inbound) {
        let Inbound {
            scope,
            purpose,
            body,
        } = inbound;
        let session = self.session.lock();
        let current = match purpose {
            ChannelPurpose::AmendmentVote => self.amendment_channels.lock().contains_key(&scope),
            _ => *session == Some(scope),
        };
        if !current {
            debug!(target = "council.view", purpose = %purpose, scope, "dropping body from a previous scope");
            return;
        }

        let decoded = match message::decode(purpose, &body) {
            Ok(decoded) => decoded,
            Err(err) => {
                counter!("council_protocol_errors_total", 1, "purpose" => purpose.as_str());
                warn!(
                    target = "council.view",
                    purpose = %purpose,
                    error = %err,
                    "dropping undecodable message"
                );
                return;
            }
        };

        match decoded {
            ChannelMessage::Tally(snapshot) => {
                let kind = match purpose {
                    ChannelPurpose::AmendmentVote => EntityKind::Amendment,
                    _ => EntityKind::Topic,
                };
                self.reconcile(kind, &snapshot);
            }
            ChannelMessage::Presented(topic) => self.set_presented(topic),
            ChannelMessage::Notice(Notice::NewTopic) => self.request_refetch(Refetch::Topics),
            ChannelMessage::Notice(Notice::NewAmendment) => {
                self.request_refetch(Refetch::Amendments);
            }
            ChannelMessage::Notice(Notice::DeleteAmendment(id)) => {
                if self.forget_amendment(id) {
                    self.emit(ViewEvent::AmendmentDeleted(id));
                }
                self.request_refetch(Refetch::Amendments);
            }
            ChannelMessage::Notice(Notice::Other(raw)) => {
                debug!(target = "council.view", purpose = %purpose, notice = %raw, "ignoring unknown notice");
            }
        }
    }

    /// Publishes the entity id so the server re-broadcasts its snapshot.
    async fn publish(&self, key: EntityKey) {
        let body = key.id.to_string();
        let result = match key.kind {
            EntityKind::Topic => self.channels.vote.send(body).await,
            EntityKind::Amendment => {
                let client = self
                    .amendment_channels
                    .lock()
                    .get(&key.id)
                    .map(|channel| Arc::clone(&channel.client));
                match client {
                    Some(client) => client.send(body).await,
                    None => {
                        debug!(target = "council.view", %key, "amendment not watched, skipping publish");
                        return;
                    }
                }
            }
        };
        match result {
            Ok(SendOutcome::Sent) => {}
            Ok(outcome) => {
                debug!(target = "council.view", %key, ?outcome, "publish not sent yet");
            }
            Err(err) => {
                warn!(target = "council.view", %key, error = %err, "publish failed");
            }
        }
    }
}

async fn route(shared: Arc<ViewShared>, mut inbound: mpsc::UnboundedReceiver<Inbound>) {
    while let Some(message) = inbound.recv().await {
        if shared.is_closed() {
            break;
        }
        shared.dispatch(message);
    }
}

/// Runs refetches off the router so a slow backend never holds up live
/// snapshots. Requests that pile up meanwhile collapse into one of each.
async fn refetch(shared: Arc<ViewShared>, mut requests: mpsc::UnboundedReceiver<Refetch>) {
    while let Some(first) = requests.recv().await {
        let mut pending = BTreeSet::from([first]);
        while let Ok(next) = requests.try_recv() {
            pending.insert(next);
        }
        for request in pending {
            if shared.is_closed() {
                return;
            }
            match request {
                Refetch::Topics => {
                    if let Err(err) = shared.refresh_topics().await {
                        warn!(target = "council.view", error = %err, "topic refetch failed");
                    }
                }
                Refetch::Amendments => shared.refresh_watched().await,
            }
        }
    }
}

fn forward_state(
    events: &broadcast::Sender<ViewEvent>,
    client: &ChannelClient,
    amendment: Option<EntityId>,
) -> JoinHandle<()> {
    let mut states = client.state_changes();
    let events = events.clone();
    let purpose = client.purpose();
    tokio::spawn(async move {
        while states.changed().await.is_ok() {
            let state = *states.borrow_and_update();
            let _ = events.send(ViewEvent::Connection {
                purpose,
                amendment,
                state,
            });
        }
    })
}
