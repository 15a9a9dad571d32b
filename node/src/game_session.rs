//! Lobby/game session actor
//!
//! Owns the player roster, the committed reservation list and a two-phase
//! merge: `StartMerge` stages reservations and hands out their indices,
//! `EndMerge` makes them visible. Player indices never change once assigned
//! and are never reused within a session.

use crate::actor::{Actor, ActorRef, CallChain, Turn};
use crate::error::ActorError;
use async_trait::async_trait;
use log::{debug, info, warn};
use shared::{
    PlayerContext, PlayerIndex, PlayerMutableState, ProfileId, Reservation, ServerId, SessionId,
    INVALID_PLAYER_INDEX,
};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::broadcast;

const EVENT_BUFFER: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    PlayerAdded {
        index: PlayerIndex,
        profile_id: ProfileId,
    },
    PlayerRemoved {
        index: PlayerIndex,
        profile_id: ProfileId,
    },
    PlayerStateChanged {
        index: PlayerIndex,
        state: PlayerMutableState,
    },
    MergeStarted {
        indices: Vec<PlayerIndex>,
    },
    MergeCommitted {
        indices: Vec<PlayerIndex>,
    },
    ServerAcquired {
        server_id: ServerId,
    },
    Closed,
}

/// Dedicated-server operations a session needs, resolved by the runtime
#[async_trait]
pub trait ServerControl: Send + Sync {
    async fn acquire_server(&self, chain: &CallChain, session_id: SessionId) -> Result<ServerId, ActorError>;
    async fn release_server(
        &self,
        chain: &CallChain,
        server_id: ServerId,
        session_id: SessionId,
    ) -> Result<(), ActorError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddPlayerOutcome {
    pub index: PlayerIndex,
    pub success: bool,
}

impl AddPlayerOutcome {
    fn added(index: PlayerIndex) -> Self {
        Self { index, success: true }
    }

    fn failed() -> Self {
        Self {
            index: INVALID_PLAYER_INDEX,
            success: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PlayerSlot {
    pub context: PlayerContext,
    pub state: PlayerMutableState,
}

pub struct GameSession {
    session_id: SessionId,
    capacity: usize,
    roster: BTreeMap<PlayerIndex, PlayerSlot>,
    reservations: Arc<Vec<Reservation>>,
    reserved: HashMap<ProfileId, PlayerIndex>,
    staged: Option<Vec<(PlayerIndex, Reservation)>>,
    next_index: PlayerIndex,
    server: Option<ServerId>,
    closed: bool,
    events: broadcast::Sender<SessionEvent>,
    servers: Arc<dyn ServerControl>,
}

impl Actor for GameSession {
    const KIND: &'static str = "GameSession";
}

impl GameSession {
    pub fn new(session_id: SessionId, capacity: usize, servers: Arc<dyn ServerControl>) -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            session_id,
            capacity,
            roster: BTreeMap::new(),
            reservations: Arc::new(Vec::new()),
            reserved: HashMap::new(),
            staged: None,
            next_index: 0,
            server: None,
            closed: false,
            events,
            servers,
        }
    }

    fn emit(&self, event: SessionEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    fn index_of(&self, profile_id: ProfileId) -> Option<PlayerIndex> {
        self.roster
            .iter()
            .find(|(_, slot)| slot.context.profile_id == profile_id)
            .map(|(index, _)| *index)
    }

    /// Slots taken by joined players, reserved players not yet joined and
    /// reservations staged by a pending merge
    fn occupied(&self) -> usize {
        let waiting = self
            .reserved
            .values()
            .filter(|index| !self.roster.contains_key(index))
            .count();
        let staged = self.staged.as_ref().map_or(0, Vec::len);
        self.roster.len() + waiting + staged
    }

    /// Whether deactivation would lose players, reservations, a pending
    /// merge or a bound dedicated server
    fn has_live_state(&self) -> bool {
        !self.closed
            && (!self.roster.is_empty()
                || !self.reservations.is_empty()
                || self.staged.is_some()
                || self.server.is_some())
    }

    fn allocate_index(&mut self) -> PlayerIndex {
        let index = self.next_index;
        self.next_index += 1;
        index
    }

    fn add_player(&mut self, context: PlayerContext, state: Option<PlayerMutableState>) -> AddPlayerOutcome {
        let profile_id = context.profile_id;
        if self.closed || profile_id == 0 || self.index_of(profile_id).is_some() {
            return AddPlayerOutcome::failed();
        }

        let index = match self.reserved.get(&profile_id) {
            Some(index) => *index,
            None if self.occupied() >= self.capacity => return AddPlayerOutcome::failed(),
            None => self.allocate_index(),
        };

        let mut state = state.unwrap_or_default();
        state.profile_id = profile_id;
        info!(
            "Session {}: player {} ({}) joined at index {}",
            self.session_id, profile_id, context.display_name, index
        );
        self.roster.insert(index, PlayerSlot { context, state });
        self.emit(SessionEvent::PlayerAdded { index, profile_id });
        AddPlayerOutcome::added(index)
    }

    fn start_merge(&mut self, reservations: Vec<Reservation>) -> Result<Vec<PlayerIndex>, ActorError> {
        if self.closed {
            return Err(ActorError::invalid_operation("session is closed"));
        }
        if self.staged.is_some() {
            return Err(ActorError::invalid_operation("a merge is already in progress"));
        }
        if self.occupied() + reservations.len() > self.capacity {
            return Err(ActorError::invalid_operation(format!(
                "merging {} reservations exceeds capacity {}",
                reservations.len(),
                self.capacity
            )));
        }
        for (i, reservation) in reservations.iter().enumerate() {
            let profile_id = reservation.profile_id;
            let duplicate = reservations[..i].iter().any(|r| r.profile_id == profile_id);
            if profile_id == 0
                || duplicate
                || self.reserved.contains_key(&profile_id)
                || self.index_of(profile_id).is_some()
            {
                return Err(ActorError::invalid_argument(format!(
                    "profile {} cannot be reserved in session {}",
                    profile_id, self.session_id
                )));
            }
        }

        // Indices follow slot order; results follow input order
        let mut order: Vec<usize> = (0..reservations.len()).collect();
        order.sort_by_key(|&i| (reservations[i].slot_group_index, reservations[i].slot_index()));
        let mut indices = vec![INVALID_PLAYER_INDEX; reservations.len()];
        for i in order {
            indices[i] = self.allocate_index();
        }

        self.staged = Some(indices.iter().copied().zip(reservations).collect());
        self.emit(SessionEvent::MergeStarted {
            indices: indices.clone(),
        });
        Ok(indices)
    }

    fn end_merge(&mut self) -> Result<Vec<PlayerIndex>, ActorError> {
        let staged = self
            .staged
            .take()
            .ok_or_else(|| ActorError::invalid_operation("no merge in progress"))?;

        let mut reservations = self.reservations.as_ref().clone();
        let mut indices = Vec::with_capacity(staged.len());
        for (index, reservation) in staged {
            self.reserved.insert(reservation.profile_id, index);
            indices.push(index);
            reservations.push(reservation);
        }
        reservations.sort_by_key(|r| (r.slot_group_index, r.slot_index()));
        self.reservations = Arc::new(reservations);

        info!(
            "Session {}: merge committed {} reservations",
            self.session_id,
            indices.len()
        );
        self.emit(SessionEvent::MergeCommitted {
            indices: indices.clone(),
        });
        Ok(indices)
    }
}

/// Pins the session against idle collection while it holds live state
fn sync_pin(turn: &Turn<GameSession>, session: &GameSession) {
    if session.has_live_state() {
        turn.pin();
    } else {
        turn.unpin();
    }
}

/// Typed address of a [`GameSession`]
#[derive(Clone, Debug)]
pub struct GameSessionRef(ActorRef<GameSession>);

impl From<ActorRef<GameSession>> for GameSessionRef {
    fn from(actor: ActorRef<GameSession>) -> Self {
        Self(actor)
    }
}

impl GameSessionRef {
    pub fn session_id(&self) -> SessionId {
        self.0.id().key
    }

    pub async fn add_player(
        &self,
        chain: &CallChain,
        context: PlayerContext,
        state: Option<PlayerMutableState>,
    ) -> Result<AddPlayerOutcome, ActorError> {
        self.0
            .call(chain, move |turn| async move {
                let mut session = turn.state().await;
                let outcome = session.add_player(context, state);
                sync_pin(&turn, &session);
                Ok(outcome)
            })
            .await
    }

    pub async fn remove_player(&self, chain: &CallChain, profile_id: ProfileId) -> Result<bool, ActorError> {
        self.0
            .call(chain, move |turn| async move {
                let mut session = turn.state().await;
                let Some(index) = session.index_of(profile_id) else {
                    return Ok(false);
                };
                session.roster.remove(&index);
                info!(
                    "Session {}: player {} left index {}",
                    session.session_id, profile_id, index
                );
                session.emit(SessionEvent::PlayerRemoved { index, profile_id });
                sync_pin(&turn, &session);
                Ok(true)
            })
            .await
    }

    pub async fn get_players(&self, chain: &CallChain) -> Result<Vec<PlayerIndex>, ActorError> {
        self.0
            .call(chain, |turn| async move {
                Ok(turn.state().await.roster.keys().copied().collect())
            })
            .await
    }

    /// Committed reservations; staged ones stay hidden until `end_merge`
    pub async fn get_reservations(&self, chain: &CallChain) -> Result<Arc<Vec<Reservation>>, ActorError> {
        self.0
            .call(chain, |turn| async move {
                Ok(Arc::clone(&turn.state().await.reservations))
            })
            .await
    }

    /// Fire-and-forget; observe the outcome through session events
    pub fn set_player_mutable_state(&self, chain: &CallChain, state: PlayerMutableState) -> Result<(), ActorError> {
        self.0.tell(chain, move |turn| async move {
            let mut session = turn.state().await;
            let Some(index) = session.index_of(state.profile_id) else {
                debug!(
                    "Session {}: state update for absent player {}",
                    session.session_id, state.profile_id
                );
                return;
            };
            if let Some(slot) = session.roster.get_mut(&index) {
                slot.state = state.clone();
            }
            session.emit(SessionEvent::PlayerStateChanged { index, state });
        })
    }

    pub async fn start_merge(
        &self,
        chain: &CallChain,
        reservations: Vec<Reservation>,
    ) -> Result<Vec<PlayerIndex>, ActorError> {
        self.0
            .call(chain, move |turn| async move {
                let mut session = turn.state().await;
                let indices = session.start_merge(reservations)?;
                sync_pin(&turn, &session);
                Ok(indices)
            })
            .await
    }

    pub async fn end_merge(&self, chain: &CallChain) -> Result<Vec<PlayerIndex>, ActorError> {
        self.0
            .call(chain, |turn| async move {
                let mut session = turn.state().await;
                let indices = session.end_merge()?;
                sync_pin(&turn, &session);
                Ok(indices)
            })
            .await
    }

    /// Forced teardown; a second close is a no-op
    pub async fn close_internal(&self, chain: &CallChain) -> Result<(), ActorError> {
        self.0
            .call(chain, |turn| async move {
                let (servers, server, session_id) = {
                    let mut session = turn.state().await;
                    if session.closed {
                        return Ok(());
                    }
                    session.closed = true;
                    session.staged = None;
                    session.roster.clear();
                    let bound = (Arc::clone(&session.servers), session.server.take(), session.session_id);
                    sync_pin(&turn, &session);
                    bound
                };

                if let Some(server_id) = server {
                    if let Err(e) = servers.release_server(turn.chain(), server_id, session_id).await {
                        warn!(
                            "Session {}: failed to release dedicated server {}: {}",
                            session_id, server_id, e
                        );
                    }
                }

                info!("Session {} closed", session_id);
                turn.state().await.emit(SessionEvent::Closed);
                Ok(())
            })
            .await
    }

    /// Binds an enlisted dedicated server, or returns the one already bound
    pub async fn acquire_server(&self, chain: &CallChain) -> Result<ServerId, ActorError> {
        self.0
            .call(chain, |turn| async move {
                let (servers, session_id) = {
                    let session = turn.state().await;
                    if session.closed {
                        return Err(ActorError::invalid_operation("session is closed"));
                    }
                    if let Some(server_id) = session.server {
                        return Ok(server_id);
                    }
                    (Arc::clone(&session.servers), session.session_id)
                };

                let server_id = servers.acquire_server(turn.chain(), session_id).await?;

                let mut session = turn.state().await;
                session.server = Some(server_id);
                session.emit(SessionEvent::ServerAcquired { server_id });
                sync_pin(&turn, &session);
                Ok(server_id)
            })
            .await
    }

    pub async fn server(&self, chain: &CallChain) -> Result<Option<ServerId>, ActorError> {
        self.0
            .call(chain, |turn| async move { Ok(turn.state().await.server) })
            .await
    }

    pub async fn is_closed(&self, chain: &CallChain) -> Result<bool, ActorError> {
        self.0
            .call(chain, |turn| async move { Ok(turn.state().await.closed) })
            .await
    }

    pub async fn subscribe(&self, chain: &CallChain) -> Result<broadcast::Receiver<SessionEvent>, ActorError> {
        self.0
            .call(chain, |turn| async move {
                Ok(turn.state().await.events.subscribe())
            })
            .await
    }
}
