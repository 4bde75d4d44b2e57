//! Session core - the authoritative playback state machine
//!
//! A session is a "station": a group of up to ten listeners, a DJ whose
//! control messages are authoritative, a current track anchored in wall-clock
//! time, and a queue that advances on its own when tracks run out. All state
//! for one session sits behind a single coarse mutex; sessions never interact
//! so contention is only ever among the connections of one station.
//!
//! Positions are *anchored*: the pair `(position_ms, position_timestamp)`
//! means "the track was at `position_ms` at that wall-clock instant". Any
//! observer computes the position right now by adding elapsed time while
//! playing. Messages stay meaningful regardless of transit delay.
//!
//! The advancement timer is the one piece of machinery that keeps a station
//! on air with nobody connected: whenever the session is playing a track of
//! known duration, exactly one timer is scheduled to fire when that track
//! ends, shift the queue head into place, bump the epoch and broadcast a
//! fresh snapshot. Timer callbacks re-find their session by id and check a
//! generation counter at fire time, so a cancelled or superseded timer - or
//! one whose session has been destroyed - does nothing.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, Utf8Bytes};
use serde_json::{json, Value};
use tokio::sync::mpsc::UnboundedSender;

use crate::protocol::{
    self, ClientCommand, MemberInfo, Outbound, QueueEntry, StateSnapshot, Track,
};
use crate::AppState;

/// Member cap per session
pub const MAX_MEMBERS: usize = 10;

/// How long a memberless station with queued or playing content stays alive
pub const DESTROY_GRACE: Duration = Duration::from_secs(5 * 60);

/// Sessions without any inbound activity for this long are torn down
pub const IDLE_TTL_MS: f64 = 30.0 * 60.0 * 1000.0;

/// Cadence of the idle sweep
pub const IDLE_SWEEP_INTERVAL: Duration = Duration::from_secs(15);

/// One connected listener
pub struct Member {
    pub user_id: String,
    pub display_name: String,

    /// Process-unique id of the underlying connection, so the reader of a
    /// replaced socket cannot remove its successor
    pub conn_id: u64,

    /// Outbound frames; a writer task drains this into the socket
    pub sender: UnboundedSender<Message>,

    /// Cleared by the liveness sweep, set again by a pong
    pub alive: bool,

    /// Wall-clock ms of first join, drives DJ succession order
    pub joined_at: f64,
}

/// Holder for at most one scheduled callback.
///
/// The generation counter makes cancellation exact: every arm or cancel bumps
/// it, and a fire that finds a different generation than it captured aborts.
/// Double-cancel is a no-op by construction.
#[derive(Default)]
struct TimerSlot {
    handle: Option<tokio::task::JoinHandle<()>>,
    generation: u64,
}

impl TimerSlot {
    fn cancel(&mut self) {
        self.generation += 1;
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }

    /// Cancel whatever was scheduled and reserve the generation for a new fire
    fn arm(&mut self) -> u64 {
        self.cancel();
        self.generation
    }

    fn is_scheduled(&self) -> bool {
        self.handle.is_some()
    }
}

/// All state of one station
pub struct Session {
    pub id: String,

    /// 4-digit code for joining; expires separately from the session
    pub join_code: String,

    pub creator_id: String,

    /// The single authority for playback control
    pub dj_user_id: String,

    /// Connected listeners by principal id
    pub members: HashMap<String, Member>,

    /// Bumped on every change of playback regime (DJ change, track change);
    /// receivers discard commands from older epochs
    pub epoch: u64,

    /// Bumped on every state-affecting broadcast, reset on epoch bump
    pub sequence: u64,

    /// What is (or was last) playing. Survives queue exhaustion as context.
    pub current_track: Option<Track>,

    pub is_playing: bool,

    /// Playback offset at the instant of `position_timestamp`
    pub position_ms: f64,

    /// Wall-clock ms anchor for `position_ms`
    pub position_timestamp: f64,

    pub queue: Vec<QueueEntry>,

    /// Wall-clock ms of the last inbound message or autonomous advancement
    pub last_activity: f64,

    /// Set once the destroy path has run; a locked-out connect checks this
    destroyed: bool,

    advancement: TimerSlot,
    destroy_grace: TimerSlot,
}

/// Why a connection could not be attached
#[derive(Debug, PartialEq, Eq)]
pub enum ConnectError {
    /// The session was destroyed while the connection was being set up
    SessionClosed,

    /// Member cap reached and this principal is not already in
    Full,
}

impl Session {
    pub fn new(id: String, join_code: String, creator_id: String, now_ms: f64) -> Self {
        Self {
            id,
            join_code,
            creator_id: creator_id.clone(),
            dj_user_id: creator_id,
            members: HashMap::new(),
            epoch: 0,
            sequence: 0,
            current_track: None,
            is_playing: false,
            position_ms: 0.0,
            position_timestamp: now_ms,
            queue: Vec::new(),
            last_activity: now_ms,
            destroyed: false,
            advancement: TimerSlot::default(),
            destroy_grace: TimerSlot::default(),
        }
    }

    pub fn touch(&mut self, now_ms: f64) {
        self.last_activity = now_ms;
    }

    pub fn is_idle(&self, now_ms: f64) -> bool {
        now_ms - self.last_activity > IDLE_TTL_MS
    }

    /// New playback regime: next epoch, sequence restarts
    fn bump_epoch(&mut self) {
        self.epoch += 1;
        self.sequence = 0;
    }

    fn next_seq(&mut self) {
        self.sequence += 1;
    }

    /// Playback offset at `now_ms` according to the anchor
    pub fn position_at(&self, now_ms: f64) -> f64 {
        if self.is_playing {
            self.position_ms + (now_ms - self.position_timestamp)
        } else {
            self.position_ms
        }
    }

    pub fn advancement_scheduled(&self) -> bool {
        self.advancement.is_scheduled()
    }

    pub fn grace_scheduled(&self) -> bool {
        self.destroy_grace.is_scheduled()
    }

    /// Full state, sufficient for a client to (re)bootstrap with no context
    pub fn snapshot(&self) -> StateSnapshot {
        let mut members: Vec<MemberInfo> = self
            .members
            .values()
            .map(|member| MemberInfo {
                user_id: member.user_id.clone(),
                display_name: member.display_name.clone(),
            })
            .collect();
        members.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        StateSnapshot {
            session_id: self.id.clone(),
            members,
            dj_user_id: self.dj_user_id.clone(),
            current_track: self.current_track.clone(),
            is_playing: self.is_playing,
            position_ms: self.position_ms,
            position_timestamp: self.position_timestamp,
            queue: self.queue.clone(),
            epoch: self.epoch,
            seq: self.sequence,
        }
    }

    /// Stamp one outbound message with the current ordering envelope
    fn envelope(&self, kind: &'static str, data: Value) -> Message {
        let outbound = Outbound {
            kind,
            data,
            epoch: self.epoch,
            seq: self.sequence,
            timestamp: crate::now_ms(),
        };
        let text =
            serde_json::to_string(&outbound).expect("outbound envelopes always serialize");
        Message::Text(text.into())
    }

    /// One serialization, then a write per live member. Members whose channel
    /// has gone away are skipped; their reader task cleans them up.
    fn broadcast(&self, kind: &'static str, data: Value, exclude: Option<&str>) {
        let message = self.envelope(kind, data);
        for (user_id, member) in &self.members {
            if exclude == Some(user_id.as_str()) {
                continue;
            }
            let _ = member.sender.send(message.clone());
        }
    }

    fn unicast(&self, user_id: &str, kind: &'static str, data: Value) {
        if let Some(member) = self.members.get(user_id) {
            let _ = member.sender.send(self.envelope(kind, data));
        }
    }

    fn broadcast_state_sync(&self) {
        let data = serde_json::to_value(self.snapshot()).expect("snapshots always serialize");
        self.broadcast(protocol::STATE_SYNC, data, None);
    }

    /// Member believed alive again (a pong arrived)
    pub fn mark_alive(&mut self, user_id: &str) {
        if let Some(member) = self.members.get_mut(user_id) {
            member.alive = true;
        }
    }

    /// One liveness round: members that never answered the previous ping are
    /// returned for removal, everyone else is pinged and marked suspect.
    pub fn sweep_liveness(&mut self) -> Vec<(String, u64)> {
        let mut dead = Vec::new();
        for (user_id, member) in self.members.iter_mut() {
            if member.alive {
                member.alive = false;
                let _ = member.sender.send(Message::Ping(Vec::new().into()));
            } else {
                dead.push((user_id.clone(), member.conn_id));
            }
        }
        dead
    }
}

/// Attach a connection to the session per the admission rules: cap of
/// [MAX_MEMBERS], same-principal connections replace each other, the joiner
/// gets a private bootstrap snapshot, everyone else learns of the join.
pub fn connect(
    session: &mut Session,
    user_id: &str,
    display_name: &str,
    conn_id: u64,
    sender: UnboundedSender<Message>,
) -> Result<(), ConnectError> {
    if session.destroyed {
        return Err(ConnectError::SessionClosed);
    }
    if session.members.len() >= MAX_MEMBERS && !session.members.contains_key(user_id) {
        return Err(ConnectError::Full);
    }

    let now = crate::now_ms();
    let joined_at = match session.members.remove(user_id) {
        Some(old) => {
            tracing::info!(
                "user {user_id} reconnected to session {id}, replacing connection {old_conn}",
                id = session.id,
                old_conn = old.conn_id
            );
            let _ = old.sender.send(Message::Close(Some(CloseFrame {
                code: protocol::CLOSE_REPLACED,
                reason: Utf8Bytes::from_static("replaced"),
            })));
            old.joined_at
        }
        None => now,
    };

    session.touch(now);
    // The station has an audience again
    session.destroy_grace.cancel();
    session.members.insert(
        user_id.to_string(),
        Member {
            user_id: user_id.to_string(),
            display_name: display_name.to_string(),
            conn_id,
            sender,
            alive: true,
            joined_at,
        },
    );

    session.next_seq();
    let snapshot =
        serde_json::to_value(session.snapshot()).expect("snapshots always serialize");
    session.unicast(user_id, protocol::STATE_SYNC, snapshot);
    session.broadcast(
        protocol::MEMBER_JOINED,
        json!({ "userId": user_id, "displayName": display_name }),
        Some(user_id),
    );
    Ok(())
}

/// Detach a connection: authority transfer if the DJ left, grace period or
/// immediate teardown if the station emptied out.
///
/// `conn_id` must match the member's live connection - the reader of a socket
/// that was already replaced arrives here too, and must change nothing.
pub fn disconnect(state: &Arc<AppState>, session_id: &str, user_id: &str, conn_id: u64) {
    let Some(session) = state.registry.session(session_id) else {
        return;
    };
    let mut session = session.lock().unwrap();
    if session.destroyed {
        return;
    }
    match session.members.get(user_id) {
        Some(member) if member.conn_id == conn_id => {}
        _ => return,
    }

    if let Some(member) = session.members.remove(user_id) {
        // Nudge the writer half to wind the connection down; harmless when
        // the peer is already gone
        let _ = member.sender.send(Message::Close(None));
    }
    session.next_seq();
    session.broadcast(protocol::MEMBER_LEFT, json!({ "userId": user_id }), None);

    if session.dj_user_id == user_id && !session.members.is_empty() {
        let heir = if session.members.contains_key(&session.creator_id) {
            session.creator_id.clone()
        } else {
            session
                .members
                .values()
                .min_by(|a, b| {
                    a.joined_at
                        .total_cmp(&b.joined_at)
                        .then_with(|| a.user_id.cmp(&b.user_id))
                })
                .map(|member| member.user_id.clone())
                .expect("members is non-empty on this branch")
        };
        tracing::info!(
            "dj {user_id} left session {id}, authority passes to {heir}",
            id = session.id
        );
        session.dj_user_id = heir;
        session.bump_epoch();
        session.broadcast_state_sync();
    }

    if session.members.is_empty() {
        if !session.queue.is_empty() || session.is_playing {
            // The station survives its broadcaster backgrounding: keep
            // playing unattended and give them a window to come back.
            tracing::info!(
                "session {id} has no members but content remains, grace period started",
                id = session.id
            );
            schedule_destroy(state, &mut session, DESTROY_GRACE);
        } else {
            schedule_destroy(state, &mut session, Duration::ZERO);
        }
    }
}

/// Apply one validated inbound command from `user_id`.
///
/// Control operations from anyone but the DJ are dropped without a reply;
/// the sender may be working from a stale epoch and will reconcile from the
/// next snapshot.
pub fn apply_command(
    state: &Arc<AppState>,
    session: &Arc<Mutex<Session>>,
    user_id: &str,
    command: ClientCommand,
) {
    let mut session = session.lock().unwrap();
    if session.destroyed || !session.members.contains_key(user_id) {
        return;
    }

    let now = crate::now_ms();
    session.touch(now);

    let requires_authority = !matches!(
        command,
        ClientCommand::AddToQueue { .. } | ClientCommand::DriftReport { .. } | ClientCommand::Ping { .. }
    );
    if requires_authority && session.dj_user_id != user_id {
        tracing::debug!(
            "ignoring control message from non-dj {user_id} in session {id}",
            id = session.id
        );
        return;
    }

    match command {
        ClientCommand::PlayPrepare { track, raw } => {
            session.current_track = Some(track);
            session.bump_epoch();
            session.broadcast("playPrepare", raw, None);
        }

        ClientCommand::PlayCommit {
            track,
            position_ms,
            ntp_timestamp,
            raw,
        } => {
            // A commit for the prepared track must not clobber the richer
            // descriptor the prepare carried (the commit often has no
            // duration of its own).
            if let Some(current) = session
                .current_track
                .as_mut()
                .filter(|current| current.id == track.id)
            {
                if track.duration_ms.is_some() {
                    current.duration_ms = track.duration_ms;
                }
                current.metadata.extend(track.metadata);
            } else {
                session.current_track = Some(track);
            }
            session.is_playing = true;
            session.position_ms = position_ms;
            session.position_timestamp = ntp_timestamp.unwrap_or(now);
            session.next_seq();
            session.broadcast("playCommit", raw, None);
            schedule_advancement(state, &mut session);
        }

        ClientCommand::Pause { raw } => {
            if session.is_playing {
                // Freeze the anchor at the pause instant
                session.position_ms += now - session.position_timestamp;
                session.position_timestamp = now;
                session.is_playing = false;
            }
            session.advancement.cancel();
            session.next_seq();
            session.broadcast("pause", raw, None);
        }

        ClientCommand::Resume { raw } => {
            session.is_playing = true;
            session.position_timestamp = now;
            session.next_seq();
            // `executionTime` and friends pass through untouched
            session.broadcast("resume", raw, None);
            schedule_advancement(state, &mut session);
        }

        ClientCommand::Seek { position_ms, raw } => {
            session.position_ms = position_ms;
            session.position_timestamp = now;
            session.next_seq();
            session.broadcast("seek", raw, None);
            if session.is_playing {
                schedule_advancement(state, &mut session);
            }
        }

        ClientCommand::Skip => {
            advance(state, &mut session);
        }

        ClientCommand::AddToQueue { track, nonce } => {
            if session.queue.iter().any(|entry| entry.nonce == nonce) {
                // Retransmission of something we already took
                return;
            }
            session.queue.push(QueueEntry {
                track,
                nonce,
                added_by: user_id.to_string(),
            });
            session.next_seq();
            broadcast_queue(&session);
        }

        ClientCommand::RemoveFromQueue { track_id } => {
            session.queue.retain(|entry| entry.track.id != track_id);
            session.next_seq();
            broadcast_queue(&session);
        }

        ClientCommand::DriftReport { raw } => {
            let mut data = raw;
            if let Value::Object(map) = &mut data {
                map.insert("userId".to_string(), Value::String(user_id.to_string()));
            }
            // Private to the DJ; listeners never see each other's drift
            let dj = session.dj_user_id.clone();
            session.unicast(&dj, "driftReport", data);
        }

        ClientCommand::Ping { client_send_time } => {
            session.unicast(
                user_id,
                protocol::PONG,
                json!({ "clientSendTime": client_send_time, "serverTime": now }),
            );
        }
    }
}

fn broadcast_queue(session: &Session) {
    let queue = serde_json::to_value(&session.queue).expect("queues always serialize");
    session.broadcast(protocol::QUEUE_UPDATE, json!({ "queue": queue }), None);
}

/// (Re)arm the advancement timer for the current playback state.
///
/// Cancels any previous timer first, so this is the single composite
/// "cancel-and-maybe-reschedule" every mutator goes through. A track without
/// a usable duration never gets a timer: scheduling with a garbage delay
/// would consume the whole queue in one instant.
pub fn schedule_advancement(state: &Arc<AppState>, session: &mut Session) {
    let generation = session.advancement.arm();
    if !session.is_playing {
        return;
    }
    let Some(track) = &session.current_track else {
        return;
    };
    let Some(duration) = track.playable_duration() else {
        tracing::debug!(
            "track {track_id} in session {id} has no usable duration, not scheduling advancement",
            track_id = track.id,
            id = session.id
        );
        return;
    };

    let now = crate::now_ms();
    let remaining = duration - session.position_at(now);
    let delay = Duration::from_millis(remaining.max(0.0) as u64);
    tracing::debug!(
        "session {id} advances in {delay:?}",
        id = session.id
    );

    let state = state.clone();
    let session_id = session.id.clone();
    session.advancement.handle = Some(tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        advance_if_current(&state, &session_id, generation);
    }));
}

/// Advancement timer fire: re-find the session and make sure this fire is
/// still the scheduled one before acting.
fn advance_if_current(state: &Arc<AppState>, session_id: &str, generation: u64) {
    let Some(session) = state.registry.session(session_id) else {
        return;
    };
    let mut session = session.lock().unwrap();
    if session.destroyed || session.advancement.generation != generation {
        return;
    }
    session.advancement.handle = None;
    advance(state, &mut session);
}

/// Shift the queue head into the current slot and start a new epoch, or run
/// out and become an idle station (the session is never destroyed here).
fn advance(state: &Arc<AppState>, session: &mut Session) {
    let now = crate::now_ms();
    session.touch(now);

    if session.queue.is_empty() {
        session.is_playing = false;
        session.advancement.cancel();
        session.next_seq();
        session.broadcast_state_sync();
        tracing::debug!("session {id} queue ran dry, station idles", id = session.id);
        return;
    }

    let entry = session.queue.remove(0);
    tracing::info!(
        "session {id} advances to track {track_id}",
        id = session.id,
        track_id = entry.track.id
    );
    session.current_track = Some(entry.track);
    session.position_ms = 0.0;
    session.position_timestamp = now;
    session.is_playing = true;
    session.bump_epoch();
    session.broadcast_state_sync();
    schedule_advancement(state, session);
}

/// Arm the destroy timer. Zero delay is the "destroy immediately" case; it
/// still goes through the generation check so a rejoin in flight wins.
fn schedule_destroy(state: &Arc<AppState>, session: &mut Session, delay: Duration) {
    let generation = session.destroy_grace.arm();
    let state = state.clone();
    let session_id = session.id.clone();
    session.destroy_grace.handle = Some(tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        destroy_if_abandoned(&state, &session_id, generation);
    }));
}

fn destroy_if_abandoned(state: &Arc<AppState>, session_id: &str, generation: u64) {
    let Some(session) = state.registry.session(session_id) else {
        return;
    };
    let mut session = session.lock().unwrap();
    if session.destroyed
        || session.destroy_grace.generation != generation
        || !session.members.is_empty()
    {
        return;
    }
    session.destroy_grace.handle = None;
    destroy_locked(state, &mut session, None);
}

/// Tear a session down: drop it from the registry, cancel its timers, close
/// every member socket. Requires the caller to hold the session lock.
fn destroy_locked(state: &Arc<AppState>, session: &mut Session, close: Option<CloseFrame>) {
    session.destroyed = true;
    session.advancement.cancel();
    session.destroy_grace.cancel();
    state.registry.forget(&session.id, &session.join_code);
    for (_, member) in session.members.drain() {
        let _ = member.sender.send(Message::Close(close.clone()));
    }
    tracing::info!("session {id} destroyed", id = session.id);
}

/// Destroy a session by id, sending `close` to every member
pub fn destroy(state: &Arc<AppState>, session_id: &str, close: Option<CloseFrame>) {
    let Some(session) = state.registry.session(session_id) else {
        return;
    };
    let mut session = session.lock().unwrap();
    if session.destroyed {
        return;
    }
    destroy_locked(state, &mut session, close);
}

/// Every 15 seconds, tear down sessions that have seen no activity for
/// [IDLE_TTL_MS], closing their members with an idle close code.
pub async fn idle_sweep_loop(state: Arc<AppState>) {
    let mut interval = tokio::time::interval(IDLE_SWEEP_INTERVAL);
    loop {
        interval.tick().await;
        let now = crate::now_ms();
        for session in state.registry.sessions_snapshot() {
            let session_id = {
                let session = session.lock().unwrap();
                if !session.is_idle(now) {
                    continue;
                }
                session.id.clone()
            };
            tracing::info!("session {session_id} idle, tearing down");
            destroy(
                &state,
                &session_id,
                Some(CloseFrame {
                    code: protocol::CLOSE_IDLE,
                    reason: Utf8Bytes::from_static("idle-timeout"),
                }),
            );
        }
    }
}

/// Process shutdown: every station goes off the air
pub fn shutdown_all(state: &Arc<AppState>) {
    for session in state.registry.sessions_snapshot() {
        let session_id = session.lock().unwrap().id.clone();
        destroy(state, &session_id, None);
    }
}
