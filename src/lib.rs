//! Derby party-race module.
//!
//! Rooms move through a fixed phase loop (waiting, attribute selection,
//! augment selection, racing, round result, finished). Every operation is a
//! reducer running as one serializable transaction, so phase advances are
//! atomic compare-and-set against persisted rows; clients read state through
//! public table subscriptions and replay stored race scripts locally.

use std::time::Duration;

use spacetimedb::{
    reducer, table, view, Identity, ReducerContext, ScheduleAt, SpacetimeType, Table, Timestamp,
};

mod augments;
mod race;
mod replay;
mod rng;

use crate::augments::{Ability, Rarity, StatBlock};
use crate::race::RaceScript;
use crate::replay::PlaybackStatus;

// ==================== CONSTANTS ====================

const MIN_PLAYERS_TO_START: usize = 2;
const MAX_ROOM_CAP: u32 = 8;
const MAX_TOTAL_ROUNDS: u32 = 5;
const MAX_REROLL_LIMIT: u32 = 5;
const MAX_NAME_LEN: usize = 24;
const ROOM_TOKEN_LEN: usize = 20;

const ROOM_SWEEP_INTERVAL_SECS: u64 = 300;
const STALE_ROOM_AGE_SECS: u64 = 3600;
/// Slack between a script's projected end and the wind-down schedule, so
/// the scheduled pass always lands after playback truly finished.
const FINISH_SCHEDULE_MARGIN: Duration = Duration::from_millis(250);

// ==================== ERRORS ====================

/// Operation failures, bucketed by who has to fix what. The rendered form
/// is `category: detail` and is what clients receive.
#[derive(Debug, Clone, PartialEq)]
pub enum ApiError {
    InvalidInput(String),
    Unauthenticated(String),
    PermissionDenied(String),
    NotFound(String),
    FailedPrecondition(String),
    ResourceExhausted(String),
    Internal(String),
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ApiError::InvalidInput(msg) => write!(f, "invalid-input: {}", msg),
            ApiError::Unauthenticated(msg) => write!(f, "unauthenticated: {}", msg),
            ApiError::PermissionDenied(msg) => write!(f, "permission-denied: {}", msg),
            ApiError::NotFound(msg) => write!(f, "not-found: {}", msg),
            ApiError::FailedPrecondition(msg) => write!(f, "failed-precondition: {}", msg),
            ApiError::ResourceExhausted(msg) => write!(f, "resource-exhausted: {}", msg),
            ApiError::Internal(msg) => write!(f, "internal: {}", msg),
        }
    }
}

impl From<ApiError> for String {
    fn from(err: ApiError) -> Self {
        err.to_string()
    }
}

// ==================== TYPES ====================

#[derive(SpacetimeType, Debug, Clone, PartialEq)]
pub enum RoomPhase {
    Waiting,
    AttributeSelection,
    ModifierSelection,
    Racing,
    RoundResult,
    Finished,
}

// ==================== TABLES ====================

/// A party room. `host_player_id` is the only record of who hosts;
/// `game_epoch` bumps on every game start so per-game seed keys never
/// repeat within a room.
#[table(name = room, public)]
pub struct Room {
    #[primary_key]
    #[auto_inc]
    pub id: u64,
    pub phase: RoomPhase,
    pub host_player_id: String,
    pub current_round: u32,
    pub total_rounds: u32,
    pub reroll_limit: u32,
    pub max_players: u32,
    pub game_epoch: u32,
    pub created_at: Timestamp,
}

/// Roster row, one per player per room. `stats` is the grown base block,
/// `round_bonus` the stacked single-round effects, `condition` the rolled
/// form once the race is prepared.
#[table(name = room_player, public)]
#[derive(Clone)]
pub struct RoomPlayer {
    #[primary_key]
    #[auto_inc]
    pub id: u64,
    #[index(btree)]
    pub room_id: u64,
    pub player_id: String,
    pub display_name: String,
    pub ready: bool,
    pub stats: StatBlock,
    pub stats_submitted: bool,
    pub round_bonus: StatBlock,
    pub condition: i32,
    pub picks: Vec<u32>,
    pub rerolls_used: u32,
    pub joined_at: Timestamp,
}

/// One row per round a room has opened: the shared rarity tier, the race
/// script once prepared, start time once fired, and the ready set that
/// advances the room out of the result screen.
#[table(name = room_round, public)]
#[derive(Clone)]
pub struct RoomRound {
    #[primary_key]
    #[auto_inc]
    pub id: u64,
    #[index(btree)]
    pub room_id: u64,
    pub round_index: u32,
    pub tier: Rarity,
    pub script: Option<RaceScript>,
    pub race_started_at: Option<Timestamp>,
    pub ready_players: Vec<String>,
    pub finalized: bool,
    pub skipped: bool,
}

/// A player's drawn candidates for one round. `confirmed` locks the pick;
/// effects apply only when the whole roster has confirmed. Display names
/// ride along so clients never need the server-side catalog.
#[table(name = augment_offer, public)]
#[derive(Clone)]
pub struct AugmentOffer {
    #[primary_key]
    #[auto_inc]
    pub id: u64,
    #[index(btree)]
    pub room_id: u64,
    pub round_index: u32,
    pub player_id: String,
    pub augment_ids: Vec<u32>,
    pub augment_names: Vec<String>,
    pub roll_seq: u32,
    pub confirmed: Option<u32>,
}

/// Server-issued session credential, one per player. Private: the gateway
/// worker mints these and callers prove themselves by echoing the token.
#[table(name = session)]
#[derive(Clone)]
pub struct Session {
    #[primary_key]
    pub player_id: String,
    #[unique]
    pub connection_id: Identity,
    pub session_token: String,
    pub connected_at: Timestamp,
}

/// Per-room credential, rotated on every join and rejoin; the previous
/// token stops working the moment a new one is issued.
#[table(name = room_credential)]
#[derive(Clone)]
pub struct RoomCredential {
    #[primary_key]
    #[auto_inc]
    pub id: u64,
    #[index(btree)]
    pub room_id: u64,
    #[index(btree)]
    pub player_id: String,
    pub token: String,
    pub issued_at: Timestamp,
}

/// Backend identities allowed to call the session gateway. The module
/// owner is seeded at init; further workers are added out-of-band.
#[table(name = authorized_worker)]
pub struct AuthorizedWorker {
    #[primary_key]
    pub identity: Identity,
    pub added_at: Timestamp,
}

/// One-shot schedule per started race, firing at the script's projected end.
#[table(name = race_finish_schedule, scheduled(race_playback_complete))]
pub struct RaceFinishSchedule {
    #[primary_key]
    #[auto_inc]
    pub id: u64,
    pub room_id: u64,
    pub round_index: u32,
    pub scheduled_at: ScheduleAt,
}

/// Periodic sweep for rooms abandoned without a clean leave.
#[table(name = room_sweep_schedule, scheduled(sweep_stale_rooms))]
pub struct RoomSweepSchedule {
    #[primary_key]
    #[auto_inc]
    pub id: u64,
    pub scheduled_at: ScheduleAt,
}

// ==================== VIEWS ====================

/// The calling session's newest room credential. Credentials live in a
/// private table; this is the only read path and it only shows callers
/// their own.
#[view(name = my_credential, public)]
fn my_credential(ctx: &spacetimedb::ViewContext) -> Option<RoomCredential> {
    let session = ctx.db.session().connection_id().find(ctx.sender)?;
    newest_credential(ctx.db.room_credential().player_id().filter(&session.player_id))
}

/// A player holds one credential per room they have joined; the most
/// recently issued one belongs to the room they are actively playing.
fn newest_credential(rows: impl Iterator<Item = RoomCredential>) -> Option<RoomCredential> {
    rows.max_by_key(|c| c.issued_at.to_micros_since_unix_epoch())
}

// ==================== AUTH GUARDS ====================

fn verify_session(ctx: &ReducerContext, player_id: &str, session_token: &str) -> Result<(), ApiError> {
    match ctx.db.session().player_id().find(&player_id.to_string()) {
        Some(session) if session.session_token == session_token => Ok(()),
        Some(_) => Err(ApiError::Unauthenticated("session token does not match".into())),
        None => Err(ApiError::Unauthenticated("no session for this player".into())),
    }
}

/// Check the caller's per-room token and resolve their roster row.
fn verify_room_credential(
    ctx: &ReducerContext,
    room_id: u64,
    player_id: &str,
    room_token: &str,
) -> Result<RoomPlayer, ApiError> {
    let credential = ctx
        .db
        .room_credential()
        .room_id()
        .filter(&room_id)
        .find(|c| c.player_id == player_id)
        .ok_or_else(|| ApiError::PermissionDenied("no credential issued for this room".into()))?;
    if credential.token != room_token {
        return Err(ApiError::PermissionDenied("room credential is stale".into()));
    }
    find_member(ctx, room_id, player_id)
        .ok_or_else(|| ApiError::NotFound("player is not in this room".into()))
}

fn get_room(ctx: &ReducerContext, room_id: u64) -> Result<Room, ApiError> {
    ctx.db
        .room()
        .id()
        .find(&room_id)
        .ok_or_else(|| ApiError::NotFound("room does not exist".into()))
}

fn require_host(room: &Room, player_id: &str) -> Result<(), ApiError> {
    if room.host_player_id != player_id {
        return Err(ApiError::PermissionDenied("only the host may do this".into()));
    }
    Ok(())
}

fn require_phase(room: &Room, expected: RoomPhase) -> Result<(), ApiError> {
    if room.phase != expected {
        return Err(ApiError::FailedPrecondition(format!(
            "room is in {:?}, expected {:?}",
            room.phase, expected
        )));
    }
    Ok(())
}

fn require_current_round(room: &Room, round_index: u32) -> Result<(), ApiError> {
    if room.current_round != round_index {
        return Err(ApiError::FailedPrecondition(format!(
            "round {} is not the current round {}",
            round_index, room.current_round
        )));
    }
    Ok(())
}

// ==================== RULES ====================

fn validate_display_name(name: &str) -> Result<(), ApiError> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return Err(ApiError::InvalidInput("display name is empty".into()));
    }
    if trimmed.chars().count() > MAX_NAME_LEN {
        return Err(ApiError::InvalidInput(format!(
            "display name longer than {} characters",
            MAX_NAME_LEN
        )));
    }
    Ok(())
}

fn validate_room_config(total_rounds: u32, reroll_limit: u32, max_players: u32) -> Result<(), ApiError> {
    if total_rounds == 0 || total_rounds > MAX_TOTAL_ROUNDS {
        return Err(ApiError::InvalidInput(format!(
            "total rounds must be 1..={}",
            MAX_TOTAL_ROUNDS
        )));
    }
    if reroll_limit > MAX_REROLL_LIMIT {
        return Err(ApiError::InvalidInput(format!(
            "reroll limit must be 0..={}",
            MAX_REROLL_LIMIT
        )));
    }
    if max_players < MIN_PLAYERS_TO_START as u32 || max_players > MAX_ROOM_CAP {
        return Err(ApiError::InvalidInput(format!(
            "room capacity must be {}..={}",
            MIN_PLAYERS_TO_START, MAX_ROOM_CAP
        )));
    }
    Ok(())
}

fn validate_stats(stats: &StatBlock) -> Result<(), ApiError> {
    if !stats.is_legal_allocation() {
        return Err(ApiError::InvalidInput(format!(
            "attributes must each be {}..={} and total exactly {}",
            augments::STAT_MIN,
            augments::STAT_MAX,
            augments::STAT_BUDGET
        )));
    }
    Ok(())
}

/// True when every listed member id appears in the ready set. Vacuously
/// true for an empty roster; callers guard against that.
fn roster_covered(ready: &[String], member_ids: &[&str]) -> bool {
    member_ids.iter().all(|m| ready.iter().any(|r| r.as_str() == *m))
}

/// Opaque room token. Charset skips look-alike characters.
fn generate_token(ctx: &ReducerContext) -> String {
    use spacetimedb::rand::Rng;
    const CHARSET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";
    let mut rng = ctx.rng();
    (0..ROOM_TOKEN_LEN)
        .map(|_| {
            let idx = rng.gen_range(0..CHARSET.len());
            CHARSET[idx] as char
        })
        .collect()
}

// ==================== LOOKUP HELPERS ====================

fn find_member(ctx: &ReducerContext, room_id: u64, player_id: &str) -> Option<RoomPlayer> {
    ctx.db
        .room_player()
        .room_id()
        .filter(&room_id)
        .find(|m| m.player_id == player_id)
}

fn room_members(ctx: &ReducerContext, room_id: u64) -> Vec<RoomPlayer> {
    ctx.db.room_player().room_id().filter(&room_id).collect()
}

fn find_round(ctx: &ReducerContext, room_id: u64, round_index: u32) -> Option<RoomRound> {
    ctx.db
        .room_round()
        .room_id()
        .filter(&room_id)
        .find(|r| r.round_index == round_index)
}

fn find_offer(ctx: &ReducerContext, room_id: u64, round_index: u32, player_id: &str) -> Option<AugmentOffer> {
    ctx.db
        .augment_offer()
        .room_id()
        .filter(&room_id)
        .find(|o| o.round_index == round_index && o.player_id == player_id)
}

fn member_confirmed(ctx: &ReducerContext, room: &Room, member: &RoomPlayer) -> bool {
    find_offer(ctx, room.id, room.current_round, &member.player_id)
        .map(|o| o.confirmed.is_some())
        .unwrap_or(false)
}

/// Abilities granted by this round's confirmed augment.
fn round_abilities(ctx: &ReducerContext, room_id: u64, round_index: u32, player_id: &str) -> Vec<Ability> {
    find_offer(ctx, room_id, round_index, player_id)
        .and_then(|o| o.confirmed)
        .and_then(augments::find)
        .and_then(|def| def.ability)
        .into_iter()
        .collect()
}

// ==================== ROUND MACHINERY ====================

fn issue_room_credential(ctx: &ReducerContext, room_id: u64, player_id: &str) -> String {
    let stale: Vec<u64> = ctx
        .db
        .room_credential()
        .room_id()
        .filter(&room_id)
        .filter(|c| c.player_id == player_id)
        .map(|c| c.id)
        .collect();
    for id in stale {
        ctx.db.room_credential().id().delete(&id);
    }
    let token = generate_token(ctx);
    ctx.db.room_credential().insert(RoomCredential {
        id: 0,
        room_id,
        player_id: player_id.to_string(),
        token: token.clone(),
        issued_at: ctx.timestamp,
    });
    token
}

fn insert_member(ctx: &ReducerContext, room_id: u64, player_id: &str, display_name: &str) {
    ctx.db.room_player().insert(RoomPlayer {
        id: 0,
        room_id,
        player_id: player_id.to_string(),
        display_name: display_name.trim().to_string(),
        ready: false,
        stats: StatBlock::default(),
        stats_submitted: false,
        round_bonus: StatBlock::default(),
        condition: 0,
        picks: Vec::new(),
        rerolls_used: 0,
        joined_at: ctx.timestamp,
    });
    issue_room_credential(ctx, room_id, player_id);
}

/// Round rows are created lazily on first access. The shared tier is
/// rolled once from the round's seed key, never re-rolled.
fn ensure_round(ctx: &ReducerContext, room: &Room) -> RoomRound {
    if let Some(round) = find_round(ctx, room.id, room.current_round) {
        return round;
    }
    let tier = augments::roll_tier(
        room.current_round,
        &rng::tier_seed(room.id, room.game_epoch, room.current_round),
    );
    let round = ctx.db.room_round().insert(RoomRound {
        id: 0,
        room_id: room.id,
        round_index: room.current_round,
        tier,
        script: None,
        race_started_at: None,
        ready_players: Vec::new(),
        finalized: false,
        skipped: false,
    });
    log::info!(
        "[ROUND] opened room_id:{} round:{} tier:{:?}",
        room.id,
        room.current_round,
        round.tier
    );
    round
}

/// Apply every member's confirmed augment: permanent growth onto the base
/// block, round bonus stacked for the upcoming race, pick recorded.
fn commit_round_effects(ctx: &ReducerContext, room: &Room) {
    for member in room_members(ctx, room.id) {
        let Some(offer) = find_offer(ctx, room.id, room.current_round, &member.player_id) else {
            continue;
        };
        let Some(augment_id) = offer.confirmed else {
            continue;
        };
        let Some(def) = augments::find(augment_id) else {
            continue;
        };
        let (grown, round_bonus) = augments::apply(&member.stats, def);
        let mut updated = member;
        updated.stats = grown;
        updated.round_bonus = updated.round_bonus.add(&round_bonus);
        updated.picks.push(augment_id);
        ctx.db.room_player().id().update(updated);
    }
}

/// Close a round exactly once: mark it finalized, clear per-round state on
/// the roster, then open the next selection phase or finish the game.
fn finalize_round(ctx: &ReducerContext, mut room: Room, mut round: RoomRound, skipped: bool) {
    round.finalized = true;
    round.skipped = round.skipped || skipped;
    ctx.db.room_round().id().update(round);

    for member in room_members(ctx, room.id) {
        let mut updated = member;
        updated.round_bonus = StatBlock::default();
        updated.condition = 0;
        ctx.db.room_player().id().update(updated);
    }

    if room.current_round >= room.total_rounds {
        room.phase = RoomPhase::Finished;
        log::info!("[GAME] finished room_id:{} rounds:{}", room.id, room.total_rounds);
    } else {
        room.current_round += 1;
        room.phase = RoomPhase::ModifierSelection;
        log::info!("[ROUND] advanced room_id:{} next_round:{}", room.id, room.current_round);
    }
    ctx.db.room().id().update(room);
}

/// A departure can complete the gate the leaver was blocking; re-check the
/// current phase's condition against the remaining roster.
fn reevaluate_after_departure(ctx: &ReducerContext, room_id: u64) {
    let Some(room) = ctx.db.room().id().find(&room_id) else {
        return;
    };
    let members = room_members(ctx, room_id);
    if members.is_empty() {
        return;
    }
    match room.phase {
        RoomPhase::AttributeSelection => {
            if members.iter().all(|m| m.stats_submitted) {
                let mut updated = room;
                updated.phase = RoomPhase::ModifierSelection;
                ctx.db.room().id().update(updated);
                log::info!("[GAME] attributes locked room_id:{}", room_id);
            }
        }
        RoomPhase::ModifierSelection => {
            if members.iter().all(|m| member_confirmed(ctx, &room, m)) {
                commit_round_effects(ctx, &room);
                let round_index = room.current_round;
                let mut updated = room;
                updated.phase = RoomPhase::Racing;
                ctx.db.room().id().update(updated);
                log::info!("[ROUND] selections locked room_id:{} round:{}", room_id, round_index);
            }
        }
        RoomPhase::RoundResult => {
            if let Some(round) = find_round(ctx, room_id, room.current_round) {
                if !round.finalized {
                    let ids: Vec<&str> = members.iter().map(|m| m.player_id.as_str()).collect();
                    if roster_covered(&round.ready_players, &ids) {
                        finalize_round(ctx, room, round, false);
                    }
                }
            }
        }
        _ => {}
    }
}

/// Host succession: earliest joiner remaining, ties broken by row id.
fn promote_successor(ctx: &ReducerContext, room_id: u64) -> Option<String> {
    let members = room_members(ctx, room_id);
    let successor = members
        .iter()
        .min_by_key(|m| (m.joined_at.to_micros_since_unix_epoch(), m.id))?;
    Some(successor.player_id.clone())
}

/// Drop the previous game's rounds, offers, and pending schedules. Result
/// rows survive the lobby so players can review them; they clear only when
/// a new game actually starts.
fn clear_game_state(ctx: &ReducerContext, room_id: u64) {
    let round_ids: Vec<u64> = ctx.db.room_round().room_id().filter(&room_id).map(|r| r.id).collect();
    for id in round_ids {
        ctx.db.room_round().id().delete(&id);
    }
    let offer_ids: Vec<u64> = ctx.db.augment_offer().room_id().filter(&room_id).map(|o| o.id).collect();
    for id in offer_ids {
        ctx.db.augment_offer().id().delete(&id);
    }
    let schedule_ids: Vec<u64> = ctx
        .db
        .race_finish_schedule()
        .iter()
        .filter(|s| s.room_id == room_id)
        .map(|s| s.id)
        .collect();
    for id in schedule_ids {
        ctx.db.race_finish_schedule().id().delete(&id);
    }
}

/// Full teardown of a room and everything keyed by it.
fn cleanup_room_data(ctx: &ReducerContext, room_id: u64) {
    clear_game_state(ctx, room_id);
    let member_ids: Vec<u64> = ctx.db.room_player().room_id().filter(&room_id).map(|m| m.id).collect();
    for id in member_ids {
        ctx.db.room_player().id().delete(&id);
    }
    let credential_ids: Vec<u64> = ctx
        .db
        .room_credential()
        .room_id()
        .filter(&room_id)
        .map(|c| c.id)
        .collect();
    for id in credential_ids {
        ctx.db.room_credential().id().delete(&id);
    }
    ctx.db.room().id().delete(&room_id);
}

// ==================== SESSION GATEWAY ====================

/// Gateway reducer: only pre-authorized backend workers may mint sessions.
/// Re-minting for a player rotates their token; the old one stops working.
#[reducer]
pub fn create_session(
    ctx: &ReducerContext,
    client_identity: String,
    player_id: String,
    session_token: String,
) -> Result<(), String> {
    if ctx.db.authorized_worker().identity().find(&ctx.sender).is_none() {
        return Err(ApiError::PermissionDenied("caller is not an authorized worker".into()).into());
    }
    let connection_id = Identity::from_hex(&client_identity)
        .map_err(|_| ApiError::InvalidInput("client identity is not valid hex".into()))?;
    if player_id.trim().is_empty() {
        return Err(ApiError::InvalidInput("player id is empty".into()).into());
    }
    if session_token.is_empty() {
        return Err(ApiError::InvalidInput("session token is empty".into()).into());
    }

    // One session per player and per connection; stale rows go first.
    if let Some(stale) = ctx.db.session().player_id().find(&player_id) {
        ctx.db.session().player_id().delete(&stale.player_id);
    }
    if let Some(stale) = ctx.db.session().connection_id().find(&connection_id) {
        ctx.db.session().player_id().delete(&stale.player_id);
    }
    ctx.db.session().insert(Session {
        player_id: player_id.clone(),
        connection_id,
        session_token,
        connected_at: ctx.timestamp,
    });
    log::info!("[SESSION] created player_id:{}", player_id);
    Ok(())
}

// ==================== ROOM LIFECYCLE ====================

#[reducer]
pub fn create_room(
    ctx: &ReducerContext,
    player_id: String,
    session_token: String,
    display_name: String,
    total_rounds: u32,
    reroll_limit: u32,
    max_players: u32,
) -> Result<(), String> {
    verify_session(ctx, &player_id, &session_token)?;
    validate_display_name(&display_name)?;
    validate_room_config(total_rounds, reroll_limit, max_players)?;

    let room = ctx.db.room().insert(Room {
        id: 0,
        phase: RoomPhase::Waiting,
        host_player_id: player_id.clone(),
        current_round: 1,
        total_rounds,
        reroll_limit,
        max_players,
        game_epoch: 0,
        created_at: ctx.timestamp,
    });
    insert_member(ctx, room.id, &player_id, &display_name);
    log::info!(
        "[ROOM] created room_id:{} host:{} rounds:{} cap:{}",
        room.id,
        player_id,
        total_rounds,
        max_players
    );
    Ok(())
}

#[reducer]
pub fn join_room(
    ctx: &ReducerContext,
    player_id: String,
    session_token: String,
    room_id: u64,
    display_name: String,
) -> Result<(), String> {
    verify_session(ctx, &player_id, &session_token)?;
    let room = get_room(ctx, room_id)?;

    // Rejoin at any phase: rotate the credential and change nothing else.
    if find_member(ctx, room_id, &player_id).is_some() {
        issue_room_credential(ctx, room_id, &player_id);
        log::info!("[ROOM] rejoined room_id:{} player_id:{}", room_id, player_id);
        return Ok(());
    }

    require_phase(&room, RoomPhase::Waiting)?;
    validate_display_name(&display_name)?;
    if room_members(ctx, room_id).len() >= room.max_players as usize {
        return Err(ApiError::ResourceExhausted("room is full".into()).into());
    }
    insert_member(ctx, room_id, &player_id, &display_name);
    log::info!("[ROOM] joined room_id:{} player_id:{}", room_id, player_id);
    Ok(())
}

#[reducer]
pub fn leave_room(
    ctx: &ReducerContext,
    player_id: String,
    session_token: String,
    room_id: u64,
    room_token: String,
) -> Result<(), String> {
    verify_session(ctx, &player_id, &session_token)?;
    let member = verify_room_credential(ctx, room_id, &player_id, &room_token)?;
    let room = get_room(ctx, room_id)?;

    ctx.db.room_player().id().delete(&member.id);
    let credential_ids: Vec<u64> = ctx
        .db
        .room_credential()
        .room_id()
        .filter(&room_id)
        .filter(|c| c.player_id == player_id)
        .map(|c| c.id)
        .collect();
    for id in credential_ids {
        ctx.db.room_credential().id().delete(&id);
    }

    if room_members(ctx, room_id).is_empty() {
        log::info!("[ROOM] closed room_id:{} last player left", room_id);
        cleanup_room_data(ctx, room_id);
        return Ok(());
    }

    if room.host_player_id == player_id {
        if let Some(successor) = promote_successor(ctx, room_id) {
            let mut updated = room;
            updated.host_player_id = successor.clone();
            ctx.db.room().id().update(updated);
            log::info!("[ROOM] host transferred room_id:{} new_host:{}", room_id, successor);
        }
    }
    reevaluate_after_departure(ctx, room_id);
    log::info!("[ROOM] left room_id:{} player_id:{}", room_id, player_id);
    Ok(())
}

// ==================== LOBBY ====================

#[reducer]
pub fn set_ready(
    ctx: &ReducerContext,
    player_id: String,
    session_token: String,
    room_id: u64,
    room_token: String,
    ready: bool,
) -> Result<(), String> {
    verify_session(ctx, &player_id, &session_token)?;
    let member = verify_room_credential(ctx, room_id, &player_id, &room_token)?;
    let room = get_room(ctx, room_id)?;
    require_phase(&room, RoomPhase::Waiting)?;

    let mut updated = member;
    updated.ready = ready;
    ctx.db.room_player().id().update(updated);
    log::info!("[ROOM] ready room_id:{} player_id:{} ready:{}", room_id, player_id, ready);
    Ok(())
}

/// Host-only game start. Clears the previous game's rows, resets the
/// roster, bumps the seed epoch, and opens attribute selection.
#[reducer]
pub fn start_game(
    ctx: &ReducerContext,
    player_id: String,
    session_token: String,
    room_id: u64,
    room_token: String,
) -> Result<(), String> {
    verify_session(ctx, &player_id, &session_token)?;
    verify_room_credential(ctx, room_id, &player_id, &room_token)?;
    let room = get_room(ctx, room_id)?;
    require_host(&room, &player_id)?;
    require_phase(&room, RoomPhase::Waiting)?;

    let members = room_members(ctx, room_id);
    if members.len() < MIN_PLAYERS_TO_START {
        return Err(ApiError::FailedPrecondition(format!(
            "need at least {} players to start",
            MIN_PLAYERS_TO_START
        ))
        .into());
    }
    if !members.iter().all(|m| m.ready) {
        return Err(ApiError::FailedPrecondition("not all players are ready".into()).into());
    }

    clear_game_state(ctx, room_id);
    for member in members {
        let mut updated = member;
        updated.ready = false;
        updated.stats = StatBlock::default();
        updated.stats_submitted = false;
        updated.round_bonus = StatBlock::default();
        updated.condition = 0;
        updated.picks = Vec::new();
        updated.rerolls_used = 0;
        ctx.db.room_player().id().update(updated);
    }

    let mut updated_room = room;
    updated_room.game_epoch += 1;
    updated_room.current_round = 1;
    updated_room.phase = RoomPhase::AttributeSelection;
    let epoch = updated_room.game_epoch;
    ctx.db.room().id().update(updated_room);
    log::info!("[GAME] started room_id:{} epoch:{}", room_id, epoch);
    Ok(())
}

// ==================== ATTRIBUTE SELECTION ====================

/// One-shot attribute submission. When the last member locks in, the room
/// advances to augment selection in the same transaction.
#[reducer]
pub fn submit_attributes(
    ctx: &ReducerContext,
    player_id: String,
    session_token: String,
    room_id: u64,
    room_token: String,
    stats: StatBlock,
) -> Result<(), String> {
    verify_session(ctx, &player_id, &session_token)?;
    let member = verify_room_credential(ctx, room_id, &player_id, &room_token)?;
    let room = get_room(ctx, room_id)?;
    require_phase(&room, RoomPhase::AttributeSelection)?;
    if member.stats_submitted {
        return Err(ApiError::FailedPrecondition("attributes already submitted".into()).into());
    }
    validate_stats(&stats)?;

    let mut updated = member;
    updated.stats = stats;
    updated.stats_submitted = true;
    ctx.db.room_player().id().update(updated);
    log::info!("[GAME] attributes submitted room_id:{} player_id:{}", room_id, player_id);

    if room_members(ctx, room_id).iter().all(|m| m.stats_submitted) {
        let mut updated_room = room;
        updated_room.phase = RoomPhase::ModifierSelection;
        ctx.db.room().id().update(updated_room);
        log::info!("[GAME] attributes locked room_id:{}", room_id);
    }
    Ok(())
}

// ==================== AUGMENT SELECTION ====================

/// Materialize the caller's offer for the round. Idempotent: a repeat call
/// finds the persisted row and draws nothing new.
#[reducer]
pub fn get_augment_offers(
    ctx: &ReducerContext,
    player_id: String,
    session_token: String,
    room_id: u64,
    room_token: String,
    round_index: u32,
) -> Result<(), String> {
    verify_session(ctx, &player_id, &session_token)?;
    let member = verify_room_credential(ctx, room_id, &player_id, &room_token)?;
    let room = get_room(ctx, room_id)?;
    require_phase(&room, RoomPhase::ModifierSelection)?;
    require_current_round(&room, round_index)?;

    let round = ensure_round(ctx, &room);
    if find_offer(ctx, room_id, round_index, &player_id).is_some() {
        return Ok(());
    }
    let augment_ids = augments::offer(
        round.tier,
        &rng::offer_seed(room_id, room.game_epoch, round_index, &player_id, member.rerolls_used),
    );
    ctx.db.augment_offer().insert(AugmentOffer {
        id: 0,
        room_id,
        round_index,
        player_id: player_id.clone(),
        augment_names: augments::names(&augment_ids),
        augment_ids,
        roll_seq: member.rerolls_used,
        confirmed: None,
    });
    log::info!("[ROUND] offer drawn room_id:{} round:{} player_id:{}", room_id, round_index, player_id);
    Ok(())
}

/// Lock a pick from the offered candidates. When the last member confirms,
/// effects commit and the room moves to racing in the same transaction.
#[reducer]
pub fn confirm_augment(
    ctx: &ReducerContext,
    player_id: String,
    session_token: String,
    room_id: u64,
    room_token: String,
    round_index: u32,
    augment_id: u32,
) -> Result<(), String> {
    verify_session(ctx, &player_id, &session_token)?;
    verify_room_credential(ctx, room_id, &player_id, &room_token)?;
    let room = get_room(ctx, room_id)?;
    require_phase(&room, RoomPhase::ModifierSelection)?;
    require_current_round(&room, round_index)?;

    let offer = find_offer(ctx, room_id, round_index, &player_id)
        .ok_or_else(|| ApiError::NotFound("no offer drawn for this round".into()))?;
    if offer.confirmed.is_some() {
        return Err(ApiError::FailedPrecondition("augment already confirmed".into()).into());
    }
    if !offer.augment_ids.contains(&augment_id) {
        return Err(ApiError::InvalidInput("augment was not among the offered candidates".into()).into());
    }
    if augments::find(augment_id).is_none() {
        return Err(ApiError::Internal("offered augment missing from catalog".into()).into());
    }

    let mut updated = offer;
    updated.confirmed = Some(augment_id);
    ctx.db.augment_offer().id().update(updated);
    log::info!(
        "[ROUND] confirmed room_id:{} round:{} player_id:{} augment:{}",
        room_id,
        round_index,
        player_id,
        augment_id
    );

    if room_members(ctx, room_id).iter().all(|m| member_confirmed(ctx, &room, m)) {
        commit_round_effects(ctx, &room);
        let mut updated_room = room;
        updated_room.phase = RoomPhase::Racing;
        ctx.db.room().id().update(updated_room);
        log::info!("[ROUND] selections locked room_id:{} round:{}", room_id, round_index);
    }
    Ok(())
}

/// Redraw an unconfirmed offer, spending one reroll. The new draw comes
/// from the next reroll-keyed seed, so it is just as deterministic.
#[reducer]
pub fn reroll_augments(
    ctx: &ReducerContext,
    player_id: String,
    session_token: String,
    room_id: u64,
    room_token: String,
    round_index: u32,
) -> Result<(), String> {
    verify_session(ctx, &player_id, &session_token)?;
    let member = verify_room_credential(ctx, room_id, &player_id, &room_token)?;
    let room = get_room(ctx, room_id)?;
    require_phase(&room, RoomPhase::ModifierSelection)?;
    require_current_round(&room, round_index)?;

    let offer = find_offer(ctx, room_id, round_index, &player_id)
        .ok_or_else(|| ApiError::NotFound("no offer drawn for this round".into()))?;
    if offer.confirmed.is_some() {
        return Err(ApiError::FailedPrecondition("augment already confirmed".into()).into());
    }
    if member.rerolls_used >= room.reroll_limit {
        return Err(ApiError::ResourceExhausted(format!(
            "reroll limit of {} reached",
            room.reroll_limit
        ))
        .into());
    }

    let rerolls_used = member.rerolls_used + 1;
    let round = ensure_round(ctx, &room);
    let augment_ids = augments::offer(
        round.tier,
        &rng::offer_seed(room_id, room.game_epoch, round_index, &player_id, rerolls_used),
    );

    let mut updated_member = member;
    updated_member.rerolls_used = rerolls_used;
    ctx.db.room_player().id().update(updated_member);

    let mut updated_offer = offer;
    updated_offer.augment_names = augments::names(&augment_ids);
    updated_offer.augment_ids = augment_ids;
    updated_offer.roll_seq = rerolls_used;
    ctx.db.augment_offer().id().update(updated_offer);
    log::info!(
        "[ROUND] rerolled room_id:{} round:{} player_id:{} used:{}/{}",
        room_id,
        round_index,
        player_id,
        rerolls_used,
        room.reroll_limit
    );
    Ok(())
}

// ==================== RACING ====================

/// Build and persist the race script. Host-gated and idempotent: once a
/// script exists the call is a no-op, so a retry can never produce a
/// second script for the same round.
#[reducer]
pub fn prepare_race(
    ctx: &ReducerContext,
    player_id: String,
    session_token: String,
    room_id: u64,
    room_token: String,
    round_index: u32,
) -> Result<(), String> {
    verify_session(ctx, &player_id, &session_token)?;
    verify_room_credential(ctx, room_id, &player_id, &room_token)?;
    let room = get_room(ctx, room_id)?;
    require_host(&room, &player_id)?;
    require_phase(&room, RoomPhase::Racing)?;
    require_current_round(&room, round_index)?;

    let round = find_round(ctx, room_id, round_index)
        .ok_or_else(|| ApiError::NotFound("round record missing".into()))?;
    if round.script.is_some() {
        return Ok(());
    }

    let mut members = room_members(ctx, room_id);
    if members.len() < MIN_PLAYERS_TO_START {
        return Err(ApiError::FailedPrecondition(format!(
            "need at least {} racers",
            MIN_PLAYERS_TO_START
        ))
        .into());
    }
    // Canonical entrant order, so a rebuild from the same rows reproduces
    // the script byte for byte.
    members.sort_by(|a, b| a.player_id.cmp(&b.player_id));

    let mut entrants = Vec::with_capacity(members.len());
    for member in &members {
        let effective = member.stats.add(&member.round_bonus).floor_each(1);
        let condition = augments::roll_condition(
            effective.luck,
            &rng::condition_seed(room_id, room.game_epoch, round_index, &member.player_id),
        );
        let abilities = round_abilities(ctx, room_id, round_index, &member.player_id);
        entrants.push(race::RaceEntrant {
            player_id: member.player_id.clone(),
            stats: effective,
            abilities,
            condition,
        });
    }

    // Persist rolled conditions for roster displays.
    for entrant in &entrants {
        if let Some(m) = find_member(ctx, room_id, &entrant.player_id) {
            let mut updated = m;
            updated.condition = entrant.condition;
            ctx.db.room_player().id().update(updated);
        }
    }

    let script = race::build_script(&entrants);
    log::info!(
        "[RACE] prepared room_id:{} round:{} entrants:{} duration:{:.1}s hash:{}",
        room_id,
        round_index,
        entrants.len(),
        script.duration,
        &script.input_hash[..8]
    );
    let mut updated_round = round;
    updated_round.script = Some(script);
    ctx.db.room_round().id().update(updated_round);
    Ok(())
}

/// Fire the start gun: stamp the shared start time and schedule the
/// wind-down pass at the script's projected end. Idempotent on retry.
#[reducer]
pub fn start_race(
    ctx: &ReducerContext,
    player_id: String,
    session_token: String,
    room_id: u64,
    room_token: String,
    round_index: u32,
) -> Result<(), String> {
    verify_session(ctx, &player_id, &session_token)?;
    verify_room_credential(ctx, room_id, &player_id, &room_token)?;
    let room = get_room(ctx, room_id)?;
    require_host(&room, &player_id)?;
    require_phase(&room, RoomPhase::Racing)?;
    require_current_round(&room, round_index)?;

    let round = find_round(ctx, room_id, round_index)
        .ok_or_else(|| ApiError::NotFound("round record missing".into()))?;
    let duration = match &round.script {
        Some(script) => script.duration,
        None => return Err(ApiError::FailedPrecondition("race is not prepared".into()).into()),
    };
    if round.race_started_at.is_some() {
        return Ok(());
    }

    let fire_at = ctx.timestamp + Duration::from_secs_f64(duration) + FINISH_SCHEDULE_MARGIN;
    ctx.db.race_finish_schedule().insert(RaceFinishSchedule {
        id: 0,
        room_id,
        round_index,
        scheduled_at: ScheduleAt::Time(fire_at.into()),
    });

    let mut updated = round;
    updated.race_started_at = Some(ctx.timestamp);
    ctx.db.room_round().id().update(updated);
    log::info!("[RACE] started room_id:{} round:{} duration:{:.1}s", room_id, round_index, duration);
    Ok(())
}

/// Member-callable fallback for closing out playback when the scheduled
/// pass is late or lost. Fails while the script still has time to run.
#[reducer]
pub fn finish_race(
    ctx: &ReducerContext,
    player_id: String,
    session_token: String,
    room_id: u64,
    room_token: String,
    round_index: u32,
) -> Result<(), String> {
    verify_session(ctx, &player_id, &session_token)?;
    verify_room_credential(ctx, room_id, &player_id, &room_token)?;
    let room = get_room(ctx, room_id)?;
    if room.phase == RoomPhase::RoundResult && room.current_round == round_index {
        return Ok(()); // already closed out
    }
    require_phase(&room, RoomPhase::Racing)?;
    require_current_round(&room, round_index)?;

    let round = find_round(ctx, room_id, round_index)
        .ok_or_else(|| ApiError::NotFound("round record missing".into()))?;
    let Some(script) = &round.script else {
        return Err(ApiError::FailedPrecondition("race is not prepared".into()).into());
    };
    if round.race_started_at.is_none() {
        return Err(ApiError::FailedPrecondition("race has not started".into()).into());
    }
    let snapshot = replay::project(script, round.race_started_at, ctx.timestamp);
    if snapshot.status != PlaybackStatus::Completed {
        return Err(ApiError::FailedPrecondition("race is still running".into()).into());
    }

    let mut updated_room = room;
    updated_room.phase = RoomPhase::RoundResult;
    ctx.db.room().id().update(updated_room);
    log::info!("[RACE] completed room_id:{} round:{}", room_id, round_index);
    Ok(())
}

/// Scheduled wind-down: flips racing to round result once playback has
/// truly elapsed. No-ops if a skip or a finish call got there first.
#[reducer]
pub fn race_playback_complete(ctx: &ReducerContext, schedule: RaceFinishSchedule) {
    if ctx.sender != ctx.identity() {
        log::warn!("[RACE] playback completion called by non-scheduler, ignoring");
        return;
    }
    let Some(room) = ctx.db.room().id().find(&schedule.room_id) else {
        return;
    };
    if room.phase != RoomPhase::Racing || room.current_round != schedule.round_index {
        return;
    }
    let Some(round) = find_round(ctx, schedule.room_id, schedule.round_index) else {
        return;
    };
    let Some(script) = &round.script else {
        return;
    };
    let snapshot = replay::project(script, round.race_started_at, ctx.timestamp);
    if snapshot.status != PlaybackStatus::Completed {
        log::warn!(
            "[RACE] schedule fired before playback end room_id:{} round:{}",
            schedule.room_id,
            schedule.round_index
        );
        return;
    }
    let mut updated_room = room;
    updated_room.phase = RoomPhase::RoundResult;
    ctx.db.room().id().update(updated_room);
    log::info!("[RACE] completed room_id:{} round:{}", schedule.room_id, schedule.round_index);
}

// ==================== ROUND RESULT ====================

/// Ready-up on the result screen. The last needed signal advances the
/// room; signals against an already-finalized round are accepted and
/// ignored, so a slow retry can never double-advance.
#[reducer]
pub fn signal_round_ready(
    ctx: &ReducerContext,
    player_id: String,
    session_token: String,
    room_id: u64,
    room_token: String,
    round_index: u32,
) -> Result<(), String> {
    verify_session(ctx, &player_id, &session_token)?;
    verify_room_credential(ctx, room_id, &player_id, &room_token)?;
    let room = get_room(ctx, room_id)?;
    let round = find_round(ctx, room_id, round_index)
        .ok_or_else(|| ApiError::NotFound("round record missing".into()))?;
    if round.finalized {
        return Ok(());
    }
    require_phase(&room, RoomPhase::RoundResult)?;
    require_current_round(&room, round_index)?;

    let mut round = round;
    if !round.ready_players.iter().any(|p| p == &player_id) {
        round.ready_players.push(player_id.clone());
    }
    ctx.db.room_round().id().update(round.clone());
    log::info!("[ROUND] ready room_id:{} round:{} player_id:{}", room_id, round_index, player_id);

    let members = room_members(ctx, room_id);
    let ids: Vec<&str> = members.iter().map(|m| m.player_id.as_str()).collect();
    if roster_covered(&round.ready_players, &ids) {
        finalize_round(ctx, room, round, false);
    }
    Ok(())
}

/// Host escape hatch: force the current round closed from any mid-round
/// phase. Selections that never reached the commit point simply never
/// apply.
#[reducer]
pub fn skip_round(
    ctx: &ReducerContext,
    player_id: String,
    session_token: String,
    room_id: u64,
    room_token: String,
    round_index: u32,
) -> Result<(), String> {
    verify_session(ctx, &player_id, &session_token)?;
    verify_room_credential(ctx, room_id, &player_id, &room_token)?;
    let room = get_room(ctx, room_id)?;
    require_host(&room, &player_id)?;
    match room.phase {
        RoomPhase::ModifierSelection | RoomPhase::Racing | RoomPhase::RoundResult => {}
        _ => {
            return Err(ApiError::FailedPrecondition(format!("cannot skip from {:?}", room.phase)).into());
        }
    }
    require_current_round(&room, round_index)?;

    let round = ensure_round(ctx, &room);
    if round.finalized {
        return Ok(());
    }
    log::info!("[ROUND] skipped room_id:{} round:{} by:{}", room_id, round_index, player_id);
    finalize_round(ctx, room, round, true);
    Ok(())
}

/// Wrap up a finished game and reopen the lobby. The roster and grown
/// stats survive for browsing; per-game rows clear when the next game
/// actually starts.
#[reducer]
pub fn return_to_lobby(
    ctx: &ReducerContext,
    player_id: String,
    session_token: String,
    room_id: u64,
    room_token: String,
) -> Result<(), String> {
    verify_session(ctx, &player_id, &session_token)?;
    verify_room_credential(ctx, room_id, &player_id, &room_token)?;
    let room = get_room(ctx, room_id)?;
    require_host(&room, &player_id)?;
    require_phase(&room, RoomPhase::Finished)?;

    for member in room_members(ctx, room_id) {
        let mut updated = member;
        updated.ready = false;
        ctx.db.room_player().id().update(updated);
    }
    let mut updated_room = room;
    updated_room.phase = RoomPhase::Waiting;
    ctx.db.room().id().update(updated_room);
    log::info!("[ROOM] lobby reopened room_id:{}", room_id);
    Ok(())
}

// ==================== MAINTENANCE ====================

#[reducer(init)]
pub fn init(ctx: &ReducerContext) {
    // In init, ctx.sender is the module owner; seed it as the first
    // authorized worker so the session gateway is callable at all.
    if ctx.db.authorized_worker().identity().find(&ctx.sender).is_none() {
        ctx.db.authorized_worker().insert(AuthorizedWorker {
            identity: ctx.sender,
            added_at: ctx.timestamp,
        });
    }
    if ctx.db.room_sweep_schedule().iter().next().is_none() {
        ctx.db.room_sweep_schedule().insert(RoomSweepSchedule {
            id: 0,
            scheduled_at: ScheduleAt::Interval(Duration::from_secs(ROOM_SWEEP_INTERVAL_SECS).into()),
        });
    }
    log::info!("[INIT] derby module initialized");
}

/// Periodic sweep: tear down rooms old enough to matter whose whole
/// roster has no live session. Covers clients that vanished without a
/// clean leave.
#[reducer]
pub fn sweep_stale_rooms(ctx: &ReducerContext, _schedule: RoomSweepSchedule) {
    if ctx.sender != ctx.identity() {
        log::warn!("[SWEEP] called by non-scheduler, ignoring");
        return;
    }
    let cutoff = Duration::from_secs(STALE_ROOM_AGE_SECS);
    let stale: Vec<u64> = ctx
        .db
        .room()
        .iter()
        .filter(|room| {
            let age = ctx.timestamp.duration_since(room.created_at).unwrap_or_default();
            if age < cutoff {
                return false;
            }
            room_members(ctx, room.id)
                .iter()
                .all(|m| ctx.db.session().player_id().find(&m.player_id).is_none())
        })
        .map(|room| room.id)
        .collect();
    for room_id in stale {
        log::info!("[SWEEP] removing stale room_id:{}", room_id);
        cleanup_room_data(ctx, room_id);
    }
}

/// Membership is durable across disconnects; only the session row goes.
/// The player re-authenticates through the gateway and `join_room`
/// re-credentials them.
#[reducer(client_disconnected)]
pub fn on_disconnect(ctx: &ReducerContext) {
    if let Some(session) = ctx.db.session().connection_id().find(&ctx.sender) {
        log::info!("[SESSION] disconnected player_id:{}", session.player_id);
        ctx.db.session().player_id().delete(&session.player_id);
    }
}

// ==================== TESTS ====================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replay;

    fn block(speed: i32, stamina: i32, power: i32, guts: i32, start: i32, luck: i32) -> StatBlock {
        StatBlock {
            speed,
            stamina,
            power,
            guts,
            start,
            luck,
        }
    }

    #[test]
    fn error_strings_carry_their_category() {
        let cases = [
            (ApiError::InvalidInput("x".into()), "invalid-input: x"),
            (ApiError::Unauthenticated("x".into()), "unauthenticated: x"),
            (ApiError::PermissionDenied("x".into()), "permission-denied: x"),
            (ApiError::NotFound("x".into()), "not-found: x"),
            (ApiError::FailedPrecondition("x".into()), "failed-precondition: x"),
            (ApiError::ResourceExhausted("x".into()), "resource-exhausted: x"),
            (ApiError::Internal("x".into()), "internal: x"),
        ];
        for (err, expected) in cases {
            let rendered: String = err.into();
            assert_eq!(rendered, expected);
        }
    }

    #[test]
    fn room_config_bounds() {
        assert!(validate_room_config(3, 2, 4).is_ok());
        assert!(validate_room_config(1, 0, 2).is_ok());
        assert!(validate_room_config(MAX_TOTAL_ROUNDS, MAX_REROLL_LIMIT, MAX_ROOM_CAP).is_ok());

        assert!(validate_room_config(0, 2, 4).is_err());
        assert!(validate_room_config(MAX_TOTAL_ROUNDS + 1, 2, 4).is_err());
        assert!(validate_room_config(3, MAX_REROLL_LIMIT + 1, 4).is_err());
        assert!(validate_room_config(3, 2, 1).is_err());
        assert!(validate_room_config(3, 2, MAX_ROOM_CAP + 1).is_err());
    }

    #[test]
    fn display_name_rules() {
        assert!(validate_display_name("Swift Jenny").is_ok());
        assert!(validate_display_name("  padded  ").is_ok());
        assert!(validate_display_name("").is_err());
        assert!(validate_display_name("   ").is_err());
        assert!(validate_display_name(&"x".repeat(MAX_NAME_LEN + 1)).is_err());
    }

    #[test]
    fn stat_submission_rules() {
        assert!(validate_stats(&block(5, 5, 5, 5, 5, 5)).is_ok());
        assert!(validate_stats(&block(10, 4, 4, 4, 4, 4)).is_ok());
        assert!(validate_stats(&block(5, 5, 5, 5, 5, 4)).is_err());
        assert!(validate_stats(&block(11, 4, 4, 4, 4, 3)).is_err());
        assert!(validate_stats(&block(0, 6, 6, 6, 6, 6)).is_err());
    }

    #[test]
    fn roster_coverage_ignores_departed_signals() {
        let ready = vec!["a".to_string(), "ghost".to_string()];
        assert!(roster_covered(&ready, &["a"]));
        assert!(!roster_covered(&ready, &["a", "b"]));
        assert!(roster_covered(&[], &[]));
        assert!(!roster_covered(&[], &["a"]));
    }

    // Mirrors the ready-signal reducer's decision sequence on plain data:
    // dedupe, coverage check, finalize once.
    fn apply_signal(ready: &mut Vec<String>, finalized: &mut bool, members: &[&str], who: &str) -> bool {
        if *finalized {
            return false;
        }
        if !ready.iter().any(|p| p == who) {
            ready.push(who.to_string());
        }
        if roster_covered(ready, members) {
            *finalized = true;
            return true;
        }
        false
    }

    #[test]
    fn ready_signals_advance_exactly_once_in_any_order() {
        let members = ["a", "b", "c"];
        let orders = [
            ["a", "b", "c"],
            ["a", "c", "b"],
            ["b", "a", "c"],
            ["b", "c", "a"],
            ["c", "a", "b"],
            ["c", "b", "a"],
        ];
        for order in orders {
            let mut ready = Vec::new();
            let mut finalized = false;
            let mut advances = 0;
            for who in order {
                // Every signal arrives twice; duplicates must be harmless.
                if apply_signal(&mut ready, &mut finalized, &members, who) {
                    advances += 1;
                }
                if apply_signal(&mut ready, &mut finalized, &members, who) {
                    advances += 1;
                }
            }
            assert_eq!(advances, 1, "order {:?}", order);
            assert!(finalized);
        }
    }

    #[test]
    fn late_signals_after_finalize_are_ignored() {
        let members = ["a", "b"];
        let mut ready = Vec::new();
        let mut finalized = false;
        assert!(!apply_signal(&mut ready, &mut finalized, &members, "a"));
        assert!(apply_signal(&mut ready, &mut finalized, &members, "b"));
        assert!(!apply_signal(&mut ready, &mut finalized, &members, "b"));
        assert!(!apply_signal(&mut ready, &mut finalized, &members, "a"));
    }

    // Mirrors the reroll reducer's guard sequence on plain data.
    fn try_reroll(rerolls_used: &mut u32, limit: u32, confirmed: bool) -> Result<(), ApiError> {
        if confirmed {
            return Err(ApiError::FailedPrecondition("augment already confirmed".into()));
        }
        if *rerolls_used >= limit {
            return Err(ApiError::ResourceExhausted(format!("reroll limit of {} reached", limit)));
        }
        *rerolls_used += 1;
        Ok(())
    }

    #[test]
    fn reroll_limit_is_enforced() {
        let mut used = 0;
        assert!(try_reroll(&mut used, 2, false).is_ok());
        assert!(try_reroll(&mut used, 2, false).is_ok());
        assert!(matches!(
            try_reroll(&mut used, 2, false),
            Err(ApiError::ResourceExhausted(_))
        ));
        assert_eq!(used, 2);

        // A confirmed pick freezes the offer regardless of remaining rerolls.
        let mut fresh = 0;
        assert!(matches!(
            try_reroll(&mut fresh, 2, true),
            Err(ApiError::FailedPrecondition(_))
        ));
        assert_eq!(fresh, 0);
    }

    #[test]
    fn newest_credential_wins_across_rooms() {
        let cred = |id: u64, room_id: u64, micros: i64| RoomCredential {
            id,
            room_id,
            player_id: "ada".to_string(),
            token: format!("t{}", id),
            issued_at: Timestamp::from_micros_since_unix_epoch(micros),
        };
        // Joined three rooms over time; the view surfaces the latest issue.
        let rows = vec![cred(1, 7, 100), cred(3, 9, 900), cred(2, 8, 500)];
        let newest = newest_credential(rows.into_iter()).unwrap();
        assert_eq!(newest.id, 3);
        assert_eq!(newest.room_id, 9);
        assert!(newest_credential(std::iter::empty()).is_none());
    }

    // The deterministic pipeline end to end: seeds, tiers, offers, picks,
    // conditions, script, projection. Two independent runs over the same
    // identifiers must agree on everything a player would see.
    #[test]
    fn full_game_pipeline_reproduces_itself() {
        struct Racer {
            player_id: &'static str,
            stats: StatBlock,
            round_bonus: StatBlock,
        }

        fn run(room_id: u64, epoch: u32) -> Vec<race::RaceScript> {
            let mut roster = vec![
                Racer {
                    player_id: "ada",
                    stats: block_for_run(7, 6, 5, 4, 4, 4),
                    round_bonus: StatBlock::default(),
                },
                Racer {
                    player_id: "bo",
                    stats: block_for_run(4, 8, 5, 6, 3, 4),
                    round_bonus: StatBlock::default(),
                },
                Racer {
                    player_id: "cy",
                    stats: block_for_run(5, 5, 5, 5, 5, 5),
                    round_bonus: StatBlock::default(),
                },
            ];
            let mut scripts = Vec::new();
            for round in 1..=2u32 {
                let tier = augments::roll_tier(round, &rng::tier_seed(room_id, epoch, round));
                for racer in roster.iter_mut() {
                    let offered = augments::offer(
                        tier,
                        &rng::offer_seed(room_id, epoch, round, racer.player_id, 0),
                    );
                    assert_eq!(offered.len(), augments::OFFER_COUNT);
                    let def = augments::find(offered[0]).unwrap();
                    let (grown, bonus) = augments::apply(&racer.stats, def);
                    racer.stats = grown;
                    racer.round_bonus = racer.round_bonus.add(&bonus);
                }
                let entrants: Vec<race::RaceEntrant> = roster
                    .iter()
                    .map(|racer| {
                        let effective = racer.stats.add(&racer.round_bonus).floor_each(1);
                        race::RaceEntrant {
                            player_id: racer.player_id.to_string(),
                            stats: effective,
                            condition: augments::roll_condition(
                                effective.luck,
                                &rng::condition_seed(room_id, epoch, round, racer.player_id),
                            ),
                            abilities: Vec::new(),
                        }
                    })
                    .collect();
                let script = race::build_script(&entrants);
                assert_eq!(script.rankings.len(), 3);
                scripts.push(script);
                for racer in roster.iter_mut() {
                    racer.round_bonus = StatBlock::default();
                }
            }
            scripts
        }

        fn block_for_run(speed: i32, stamina: i32, power: i32, guts: i32, start: i32, luck: i32) -> StatBlock {
            StatBlock {
                speed,
                stamina,
                power,
                guts,
                start,
                luck,
            }
        }

        let first = run(42, 1);
        let second = run(42, 1);
        assert_eq!(first, second);

        // A different epoch reseeds the whole game.
        let replayed = run(42, 2);
        assert_ne!(
            first[0].input_hash, replayed[0].input_hash,
            "same room, new game, same draws"
        );

        // Projection of the stored script completes cleanly.
        let start = Timestamp::from_micros_since_unix_epoch(1_700_000_000_000_000);
        let snap = replay::project(
            &first[0],
            Some(start),
            start + Duration::from_secs_f64(first[0].duration + 1.0),
        );
        assert_eq!(snap.status, PlaybackStatus::Completed);
        let final_frame = first[0].keyframes.last().unwrap();
        assert!(final_frame.racers.iter().all(|r| r.finished));
    }
}
