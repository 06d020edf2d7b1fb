//! Deterministic race simulation.
//!
//! [`build_script`] turns a set of entrants (effective stats, abilities,
//! race-day condition) into a complete race script: sampled keyframes for
//! playback, presentation events, final rankings, and a digest of the inputs.
//! The simulation is a fixed-step integration with no randomness of its own,
//! so the same entrants in the same order always produce a byte-identical
//! script. Clients only ever replay scripts; nothing here runs in real time.

use spacetimedb::SpacetimeType;

use crate::augments::{Ability, StatBlock};

/// Course length in track units.
pub const TRACK_LENGTH: f64 = 1000.0;
/// Seconds between stored keyframes.
pub const FRAME_INTERVAL: f64 = 0.5;

const SIM_STEP: f64 = 0.1;
const STEPS_PER_FRAME: u64 = 5;

// Pace model coefficients. Top speed scales with speed and condition,
// launch with start and power, fatigue onset and the speed floor with
// stamina and guts.
const BASE_TOP_SPEED: f64 = 16.0;
const TOP_SPEED_PER_SPEED: f64 = 0.030;
const TOP_SPEED_PER_CONDITION: f64 = 0.02;
const ACCEL_BASE_SECS: f64 = 6.0;
const ACCEL_PER_LAUNCH: f64 = 0.05;
const FATIGUE_BASE_FRACTION: f64 = 0.55;
const FATIGUE_PER_STAMINA: f64 = 0.025;
const FATIGUE_PER_GUTS: f64 = 0.012;
const FATIGUE_FRACTION_MAX: f64 = 0.96;
const DECAY_FRACTION_PER_SEC: f64 = 0.30;
const STEADY_PACE_DECAY_SCALE: f64 = 0.5;
const FLOOR_BASE_FRACTION: f64 = 0.48;
const FLOOR_PER_GUTS: f64 = 0.022;
const FLOOR_PER_STAMINA: f64 = 0.012;
const FLOOR_FRACTION_MAX: f64 = 0.92;

// Presentation cue timing, as fractions of a finish time.
const LAST_EFFORT_AT: f64 = 0.8;
const LATE_CHARGE_EFFORT_AT: f64 = 0.7;
const SLOWDOWN_CUE_AT: f64 = 0.9;

/// One racer's inputs: identity, effective stats for this round, abilities
/// granted by the round's augment, and rolled condition.
#[derive(SpacetimeType, Clone, Debug, PartialEq)]
pub struct RaceEntrant {
    pub player_id: String,
    pub stats: StatBlock,
    pub abilities: Vec<Ability>,
    pub condition: i32,
}

impl RaceEntrant {
    fn has(&self, ability: Ability) -> bool {
        self.abilities.contains(&ability)
    }
}

/// Per-racer state at one keyframe. `stamina_left` is the remaining fraction
/// of track before fatigue sets in, for gauges; zero once tired or done.
#[derive(SpacetimeType, Clone, Debug, PartialEq)]
pub struct RacerFrame {
    pub position: f64,
    pub speed: f64,
    pub stamina_left: f64,
    pub finished: bool,
}

/// A sampled moment of the race. `racers` is parallel to the script's
/// entrant list.
#[derive(SpacetimeType, Clone, Debug, PartialEq)]
pub struct Keyframe {
    pub t: f64,
    pub racers: Vec<RacerFrame>,
}

#[derive(SpacetimeType, Clone, Copy, Debug, PartialEq, Eq)]
pub enum RaceEventKind {
    /// A racer's standing improved; carries old and new place.
    RankChange,
    /// The racer begins their final effort.
    LastEffort,
    /// The racer crosses the line; carries the final place.
    Finish,
    /// Field-wide wind-down cue near the front-runner's finish.
    SlowdownCue,
}

#[derive(SpacetimeType, Clone, Debug, PartialEq)]
pub struct RaceEvent {
    pub t: f64,
    pub kind: RaceEventKind,
    pub player_id: Option<String>,
    pub place: Option<u32>,
    pub from_place: Option<u32>,
}

#[derive(SpacetimeType, Clone, Debug, PartialEq)]
pub struct RankingEntry {
    pub player_id: String,
    pub finish_time: f64,
    pub place: u32,
}

/// The complete, immutable product of one simulation run.
#[derive(SpacetimeType, Clone, Debug, PartialEq)]
pub struct RaceScript {
    pub entrants: Vec<RaceEntrant>,
    pub keyframes: Vec<Keyframe>,
    pub events: Vec<RaceEvent>,
    pub rankings: Vec<RankingEntry>,
    pub track_length: f64,
    pub frame_interval: f64,
    /// Last finisher's crossing time; playback ends here.
    pub duration: f64,
    /// blake3 digest of the canonical input encoding, for drift checks.
    pub input_hash: String,
}

struct PaceProfile {
    top_speed: f64,
    accel_secs: f64,
    fatigue_at: f64,
    decay_per_sec: f64,
    floor: f64,
}

fn pace_profile(entrant: &RaceEntrant) -> PaceProfile {
    let s = &entrant.stats;
    let condition_factor = 1.0 + TOP_SPEED_PER_CONDITION * entrant.condition as f64;
    let top_speed = BASE_TOP_SPEED * (1.0 + TOP_SPEED_PER_SPEED * s.speed as f64) * condition_factor;
    let accel_secs = ACCEL_BASE_SECS / (1.0 + ACCEL_PER_LAUNCH * (s.start + s.power) as f64);
    let fatigue_fraction = (FATIGUE_BASE_FRACTION
        + FATIGUE_PER_STAMINA * s.stamina as f64
        + FATIGUE_PER_GUTS * s.guts as f64)
        .min(FATIGUE_FRACTION_MAX);
    let decay_scale = if entrant.has(Ability::SteadyPace) {
        STEADY_PACE_DECAY_SCALE
    } else {
        1.0
    };
    let floor_fraction = (FLOOR_BASE_FRACTION
        + FLOOR_PER_GUTS * s.guts as f64
        + FLOOR_PER_STAMINA * s.stamina as f64)
        .min(FLOOR_FRACTION_MAX);
    PaceProfile {
        top_speed,
        accel_secs,
        fatigue_at: TRACK_LENGTH * fatigue_fraction,
        decay_per_sec: DECAY_FRACTION_PER_SEC * top_speed * decay_scale,
        floor: top_speed * floor_fraction,
    }
}

/// Speed at time `t` for a racer whose fatigue began at `fatigued_since`
/// (if it has). The floor is strictly positive, so racers always finish.
fn current_speed(p: &PaceProfile, t: f64, fatigued_since: Option<f64>) -> f64 {
    if let Some(t0) = fatigued_since {
        return (p.top_speed - p.decay_per_sec * (t - t0)).max(p.floor);
    }
    if t < p.accel_secs {
        p.top_speed * (t / p.accel_secs)
    } else {
        p.top_speed
    }
}

/// Run the simulation and assemble the full script. Entrant order is
/// preserved everywhere; rebuilding from the same inputs reproduces the
/// script exactly.
pub fn build_script(entrants: &[RaceEntrant]) -> RaceScript {
    let profiles: Vec<PaceProfile> = entrants.iter().map(pace_profile).collect();
    let n = entrants.len();

    let mut pos = vec![0.0f64; n];
    let mut fatigued_since: Vec<Option<f64>> = vec![None; n];
    let mut finish: Vec<Option<f64>> = vec![None; n];
    let mut keyframes: Vec<Keyframe> = Vec::new();

    let mut step: u64 = 0;
    loop {
        let t = step as f64 * SIM_STEP;
        if step % STEPS_PER_FRAME == 0 {
            keyframes.push(capture(t, &profiles, &pos, &fatigued_since, &finish));
            if finish.iter().all(|f| f.is_some()) {
                break;
            }
        }
        for i in 0..n {
            if finish[i].is_some() {
                continue;
            }
            if fatigued_since[i].is_none() && pos[i] >= profiles[i].fatigue_at {
                fatigued_since[i] = Some(t);
            }
            let v = current_speed(&profiles[i], t, fatigued_since[i]);
            let next = pos[i] + v * SIM_STEP;
            if next >= TRACK_LENGTH {
                // Speed is constant within a step, so the crossing is exact.
                finish[i] = Some(t + (TRACK_LENGTH - pos[i]) / v);
                pos[i] = TRACK_LENGTH;
            } else {
                pos[i] = next;
            }
        }
        step += 1;
    }

    let duration = finish
        .iter()
        .filter_map(|f| *f)
        .fold(0.0f64, f64::max);

    let rankings = rank(entrants, &finish);
    let events = collect_events(entrants, &keyframes, &finish, &rankings, duration);

    RaceScript {
        entrants: entrants.to_vec(),
        keyframes,
        events,
        rankings,
        track_length: TRACK_LENGTH,
        frame_interval: FRAME_INTERVAL,
        duration,
        input_hash: input_digest(entrants),
    }
}

fn capture(
    t: f64,
    profiles: &[PaceProfile],
    pos: &[f64],
    fatigued_since: &[Option<f64>],
    finish: &[Option<f64>],
) -> Keyframe {
    let racers = profiles
        .iter()
        .enumerate()
        .map(|(i, p)| {
            if finish[i].is_some() {
                RacerFrame {
                    position: TRACK_LENGTH,
                    speed: 0.0,
                    stamina_left: 0.0,
                    finished: true,
                }
            } else {
                let stamina_left = if fatigued_since[i].is_some() {
                    0.0
                } else {
                    ((p.fatigue_at - pos[i]) / p.fatigue_at).clamp(0.0, 1.0)
                };
                RacerFrame {
                    position: pos[i],
                    speed: current_speed(p, t, fatigued_since[i]),
                    stamina_left,
                    finished: false,
                }
            }
        })
        .collect();
    Keyframe { t, racers }
}

/// Final standings: ascending finish time, ties broken by ascending
/// player id.
fn rank(entrants: &[RaceEntrant], finish: &[Option<f64>]) -> Vec<RankingEntry> {
    let mut order: Vec<usize> = (0..entrants.len()).collect();
    order.sort_by(|&a, &b| {
        finish[a]
            .unwrap_or(f64::MAX)
            .total_cmp(&finish[b].unwrap_or(f64::MAX))
            .then_with(|| entrants[a].player_id.cmp(&entrants[b].player_id))
    });
    order
        .iter()
        .enumerate()
        .map(|(i, &idx)| RankingEntry {
            player_id: entrants[idx].player_id.clone(),
            finish_time: finish[idx].unwrap_or(0.0),
            place: (i + 1) as u32,
        })
        .collect()
}

/// Standing of each racer at one keyframe: finishers rank by crossing time,
/// the rest by distance covered, ties by player id.
fn standings_at(frame: &Keyframe, entrants: &[RaceEntrant], finish: &[Option<f64>]) -> Vec<u32> {
    let n = entrants.len();
    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|&a, &b| {
        let key = |i: usize| -> (f64, f64) {
            match finish[i] {
                Some(f) if f <= frame.t => (TRACK_LENGTH, f),
                _ => (frame.racers[i].position, f64::MAX),
            }
        };
        let (pos_a, fin_a) = key(a);
        let (pos_b, fin_b) = key(b);
        pos_b
            .total_cmp(&pos_a)
            .then(fin_a.total_cmp(&fin_b))
            .then_with(|| entrants[a].player_id.cmp(&entrants[b].player_id))
    });
    let mut places = vec![0u32; n];
    for (rank, &idx) in order.iter().enumerate() {
        places[idx] = (rank + 1) as u32;
    }
    places
}

fn collect_events(
    entrants: &[RaceEntrant],
    keyframes: &[Keyframe],
    finish: &[Option<f64>],
    rankings: &[RankingEntry],
    duration: f64,
) -> Vec<RaceEvent> {
    let mut events = Vec::new();

    for entry in rankings {
        events.push(RaceEvent {
            t: entry.finish_time,
            kind: RaceEventKind::Finish,
            player_id: Some(entry.player_id.clone()),
            place: Some(entry.place),
            from_place: None,
        });
    }

    for (i, entrant) in entrants.iter().enumerate() {
        if let Some(f) = finish[i] {
            let fraction = if entrant.has(Ability::LateCharge) {
                LATE_CHARGE_EFFORT_AT
            } else {
                LAST_EFFORT_AT
            };
            events.push(RaceEvent {
                t: f * fraction,
                kind: RaceEventKind::LastEffort,
                player_id: Some(entrant.player_id.clone()),
                place: None,
                from_place: None,
            });
        }
    }

    if let Some(winner) = rankings.first() {
        events.push(RaceEvent {
            t: winner.finish_time * SLOWDOWN_CUE_AT,
            kind: RaceEventKind::SlowdownCue,
            player_id: None,
            place: None,
            from_place: None,
        });
    }

    // Overtakes: a racer whose place improves between consecutive keyframes.
    let mut prev_places: Option<Vec<u32>> = None;
    for frame in keyframes {
        let places = standings_at(frame, entrants, finish);
        if let Some(prev) = &prev_places {
            for (i, entrant) in entrants.iter().enumerate() {
                if places[i] < prev[i] {
                    events.push(RaceEvent {
                        t: frame.t.min(duration),
                        kind: RaceEventKind::RankChange,
                        player_id: Some(entrant.player_id.clone()),
                        place: Some(places[i]),
                        from_place: Some(prev[i]),
                    });
                }
            }
        }
        prev_places = Some(places);
    }

    events.sort_by(|a, b| {
        a.t.total_cmp(&b.t)
            .then(kind_order(&a.kind).cmp(&kind_order(&b.kind)))
            .then_with(|| a.player_id.cmp(&b.player_id))
    });
    events
}

fn kind_order(kind: &RaceEventKind) -> u8 {
    match kind {
        RaceEventKind::SlowdownCue => 0,
        RaceEventKind::RankChange => 1,
        RaceEventKind::LastEffort => 2,
        RaceEventKind::Finish => 3,
    }
}

/// Canonical digest of the simulation inputs. Stored on the script so a
/// later rebuild can be checked for drift against what players saw.
pub fn input_digest(entrants: &[RaceEntrant]) -> String {
    let encoded = serde_json::json!({
        "track_length": TRACK_LENGTH,
        "frame_interval": FRAME_INTERVAL,
        "entrants": entrants
            .iter()
            .map(|e| {
                serde_json::json!({
                    "player": e.player_id,
                    "stats": [
                        e.stats.speed,
                        e.stats.stamina,
                        e.stats.power,
                        e.stats.guts,
                        e.stats.start,
                        e.stats.luck,
                    ],
                    "abilities": e.abilities.iter().map(ability_tag).collect::<Vec<_>>(),
                    "condition": e.condition,
                })
            })
            .collect::<Vec<_>>(),
    });
    blake3::hash(encoded.to_string().as_bytes())
        .to_hex()
        .to_string()
}

fn ability_tag(ability: &Ability) -> &'static str {
    match ability {
        Ability::LateCharge => "late-charge",
        Ability::SteadyPace => "steady-pace",
    }
}
