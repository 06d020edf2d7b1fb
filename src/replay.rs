//! Read-side projection of a race script onto wall-clock time.
//!
//! The stored script is the single source of truth; this module derives what
//! a viewer should currently see from the script, the persisted start time,
//! and the caller's clock. Pure functions only, so any poll at the same
//! instant sees the same snapshot and nothing here can drift between
//! callers.

use spacetimedb::Timestamp;

use crate::race::{Keyframe, RaceEvent, RaceScript};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PlaybackStatus {
    /// Script exists but the start gun hasn't fired.
    Prepared,
    Running,
    Completed,
}

/// What a viewer should render right now.
#[derive(Clone, Debug, PartialEq)]
pub struct RaceSnapshot {
    pub status: PlaybackStatus,
    /// Seconds into playback, clamped to `[0, duration]`.
    pub elapsed: f64,
    pub frame_index: usize,
    pub frame: Keyframe,
    /// The following keyframe, for interpolation; `None` at the last frame.
    pub next_frame: Option<Keyframe>,
    /// Events inside the current frame window. Windows are half-open and
    /// consecutive, so polling each window once delivers every event exactly
    /// once; the completed snapshot closes the right edge at `duration`.
    pub events: Vec<RaceEvent>,
}

pub fn project(script: &RaceScript, started_at: Option<Timestamp>, now: Timestamp) -> RaceSnapshot {
    let Some(first) = script.keyframes.first() else {
        // Nothing to play; report it finished rather than wedge the round.
        return RaceSnapshot {
            status: PlaybackStatus::Completed,
            elapsed: 0.0,
            frame_index: 0,
            frame: Keyframe {
                t: 0.0,
                racers: Vec::new(),
            },
            next_frame: None,
            events: Vec::new(),
        };
    };

    let Some(started) = started_at else {
        return RaceSnapshot {
            status: PlaybackStatus::Prepared,
            elapsed: 0.0,
            frame_index: 0,
            frame: first.clone(),
            next_frame: script.keyframes.get(1).cloned(),
            events: Vec::new(),
        };
    };

    // A clock behind the start time reads as zero elapsed.
    let raw = now
        .duration_since(started)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0);
    let done = raw >= script.duration;
    let elapsed = raw.min(script.duration);

    let last = script.keyframes.len() - 1;
    let frame_index = ((elapsed / script.frame_interval).floor() as usize).min(last);
    let window_start = frame_index as f64 * script.frame_interval;

    let events: Vec<RaceEvent> = if done {
        script
            .events
            .iter()
            .filter(|e| e.t >= window_start && e.t <= script.duration)
            .cloned()
            .collect()
    } else {
        let window_end = window_start + script.frame_interval;
        script
            .events
            .iter()
            .filter(|e| e.t >= window_start && e.t < window_end)
            .cloned()
            .collect()
    };

    RaceSnapshot {
        status: if done {
            PlaybackStatus::Completed
        } else {
            PlaybackStatus::Running
        },
        elapsed,
        frame_index,
        frame: script.keyframes[frame_index].clone(),
        next_frame: script.keyframes.get(frame_index + 1).cloned(),
        events,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::augments::StatBlock;
    use crate::race::{build_script, RaceEntrant, RaceEventKind};
    use std::time::Duration;

    fn two_racer_script() -> RaceScript {
        let stats = |speed| StatBlock {
            speed,
            stamina: 6,
            power: 5,
            guts: 5,
            start: 4,
            luck: 5,
        };
        build_script(&[
            RaceEntrant {
                player_id: "pia".into(),
                stats: stats(8),
                abilities: Vec::new(),
                condition: 1,
            },
            RaceEntrant {
                player_id: "quin".into(),
                stats: stats(5),
                abilities: Vec::new(),
                condition: 0,
            },
        ])
    }

    fn t0() -> Timestamp {
        Timestamp::from_micros_since_unix_epoch(1_700_000_000_000_000)
    }

    #[test]
    fn unstarted_script_shows_the_grid() {
        let script = two_racer_script();
        let snap = project(&script, None, t0());
        assert_eq!(snap.status, PlaybackStatus::Prepared);
        assert_eq!(snap.elapsed, 0.0);
        assert_eq!(snap.frame_index, 0);
        assert_eq!(snap.frame.t, 0.0);
        assert!(snap.next_frame.is_some());
        assert!(snap.events.is_empty());
    }

    #[test]
    fn running_snapshot_lands_in_the_right_window() {
        let script = two_racer_script();
        let start = t0();
        let snap = project(&script, Some(start), start + Duration::from_millis(1_300));
        assert_eq!(snap.status, PlaybackStatus::Running);
        assert!((snap.elapsed - 1.3).abs() < 1e-6);
        assert_eq!(snap.frame_index, 2);
        assert!((snap.frame.t - 1.0).abs() < 1e-9);
        for event in &snap.events {
            assert!(event.t >= 1.0 && event.t < 1.5);
        }
    }

    #[test]
    fn clock_behind_start_reads_as_zero() {
        let script = two_racer_script();
        let start = t0() + Duration::from_secs(10);
        let snap = project(&script, Some(start), t0());
        assert_eq!(snap.status, PlaybackStatus::Running);
        assert_eq!(snap.elapsed, 0.0);
        assert_eq!(snap.frame_index, 0);
    }

    #[test]
    fn windows_deliver_every_event_exactly_once() {
        let script = two_racer_script();
        let start = t0();
        let final_index = (script.duration / script.frame_interval).floor() as usize;

        let mut delivered: Vec<RaceEvent> = Vec::new();
        for k in 0..final_index {
            let now = start + Duration::from_secs_f64(k as f64 * script.frame_interval + 0.25);
            let snap = project(&script, Some(start), now);
            assert_eq!(snap.status, PlaybackStatus::Running);
            assert_eq!(snap.frame_index, k);
            delivered.extend(snap.events);
        }
        let finale = project(&script, Some(start), start + Duration::from_secs_f64(script.duration + 5.0));
        assert_eq!(finale.status, PlaybackStatus::Completed);
        assert_eq!(finale.frame_index, final_index.min(script.keyframes.len() - 1));
        delivered.extend(finale.events);

        let sort_key = |e: &RaceEvent| (e.t.to_bits(), e.player_id.clone());
        let mut expected = script.events.clone();
        expected.sort_by_key(sort_key);
        delivered.sort_by_key(sort_key);
        assert_eq!(delivered, expected);
    }

    #[test]
    fn completed_snapshot_carries_the_last_crossing() {
        let script = two_racer_script();
        let start = t0();
        let snap = project(&script, Some(start), start + Duration::from_secs_f64(script.duration + 0.01));
        assert_eq!(snap.status, PlaybackStatus::Completed);
        assert!((snap.elapsed - script.duration).abs() < 1e-9);

        // The shown frame is the window holding the last crossing, so the
        // winner is already over the line in it.
        let winner = &script.rankings[0].player_id;
        let idx = script
            .entrants
            .iter()
            .position(|e| &e.player_id == winner)
            .unwrap();
        assert!(snap.frame.racers[idx].finished);

        let last_finisher = &script.rankings.last().unwrap().player_id;
        assert!(snap.events.iter().any(|e| {
            e.kind == RaceEventKind::Finish && e.player_id.as_deref() == Some(last_finisher.as_str())
        }));
    }

    #[test]
    fn far_future_polls_are_stable() {
        let script = two_racer_script();
        let start = t0();
        let a = project(&script, Some(start), start + Duration::from_secs_f64(script.duration + 1.0));
        let b = project(&script, Some(start), start + Duration::from_secs(7200));
        assert_eq!(a, b);
    }

    #[test]
    fn frames_stay_parallel_to_entrants() {
        let script = two_racer_script();
        let snap = project(&script, Some(t0()), t0() + Duration::from_secs(5));
        assert_eq!(snap.frame.racers.len(), script.entrants.len());
        if let Some(next) = &snap.next_frame {
            assert_eq!(next.racers.len(), script.entrants.len());
        }
    }
}
