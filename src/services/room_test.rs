use super::*;
use crate::track::{Platform, Track};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

const T0: i64 = 1_700_000_000_000;

fn snapshot(owner: Uuid, n: usize) -> PlaylistSnapshot {
    let tracks = (0..n)
        .map(|i| Track::new(Platform::YouTube, format!("{owner}-{i}")).expect("track"))
        .collect();
    PlaylistSnapshot::new(Uuid::new_v4(), owner, tracks).expect("non-empty")
}

fn room() -> RoomState {
    RoomState::new(Uuid::new_v4(), "Test Room", Uuid::new_v4())
}

fn joined(state: &mut RoomState, name: &str) -> Uuid {
    let id = Uuid::new_v4();
    state.join(id, name);
    id
}

fn events_for(t: &Transition, audience: Audience) -> Vec<&RoomEvent> {
    t.events
        .iter()
        .filter(|o| o.audience == audience)
        .map(|o| &o.event)
        .collect()
}

fn deck_changes(t: &Transition) -> Vec<&DeckView> {
    t.events
        .iter()
        .filter_map(|o| match &o.event {
            RoomEvent::DeckChanged(deck) => Some(deck),
            _ => None,
        })
        .collect()
}

// =============================================================================
// Join / Leave
// =============================================================================

#[test]
fn join_announces_to_others_and_snapshots_joiner() {
    let mut state = room();
    let a = joined(&mut state, "alice");
    let b = Uuid::new_v4();

    let t = state.join(b, "bob");

    assert_eq!(
        events_for(&t, Audience::RoomExcept(b)),
        vec![&RoomEvent::MemberJoined { user_id: b, username: "bob".into() }]
    );
    let snap = events_for(&t, Audience::User(b));
    let [RoomEvent::Snapshot(view)] = snap.as_slice() else {
        panic!("expected one snapshot, got {snap:?}");
    };
    assert_eq!(view.members.len(), 2);
    assert_eq!(view.members[0].user_id, a);
    assert!(!view.is_dj);
    assert!(!t.deck_dirty);
}

#[test]
fn rejoin_does_not_duplicate_roster_or_announce() {
    let mut state = room();
    let a = joined(&mut state, "alice");

    let t = state.join(a, "alice");

    assert_eq!(state.member_count(), 1);
    assert!(events_for(&t, Audience::RoomExcept(a)).is_empty());
    assert_eq!(events_for(&t, Audience::User(a)).len(), 1);
}

#[test]
fn leave_of_unknown_user_is_noop() {
    let mut state = room();
    joined(&mut state, "alice");
    let t = state.leave(Uuid::new_v4(), T0);
    assert!(t.is_noop());
    assert_eq!(state.member_count(), 1);
}

#[test]
fn leave_compacts_queue_without_reordering() {
    let mut state = room();
    let dj = joined(&mut state, "dj");
    let a = joined(&mut state, "a");
    let b = joined(&mut state, "b");
    let c = joined(&mut state, "c");
    state.join_queue(dj, snapshot(dj, 2), T0).unwrap();
    for u in [a, b, c] {
        state.join_queue(u, snapshot(u, 1), T0).unwrap();
    }

    let t = state.leave(b, T0);

    assert_eq!(state.queue_ids(), vec![a, c]);
    assert!(t.deck_dirty);
    assert_eq!(events_for(&t, Audience::RoomExcept(b)), vec![&RoomEvent::MemberLeft { user_id: b }]);
    assert!(deck_changes(&t).is_empty());
    assert!(state.is_dj(dj));
}

#[test]
fn sole_dj_disconnect_goes_idle_with_null_track() {
    let mut state = room();
    let u = joined(&mut state, "u");
    let listener = joined(&mut state, "listener");
    state.join_queue(u, snapshot(u, 3), T0).unwrap();

    let t = state.leave(u, T0 + 5_000);

    assert!(!state.is_playing());
    assert!(state.current_dj().is_none());
    assert!(state.playback_started_at().is_none());
    let decks = deck_changes(&t);
    assert_eq!(decks.len(), 1);
    assert!(decks[0].track.is_none());
    assert!(decks[0].current_dj.is_none());
    assert_eq!(decks[0].cause, DeckCause::Idle);
    assert_eq!(events_for(&t, Audience::User(u)), vec![&RoomEvent::NoLongerDj]);
    assert!(!state.is_member(u));
    assert!(state.is_member(listener));
    state.check_invariants(T0 + 5_000).unwrap();
}

#[test]
fn dj_disconnect_promotes_head_of_queue() {
    let mut state = room();
    let u = joined(&mut state, "u");
    let v = joined(&mut state, "v");
    state.join_queue(u, snapshot(u, 3), T0).unwrap();
    state.join_queue(v, snapshot(v, 2), T0).unwrap();

    let t = state.leave(u, T0 + 1);

    assert!(state.is_dj(v));
    assert_eq!(events_for(&t, Audience::User(v)), vec![&RoomEvent::BecameDj]);
    assert_eq!(deck_changes(&t)[0].current_dj, Some(v));
}

// =============================================================================
// Queue
// =============================================================================

#[test]
fn first_queuer_in_idle_room_becomes_dj_immediately() {
    let mut state = room();
    let u = joined(&mut state, "u");
    let pl = snapshot(u, 3);
    let first = pl.get(0).cloned();

    let t = state.join_queue(u, pl, T0).unwrap();

    let dj = state.current_dj().expect("dj");
    assert_eq!(dj.user_id, u);
    assert_eq!(dj.current_index, 0);
    assert!(state.is_playing());
    assert_eq!(state.playback_started_at(), Some(T0));
    assert!(state.queue_ids().is_empty());
    assert_eq!(events_for(&t, Audience::User(u)), vec![&RoomEvent::BecameDj]);
    let decks = deck_changes(&t);
    assert_eq!(decks.len(), 1);
    assert_eq!(decks[0].track, first);
    assert_eq!(decks[0].cause, DeckCause::NewDj);
    assert!(t.deck_dirty);
}

#[test]
fn second_queuer_waits_and_gets_ack_only() {
    let mut state = room();
    let u = joined(&mut state, "u");
    let v = joined(&mut state, "v");
    state.join_queue(u, snapshot(u, 1), T0).unwrap();

    let t = state.join_queue(v, snapshot(v, 1), T0).unwrap();

    assert_eq!(t.events, vec![Outbound { audience: Audience::User(v), event: RoomEvent::JoinedQueue { position: 0 } }]);
    assert_eq!(state.queue_ids(), vec![v]);
}

#[test]
fn already_active_rejected_without_mutation() {
    let mut state = room();
    let u = joined(&mut state, "u");
    let v = joined(&mut state, "v");
    state.join_queue(u, snapshot(u, 1), T0).unwrap();
    state.join_queue(v, snapshot(v, 1), T0).unwrap();
    let seq = state.deck_seq();

    assert!(matches!(state.join_queue(u, snapshot(u, 2), T0), Err(RoomError::AlreadyActive)));
    assert!(matches!(state.join_queue(v, snapshot(v, 2), T0), Err(RoomError::AlreadyActive)));
    assert_eq!(state.queue_ids(), vec![v]);
    assert_eq!(state.deck_seq(), seq);
}

#[test]
fn non_member_cannot_queue() {
    let mut state = room();
    let stranger = Uuid::new_v4();
    assert!(matches!(state.check_can_queue(stranger), Err(RoomError::NotMember(id)) if id == stranger));
}

#[test]
fn queue_promotes_in_fifo_order() {
    let mut state = room();
    let dj = joined(&mut state, "dj");
    let a = joined(&mut state, "a");
    let b = joined(&mut state, "b");
    let c = joined(&mut state, "c");
    state.join_queue(dj, snapshot(dj, 1), T0).unwrap();
    for u in [a, b, c] {
        state.join_queue(u, snapshot(u, 1), T0).unwrap();
    }

    let mut order = Vec::new();
    let mut now = T0;
    for _ in 0..3 {
        now += 1_000;
        let current = state.current_dj().unwrap().user_id;
        state.song_finished(current, None, now);
        order.push(state.current_dj().unwrap().user_id);
    }

    assert_eq!(order, vec![a, b, c]);
}

// =============================================================================
// Song finished
// =============================================================================

#[test]
fn distinct_finish_signals_advance_each_time() {
    let mut state = room();
    let u = joined(&mut state, "u");
    state.join_queue(u, snapshot(u, 3), T0).unwrap();

    let t1 = state.song_finished(u, None, T0 + 1_000);
    assert_eq!(state.current_dj().unwrap().current_index, 1);
    assert_eq!(deck_changes(&t1)[0].cause, DeckCause::NextTrack);
    assert_eq!(state.playback_started_at(), Some(T0 + 1_000));

    state.song_finished(u, None, T0 + 2_000);
    assert_eq!(state.current_dj().unwrap().current_index, 2);
    assert!(state.is_playing());
}

#[test]
fn duplicate_finish_for_same_track_is_noop() {
    let mut state = room();
    let u = joined(&mut state, "u");
    state.join_queue(u, snapshot(u, 3), T0).unwrap();
    let seq = state.deck_seq();

    let first = state.song_finished(u, Some(seq), T0 + 1_000);
    assert_eq!(deck_changes(&first).len(), 1);
    let index_after_first = state.current_dj().unwrap().current_index;

    let second = state.song_finished(u, Some(seq), T0 + 1_001);
    assert!(second.is_noop());
    assert_eq!(state.current_dj().unwrap().current_index, index_after_first);
}

#[test]
fn finish_from_non_dj_is_ignored() {
    let mut state = room();
    let u = joined(&mut state, "u");
    let v = joined(&mut state, "v");
    state.join_queue(u, snapshot(u, 3), T0).unwrap();

    assert!(state.song_finished(v, None, T0 + 1).is_noop());
    assert_eq!(state.current_dj().unwrap().current_index, 0);
}

#[test]
fn finish_in_idle_room_is_ignored() {
    let mut state = room();
    let u = joined(&mut state, "u");
    assert!(state.song_finished(u, None, T0).is_noop());
}

#[test]
fn last_track_hands_deck_to_queue() {
    let mut state = room();
    let u = joined(&mut state, "u");
    let v = joined(&mut state, "v");
    state.join_queue(u, snapshot(u, 2), T0).unwrap();
    let v_playlist = snapshot(v, 2);
    let v_first = v_playlist.get(0).cloned();
    state.join_queue(v, v_playlist, T0).unwrap();

    state.song_finished(u, None, T0 + 1_000);
    let t = state.song_finished(u, None, T0 + 2_000);

    let dj = state.current_dj().unwrap();
    assert_eq!(dj.user_id, v);
    assert_eq!(dj.current_index, 0);
    assert_eq!(events_for(&t, Audience::User(u)), vec![&RoomEvent::NoLongerDj]);
    assert_eq!(events_for(&t, Audience::User(v)), vec![&RoomEvent::BecameDj]);
    let decks = deck_changes(&t);
    assert_eq!(decks.len(), 1);
    assert_eq!(decks[0].track, v_first);
    assert!(state.queue_ids().is_empty());
}

#[test]
fn last_track_with_empty_queue_goes_idle() {
    let mut state = room();
    let u = joined(&mut state, "u");
    state.join_queue(u, snapshot(u, 1), T0).unwrap();

    let t = state.song_finished(u, None, T0 + 1_000);

    assert!(!state.is_playing());
    assert_eq!(deck_changes(&t)[0].cause, DeckCause::Idle);
    // The former DJ may queue again.
    state.check_can_queue(u).unwrap();
}

#[test]
fn superseded_dj_signals_are_ignored() {
    let mut state = room();
    let u = joined(&mut state, "u");
    let v = joined(&mut state, "v");
    state.join_queue(u, snapshot(u, 3), T0).unwrap();
    state.join_queue(v, snapshot(v, 3), T0).unwrap();
    let stale_seq = state.deck_seq();
    state.leave(u, T0 + 1);

    assert!(state.song_finished(u, Some(stale_seq), T0 + 2).is_noop());
    assert!(matches!(state.request_skip(u, T0 + 60_000, DEFAULT_SKIP_GUARD_MS), Err(RoomError::NotDj)));
    assert!(state.is_dj(v));
}

// =============================================================================
// Skip
// =============================================================================

#[test]
fn skip_inside_guard_is_too_soon_and_does_not_move_cursor() {
    let mut state = room();
    let u = joined(&mut state, "u");
    state.join_queue(u, snapshot(u, 3), T0).unwrap();

    let err = state.request_skip(u, T0 + 4_000, DEFAULT_SKIP_GUARD_MS).unwrap_err();

    assert!(matches!(err, RoomError::TooSoon { remaining_ms: 6_000 }));
    assert_eq!(state.current_dj().unwrap().current_index, 0);
    assert_eq!(state.playback_started_at(), Some(T0));
}

#[test]
fn skip_after_guard_advances_with_skip_cause() {
    let mut state = room();
    let u = joined(&mut state, "u");
    state.join_queue(u, snapshot(u, 3), T0).unwrap();

    let t = state.request_skip(u, T0 + DEFAULT_SKIP_GUARD_MS, DEFAULT_SKIP_GUARD_MS).unwrap();

    assert_eq!(state.current_dj().unwrap().current_index, 1);
    assert_eq!(deck_changes(&t)[0].cause, DeckCause::Skipped);
}

#[test]
fn skip_by_listener_is_not_dj() {
    let mut state = room();
    let u = joined(&mut state, "u");
    let v = joined(&mut state, "v");
    state.join_queue(u, snapshot(u, 3), T0).unwrap();
    assert!(matches!(state.request_skip(v, T0 + 60_000, DEFAULT_SKIP_GUARD_MS), Err(RoomError::NotDj)));
}

// =============================================================================
// Recovery / reset
// =============================================================================

#[test]
fn restore_accepts_consistent_record() {
    let mut source = room();
    let u = joined(&mut source, "u");
    let v = joined(&mut source, "v");
    source.join_queue(u, snapshot(u, 2), T0).unwrap();
    source.join_queue(v, snapshot(v, 2), T0).unwrap();
    let record = source.deck_record();

    let mut restored = RoomState::new(source.room_id(), "Test Room", source.owner_id());
    restored.restore(record, T0 + 10).unwrap();

    assert!(restored.is_dj(u));
    assert_eq!(restored.queue_ids(), vec![v]);
    assert_eq!(restored.deck_seq(), source.deck_seq());
    assert!(restored.has_absent_participants());
}

#[test]
fn restore_rejects_broken_record_and_stays_idle() {
    let u = Uuid::new_v4();
    let record = DeckRecord {
        current_dj: Some(DjSession { user_id: u, playlist: snapshot(u, 2), current_index: 5 }),
        playback_started_at: Some(T0),
        queue: Vec::new(),
        deck_seq: 3,
    };
    let mut state = room();

    assert!(matches!(state.restore(record, T0), Err(RoomError::Invariant(_))));
    assert!(!state.is_playing());
    assert!(state.current_dj().is_none());
}

#[test]
fn expire_absent_drops_missing_users_and_keeps_returners() {
    let mut source = room();
    let dj = joined(&mut source, "dj");
    let back = joined(&mut source, "back");
    let gone = joined(&mut source, "gone");
    source.join_queue(dj, snapshot(dj, 2), T0).unwrap();
    source.join_queue(gone, snapshot(gone, 1), T0).unwrap();
    source.join_queue(back, snapshot(back, 1), T0).unwrap();

    let mut state = RoomState::new(source.room_id(), "Test Room", source.owner_id());
    state.restore(source.deck_record(), T0).unwrap();
    state.join(back, "back");

    let t = state.expire_absent(T0 + 30_000);

    assert!(state.is_dj(back));
    assert!(state.queue_ids().is_empty());
    assert!(t.deck_dirty);
    assert!(!state.has_absent_participants());
    state.check_invariants(T0 + 30_000).unwrap();
}

#[test]
fn reset_clears_deck_and_resyncs_every_member() {
    let mut state = room();
    let u = joined(&mut state, "u");
    let v = joined(&mut state, "v");
    state.join_queue(u, snapshot(u, 2), T0).unwrap();
    state.join_queue(v, snapshot(v, 2), T0).unwrap();

    let owner = Uuid::new_v4();
    let t = state.reset("Reloaded".into(), owner);

    assert!(!state.is_playing());
    assert!(state.queue_ids().is_empty());
    assert_eq!(state.owner_id(), owner);
    assert_eq!(state.member_count(), 2);
    for user in [u, v] {
        let snaps = events_for(&t, Audience::User(user));
        let [RoomEvent::Snapshot(view)] = snaps.as_slice() else {
            panic!("expected snapshot for {user}");
        };
        assert_eq!(view.name, "Reloaded");
        assert!(!view.deck.is_playing);
    }
}

// =============================================================================
// Invariants
// =============================================================================

#[test]
fn invariant_check_flags_playing_without_dj() {
    let mut state = room();
    state.is_playing = true;
    assert!(matches!(state.check_invariants(T0), Err(RoomError::Invariant(_))));
}

#[test]
fn invariant_check_flags_duplicate_queue_entries() {
    let mut state = room();
    let u = joined(&mut state, "u");
    let v = joined(&mut state, "v");
    state.join_queue(u, snapshot(u, 1), T0).unwrap();
    state.join_queue(v, snapshot(v, 1), T0).unwrap();
    let dup = state.queue[0].clone();
    state.queue.push_back(dup);

    assert!(matches!(state.check_invariants(T0), Err(RoomError::Invariant(_))));
}

#[test]
fn invariant_check_flags_future_start() {
    let mut state = room();
    let u = joined(&mut state, "u");
    state.join_queue(u, snapshot(u, 1), T0 + 10).unwrap();
    assert!(state.check_invariants(T0).is_err());
    assert!(state.check_invariants(T0 + 10).is_ok());
}

/// Random operation sequences keep the roster count and every invariant.
#[test]
fn random_sequences_preserve_invariants() {
    let mut rng = StdRng::seed_from_u64(0x5eed);
    let users: Vec<Uuid> = (0..6).map(|_| Uuid::new_v4()).collect();

    for _ in 0..50 {
        let mut state = room();
        let mut expected_roster = HashSet::new();
        let mut now = T0;

        for _ in 0..200 {
            now += rng.random_range(0..15_000);
            let user = users[rng.random_range(0..users.len())];
            match rng.random_range(0..6) {
                0 => {
                    state.join(user, "u");
                    expected_roster.insert(user);
                }
                1 => {
                    state.leave(user, now);
                    expected_roster.remove(&user);
                }
                2 => {
                    let tracks = rng.random_range(1..4);
                    let _ = state.join_queue(user, snapshot(user, tracks), now);
                }
                3 => {
                    let seq = rng.random_bool(0.5).then(|| state.deck_seq());
                    state.song_finished(user, seq, now);
                }
                4 => {
                    let _ = state.request_skip(user, now, DEFAULT_SKIP_GUARD_MS);
                }
                _ => {
                    let dj = state.current_dj().map(|d| d.user_id);
                    if let Some(dj) = dj {
                        state.song_finished(dj, None, now);
                    }
                }
            }

            state.check_invariants(now).expect("invariants hold");
            assert_eq!(state.member_count(), expected_roster.len());
            for id in state.queue_ids() {
                assert!(state.is_member(id), "queued users are members");
            }
            if let Some(dj) = state.current_dj() {
                assert!(state.is_member(dj.user_id), "dj is a member");
            }
        }
    }
}

// =============================================================================
// Wire payloads
// =============================================================================

#[test]
fn deck_changed_payload_is_flat() {
    let mut state = room();
    let u = joined(&mut state, "u");
    let t = state.join_queue(u, snapshot(u, 1), T0).unwrap();
    let deck = t
        .events
        .iter()
        .find(|o| matches!(o.event, RoomEvent::DeckChanged(_)))
        .unwrap();

    let data = deck.event.to_data();
    assert_eq!(deck.event.syscall(), "deck:changed");
    assert_eq!(data.get("is_playing"), Some(&serde_json::json!(true)));
    assert_eq!(data.get("current_dj"), Some(&serde_json::json!(u)));
    assert_eq!(data.get("started_at"), Some(&serde_json::json!(T0)));
    assert_eq!(data.get("cause"), Some(&serde_json::json!("new_dj")));
    assert_eq!(data["track"]["platform"], "youtube");
}

#[test]
fn error_codes_are_stable() {
    assert_eq!(RoomError::AlreadyActive.error_code(), "E_ALREADY_ACTIVE");
    assert_eq!(RoomError::NotDj.error_code(), "E_NOT_DJ");
    assert_eq!(RoomError::TooSoon { remaining_ms: 1 }.error_code(), "E_TOO_SOON");
    assert!(RoomError::TooSoon { remaining_ms: 1 }.retryable());
    assert!(!RoomError::EmptyPlaylist.retryable());
    assert_eq!(RoomError::PlaylistNotFound(Uuid::nil()).error_code(), "E_PLAYLIST_NOT_FOUND");
}
