use super::*;

#[tokio::test]
async fn identity_ticket_is_single_use() {
    let identity = StaticIdentity::new();
    let user = Identity { user_id: Uuid::new_v4(), username: "alice".into() };
    let ticket = identity.issue(user.clone());

    assert!(crate::services::session::is_well_formed_ticket(&ticket));
    assert_eq!(identity.authenticate(&ticket).await.unwrap(), Some(user));
    assert_eq!(identity.authenticate(&ticket).await.unwrap(), None);
}

#[tokio::test]
async fn playlists_only_resolve_for_owner() {
    let playlists = StaticPlaylists::new();
    let owner = Uuid::new_v4();
    let id = playlists.add(owner, 2);

    assert_eq!(playlists.resolve(id, owner).await.unwrap().len(), 2);
    assert!(matches!(playlists.resolve(id, Uuid::new_v4()).await, Err(PlaylistError::NotFound(_))));
}

#[tokio::test]
async fn empty_playlist_is_reported_as_empty() {
    let playlists = StaticPlaylists::new();
    let owner = Uuid::new_v4();
    let id = playlists.add(owner, 0);

    assert!(matches!(playlists.resolve(id, owner).await, Err(PlaylistError::Empty(_))));
}

#[tokio::test]
async fn store_records_saved_deck() {
    let store = MemoryRoomStore::new();
    let room_id = Uuid::new_v4();
    store.add_room(room_id, "lounge", Uuid::new_v4());

    let deck = DeckRecord { deck_seq: 4, ..DeckRecord::default() };
    store.save_deck(room_id, &deck).await.unwrap();

    assert_eq!(store.deck(room_id), Some(deck));
    assert_eq!(store.save_count(), 1);
}

#[tokio::test]
async fn failing_store_still_counts_attempts() {
    let store = MemoryRoomStore::new();
    let room_id = Uuid::new_v4();
    store.add_room(room_id, "lounge", Uuid::new_v4());
    store.fail_saves(true);

    assert!(store.save_deck(room_id, &DeckRecord::default()).await.is_err());
    assert_eq!(store.save_count(), 1);
    assert_eq!(store.deck(room_id), None);
}
