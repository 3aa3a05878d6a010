mod common;

use std::sync::Arc;

use common::*;

use chimera_core::entity::EntityId;
use chimera_core::error::ChimeraError;
use chimera_core::item::ItemEventKind;
use chimera_core::source::{DeleteResult, ItemResponse};
use chimera_core::state::QueryState;
use chimera_core::{EntityOptions, Store};

fn note_store(source: Arc<MockSource<Note>>) -> Store {
    Store::builder().entity::<Note>("notes", EntityOptions::new().source(source)).build()
}

#[tokio::test]
async fn prefetched_update_with_same_id() -> anyhow::Result<()> {
    let source = Arc::new(MockSource::<Note>::new().with_update_item(|note| Ok(ItemResponse::from(note))));
    let store = note_store(source.clone());
    let repo = store.from::<Note>("notes")?;

    let query = repo.prefetch_item(Note::new("x", "A", 1))?;
    assert_eq!(query.state(), QueryState::Prefetched);
    assert_eq!(*query.data()?, Note::new("x", "A", 1));
    settle().await;

    let (_guard, events) = item_event_watcher(&query);
    let updated = query.update(Note::new("x", "B", 2), false).await?;
    settle().await;

    assert_eq!(*updated, Note::new("x", "B", 2));
    assert_eq!(*query.data()?, Note::new("x", "B", 2));
    assert_eq!(query.state(), QueryState::Fetched);

    let events = events();
    assert_eq!(events.iter().filter(|k| **k == ItemEventKind::SelfUpdated).count(), 1);
    assert!(events.contains(&ItemEventKind::Updated));
    assert_eq!(source.count("update_item"), 1);
    Ok(())
}

#[tokio::test]
async fn update_rejects_server_id_mismatch() -> anyhow::Result<()> {
    // The updater echoes a different id; trust mode is off.
    let source = Arc::new(MockSource::<Note>::new().with_update_item(|mut note| {
        note.id = "y".to_owned();
        Ok(ItemResponse::from(note))
    }));
    let store = note_store(source);
    let repo = store.from::<Note>("notes")?;
    let query = repo.prefetch_item(Note::new("x", "A", 1))?;

    let err = query.update(Note::new("x", "B", 2), false).await.unwrap_err();
    assert!(matches!(err, ChimeraError::TrustIdMismatch { .. }), "got {err}");
    assert_eq!(query.state(), QueryState::ReErrored);
    // Prior data is kept
    assert_eq!(*query.data()?, Note::new("x", "A", 1));
    assert!(matches!(query.last_error(), Some(ChimeraError::TrustIdMismatch { .. })));
    Ok(())
}

#[tokio::test]
async fn trusted_dev_mode_adopts_mismatched_id() -> anyhow::Result<()> {
    let source = Arc::new(MockSource::<Note>::new().with_update_item(|mut note| {
        note.id = "y".to_owned();
        Ok(ItemResponse::from(note))
    }));
    let store = Store::builder().trust_query(true).dev_mode(true).entity::<Note>("notes", EntityOptions::new().source(source)).build();
    let repo = store.from::<Note>("notes")?;
    let query = repo.prefetch_item(Note::new("x", "A", 1))?;

    query.update(Note::new("x", "B", 2), false).await?;
    assert_eq!(query.state(), QueryState::Fetched);
    assert_eq!(query.id(), Some(EntityId::from("y")));
    Ok(())
}

#[tokio::test]
async fn local_id_mismatch_is_rejected_before_the_callback_runs() -> anyhow::Result<()> {
    let source = Arc::new(MockSource::<Note>::new().with_update_item(|note| Ok(ItemResponse::from(note))));
    let store = note_store(source.clone());
    let repo = store.from::<Note>("notes")?;
    let query = repo.prefetch_item(Note::new("x", "A", 1))?;

    let err = query.update(Note::new("z", "B", 2), false).await.unwrap_err();
    assert!(matches!(err, ChimeraError::IdMismatch { .. }));
    assert_eq!(source.count("update_item"), 0);
    // The rejection never started an operation; the query is untouched.
    assert_eq!(query.state(), QueryState::Prefetched);
    Ok(())
}

#[tokio::test]
async fn fetching_mode_publishes_on_completion() -> anyhow::Result<()> {
    let source = Arc::new(MockSource::<Note>::new().with_fetch_item(|params| {
        assert_eq!(params.id, EntityId::from("x"));
        Ok(ItemResponse::from(Note::new("x", "fetched", 7)))
    }));
    let store = note_store(source.clone());
    let repo = store.from::<Note>("notes")?;

    let query = repo.get_item("x")?;
    assert_eq!(query.state(), QueryState::Fetching);
    assert!(query.data().is_err());

    let data = query.wait_ready().await?;
    assert_eq!(*data, Note::new("x", "fetched", 7));
    assert_eq!(query.state(), QueryState::Fetched);
    assert_eq!(source.count("fetch_item"), 1);
    Ok(())
}

#[tokio::test]
async fn mutate_with_an_untouched_clone_behaves_like_an_identity_update() -> anyhow::Result<()> {
    let source = Arc::new(MockSource::<Note>::new().with_update_item(|note| Ok(ItemResponse::from(note))));
    let store = note_store(source);
    let repo = store.from::<Note>("notes")?;
    let query = repo.prefetch_item(Note::new("x", "A", 1))?;
    settle().await;

    let (_guard, events) = item_event_watcher(&query);
    let result = query.mutate(|_| {}, false).await?;
    settle().await;

    assert_eq!(*result, Note::new("x", "A", 1));
    assert_eq!(query.state(), QueryState::Fetched);
    assert_eq!(events().iter().filter(|k| **k == ItemEventKind::SelfUpdated).count(), 1);
    Ok(())
}

#[tokio::test]
async fn mutate_pushes_the_edited_clone() -> anyhow::Result<()> {
    let source = Arc::new(MockSource::<Note>::new().with_update_item(|note| Ok(ItemResponse::from(note))));
    let store = note_store(source);
    let repo = store.from::<Note>("notes")?;
    let query = repo.prefetch_item(Note::new("x", "A", 1))?;

    let result = query
        .mutate(
            |note| {
                note.name = "edited".to_owned();
                note.value = 9;
            },
            false,
        )
        .await?;
    assert_eq!(*result, Note::new("x", "edited", 9));
    Ok(())
}

#[tokio::test]
async fn commit_pushes_the_draft_and_resets_it() -> anyhow::Result<()> {
    let source = Arc::new(MockSource::<Note>::new().with_update_item(|mut note| {
        // Server normalizes the value on write
        note.value += 100;
        Ok(ItemResponse::from(note))
    }));
    let store = note_store(source);
    let repo = store.from::<Note>("notes")?;
    let query = repo.prefetch_item(Note::new("x", "A", 1))?;

    query.draft(|draft| draft.name = "staged".to_owned())?;
    assert_eq!(query.draft_value()?.name, "staged");
    // The published item is untouched until commit
    assert_eq!(query.data()?.name, "A");

    let committed = query.commit(false).await?;
    assert_eq!(*committed, Note::new("x", "staged", 101));
    // The draft was reset from the server response
    assert_eq!(query.draft_value()?, Note::new("x", "staged", 101));
    Ok(())
}

#[tokio::test]
async fn delete_transitions_to_deleted_and_refetch_recovers() -> anyhow::Result<()> {
    let source = Arc::new(
        MockSource::<Note>::new()
            .with_delete_item(|id| Ok(DeleteResult { id, success: true }.into()))
            .with_fetch_item(|params| Ok(ItemResponse::from(Note::new(&params.id.to_string(), "back", 3)))),
    );
    let store = note_store(source);
    let repo = store.from::<Note>("notes")?;
    let query = repo.prefetch_item(Note::new("x", "A", 1))?;
    settle().await;

    let (_guard, events) = item_event_watcher(&query);
    query.delete(false).await?;
    settle().await;

    assert_eq!(query.state(), QueryState::Deleted);
    assert!(query.data().is_err());
    let kinds = events();
    assert!(kinds.contains(&ItemEventKind::Deleted));
    assert!(kinds.contains(&ItemEventKind::SelfDeleted));

    // Updates are rejected while deleted
    let err = query.update(Note::new("x", "B", 2), false).await.unwrap_err();
    assert!(matches!(err, ChimeraError::DeletedItem { .. }));

    // But refetch recovers
    let data = query.refetch(false).await?;
    assert_eq!(*data, Note::new("x", "back", 3));
    assert_eq!(query.state(), QueryState::Fetched);
    Ok(())
}

#[tokio::test]
async fn unsuccessful_deletion_keeps_data_and_reerrors() -> anyhow::Result<()> {
    let source = Arc::new(MockSource::<Note>::new().with_delete_item(|id| Ok(DeleteResult { id, success: false }.into())));
    let store = note_store(source);
    let repo = store.from::<Note>("notes")?;
    let query = repo.prefetch_item(Note::new("x", "A", 1))?;

    let err = query.delete(false).await.unwrap_err();
    assert!(matches!(err, ChimeraError::UnsuccessfulDeletion { .. }));
    assert_eq!(query.state(), QueryState::ReErrored);
    assert_eq!(*query.data()?, Note::new("x", "A", 1));
    Ok(())
}

#[tokio::test]
async fn missing_callback_reports_not_specified() -> anyhow::Result<()> {
    let source = Arc::new(MockSource::<Note>::new());
    let store = note_store(source);
    let repo = store.from::<Note>("notes")?;
    let query = repo.prefetch_item(Note::new("x", "A", 1))?;

    let err = query.update(Note::new("x", "B", 2), false).await.unwrap_err();
    assert!(matches!(err, ChimeraError::NotSpecified { operation: "update_item", .. }));
    Ok(())
}

#[tokio::test]
async fn concurrent_operations_require_force() -> anyhow::Result<()> {
    let source = Arc::new(
        MockSource::<Note>::new()
            .with_hanging_updates()
            .with_update_item(|note| Ok(ItemResponse::from(note)))
            .with_fetch_item(|params| Ok(ItemResponse::from(Note::new(&params.id.to_string(), "fresh", 5)))),
    );
    let store = note_store(source);
    let repo = store.from::<Note>("notes")?;
    let query = repo.prefetch_item(Note::new("x", "A", 1))?;

    let hung = {
        let query = query.clone();
        tokio::spawn(async move { query.update(Note::new("x", "B", 2), false).await })
    };
    settle().await;
    assert_eq!(query.state(), QueryState::Updating);

    let err = query.update(Note::new("x", "C", 3), false).await.unwrap_err();
    assert!(matches!(err, ChimeraError::AlreadyRunning { .. }));

    // Forced refetch cancels the hung update
    let data = query.refetch(true).await?;
    assert_eq!(*data, Note::new("x", "fresh", 5));
    let first = hung.await?;
    assert!(matches!(first.unwrap_err(), ChimeraError::Cancelled { .. }));
    Ok(())
}

#[tokio::test]
async fn created_item_adopts_the_server_id() -> anyhow::Result<()> {
    let source = Arc::new(MockSource::<Note>::new().with_create_item(|mut draft| {
        draft.id = "assigned".to_owned();
        Ok(ItemResponse::from(draft))
    }));
    let store = note_store(source);
    let repo = store.from::<Note>("notes")?;

    let query = repo.create_item(Note::new("", "draft", 1));
    assert_eq!(query.state(), QueryState::Creating);
    assert_eq!(query.id(), None);

    // Nothing but waiting is allowed while creating
    let err = query.update(Note::new("assigned", "B", 2), false).await.unwrap_err();
    assert!(matches!(err, ChimeraError::NotCreated { .. }));

    let (_guard, events) = item_event_watcher(&query);
    let data = query.wait_ready().await?;
    settle().await;

    assert_eq!(query.id(), Some(EntityId::from("assigned")));
    assert_eq!(query.state(), QueryState::Fetched);
    assert_eq!(*data, Note::new("assigned", "draft", 1));
    assert!(events().contains(&ItemEventKind::SelfCreated));

    // The repository now serves the same query for the adopted id
    let again = repo.get_item("assigned")?;
    assert!(Arc::ptr_eq(&again.data()?, &query.data()?));
    Ok(())
}

#[tokio::test]
async fn fetch_failure_errors_without_prior_data() -> anyhow::Result<()> {
    let source = Arc::new(MockSource::<Note>::new().with_fetch_item(|_| Err(anyhow::anyhow!("boom").into())));
    let store = note_store(source);
    let repo = store.from::<Note>("notes")?;

    let query = repo.get_item("x")?;
    let err = query.wait_ready().await.unwrap_err();
    assert!(matches!(err, ChimeraError::FetchingError { .. }));
    assert_eq!(query.state(), QueryState::Errored);
    Ok(())
}
