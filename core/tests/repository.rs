mod common;

use std::sync::Arc;

use common::*;

use chimera_core::entity::EntityId;
use chimera_core::item::ItemEventKind;
use chimera_core::repository::RepositoryEventKind;
use chimera_core::source::{CollectionParams, CollectionResponse, DeleteResult, ItemResponse};
use chimera_core::state::QueryState;
use chimera_core::{EntityOptions, Store};
use chimera_core::ql::{Filter, OrderBy};

fn task_store(source: Arc<MockSource<Task>>) -> Store {
    Store::builder().entity::<Task>("tasks", EntityOptions::new().source(source)).build()
}

#[tokio::test]
async fn subset_filters_seed_new_collections_synchronously() -> anyhow::Result<()> {
    let source = Arc::new(MockSource::<Task>::new().with_fetch_collection(|_| {
        Ok(CollectionResponse::from(vec![Task::new(1, "open", 3, 0), Task::new(2, "open", 1, 0)]))
    }));
    let store = task_store(source.clone());
    let repo = store.from::<Task>("tasks")?;

    let open = repo.get_collection(CollectionParams::new(Some(Filter::cmp("status", "eq", "open")), OrderBy::unordered()))?;
    open.wait_ready().await?;

    // A strictly narrower filter: constructed synchronously from the loaded
    // collection, no second fetch.
    let narrow = repo.get_collection(CollectionParams::new(
        Some(Filter::and([Filter::cmp("status", "eq", "open"), Filter::cmp("prio", "lte", 2)])),
        OrderBy::asc("prio"),
    ))?;
    assert_eq!(narrow.state(), QueryState::Prefetched);
    assert!(narrow.ready());
    assert_eq!(narrow.read()?.ids(), &[EntityId::Int(2)]);
    assert_eq!(source.count("fetch_collection"), 1);

    // A broader filter cannot be seeded and fetches for itself
    let broader = repo.get_collection(CollectionParams::new(None, OrderBy::unordered()))?;
    assert_eq!(broader.state(), QueryState::Fetching);
    broader.wait_ready().await?;
    assert_eq!(source.count("fetch_collection"), 2);
    Ok(())
}

#[tokio::test]
async fn collection_cache_is_keyed_canonically() -> anyhow::Result<()> {
    let source = Arc::new(MockSource::<Task>::new().with_fetch_collection(|_| Ok(CollectionResponse::from(vec![]))));
    let store = task_store(source.clone());
    let repo = store.from::<Task>("tasks")?;

    let a = repo.get_collection(CollectionParams::new(
        Some(Filter::and([Filter::cmp("status", "eq", "open"), Filter::cmp("prio", "lte", 2)])),
        OrderBy::unordered(),
    ))?;
    // Same filter, different source order: the same live query comes back
    let b = repo.get_collection(CollectionParams::new(
        Some(Filter::and([Filter::cmp("prio", "lte", 2), Filter::cmp("status", "eq", "open")])),
        OrderBy::unordered(),
    ))?;
    assert_eq!(source.count("fetch_collection"), 1);
    a.wait_ready().await?;
    assert!(b.ready());
    Ok(())
}

#[tokio::test]
async fn item_updates_propagate_to_all_live_views() -> anyhow::Result<()> {
    let source = Arc::new(
        MockSource::<Task>::new()
            .with_fetch_collection(|_| {
                Ok(CollectionResponse::from(vec![Task::new(1, "open", 1, 60), Task::new(2, "open", 1, 80)]))
            })
            .with_update_item(|task| Ok(ItemResponse::from(task))),
    );
    let store = task_store(source);
    let repo = store.from::<Task>("tasks")?;

    let collection = repo.get_collection(CollectionParams::new(Some(Filter::cmp("value", "gte", 50)), OrderBy::asc("value")))?;
    collection.wait_ready().await?;
    settle().await;

    // The item query is seeded from the entity index, no fetch needed
    let item = repo.get_item(1)?;
    assert_eq!(item.state(), QueryState::Prefetched);

    item.update(Task::new(1, "open", 1, 75), false).await?;
    settle().await;

    // Every view of id 1 sees the same record, referentially
    let via_collection = collection.get_by_id(&EntityId::Int(1))?.unwrap();
    let via_item = item.data()?;
    let via_index = repo.cached_entity(&EntityId::Int(1)).unwrap();
    assert!(Arc::ptr_eq(&via_collection, &via_item));
    assert!(Arc::ptr_eq(&via_item, &via_index));
    assert_eq!(via_item.value, 75);
    Ok(())
}

#[tokio::test]
async fn item_deletion_reaches_collections_and_spares_unrelated_queries() -> anyhow::Result<()> {
    let source = Arc::new(
        MockSource::<Task>::new()
            .with_fetch_collection(|_| {
                Ok(CollectionResponse::from(vec![Task::new(1, "open", 1, 60), Task::new(2, "open", 1, 80)]))
            })
            .with_delete_item(|id| Ok(DeleteResult { id, success: true }.into())),
    );
    let store = task_store(source);
    let repo = store.from::<Task>("tasks")?;

    let collection = repo.get_collection(CollectionParams::new(Some(Filter::cmp("value", "gte", 50)), OrderBy::asc("value")))?;
    collection.wait_ready().await?;
    let doomed = repo.get_item(1)?;
    let bystander = repo.get_item(2)?;
    settle().await;

    let (_guard, bystander_events) = item_event_watcher(&bystander);
    doomed.delete(false).await?;
    settle().await;

    assert_eq!(collection.read()?.ids(), &[EntityId::Int(2)]);
    assert_eq!(doomed.state(), QueryState::Deleted);
    // The unrelated item query is untouched
    assert_eq!(bystander.state(), QueryState::Prefetched);
    assert_eq!(*bystander.data()?, Task::new(2, "open", 1, 80));
    assert!(!bystander_events().contains(&ItemEventKind::Deleted));
    assert!(repo.cached_entity(&EntityId::Int(1)).is_none());
    Ok(())
}

#[tokio::test]
async fn external_deletes_transition_matching_item_queries() -> anyhow::Result<()> {
    let source = Arc::new(MockSource::<Task>::new().with_fetch_item(|params| {
        let EntityId::Int(id) = params.id else { panic!("integer ids") };
        Ok(ItemResponse::from(Task::new(id, "open", 1, 60)))
    }));
    let store = task_store(source);
    let repo = store.from::<Task>("tasks")?;

    let item = repo.get_item(1)?;
    item.wait_ready().await?;
    settle().await;

    let (_guard, events) = item_event_watcher(&item);
    repo.delete_one(1);
    settle().await;

    assert_eq!(item.state(), QueryState::Deleted);
    let kinds = events();
    assert!(kinds.contains(&ItemEventKind::Deleted));
    // Not self-caused
    assert!(!kinds.contains(&ItemEventKind::SelfDeleted));

    // Deleting an id nobody holds is a no-op
    repo.delete_one(42);
    settle().await;
    Ok(())
}

#[tokio::test]
async fn external_set_actualizes_idle_item_queries() -> anyhow::Result<()> {
    let source = Arc::new(MockSource::<Task>::new().with_fetch_item(|params| {
        let EntityId::Int(id) = params.id else { panic!("integer ids") };
        Ok(ItemResponse::from(Task::new(id, "open", 1, 60)))
    }));
    let store = task_store(source);
    let repo = store.from::<Task>("tasks")?;

    let item = repo.get_item(1)?;
    item.wait_ready().await?;

    repo.set_one(Task::new(1, "open", 2, 65))?;
    assert_eq!(item.state(), QueryState::Actualized);
    assert_eq!(item.data()?.value, 65);
    // The draft was reset too
    assert_eq!(item.draft_value()?.value, 65);
    Ok(())
}

#[tokio::test]
async fn update_mixed_applies_both_directions_at_once() -> anyhow::Result<()> {
    let source = Arc::new(MockSource::<Task>::new().with_fetch_collection(|_| {
        Ok(CollectionResponse::from(vec![Task::new(1, "open", 1, 60), Task::new(2, "open", 1, 80)]))
    }));
    let store = task_store(source);
    let repo = store.from::<Task>("tasks")?;

    let collection = repo.get_collection(CollectionParams::new(Some(Filter::cmp("value", "gte", 50)), OrderBy::asc("value")))?;
    collection.wait_ready().await?;

    repo.update_mixed(vec![Task::new(3, "open", 1, 70)], vec![EntityId::Int(1)])?;
    assert_eq!(collection.read()?.ids(), &[EntityId::Int(3), EntityId::Int(2)]);
    Ok(())
}

#[tokio::test]
async fn repository_events_mirror_every_change() -> anyhow::Result<()> {
    let source = Arc::new(MockSource::<Task>::new().with_fetch_collection(|_| Ok(CollectionResponse::from(vec![]))));
    let store = task_store(source);
    let repo = store.from::<Task>("tasks")?;
    let collection = repo.get_collection(CollectionParams::new(None, OrderBy::unordered()))?;
    collection.wait_ready().await?;
    settle().await;

    let (tx, rx) = std::sync::mpsc::channel();
    let _guard = repo.events().on(move |event: &chimera_core::repository::RepositoryEvent<Task>| {
        let _ = tx.send(event.kind());
    });

    repo.set_one(Task::new(1, "open", 1, 60))?;
    settle().await;
    let kinds: Vec<_> = rx.try_iter().collect();
    assert_eq!(kinds, vec![RepositoryEventKind::ItemAdded, RepositoryEventKind::Updated]);

    repo.set_one(Task::new(1, "open", 1, 61))?;
    settle().await;
    let kinds: Vec<_> = rx.try_iter().collect();
    assert_eq!(kinds, vec![RepositoryEventKind::ItemUpdated, RepositoryEventKind::Updated]);

    repo.delete_one(1);
    settle().await;
    let kinds: Vec<_> = rx.try_iter().collect();
    assert_eq!(kinds, vec![RepositoryEventKind::ItemDeleted, RepositoryEventKind::Updated]);
    Ok(())
}

#[tokio::test]
async fn dropped_queries_vacate_their_cache_slots() -> anyhow::Result<()> {
    let source = Arc::new(MockSource::<Task>::new().with_fetch_item(|params| {
        let EntityId::Int(id) = params.id else { panic!("integer ids") };
        Ok(ItemResponse::from(Task::new(id, "open", 1, 60)))
    }));
    let store = task_store(source.clone());
    let repo = store.from::<Task>("tasks")?;

    let item = repo.get_item(1)?;
    item.wait_ready().await?;
    // While held, the same live query is returned
    let same = repo.get_item(1)?;
    assert_eq!(source.count("fetch_item"), 1);
    drop(same);
    drop(item);

    // All handles dropped: the entity index entry died with the query, so a
    // new handle has to fetch again.
    let fresh = repo.get_item(1)?;
    assert_eq!(fresh.state(), QueryState::Fetching);
    fresh.wait_ready().await?;
    assert_eq!(source.count("fetch_item"), 2);
    Ok(())
}
