//! Scenarios the `synq` binary runs against an in-memory table.

pub mod table;

use std::collections::BTreeMap;
use std::time::Duration;

use clap::ValueEnum;
use color_eyre::Result;
use serde_json::{json, Value};
use synq::{
  CollectionOptions, CollectionStore, DocumentOptions, DocumentStore, FetchPriority, ItemMatcher,
  ListQueryOptions, ListQueryStore, LoadMoreResult, OptimisticRule, QueryMatcher, SyncConfig,
};
use tracing::info;

use table::{Table, TableSummary, User, UserFilter};

/// Simulated round trip of the remote table
const LATENCY: Duration = Duration::from_millis(40);

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Scenario {
  /// Single summary document: first load, invalidation, off-screen catch-up
  Document,
  /// Users by id: per-key fetches, optimistic edit under a mutation, soft delete
  Collection,
  /// Paginated user lists with optimistic membership
  List,
  /// A burst of realtime updates coalesced by the realtime throttle
  Realtime,
}

/// Run `scenario` and return its report.
pub async fn run(scenario: Scenario, config: &SyncConfig) -> Result<Value> {
  info!(?scenario, "Running scenario");
  match scenario {
    Scenario::Document => document(config).await,
    Scenario::Collection => collection(config).await,
    Scenario::List => list(config).await,
    Scenario::Realtime => realtime(config).await,
  }
}

fn summary_store(table: &Table, label: &str, config: &SyncConfig) -> DocumentStore<TableSummary> {
  let remote = table.clone();
  DocumentStore::new(
    DocumentOptions::new(move |signal| {
      let remote = remote.clone();
      async move { remote.summary(signal).await }
    })
    .with_label(label)
    .with_config(config),
  )
}

async fn document(config: &SyncConfig) -> Result<Value> {
  let table = Table::seeded(LATENCY, 6).await;
  let store = summary_store(&table, "summary", config);

  let scheduled = store.schedule_fetch(FetchPriority::HighPriority);
  let status_after_schedule = store.state().status;
  store.wait_for_no_pending_requests().await;
  let first = store.state();

  let consumer = store.consumer();
  table
    .write(User {
      id: "users||7".to_string(),
      name: "user 7".to_string(),
      role: "admin".to_string(),
      version: 1,
    })
    .await;
  store.invalidate_data(None);
  store.wait_for_no_pending_requests().await;
  let after_invalidation = store.state();

  consumer.set_off_screen(true);
  table.remove("users||1").await?;
  store.invalidate_data(Some(FetchPriority::LowPriority));
  let pending_while_hidden = store.state().refetch_on_mount;
  tokio::time::sleep(config.low_priority_throttle()).await;
  consumer.set_off_screen(false);
  store.wait_for_no_pending_requests().await;

  Ok(json!({
    "scheduled": scheduled,
    "statusAfterSchedule": status_after_schedule,
    "first": first,
    "afterInvalidation": after_invalidation,
    "pendingWhileHidden": pending_while_hidden,
    "afterCatchUp": store.state(),
    "calls": table.calls().await,
  }))
}

async fn collection(config: &SyncConfig) -> Result<Value> {
  let table = Table::seeded(LATENCY, 4).await;
  let remote = table.clone();
  let store: CollectionStore<String, User> = CollectionStore::new(
    CollectionOptions::new(move |id: String, signal| {
      let remote = remote.clone();
      async move { remote.get(id, signal).await }
    })
    .with_label("users")
    .with_config(config),
  );

  for id in ["users||1", "users||2", "users||42"] {
    store.schedule_fetch(FetchPriority::HighPriority, id.to_string());
  }
  store.wait_for_no_pending_requests().await;
  let loaded = store.state();

  let renamed = "users||1".to_string();
  store.start_mutation(&renamed);
  store.update_item_state(ItemMatcher::Payload(renamed.clone()), |user, _| {
    user.name = "renamed".to_string();
  });
  let optimistic = store.get_item_state(&renamed);
  table
    .write(User {
      id: renamed.clone(),
      name: "renamed".to_string(),
      role: "member".to_string(),
      version: 2,
    })
    .await;
  store.end_mutation(&renamed);
  store.invalidate_item(ItemMatcher::Payload(renamed.clone()), Some(FetchPriority::HighPriority));
  let _consumer = store.consumer(&renamed);
  store.wait_for_no_pending_requests().await;

  let removed = "users||2".to_string();
  table.remove(&removed).await?;
  store.delete_item_state(&removed);

  Ok(json!({
    "loaded": loaded,
    "optimistic": optimistic,
    "confirmed": store.get_item_state(&renamed),
    "deleted": store.get_item_state(&removed),
    "calls": table.calls().await,
  }))
}

fn ids(items: &[(String, std::sync::Arc<User>)]) -> Vec<&str> {
  items.iter().map(|(id, _)| id.as_str()).collect()
}

async fn list(config: &SyncConfig) -> Result<Value> {
  let table = Table::seeded(LATENCY, 10).await;
  let lists = table.clone();
  let items = table.clone();
  let admins = UserFilter {
    role: Some("admin".to_string()),
  };
  let everyone = UserFilter { role: None };

  let store: ListQueryStore<UserFilter, String, User> = ListQueryStore::new(
    ListQueryOptions::new(
      move |request, signal| {
        let remote = lists.clone();
        async move { remote.list(request, signal).await }
      },
      move |id, signal| {
        let remote = items.clone();
        async move { remote.get(id, signal).await }
      },
    )
    .with_label("users")
    .with_config(config)
    // Any user may show up under any filter once their role changes.
    .sync_item_and_query(|_: &String, _: &UserFilter| true)
    .with_optimistic_rule(
      OptimisticRule::new(
        QueryMatcher::filter(|filter: &UserFilter| filter.role.as_deref() == Some("admin")),
        |user: &User| user.role == "admin",
      )
      .sort_by(|a: &User, b: &User| a.name.cmp(&b.name)),
    )
    .with_optimistic_rule(OptimisticRule::new(
      QueryMatcher::Payload(everyone.clone()),
      |_: &User| true,
    )),
  );

  let first_page = store.await_list_query_fetch(admins.clone(), Some(2)).await;
  let load_more = store.load_more(&admins, None);
  store.wait_for_no_pending_requests().await;
  let exhausted = store.load_more(&admins, None) == LoadMoreResult::Skipped;
  store.await_list_query_fetch(everyone.clone(), Some(5)).await;

  let promoted = "users||1".to_string();
  store.start_item_mutation(&promoted);
  store.update_item_state(ItemMatcher::Payload(promoted.clone()), |user, _| {
    user.role = "admin".to_string();
  });
  let optimistic_admins = store.get_query_items(&admins);
  table
    .write(User {
      id: promoted.clone(),
      name: "user 1".to_string(),
      role: "admin".to_string(),
      version: 2,
    })
    .await;
  store.end_item_mutation(&promoted);
  store.invalidate_item(ItemMatcher::Payload(promoted.clone()), Some(FetchPriority::HighPriority));
  let _admins_on_screen = store.query_consumer(&admins);
  store.wait_for_no_pending_requests().await;

  let created = User {
    id: "users||11".to_string(),
    name: "user 11".to_string(),
    role: "admin".to_string(),
    version: 1,
  };
  table.write(created.clone()).await;
  store.add_item_to_state(created.id.clone(), created);

  Ok(json!({
    "firstPage": ids(&first_page.items),
    "firstPageHasMore": first_page.has_more,
    "loadMore": load_more,
    "exhausted": exhausted,
    "optimisticAdmins": ids(&optimistic_admins),
    "admins": ids(&store.get_query_items(&admins)),
    "everyone": ids(&store.get_query_items(&everyone)),
    "queriesWithPromoted": store.get_queries_related_to_item(&promoted),
    "calls": table.calls().await,
  }))
}

async fn realtime(config: &SyncConfig) -> Result<Value> {
  let table = Table::seeded(LATENCY, 3).await;
  let store = summary_store(&table, "live-summary", config);

  let mut results: BTreeMap<String, usize> = BTreeMap::new();
  for tick in 0..12 {
    table
      .write(User {
        id: format!("users||{}", 100 + tick),
        name: format!("live {tick}"),
        role: "member".to_string(),
        version: 1,
      })
      .await;
    let result = store.schedule_fetch(FetchPriority::RealtimeUpdate);
    *results.entry(result.to_string()).or_default() += 1;
    tokio::time::sleep(Duration::from_millis(25)).await;
  }
  store.wait_for_no_pending_requests().await;

  Ok(json!({
    "results": results,
    "final": store.state(),
    "calls": table.calls().await,
  }))
}
