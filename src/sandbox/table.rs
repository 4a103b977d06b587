use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use color_eyre::{eyre::eyre, Result};
use serde::Serialize;
use synq::{AbortSignal, ListPage, ListRequest};
use tokio::sync::Mutex;

/// A user record as the remote table stores it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct User {
  pub id: String,
  pub name: String,
  pub role: String,
  pub version: u64,
}

/// Aggregate served by the document scenarios.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TableSummary {
  pub rows: usize,
  pub admins: usize,
  pub revision: u64,
}

/// List query payload; an absent role lists everyone.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UserFilter {
  #[serde(skip_serializing_if = "Option::is_none")]
  pub role: Option<String>,
}

#[derive(Default)]
struct Contents {
  rows: BTreeMap<String, User>,
  revision: u64,
  calls: BTreeMap<String, usize>,
}

/// In-memory stand-in for a remote table, with a fixed response latency.
#[derive(Clone)]
pub struct Table {
  contents: Arc<Mutex<Contents>>,
  latency: Duration,
}

impl Table {
  pub fn new(latency: Duration) -> Self {
    Self {
      contents: Arc::new(Mutex::new(Contents::default())),
      latency,
    }
  }

  /// Seed `count` users; every third one is an admin.
  pub async fn seeded(latency: Duration, count: usize) -> Self {
    let table = Self::new(latency);
    for n in 1..=count {
      let role = if n % 3 == 0 { "admin" } else { "member" };
      table
        .write(User {
          id: format!("users||{n}"),
          name: format!("user {n}"),
          role: role.to_string(),
          version: 1,
        })
        .await;
    }
    table.contents.lock().await.calls.clear();
    table
  }

  async fn respond(&self, call: String, signal: &AbortSignal) -> Result<()> {
    *self.contents.lock().await.calls.entry(call.clone()).or_default() += 1;
    tokio::time::sleep(self.latency).await;
    if signal.is_aborted() {
      return Err(eyre!("{} aborted", call));
    }
    Ok(())
  }

  pub async fn summary(&self, signal: AbortSignal) -> Result<TableSummary> {
    self.respond("summary".to_string(), &signal).await?;
    let contents = self.contents.lock().await;
    Ok(TableSummary {
      rows: contents.rows.len(),
      admins: contents.rows.values().filter(|user| user.role == "admin").count(),
      revision: contents.revision,
    })
  }

  pub async fn get(&self, id: String, signal: AbortSignal) -> Result<User> {
    self.respond(format!("get {id}"), &signal).await?;
    self
      .contents
      .lock()
      .await
      .rows
      .get(&id)
      .cloned()
      .ok_or_else(|| eyre!("User {} not found", id))
  }

  pub async fn list(&self, request: ListRequest<UserFilter>, signal: AbortSignal) -> Result<ListPage<String, User>> {
    let label = request.payload.role.as_deref().unwrap_or("*");
    self.respond(format!("list {label}"), &signal).await?;

    let contents = self.contents.lock().await;
    let matching: Vec<&User> = contents
      .rows
      .values()
      .filter(|user| request.payload.role.as_ref().map_or(true, |role| user.role == *role))
      .collect();
    let has_more = request.offset + request.size < matching.len();
    let items = matching
      .into_iter()
      .skip(request.offset)
      .take(request.size)
      .map(|user| (user.id.clone(), user.clone()))
      .collect();
    Ok(ListPage { items, has_more })
  }

  /// Insert or replace a row; bumps the table revision.
  pub async fn write(&self, user: User) {
    let mut contents = self.contents.lock().await;
    contents.revision += 1;
    contents.rows.insert(user.id.clone(), user);
  }

  pub async fn remove(&self, id: &str) -> Result<User> {
    let mut contents = self.contents.lock().await;
    let removed = contents
      .rows
      .remove(id)
      .ok_or_else(|| eyre!("Cannot delete {}: no such user", id))?;
    contents.revision += 1;
    Ok(removed)
  }

  /// Remote calls served so far, by call label.
  pub async fn calls(&self) -> BTreeMap<String, usize> {
    self.contents.lock().await.calls.clone()
  }
}
