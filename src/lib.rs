//! Client-side fetch orchestration and a normalized query cache.
//!
//! Three store shapes share one scheduling core:
//!
//! - [`DocumentStore`]: a single resource.
//! - [`CollectionStore`]: independent resources keyed by payload.
//! - [`ListQueryStore`]: paginated queries over a normalized item cache.
//!
//! Every resource key gets a [`FetchOrchestrator`] that serializes fetches,
//! throttles low priority and realtime requests, and holds fetches back
//! while a mutation runs. Stale data stays visible while it revalidates.

pub mod cache_key;
pub mod collection;
pub mod config;
pub mod consumer;
pub mod document;
pub mod error;
pub mod list_query;
mod lock;
pub mod matcher;
pub mod orchestrator;
pub mod priority;
pub mod status;
pub mod store;

pub use cache_key::CacheKey;
pub use collection::{CollectionItem, CollectionOptions, CollectionState, CollectionStore};
pub use config::{RealtimeThrottle, SyncConfig};
pub use consumer::Consumer;
pub use document::{Awaited, DocumentOptions, DocumentState, DocumentStore};
pub use error::{ErrorNormalizer, FetchError};
pub use list_query::{
  AppendTo, AwaitedList, FieldCoverage, InitialListData, ItemQueryState, ListPage, ListQueryOptions,
  ListQueryState, ListQueryStore, ListRequest, LoadMoreResult, OptimisticRule, QueryState,
};
pub use matcher::{ItemMatcher, QueryMatcher};
pub use orchestrator::{AbortSignal, FetchOrchestrator, OrchestratorConfig};
pub use priority::{FetchPriority, ScheduleResult};
pub use status::Status;
pub use store::{Store, Subscription};
