//! Operations of the demo todo app.

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use quarry_engine::{
    FetchError, InfiniteQueryKey, MutationKey, QueryChunks, QueryEffect, QueryKey, Reply,
    SubscriptionKey,
};
use quarry_id::{KeyError, KeyPattern, MutationId, QueryId, SubscriptionId};
use tracing::warn;

use crate::transport::{MemoryTransport, Todo};

pub type TodoChunks = QueryChunks<Vec<Todo>, usize>;

pub struct TodoCount {
    id: QueryId,
}

impl TodoCount {
    pub fn new() -> Result<Self, KeyError> {
        Ok(Self {
            id: QueryId::new("todos/count")?,
        })
    }
}

#[async_trait]
impl QueryKey<MemoryTransport> for TodoCount {
    type Data = usize;

    fn id(&self) -> QueryId {
        self.id.clone()
    }

    async fn fetch(&self, transport: &MemoryTransport) -> Result<usize, FetchError> {
        transport.count().await
    }

    fn content_equals(&self, old: &usize, new: &usize) -> bool {
        old == new
    }
}

pub struct TodoPages {
    id: QueryId,
    page_size: usize,
}

impl TodoPages {
    pub fn new(page_size: usize) -> Result<Self, KeyError> {
        Ok(Self {
            id: QueryId::new("todos/pages")?,
            page_size: page_size.max(1),
        })
    }
}

#[async_trait]
impl InfiniteQueryKey<MemoryTransport> for TodoPages {
    type Chunk = Vec<Todo>;
    type Param = usize;

    fn id(&self) -> QueryId {
        self.id.clone()
    }

    fn initial_param(&self) -> usize {
        0
    }

    fn load_more_param(&self, chunks: &TodoChunks) -> Option<usize> {
        let last = chunks.last()?;
        // A short page is the last one
        (last.data.len() == self.page_size).then_some(last.param + self.page_size)
    }

    async fn fetch(
        &self,
        transport: &MemoryTransport,
        offset: usize,
    ) -> Result<Vec<Todo>, FetchError> {
        transport.list(offset, self.page_size).await
    }

    fn content_equals(&self, old: &TodoChunks, new: &TodoChunks) -> bool {
        old == new
    }
}

/// Adds a todo, bumps the cached count and invalidates the pages.
pub struct AddTodo {
    id: MutationId,
    count: QueryId,
    pages: KeyPattern,
}

impl AddTodo {
    pub fn new() -> Result<Self, KeyError> {
        Ok(Self {
            id: MutationId::new("todos/add")?,
            count: QueryId::new("todos/count")?,
            pages: KeyPattern::parse("todos/pages")?,
        })
    }
}

#[async_trait]
impl MutationKey<MemoryTransport> for AddTodo {
    type Variable = String;
    type Data = Todo;

    fn id(&self) -> MutationId {
        self.id.clone()
    }

    async fn mutate(&self, transport: &MemoryTransport, title: &String) -> Result<Todo, FetchError> {
        transport.add(title).await
    }

    async fn on_query_update(&self, effect: &QueryEffect, _title: &String, _todo: &Todo) {
        let bumped = effect
            .update_query::<usize, _>(&self.count, |reply| reply.as_ref().map(|n| n + 1))
            .await;
        if let Err(e) = bumped {
            warn!(error = %e, "Could not patch todo count");
        }

        effect.invalidate_queries(&self.pages).await;
    }
}

/// Live feed of added todos.
pub struct TodoFeed {
    id: SubscriptionId,
}

impl TodoFeed {
    pub fn new() -> Result<Self, KeyError> {
        Ok(Self {
            id: SubscriptionId::new("todos/feed")?,
        })
    }
}

impl SubscriptionKey<MemoryTransport> for TodoFeed {
    type Data = Todo;

    fn id(&self) -> SubscriptionId {
        self.id.clone()
    }

    fn subscribe(
        &self,
        transport: Arc<MemoryTransport>,
    ) -> BoxStream<'static, Result<Todo, FetchError>> {
        transport.added()
    }
}

/// Every loaded page flattened into one list.
pub fn flatten(pages: &Reply<TodoChunks>) -> Vec<Todo> {
    pages
        .get()
        .map(|chunks| chunks.iter().flat_map(|c| c.data.iter().cloned()).collect())
        .unwrap_or_default()
}
