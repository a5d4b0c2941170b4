//! Continuation-token pagination.
//!
//! [`Pages`] walks a [`PageSource`] lazily, one remote call per page, until
//! the provider stops returning a continuation token. Observers use
//! [`Pages::collect_all`] to materialise the whole sub-collection.

use async_trait::async_trait;

use crate::context::CallContext;
use crate::error::Result;

/// One page of a listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page<T> {
    pub items: Vec<T>,
    /// Token for the next page. `None` (or empty) ends the listing.
    pub next_token: Option<String>,
}

/// A paginated remote listing.
#[async_trait]
pub trait PageSource: Send + Sync {
    type Item: Send;

    async fn fetch_page(
        &self,
        ctx: &CallContext,
        token: Option<String>,
    ) -> Result<Page<Self::Item>>;
}

/// Lazy, restartable walk over a [`PageSource`].
pub struct Pages<'a, S: ?Sized> {
    ctx: &'a CallContext,
    source: &'a S,
    token: Option<String>,
    done: bool,
}

impl<'a, S> Pages<'a, S>
where
    S: PageSource + ?Sized,
{
    pub fn new(ctx: &'a CallContext, source: &'a S) -> Self {
        Self {
            ctx,
            source,
            token: None,
            done: false,
        }
    }

    /// Fetch the next page. Returns `None` once the listing is exhausted.
    /// A failed fetch can be retried by calling again; the token is kept.
    pub async fn next_page(&mut self) -> Option<Result<Vec<S::Item>>> {
        if self.done {
            return None;
        }
        match self.source.fetch_page(self.ctx, self.token.clone()).await {
            Ok(page) => {
                self.token = page.next_token.filter(|t| !t.is_empty());
                self.done = self.token.is_none();
                Some(Ok(page.items))
            }
            Err(e) => Some(Err(e)),
        }
    }

    /// Start again from the first page.
    pub fn restart(&mut self) {
        self.token = None;
        self.done = false;
    }

    /// Drain every remaining page into one vector.
    pub async fn collect_all(mut self) -> Result<Vec<S::Item>> {
        let mut all = Vec::new();
        while let Some(page) = self.next_page().await {
            all.extend(page?);
        }
        Ok(all)
    }
}
