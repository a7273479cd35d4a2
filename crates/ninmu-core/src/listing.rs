//! Paged view over a [`JobStore`] for API layers.
use crate::{
    backend::{BackEndDriver, JobStore},
    job::{JobId, JobRecord, ListOptions},
};

type StoreError<S> = <<S as JobStore>::Driver as BackEndDriver>::Error;

/// One listing request: filters plus keyset cursor.
///
/// The total is counted at most once per listing, however often it is read.
pub struct JobListing<'s, S> {
    store: &'s S,
    options: ListOptions,
    total: Option<usize>,
}

impl<'s, S> JobListing<'s, S>
where
    S: JobStore + Sync,
{
    pub fn new(store: &'s S, options: ListOptions) -> Self {
        Self {
            store,
            options,
            total: None,
        }
    }

    pub fn options(&self) -> &ListOptions {
        &self.options
    }

    pub async fn page(&self) -> Result<Vec<JobRecord<S::Data>>, StoreError<S>> {
        self.store.list(&self.options).await
    }

    /// Number of jobs passing the filters, ignoring the cursor.
    pub async fn total_count(&mut self) -> Result<usize, StoreError<S>> {
        if let Some(total) = self.total {
            return Ok(total);
        }
        let total = self.store.count(&self.options).await?;
        self.total = Some(total);
        Ok(total)
    }

    /// Listing of the page that follows `last`, sharing the memoized total.
    pub fn after(&self, last: JobId) -> Self {
        Self {
            store: self.store,
            options: self.options.clone().after(last),
            total: self.total,
        }
    }
}
