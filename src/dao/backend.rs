use futures::{future::BoxFuture, stream::BoxStream};

use crate::{
    dao::{
        models::{CompareAndSet, MutationBatch},
        storage::BackendResult,
    },
    state::{events::ChangeEvent, value::Value},
};

/// Ordered stream of change events. Ends when the subscription is lost.
pub type ChangeFeed = BoxStream<'static, ChangeEvent>;

/// Abstraction over the system of record holding scopes, attributes and steps.
///
/// A fresh subscription first replays the current contents followed by a
/// boundary, then streams live changes. Replayed events may repeat events
/// already applied; consumers rely on attribute versions to stay idempotent.
pub trait Backend: Send + Sync {
    /// Open a change feed.
    fn subscribe(&self) -> BoxFuture<'static, BackendResult<ChangeFeed>>;
    /// Apply a batch of mutations atomically.
    fn commit(&self, batch: MutationBatch) -> BoxFuture<'static, BackendResult<()>>;
    /// Write `value` only if the attribute currently equals `expected`.
    fn compare_and_set(&self, request: CompareAndSet) -> BoxFuture<'static, BackendResult<bool>>;
    /// Read the authoritative value of an attribute, bypassing the local store.
    fn read_attribute(&self, scope_id: String, key: String) -> BoxFuture<'static, BackendResult<Option<Value>>>;
    /// Cheap liveness probe.
    fn health_check(&self) -> BoxFuture<'static, BackendResult<()>>;
}
