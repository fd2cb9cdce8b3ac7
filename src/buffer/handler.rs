use std::future::Future;
use std::marker::PhantomData;

use async_trait::async_trait;
use tracing::error;

use crate::buffer::Group;
use crate::error::{RelayError, Result};

/// Consumer invoked once per completed group.
#[async_trait]
pub trait FlushHandler<T>: Send + Sync {
    async fn on_flush(&self, group: Group<T>) -> Result<()>;
}

/// Receives failures that happen after `submit` has already returned.
pub trait ErrorSink: Send + Sync {
    fn report(&self, key: Option<&str>, error: &RelayError);
}

/// Default sink: log and move on.
pub struct TracingSink;

impl ErrorSink for TracingSink {
    fn report(&self, key: Option<&str>, error: &RelayError) {
        error!("Flush failed for group {}: {error}", key.unwrap_or("<none>"));
    }
}

impl<F> ErrorSink for F
where
    F: Fn(Option<&str>, &RelayError) + Send + Sync,
{
    fn report(&self, key: Option<&str>, error: &RelayError) {
        self(key, error)
    }
}

/// Wraps an async closure as a [`FlushHandler`].
pub struct FnHandler<F, T> {
    f: F,
    _payload: PhantomData<fn(T)>,
}

pub fn handler_fn<F, Fut, T>(f: F) -> FnHandler<F, T>
where
    F: Fn(Group<T>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<()>> + Send,
    T: Send + 'static,
{
    FnHandler {
        f,
        _payload: PhantomData,
    }
}

#[async_trait]
impl<F, Fut, T> FlushHandler<T> for FnHandler<F, T>
where
    F: Fn(Group<T>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<()>> + Send,
    T: Send + 'static,
{
    async fn on_flush(&self, group: Group<T>) -> Result<()> {
        (self.f)(group).await
    }
}
