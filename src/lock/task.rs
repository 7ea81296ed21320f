use std::future::Future;

use async_trait::async_trait;

/// A unit of work that must run while holding a named lock.
///
/// The coordinator derives the lock key from [`lock_name`](Self::lock_name),
/// acquires it, runs [`process`](Self::process) and releases it afterwards.
#[async_trait]
pub trait DistributedTask: Send {
    type Output: Send;

    fn lock_name(&self) -> String;

    async fn process(self) -> Self::Output;
}

/// [`DistributedTask`] built from a name and a closure.
pub struct FnTask<F> {
    name: String,
    work: F,
}

/// Wraps `work` so it runs under the lock called `name`.
pub fn task<F, Fut>(name: impl Into<String>, work: F) -> FnTask<F>
where
    F: FnOnce() -> Fut + Send,
    Fut: Future + Send,
    Fut::Output: Send,
{
    FnTask {
        name: name.into(),
        work,
    }
}

#[async_trait]
impl<F, Fut> DistributedTask for FnTask<F>
where
    F: FnOnce() -> Fut + Send,
    Fut: Future + Send,
    Fut::Output: Send,
{
    type Output = Fut::Output;

    fn lock_name(&self) -> String {
        self.name.clone()
    }

    async fn process(self) -> Self::Output {
        (self.work)().await
    }
}
