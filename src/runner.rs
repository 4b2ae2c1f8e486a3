//! Query runner leasing and the transaction context shared by nested operations.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::driver::{Driver, QueryRunner};
use crate::error::AppError;

/// Hands out query runners for repository operations.
///
/// In single-runner mode the provider creates one runner lazily and hands
/// the same runner to every caller until [`release_reused`] is called.
/// Releasing that runner through [`release`] is a no-op, so nested
/// operations can share one connection and one transaction. Once
/// [`release_reused`] has run, a single-runner provider is closed and
/// [`provide`] fails with [`AppError::RunnerReleased`].
///
/// [`provide`]: QueryRunnerProvider::provide
/// [`release`]: QueryRunnerProvider::release
/// [`release_reused`]: QueryRunnerProvider::release_reused
pub struct QueryRunnerProvider {
    driver: Arc<dyn Driver>,
    use_single_runner: bool,
    reused: Mutex<ReusedRunner>,
}

#[derive(Default)]
struct ReusedRunner {
    runner: Option<Arc<dyn QueryRunner>>,
    closed: bool,
}

impl QueryRunnerProvider {
    pub fn new(driver: Arc<dyn Driver>, use_single_runner: bool) -> Self {
        Self {
            driver,
            use_single_runner,
            reused: Mutex::new(ReusedRunner::default()),
        }
    }

    pub fn uses_single_runner(&self) -> bool {
        self.use_single_runner
    }

    /// Returns the reusable runner in single-runner mode, or leases a new one.
    pub async fn provide(&self) -> Result<Arc<dyn QueryRunner>, AppError> {
        if !self.use_single_runner {
            let runner = self.driver.create_query_runner().await?;
            tracing::debug!("query runner acquired");
            return Ok(runner);
        }

        let mut reused = self.reused.lock().await;
        if reused.closed {
            return Err(AppError::RunnerReleased);
        }
        if let Some(runner) = reused.runner.as_ref() {
            return Ok(runner.clone());
        }
        let runner = self.driver.create_query_runner().await?;
        tracing::debug!("reusable query runner acquired");
        reused.runner = Some(runner.clone());
        Ok(runner)
    }

    /// Releases `runner` unless it is the reusable runner.
    pub async fn release(&self, runner: &Arc<dyn QueryRunner>) -> Result<(), AppError> {
        if self.is_reused(runner).await {
            return Ok(());
        }
        runner.release().await?;
        tracing::debug!("query runner released");
        Ok(())
    }

    /// Releases and forgets the reusable runner, if one was created, and
    /// closes the provider.
    pub async fn release_reused(&self) -> Result<(), AppError> {
        let runner = {
            let mut reused = self.reused.lock().await;
            reused.closed = true;
            reused.runner.take()
        };
        if let Some(runner) = runner {
            runner.release().await?;
            tracing::debug!("reusable query runner released");
        }
        Ok(())
    }

    async fn is_reused(&self, runner: &Arc<dyn QueryRunner>) -> bool {
        self.reused
            .lock()
            .await
            .runner
            .as_ref()
            .is_some_and(|reused| same_runner(reused, runner))
    }
}

fn same_runner(a: &Arc<dyn QueryRunner>, b: &Arc<dyn QueryRunner>) -> bool {
    Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const ()
}

/// The provider of an enclosing transaction.
///
/// Repositories created with [`Repository::within`](crate::repository::Repository::within)
/// lease their runners from this provider, so every operation they run joins
/// the enclosing transaction instead of opening a new connection.
///
/// A context outlives its transaction only as a handle: once the
/// transaction has finished, operations run through it fail with
/// [`AppError::RunnerReleased`].
#[derive(Clone)]
pub struct TransactionContext {
    provider: Arc<QueryRunnerProvider>,
}

impl TransactionContext {
    pub fn new(provider: Arc<QueryRunnerProvider>) -> Self {
        Self { provider }
    }

    pub fn provider(&self) -> &Arc<QueryRunnerProvider> {
        &self.provider
    }
}

impl std::fmt::Debug for TransactionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionContext")
            .field("use_single_runner", &self.provider.use_single_runner)
            .finish()
    }
}

/// A runner leased from a provider, released when the lease ends.
///
/// [`release`](RunnerLease::release) is the normal exit. A lease dropped
/// without it (its future was cancelled or aborted) releases in a background
/// task; when it owns the provider it first rolls back an open transaction.
/// A borrowed lease on a shared single-runner provider leaves the runner to
/// the lease that owns the provider.
pub(crate) struct RunnerLease {
    provider: Arc<QueryRunnerProvider>,
    runner: Arc<dyn QueryRunner>,
    owns_provider: bool,
    released: bool,
}

impl RunnerLease {
    /// Leases a runner from `provider`. With `owns_provider` the lease also
    /// releases the provider's reusable runner when it ends.
    pub(crate) async fn acquire(
        provider: Arc<QueryRunnerProvider>,
        owns_provider: bool,
    ) -> Result<Self, AppError> {
        let runner = provider.provide().await?;
        Ok(Self {
            provider,
            runner,
            owns_provider,
            released: false,
        })
    }

    pub(crate) fn runner(&self) -> &Arc<dyn QueryRunner> {
        &self.runner
    }

    pub(crate) async fn release(mut self) -> Result<(), AppError> {
        let cleanup = release_lease(&self.provider, &self.runner, self.owns_provider).await;
        self.released = true;
        cleanup
    }
}

async fn release_lease(
    provider: &QueryRunnerProvider,
    runner: &Arc<dyn QueryRunner>,
    owns_provider: bool,
) -> Result<(), AppError> {
    let mut cleanup = provider.release(runner).await;
    if owns_provider {
        cleanup = cleanup.and(provider.release_reused().await);
    }
    cleanup
}

impl Drop for RunnerLease {
    fn drop(&mut self) {
        if self.released || (!self.owns_provider && self.provider.uses_single_runner()) {
            return;
        }

        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            tracing::error!("query runner lease dropped outside a runtime; runner not released");
            return;
        };

        tracing::warn!("query runner lease dropped before release; releasing in background");
        let provider = self.provider.clone();
        let runner = self.runner.clone();
        let owns_provider = self.owns_provider;
        handle.spawn(async move {
            if owns_provider && runner.is_transaction_active() {
                if let Err(error) = runner.rollback_transaction().await {
                    tracing::warn!(error = %error, "failed to roll back abandoned transaction");
                }
            }
            if let Err(error) = release_lease(&provider, &runner, owns_provider).await {
                tracing::warn!(error = %error, "failed to release abandoned query runner");
            }
        });
    }
}

/// Leases a runner, runs `work` on it and releases the runner on every exit
/// path, including cancellation.
pub(crate) async fn with_runner<T, F, Fut>(
    provider: &Arc<QueryRunnerProvider>,
    owns_provider: bool,
    work: F,
) -> Result<T, AppError>
where
    F: FnOnce(Arc<dyn QueryRunner>) -> Fut,
    Fut: Future<Output = Result<T, AppError>>,
{
    let lease = RunnerLease::acquire(provider.clone(), owns_provider).await?;
    let result = work(lease.runner().clone()).await;
    finish(result, lease.release().await)
}

/// Combines an operation's outcome with the outcome of its cleanup.
///
/// The operation's error takes precedence; a cleanup failure is only
/// returned when the operation itself succeeded.
pub(crate) fn finish<T>(result: Result<T, AppError>, cleanup: Result<(), AppError>) -> Result<T, AppError> {
    match (result, cleanup) {
        (Ok(value), Ok(())) => Ok(value),
        (Ok(_), Err(cleanup_error)) => Err(cleanup_error),
        (Err(error), Ok(())) => Err(error),
        (Err(error), Err(cleanup_error)) => {
            tracing::warn!(error = %cleanup_error, "failed to release query runner after error");
            Err(error)
        }
    }
}
