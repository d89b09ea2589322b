//! Per-request context: bound tenant, caller, policy marker stack and the
//! memoized scope snapshot.
//!
//! A [`RequestContext`] is created once per inbound request and installed as a
//! tokio task-local for the duration of the request future. Nothing in it is
//! shared with other requests: marker pushes and tenant overrides are RAII
//! guards, so they are undone on return, on error and when the request future
//! is dropped.
//!
//! Work spawned from inside a request gets a snapshot of the context (see
//! [`spawn_with_context`]) and never touches the parent's stack.

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use rowguard_core::{Caller, PolicyMarker, ScopeSnapshot, TenantId};
use tokio::sync::OnceCell;
use tokio::task::JoinHandle;

tokio::task_local! {
    static CURRENT: Arc<RequestContext>;
}

/// Ordered stack of policy markers for one call context.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MarkerStack {
    markers: Vec<PolicyMarker>,
}

impl MarkerStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, marker: PolicyMarker) {
        self.markers.push(marker);
    }

    pub fn pop(&mut self) -> Option<PolicyMarker> {
        self.markers.pop()
    }

    /// The innermost (most recently entered) marker.
    pub fn peek(&self) -> Option<&PolicyMarker> {
        self.markers.last()
    }

    /// All markers, outermost first.
    pub fn all(&self) -> &[PolicyMarker] {
        &self.markers
    }

    pub fn len(&self) -> usize {
        self.markers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.markers.is_empty()
    }

    fn truncate(&mut self, depth: usize) {
        self.markers.truncate(depth);
    }
}

/// State of one logical request.
#[derive(Debug, Default)]
pub struct RequestContext {
    caller: Option<Caller>,
    tenant: Mutex<Option<TenantId>>,
    markers: Mutex<MarkerStack>,
    scope: OnceCell<ScopeSnapshot>,
}

impl RequestContext {
    pub fn new(caller: Option<Caller>, tenant: Option<TenantId>) -> Self {
        Self {
            caller,
            tenant: Mutex::new(tenant),
            markers: Mutex::new(MarkerStack::new()),
            scope: OnceCell::new(),
        }
    }

    /// Context of an authenticated caller acting inside their own tenant.
    pub fn for_caller(caller: Caller) -> Self {
        let tenant = caller.tenant_id.clone();
        Self::new(Some(caller), Some(tenant))
    }

    /// Context without a caller, bound to a tenant (or to none).
    pub fn anonymous(tenant: Option<TenantId>) -> Self {
        Self::new(None, tenant)
    }

    /// The context installed for the current task, if any.
    pub fn current() -> Option<Arc<RequestContext>> {
        CURRENT.try_with(Arc::clone).ok()
    }

    pub fn caller(&self) -> Option<&Caller> {
        self.caller.as_ref()
    }

    /// The tenant currently bound, including a temporary visit override.
    pub fn tenant_id(&self) -> Option<TenantId> {
        lock(&self.tenant).clone()
    }

    /// The innermost active marker.
    pub fn marker(&self) -> Option<PolicyMarker> {
        lock(&self.markers).peek().cloned()
    }

    /// Whether the innermost marker switches rules off.
    pub fn rules_disabled(&self) -> bool {
        lock(&self.markers).peek().is_some_and(|m| !m.enabled)
    }

    /// A copy of the marker stack as it is right now.
    pub fn markers(&self) -> MarkerStack {
        lock(&self.markers).clone()
    }

    /// Push a marker for the lifetime of the returned guard.
    pub fn enter(self: &Arc<Self>, marker: PolicyMarker) -> MarkerGuard {
        let mut stack = lock(&self.markers);
        let depth = stack.len();
        stack.push(marker);
        MarkerGuard {
            ctx: Arc::clone(self),
            depth,
        }
    }

    /// Bind another tenant for the lifetime of the returned guard.
    pub fn override_tenant(self: &Arc<Self>, tenant: TenantId) -> TenantOverride {
        let previous = lock(&self.tenant).replace(tenant);
        TenantOverride {
            ctx: Arc::clone(self),
            previous,
        }
    }

    /// Resolve the caller's scope snapshot at most once for this context.
    ///
    /// Concurrent callers within the same request wait for the first fetch.
    /// A failed fetch is not cached.
    pub async fn scope_snapshot<E, F, Fut>(&self, fetch: F) -> Result<&ScopeSnapshot, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<ScopeSnapshot, E>>,
    {
        self.scope.get_or_try_init(fetch).await
    }

    /// The scope snapshot, if it has already been resolved.
    pub fn cached_scope(&self) -> Option<&ScopeSnapshot> {
        self.scope.get()
    }

    /// Snapshot of this context for another execution unit.
    ///
    /// The copy owns its own marker stack and tenant binding; changes on
    /// either side are invisible to the other.
    pub fn fork(&self) -> RequestContext {
        RequestContext {
            caller: self.caller.clone(),
            tenant: Mutex::new(self.tenant_id()),
            markers: Mutex::new(self.markers()),
            scope: OnceCell::new_with(self.cached_scope().cloned()),
        }
    }

    /// Run a future with this context installed as the current one.
    ///
    /// The marker stack must be back at its starting depth when the future
    /// completes; anything left over is logged and discarded.
    pub async fn run<F: Future>(self: Arc<Self>, fut: F) -> F::Output {
        let base = lock(&self.markers).len();
        let output = CURRENT.scope(Arc::clone(&self), fut).await;

        let mut stack = lock(&self.markers);
        if stack.len() != base {
            tracing::error!(
                expected = base,
                actual = stack.len(),
                "policy marker stack leaked past request teardown"
            );
            stack.truncate(base);
        }
        output
    }
}

/// Pops its marker when dropped.
#[derive(Debug)]
#[must_use = "the marker is popped as soon as the guard is dropped"]
pub struct MarkerGuard {
    ctx: Arc<RequestContext>,
    depth: usize,
}

impl Drop for MarkerGuard {
    fn drop(&mut self) {
        let mut stack = lock(&self.ctx.markers);
        if stack.len() != self.depth + 1 {
            tracing::warn!(
                expected = self.depth + 1,
                actual = stack.len(),
                "policy markers released out of order"
            );
        }
        stack.truncate(self.depth);
    }
}

/// Restores the previously bound tenant when dropped.
#[derive(Debug)]
#[must_use = "the tenant is restored as soon as the guard is dropped"]
pub struct TenantOverride {
    ctx: Arc<RequestContext>,
    previous: Option<TenantId>,
}

impl Drop for TenantOverride {
    fn drop(&mut self) {
        *lock(&self.ctx.tenant) = self.previous.take();
    }
}

/// Run `fut` with `marker` pushed onto the current context's stack.
///
/// Outside of a request context the marker cannot be recorded; the future
/// runs with rules in their default (enabled) state.
pub async fn with_marker<F: Future>(marker: PolicyMarker, fut: F) -> F::Output {
    match RequestContext::current() {
        Some(ctx) => {
            let _guard = ctx.enter(marker);
            fut.await
        }
        None => {
            tracing::warn!(
                enabled = marker.enabled,
                "no request context; policy marker ignored"
            );
            fut.await
        }
    }
}

/// Spawn a task that observes a snapshot of the current request context.
pub fn spawn_with_context<F>(fut: F) -> JoinHandle<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    match RequestContext::current() {
        Some(ctx) => tokio::spawn(Arc::new(ctx.fork()).run(fut)),
        None => tokio::spawn(fut),
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn current_enabled() -> Option<bool> {
        RequestContext::current()
            .and_then(|ctx| ctx.marker())
            .map(|m| m.enabled)
    }

    #[test]
    fn test_marker_stack_contract() {
        let mut stack = MarkerStack::new();
        assert!(stack.peek().is_none());

        stack.push(PolicyMarker::disabled());
        stack.push(PolicyMarker::enabled());
        assert_eq!(stack.len(), 2);
        assert!(stack.peek().unwrap().enabled);
        assert!(!stack.all()[0].enabled);

        assert!(stack.pop().unwrap().enabled);
        assert!(!stack.peek().unwrap().enabled);
        stack.pop();
        assert!(stack.is_empty());
        assert!(stack.pop().is_none());
    }

    #[tokio::test]
    async fn test_nested_markers_unwind_in_order() {
        let ctx = Arc::new(RequestContext::anonymous(None));

        ctx.clone()
            .run(async {
                assert_eq!(current_enabled(), None);
                with_marker(PolicyMarker::disabled(), async {
                    assert_eq!(current_enabled(), Some(false));
                    with_marker(PolicyMarker::enabled(), async {
                        assert_eq!(current_enabled(), Some(true));
                    })
                    .await;
                    assert_eq!(current_enabled(), Some(false));
                })
                .await;
                assert_eq!(current_enabled(), None);
            })
            .await;

        assert!(ctx.markers().is_empty());
    }

    #[tokio::test]
    async fn test_marker_popped_on_error_path() {
        let ctx = Arc::new(RequestContext::anonymous(None));

        let result: Result<(), &str> = ctx
            .clone()
            .run(with_marker(PolicyMarker::disabled(), async {
                Err("boom")
            }))
            .await;

        assert!(result.is_err());
        assert!(ctx.markers().is_empty());
    }

    #[tokio::test]
    async fn test_marker_popped_on_cancellation() {
        let ctx = Arc::new(RequestContext::anonymous(None));
        let (entered_tx, entered_rx) = tokio::sync::oneshot::channel();

        let task = tokio::spawn(ctx.clone().run(with_marker(PolicyMarker::disabled(), async {
            let _ = entered_tx.send(());
            std::future::pending::<()>().await;
        })));

        entered_rx.await.unwrap();
        assert_eq!(ctx.markers().len(), 1);

        task.abort();
        assert!(task.await.unwrap_err().is_cancelled());
        assert!(ctx.markers().is_empty());
    }

    #[tokio::test]
    async fn test_spawned_task_sees_snapshot() {
        let ctx = Arc::new(RequestContext::anonymous(None));

        ctx.clone()
            .run(async {
                let parent = RequestContext::current().unwrap();
                let _outer = parent.enter(PolicyMarker::disabled());

                let handle = spawn_with_context(async {
                    let child = RequestContext::current().unwrap();
                    let seen = child.marker().map(|m| m.enabled);
                    // Mutating the snapshot must not reach the parent.
                    let _inner = child.enter(PolicyMarker::enabled());
                    (seen, child.markers().len())
                });
                let (seen, child_depth) = handle.await.unwrap();

                assert_eq!(seen, Some(false));
                assert_eq!(child_depth, 2);
                assert_eq!(parent.markers().len(), 1);
            })
            .await;

        assert!(ctx.markers().is_empty());
    }

    #[tokio::test]
    async fn test_tenant_override_restored() {
        let ctx = Arc::new(RequestContext::for_caller(Caller::new(1, "A")));
        {
            let _visit = ctx.override_tenant(TenantId::new("B"));
            assert_eq!(ctx.tenant_id(), Some(TenantId::new("B")));
        }
        assert_eq!(ctx.tenant_id(), Some(TenantId::new("A")));
    }

    #[tokio::test]
    async fn test_scope_snapshot_resolved_once() {
        let ctx = RequestContext::for_caller(Caller::new(42, "A"));
        let calls = std::sync::atomic::AtomicUsize::new(0);

        for _ in 0..3 {
            let snapshot = ctx
                .scope_snapshot(|| async {
                    calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                    Ok::<_, String>(ScopeSnapshot::depts([10]))
                })
                .await
                .unwrap();
            assert!(snapshot.dept_ids.contains(&10));
        }

        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_separate_requests_do_not_share_markers() {
        let first = Arc::new(RequestContext::anonymous(None));
        first
            .clone()
            .run(async {
                let ctx = RequestContext::current().unwrap();
                std::mem::forget(ctx.enter(PolicyMarker::disabled()));
            })
            .await;
        // The leaked push is discarded at teardown.
        assert!(first.markers().is_empty());

        let second = Arc::new(RequestContext::anonymous(None));
        let enabled = second.run(async { current_enabled() }).await;
        assert_eq!(enabled, None);
    }
}
