use std::future::Future;

use crate::{Actor, Codec, InvocationId, SessionId, Trace};

tokio::task_local! {
    static CURRENT: Context;
}

/// Server-side view of the request being handled.
///
/// Handlers do not receive it as an argument; they read it with
/// [`Context::current`] when they need the caller's identity.
#[derive(Clone, Debug, PartialEq)]
pub struct Context {
    pub invocation_id: InvocationId,
    pub session_id: SessionId,
    /// The user the broker authenticated the request for.
    pub user: String,
    pub method: String,
    pub external_trace: Option<Trace>,
    pub impersonated_actor: Option<Actor>,
    pub codec: Codec,
}

impl Context {
    /// The context of the request running on this task, if any.
    #[must_use]
    pub fn current() -> Option<Context> {
        CURRENT.try_with(Clone::clone).ok()
    }

    pub(crate) async fn scope<F: Future>(self, fut: F) -> F::Output {
        CURRENT.scope(self, fut).await
    }
}
