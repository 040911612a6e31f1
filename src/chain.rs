//! Interceptor composition, shared by the client and the server.
//!
//! # Onion ordering
//!
//! A [`Chain`] is an ordered stack of [`Interceptor`]s. Composing it around an
//! [`Endpoint`] yields a [`Composed`] call path in which the first-registered
//! interceptor is the outermost wrapper:
//!
//! ```text
//! chain: [a, b]   endpoint: e
//!
//! a.pre → b.pre → e → b.post → a.post
//! ```
//!
//! The path is not a tree of nested closures. [`Next`] is a cursor over the
//! shared stack: calling [`Next::run`] hands the request to the interceptor at
//! the cursor with a cursor advanced by one, and once the stack is exhausted
//! the endpoint runs. Composing costs one `Arc<[_]>` allocation; each hop costs
//! two `Arc` clones.
//!
//! An interceptor can inspect or rewrite the request before delegating,
//! post-process whatever the inner layers return, or never call `next` at all
//! (short-circuit). Whatever the inner layers return reaches the outer layers
//! untouched unless a layer replaces it.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// A heap-allocated, type-erased future.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// The innermost call of a chain: the transport round trip on the client,
/// the route handler on the server.
pub trait Endpoint<Req, Out>: Send + Sync + 'static {
    fn call(&self, req: Req) -> BoxFuture<'_, Out>;
}

/// A composable wrapper around an [`Endpoint`].
///
/// Client interceptors are `Interceptor<OutgoingRequest, RoundTripResult>`,
/// server middleware is `Interceptor<Request, Response>`.
///
/// ```rust
/// use courier::chain::{BoxFuture, Interceptor, Next};
///
/// struct Tag(&'static str);
///
/// impl Interceptor<Vec<&'static str>, Vec<&'static str>> for Tag {
///     fn handle(
///         &self,
///         mut req: Vec<&'static str>,
///         next: Next<Vec<&'static str>, Vec<&'static str>>,
///     ) -> BoxFuture<'_, Vec<&'static str>> {
///         Box::pin(async move {
///             req.push(self.0);
///             next.run(req).await
///         })
///     }
/// }
/// ```
pub trait Interceptor<Req, Out>: Send + Sync + 'static {
    fn handle(&self, req: Req, next: Next<Req, Out>) -> BoxFuture<'_, Out>;
}

type Stack<Req, Out> = Arc<[Arc<dyn Interceptor<Req, Out>>]>;

/// The rest of the chain, as seen from inside an interceptor.
///
/// Cloning is cheap, so an interceptor may run the remainder more than once
/// (retries) or not at all.
pub struct Next<Req, Out> {
    stack: Stack<Req, Out>,
    cursor: usize,
    endpoint: Arc<dyn Endpoint<Req, Out>>,
}

impl<Req, Out> Clone for Next<Req, Out> {
    fn clone(&self) -> Self {
        Self {
            stack: Arc::clone(&self.stack),
            cursor: self.cursor,
            endpoint: Arc::clone(&self.endpoint),
        }
    }
}

impl<Req, Out> Next<Req, Out>
where
    Req: Send + 'static,
    Out: Send + 'static,
{
    /// Runs the remainder of the chain.
    pub async fn run(mut self, req: Req) -> Out {
        match self.stack.get(self.cursor).cloned() {
            Some(current) => {
                self.cursor += 1;
                current.handle(req, self).await
            }
            None => self.endpoint.call(req).await,
        }
    }

    /// Number of interceptors still ahead of the endpoint.
    pub fn remaining(&self) -> usize {
        self.stack.len().saturating_sub(self.cursor)
    }
}

/// An ordered interceptor stack. Index 0 is the outermost layer.
pub struct Chain<Req, Out> {
    stack: Vec<Arc<dyn Interceptor<Req, Out>>>,
}

impl<Req, Out> Clone for Chain<Req, Out> {
    fn clone(&self) -> Self {
        Self { stack: self.stack.clone() }
    }
}

impl<Req, Out> Default for Chain<Req, Out> {
    fn default() -> Self {
        Self { stack: Vec::new() }
    }
}

impl<Req, Out> Chain<Req, Out>
where
    Req: Send + 'static,
    Out: Send + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `interceptor` as the innermost layer so far.
    pub fn push(&mut self, interceptor: Arc<dyn Interceptor<Req, Out>>) {
        self.stack.push(interceptor);
    }

    /// Appends every layer of `other`, keeping its order, inside this chain's layers.
    pub fn extend(&mut self, other: &Chain<Req, Out>) {
        self.stack.extend(other.stack.iter().cloned());
    }

    pub fn len(&self) -> usize {
        self.stack.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stack.is_empty()
    }

    /// Freezes the stack around `endpoint`.
    pub fn compose(&self, endpoint: Arc<dyn Endpoint<Req, Out>>) -> Composed<Req, Out> {
        Composed { stack: self.stack.clone().into(), endpoint }
    }
}

impl<Req, Out> FromIterator<Arc<dyn Interceptor<Req, Out>>> for Chain<Req, Out> {
    fn from_iter<I: IntoIterator<Item = Arc<dyn Interceptor<Req, Out>>>>(iter: I) -> Self {
        Self { stack: iter.into_iter().collect() }
    }
}

/// A chain frozen around its endpoint. Cheap to share between concurrent calls.
pub struct Composed<Req, Out> {
    stack: Stack<Req, Out>,
    endpoint: Arc<dyn Endpoint<Req, Out>>,
}

impl<Req, Out> Clone for Composed<Req, Out> {
    fn clone(&self) -> Self {
        Self { stack: Arc::clone(&self.stack), endpoint: Arc::clone(&self.endpoint) }
    }
}

impl<Req, Out> Composed<Req, Out>
where
    Req: Send + 'static,
    Out: Send + 'static,
{
    pub fn call(&self, req: Req) -> BoxFuture<'static, Out> {
        let next = Next {
            stack: Arc::clone(&self.stack),
            cursor: 0,
            endpoint: Arc::clone(&self.endpoint),
        };
        Box::pin(next.run(req))
    }
}

// ── Closure adapters ──────────────────────────────────────────────────────────

/// Turns an async closure into an [`Interceptor`].
///
/// ```rust
/// use courier::chain::{from_fn, Next};
///
/// let double = from_fn(|n: u32, next: Next<u32, u32>| async move {
///     next.run(n).await * 2
/// });
/// # let _ = double;
/// ```
pub fn from_fn<F, Fut, Req, Out>(f: F) -> FnInterceptor<F>
where
    F: Fn(Req, Next<Req, Out>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Out> + Send + 'static,
{
    FnInterceptor(f)
}

/// See [`from_fn`].
pub struct FnInterceptor<F>(F);

impl<F, Fut, Req, Out> Interceptor<Req, Out> for FnInterceptor<F>
where
    F: Fn(Req, Next<Req, Out>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Out> + Send + 'static,
    Req: 'static,
    Out: 'static,
{
    fn handle(&self, req: Req, next: Next<Req, Out>) -> BoxFuture<'_, Out> {
        Box::pin((self.0)(req, next))
    }
}

/// Turns an async closure into an [`Endpoint`].
pub fn endpoint_fn<F, Fut, Req, Out>(f: F) -> FnEndpoint<F>
where
    F: Fn(Req) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Out> + Send + 'static,
{
    FnEndpoint(f)
}

/// See [`endpoint_fn`].
pub struct FnEndpoint<F>(F);

impl<F, Fut, Req, Out> Endpoint<Req, Out> for FnEndpoint<F>
where
    F: Fn(Req) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Out> + Send + 'static,
    Req: 'static,
    Out: 'static,
{
    fn call(&self, req: Req) -> BoxFuture<'_, Out> {
        Box::pin((self.0)(req))
    }
}
