//! Radix-tree request router.
//!
//! One tree per HTTP method, O(path-length) lookup. Each route is composed
//! with its own middleware when it is registered, so a request pays for the
//! lookup and the chain hops and nothing else.

use std::collections::HashMap;
use std::sync::Arc;

use http::StatusCode;
use matchit::Router as MatchitRouter;
use tracing::warn;

use crate::chain::{BoxFuture, Chain, Composed, Endpoint, Interceptor};
use crate::method::Method;
use crate::server::handler::{BoxedHandler, Handler};
use crate::server::request::Request;
use crate::server::response::Response;

/// A handler plus the middleware that wraps only it.
///
/// Route-level middleware runs inside the server-level stack, in
/// registration order.
pub struct Route {
    handler: BoxedHandler,
    middleware: Chain<Request, Response>,
}

impl Route {
    pub fn new(handler: impl Handler) -> Self {
        Self { handler: handler.into_boxed_handler(), middleware: Chain::new() }
    }

    /// Appends a route-level middleware. Returns `self` for chaining.
    pub fn with(mut self, middleware: impl Interceptor<Request, Response>) -> Self {
        self.middleware.push(Arc::new(middleware));
        self
    }

    fn compose(self) -> Composed<Request, Response> {
        self.middleware.compose(self.handler)
    }
}

/// The application router.
///
/// Build it once at startup; pass it to [`Server::run`](crate::server::Server::run).
/// Each registration returns `self` so calls chain naturally.
pub struct Router {
    routes: HashMap<Method, MatchitRouter<Composed<Request, Response>>>,
}

impl Router {
    pub fn new() -> Self {
        Self { routes: HashMap::new() }
    }

    /// Register a handler for a method + path pair. Returns `self` for chaining.
    ///
    /// Path parameters use `{name}` syntax; `req.param("name")` retrieves them:
    ///
    /// ```rust
    /// # use courier::Method;
    /// # use courier::server::{Request, Response, Router};
    /// # async fn get_user(_: Request) -> Response { Response::text("") }
    /// # async fn create_user(_: Request) -> Response { Response::text("") }
    /// Router::new()
    ///     .on(Method::Get,  "/users/{id}", get_user)
    ///     .on(Method::Post, "/users",      create_user);
    /// ```
    ///
    /// The first registration of a path wins. A later one that conflicts with
    /// it, or a malformed path, is logged and ignored.
    pub fn on(self, method: Method, path: &str, handler: impl Handler) -> Self {
        self.route(method, path, Route::new(handler))
    }

    /// Like [`on`](Router::on), for a [`Route`] carrying its own middleware.
    pub fn route(mut self, method: Method, path: &str, route: Route) -> Self {
        let tree = self.routes.entry(method).or_default();
        if let Err(e) = tree.insert(path, route.compose()) {
            warn!(%method, path, "route ignored: {e}");
        }
        self
    }

    pub(crate) fn lookup(
        &self,
        method: Method,
        path: &str,
    ) -> Option<(Composed<Request, Response>, HashMap<String, String>)> {
        let tree = self.routes.get(&method)?;
        let matched = tree.at(path).ok()?;
        let route = matched.value.clone();
        let params = matched.params.iter()
            .map(|(k, v)| (k.to_owned(), v.to_owned()))
            .collect();
        Some((route, params))
    }
}

impl Default for Router {
    fn default() -> Self { Self::new() }
}

/// The innermost layer of the server-level stack: match, then run the route.
impl Endpoint<Request, Response> for Router {
    fn call(&self, mut req: Request) -> BoxFuture<'_, Response> {
        match self.lookup(req.method(), req.path()) {
            Some((route, params)) => {
                req.set_params(params);
                route.call(req)
            }
            None => Box::pin(async { Response::status(StatusCode::NOT_FOUND) }),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::chain::{Next, from_fn};
    use crate::server::request::test_request;

    async fn hello(_req: Request) -> &'static str {
        "hello"
    }

    async fn user(req: Request) -> String {
        format!("user {}", req.param("id").unwrap_or("?"))
    }

    async fn call(router: &Router, method: Method, uri: &str) -> Response {
        router.call(test_request(method, uri, "")).await
    }

    #[tokio::test]
    async fn exact_and_param_routes() {
        let router = Router::new()
            .on(Method::Get, "/hello", hello)
            .on(Method::Get, "/users/{id}", user);

        assert_eq!(call(&router, Method::Get, "/hello").await.body(), "hello");
        assert_eq!(call(&router, Method::Get, "/users/42").await.body(), "user 42");
        assert_eq!(call(&router, Method::Get, "/nope").await.status_code(), StatusCode::NOT_FOUND);
        assert_eq!(call(&router, Method::Post, "/hello").await.status_code(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn first_registration_wins() {
        async fn second(_req: Request) -> &'static str {
            "second"
        }
        let router = Router::new()
            .on(Method::Get, "/dup", hello)
            .on(Method::Get, "/dup", second);

        assert_eq!(call(&router, Method::Get, "/dup").await.body(), "hello");
    }

    #[tokio::test]
    async fn route_middleware_wraps_only_its_route() {
        let trail = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&trail);
        let tag = from_fn(move |req: Request, next: Next<Request, Response>| {
            let seen = Arc::clone(&seen);
            async move {
                seen.lock().unwrap().push(req.path().to_owned());
                next.run(req).await
            }
        });
        let router = Router::new()
            .route(Method::Get, "/tagged", Route::new(hello).with(tag))
            .on(Method::Get, "/plain", hello);

        call(&router, Method::Get, "/tagged").await;
        call(&router, Method::Get, "/plain").await;

        assert_eq!(*trail.lock().unwrap(), ["/tagged"]);
    }
}
