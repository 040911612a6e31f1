//! Server dispatch, panic isolation and shutdown, driven through a client session.

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use courier::chain::{Next, from_fn};
use courier::client::{OutgoingRequest, RequestOption, Session};
use courier::server::{Request, Response, Router, Server, middleware};
use courier::{Error, Method};
use http::StatusCode;
use tokio_util::sync::CancellationToken;

fn session_for(url: &str) -> Session {
    Session::builder().option(RequestOption::url(url)).build()
}

async fn get(session: &Session, path: &str) -> Result<courier::client::Response, Error> {
    session.do_request(&CancellationToken::new(), [RequestOption::path(path)]).await
}

#[tokio::test]
async fn panicking_handler_yields_500_and_server_keeps_serving() {
    let panics = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&panics);
    let server = Server::bind("127.0.0.1:0").with(middleware::Recover::new().on_panic(move |e| {
        assert!(matches!(e, Error::HandlerPanic(p) if p.message() == "handler exploded"));
        seen.fetch_add(1, Ordering::SeqCst);
    }));
    let server = common::start(server, common::app()).await;
    let session = session_for(&server.url);

    for _ in 0..3 {
        let res = get(&session, "/boom").await.unwrap();
        assert_eq!(res.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
    let res = session
        .do_request(&CancellationToken::new(), [RequestOption::path("/echo"), RequestOption::body("still here")])
        .await
        .unwrap();
    assert_eq!(res.text().await.unwrap(), "still here");
    assert_eq!(panics.load(Ordering::SeqCst), 3);

    server.stop().await.unwrap();
}

#[tokio::test]
async fn panics_are_contained_without_any_middleware() {
    let server = common::start(Server::bind("127.0.0.1:0"), common::app()).await;
    let session = session_for(&server.url);

    assert_eq!(get(&session, "/boom").await.unwrap().status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(get(&session, "/echo").await.unwrap().status(), StatusCode::OK);

    server.stop().await.unwrap();
}

#[tokio::test]
async fn server_middleware_sees_unmatched_paths() {
    let hits = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&hits);
    let counter = from_fn(move |req: Request, next: Next<Request, Response>| {
        seen.fetch_add(1, Ordering::SeqCst);
        next.run(req)
    });
    let server = common::start(Server::bind("127.0.0.1:0").with(counter), common::app()).await;
    let session = session_for(&server.url);

    assert_eq!(get(&session, "/nowhere").await.unwrap().status(), StatusCode::NOT_FOUND);
    assert_eq!(get(&session, "/echo").await.unwrap().status(), StatusCode::OK);
    assert_eq!(hits.load(Ordering::SeqCst), 2);

    server.stop().await.unwrap();
}

#[tokio::test]
async fn unknown_methods_get_405() {
    let server = common::start_app().await;
    let session = session_for(&server.url);

    let res = session
        .do_request(&CancellationToken::new(), [
            RequestOption::path("/echo"),
            RequestOption::mutator(|req: &mut OutgoingRequest| {
                *req.method_mut() = http::Method::from_bytes(b"BREW").unwrap();
            }),
        ])
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::METHOD_NOT_ALLOWED);

    let res = session
        .do_request(&CancellationToken::new(), [RequestOption::path("/slow"), RequestOption::method(Method::Delete)])
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);

    server.stop().await.unwrap();
}

#[tokio::test]
async fn oversized_bodies_get_413_before_any_middleware() {
    let hits = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&hits);
    let counter = from_fn(move |req: Request, next: Next<Request, Response>| {
        seen.fetch_add(1, Ordering::SeqCst);
        next.run(req)
    });
    let server = Server::bind("127.0.0.1:0").body_limit(16).with(counter);
    let server = common::start(server, common::app()).await;
    let session = session_for(&server.url);
    let post = |body: &str| {
        [RequestOption::method(Method::Post), RequestOption::path("/echo"), RequestOption::body(body.to_owned())]
    };

    let res = session.do_request(&CancellationToken::new(), post(&"x".repeat(64))).await.unwrap();
    assert_eq!(res.status(), StatusCode::PAYLOAD_TOO_LARGE);
    assert_eq!(hits.load(Ordering::SeqCst), 0);

    let res = session.do_request(&CancellationToken::new(), post("small")).await.unwrap();
    assert_eq!(res.text().await.unwrap(), "small");
    assert_eq!(hits.load(Ordering::SeqCst), 1);

    server.stop().await.unwrap();
}

#[tokio::test]
async fn route_middleware_only_wraps_its_route() {
    let server = common::start_app().await;
    let session = session_for(&server.url);

    let res = session
        .do_request(&CancellationToken::new(), [RequestOption::path("/traced"), RequestOption::body("t")])
        .await
        .unwrap();
    assert_eq!(res.text().await.unwrap(), "t");
    assert!(res.headers().contains_key(courier::X_REQUEST_ID));

    server.stop().await.unwrap();
}

#[tokio::test]
async fn shutdown_drains_in_flight_requests() {
    let server = common::start_app().await;
    let session = session_for(&server.url);

    let in_flight = {
        let session = session.clone();
        tokio::spawn(async move {
            let res = get(&session, "/slow").await?;
            res.text().await
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    let url = server.url.clone();
    server.stop().await.unwrap();

    assert_eq!(in_flight.await.unwrap().unwrap(), "finally");
    let err = get(&session_for(&url), "/echo").await.unwrap_err();
    assert!(err.is_transport());
}

#[tokio::test]
async fn run_binds_its_own_listener() {
    common::init_tracing();
    let reserved = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = reserved.local_addr().unwrap();
    drop(reserved);

    let shutdown = CancellationToken::new();
    let handle = tokio::spawn(
        Server::bind(addr.to_string())
            .run(Router::new().on(Method::Get, "/echo", common::echo), shutdown.clone()),
    );

    let session = session_for(&format!("http://{addr}"));
    let mut res = get(&session, "/echo").await;
    for _ in 0..20 {
        if res.is_ok() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
        res = get(&session, "/echo").await;
    }
    assert_eq!(res.unwrap().status(), StatusCode::OK);

    shutdown.cancel();
    handle.await.unwrap().unwrap();
}
