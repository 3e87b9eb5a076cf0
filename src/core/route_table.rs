//! The live routing table.
//!
//! Readers load a snapshot with a single atomic pointer read and keep using it
//! until their request completes; a concurrent [`MutableRouteTable::replace`]
//! only affects requests that start afterwards.
use std::sync::Arc;

use arc_swap::ArcSwap;
use axum::{Router, body::Body, extract::Request, response::Response};
use tower::ServiceExt;

pub struct MutableRouteTable {
    current: ArcSwap<Router>,
}

impl MutableRouteTable {
    pub fn new(initial: Router) -> Self {
        Self {
            current: ArcSwap::from_pointee(initial),
        }
    }

    /// Table with no routes; every request answers 404 until the first `replace`.
    pub fn empty() -> Self {
        Self::new(Router::new())
    }

    /// Routes `request` through the table installed at call time.
    pub async fn dispatch(&self, request: Request<Body>) -> Response {
        let snapshot = self.current.load_full();
        let router = Router::clone(&snapshot);
        match router.oneshot(request).await {
            Ok(response) => response,
            Err(never) => match never {},
        }
    }

    /// Installs `table` for every dispatch that starts after this call returns.
    pub fn replace(&self, table: Router) {
        self.current.store(Arc::new(table));
        tracing::debug!("Route table replaced");
    }

    pub fn snapshot(&self) -> Arc<Router> {
        self.current.load_full()
    }

    /// Outer router handing every request to the current table. This is what
    /// the listener serves; it never needs to be rebuilt.
    pub fn service(self: &Arc<Self>) -> Router {
        let table = Arc::clone(self);
        Router::new().fallback(move |request: Request| {
            let table = Arc::clone(&table);
            async move { table.dispatch(request).await }
        })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use axum::{http::StatusCode, routing::get};
    use http_body_util::BodyExt;

    use super::*;

    fn versioned(version: &'static str) -> Router {
        Router::new()
            .route("/a", get(move || async move { version }))
            .route("/b", get(move || async move { version }))
    }

    async fn text(table: &MutableRouteTable, path: &str) -> (StatusCode, String) {
        let response = table
            .dispatch(Request::builder().uri(path).body(Body::empty()).unwrap())
            .await;
        let status = response.status();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        (status, String::from_utf8(body.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn empty_table_answers_404() {
        let table = MutableRouteTable::empty();
        assert_eq!(text(&table, "/a").await.0, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn replace_affects_later_dispatches() {
        let table = MutableRouteTable::new(versioned("v1"));
        assert_eq!(text(&table, "/a").await.1, "v1");

        table.replace(versioned("v2").route("/c", get(|| async { "new" })));
        assert_eq!(text(&table, "/a").await.1, "v2");
        assert_eq!(text(&table, "/c").await.1, "new");
    }

    #[tokio::test]
    async fn in_flight_request_keeps_its_snapshot() {
        let slow = Router::new().route(
            "/slow",
            get(|| async {
                tokio::time::sleep(Duration::from_millis(50)).await;
                "old"
            }),
        );
        let table = Arc::new(MutableRouteTable::new(slow));

        let in_flight = {
            let table = Arc::clone(&table);
            tokio::spawn(async move { text(&table, "/slow").await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        table.replace(Router::new());

        assert_eq!(in_flight.await.unwrap(), (StatusCode::OK, "old".to_string()));
        assert_eq!(text(&table, "/slow").await.0, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn concurrent_readers_see_whole_tables() {
        let table = Arc::new(MutableRouteTable::new(versioned("v0")));
        let writer = {
            let table = Arc::clone(&table);
            tokio::spawn(async move {
                for i in 0..200 {
                    let version = if i % 2 == 0 { "even" } else { "odd" };
                    table.replace(versioned(version));
                    tokio::task::yield_now().await;
                }
            })
        };

        let mut readers = Vec::new();
        for _ in 0..8 {
            let table = Arc::clone(&table);
            readers.push(tokio::spawn(async move {
                for _ in 0..100 {
                    let snapshot = table.snapshot();
                    let a = Router::clone(&snapshot)
                        .oneshot(Request::builder().uri("/a").body(Body::empty()).unwrap())
                        .await
                        .unwrap();
                    let b = Router::clone(&snapshot)
                        .oneshot(Request::builder().uri("/b").body(Body::empty()).unwrap())
                        .await
                        .unwrap();
                    let a = a.into_body().collect().await.unwrap().to_bytes();
                    let b = b.into_body().collect().await.unwrap().to_bytes();
                    assert_eq!(a, b, "one snapshot served two tables");
                }
            }));
        }

        writer.await.unwrap();
        for reader in readers {
            reader.await.unwrap();
        }
    }

    #[tokio::test]
    async fn service_router_follows_replacements() {
        let table = Arc::new(MutableRouteTable::new(versioned("v1")));
        let outer = table.service();

        table.replace(versioned("v2"));
        let response = outer
            .oneshot(Request::builder().uri("/b").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"v2");
    }
}
