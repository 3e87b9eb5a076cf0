//! End-to-end flows through a served agent: real listener, real backends and a
//! mock executor, all on loopback.
use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use axum::{
    Json, Router,
    extract::State,
    http::{HeaderMap, StatusCode, Uri},
    routing::post,
};
use fnagent::{
    adapters::{ExecutorClient, HttpClientAdapter, InMemoryResultStore},
    config::{
        AgentConfig, FunctionConfig, FunctionReference, RoundTripConfig, TriggerConfig,
        InvocationConfig,
    },
    core::{ExecutionStrategy, InvocationContext, MutableRouteTable, TriggerSet},
    metrics::RecorderFunctionMetrics,
    ports::result_store::ResultStore,
};
use serde_json::Value;
use tokio::net::TcpListener;

const CORRELATION_HEADER: &str = "x-fnagent-correlation-id";

async fn serve(listener: TcpListener, app: Router) -> SocketAddr {
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

/// Describes what the backend received.
async fn spawn_echo_backend() -> SocketAddr {
    let app = Router::new().fallback(|uri: Uri, headers: HeaderMap| async move {
        let header = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("-")
                .to_string()
        };
        format!(
            "path={} query={} host={} xfh={}",
            uri.path(),
            uri.query().unwrap_or("-"),
            header("host"),
            header("x-forwarded-host"),
        )
    });
    serve(TcpListener::bind("127.0.0.1:0").await.unwrap(), app).await
}

#[derive(Clone)]
struct JobBackend {
    callback_url: String,
    kickoffs: Arc<AtomicUsize>,
}

/// Accepts the kick-off and reports a result through the agent's callback.
async fn spawn_job_backend(callback_url: String, kickoffs: Arc<AtomicUsize>) -> SocketAddr {
    let state = JobBackend {
        callback_url,
        kickoffs,
    };
    let app = Router::new()
        .fallback(|State(job): State<JobBackend>, headers: HeaderMap| async move {
            job.kickoffs.fetch_add(1, Ordering::SeqCst);
            let correlation = headers.get(CORRELATION_HEADER).cloned();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                let mut callback = reqwest::Client::new()
                    .post(&job.callback_url)
                    .body("result-42");
                if let Some(id) = correlation.and_then(|v| v.to_str().ok().map(str::to_string)) {
                    callback = callback.header(CORRELATION_HEADER, id);
                }
                let response = callback.send().await.unwrap();
                assert_eq!(response.status(), StatusCode::OK);
            });
            "started"
        })
        .with_state(state);
    serve(TcpListener::bind("127.0.0.1:0").await.unwrap(), app).await
}

#[derive(Clone, Default)]
struct Executor {
    addresses: Arc<HashMap<String, String>>,
    lookups: Arc<AtomicUsize>,
}

async fn spawn_executor(executor: Executor) -> SocketAddr {
    let app = Router::new()
        .route(
            "/v2/getServiceForFunction",
            post(|State(executor): State<Executor>, Json(body): Json<Value>| async move {
                executor.lookups.fetch_add(1, Ordering::SeqCst);
                let name = body["name"].as_str().unwrap_or_default();
                match executor.addresses.get(name) {
                    Some(address) => (StatusCode::OK, address.clone()),
                    None => (StatusCode::NOT_FOUND, format!("unknown function {name}")),
                }
            }),
        )
        .route("/v2/tapServices", post(|| async { StatusCode::OK }))
        .route("/v2/unTapService", post(|| async { StatusCode::OK }))
        .with_state(executor);
    serve(TcpListener::bind("127.0.0.1:0").await.unwrap(), app).await
}

fn function(name: &str, strategy: ExecutionStrategy) -> FunctionConfig {
    FunctionConfig {
        name: name.to_string(),
        namespace: "default".to_string(),
        resource_version: "1".to_string(),
        uid: format!("uid-{name}"),
        strategy,
        timeout: None,
    }
}

fn trigger(name: &str, prefix: Option<&str>, url: Option<&str>) -> TriggerConfig {
    TriggerConfig {
        name: name.to_string(),
        namespace: "default".to_string(),
        relative_url: url.map(str::to_string),
        prefix: prefix.map(str::to_string),
        keep_prefix: false,
        methods: vec![],
        function: FunctionReference::Name {
            name: name.to_string(),
        },
    }
}

struct Agent {
    addr: SocketAddr,
    triggers: Arc<TriggerSet>,
    config: AgentConfig,
    lookups: Arc<AtomicUsize>,
    job_kickoffs: Arc<AtomicUsize>,
    batch_kickoffs: Arc<AtomicUsize>,
    results: Arc<InMemoryResultStore>,
    http: reqwest::Client,
}

impl Agent {
    fn url(&self, path: &str) -> String {
        format!("http://{}{path}", self.addr)
    }
}

async fn start_agent() -> Agent {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let agent_addr = listener.local_addr().unwrap();

    let echo = spawn_echo_backend().await;
    let job_kickoffs = Arc::new(AtomicUsize::new(0));
    let job = spawn_job_backend(
        format!("http://{agent_addr}/job/functionOutput"),
        job_kickoffs.clone(),
    )
    .await;
    let batch_kickoffs = Arc::new(AtomicUsize::new(0));
    let batch = spawn_job_backend(
        format!("http://{agent_addr}/batch/functionOutput"),
        batch_kickoffs.clone(),
    )
    .await;
    let dead = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    };

    let executor = Executor {
        addresses: Arc::new(HashMap::from([
            ("hello".to_string(), echo.to_string()),
            ("job".to_string(), format!("http://{job}")),
            ("batch".to_string(), batch.to_string()),
            ("dead".to_string(), dead.to_string()),
        ])),
        lookups: Arc::new(AtomicUsize::new(0)),
    };
    let lookups = executor.lookups.clone();
    let executor_addr = spawn_executor(executor).await;

    let config = AgentConfig::builder()
        .listen_addr(agent_addr.to_string())
        .executor_url(format!("http://{executor_addr}"))
        .debug(true)
        .round_trip(RoundTripConfig {
            timeout: Duration::from_millis(10),
            max_retries: 3,
            ..RoundTripConfig::default()
        })
        .invocation(InvocationConfig {
            sync_wait: Duration::from_secs(5),
            ..InvocationConfig::default()
        })
        .function(function("hello", ExecutionStrategy::NewDeploy))
        .function(function("job", ExecutionStrategy::WasmShort))
        .function(function("batch", ExecutionStrategy::WasmLong))
        .function(function("dead", ExecutionStrategy::NewDeploy))
        .trigger(trigger("hello", Some("/hello"), None))
        .trigger(trigger("job", None, Some("/job")))
        .trigger(trigger("batch", None, Some("/batch")))
        .trigger(trigger("dead", None, Some("/dead")))
        .build();

    let results = Arc::new(InMemoryResultStore::new());
    let ctx = Arc::new(InvocationContext::new(
        &config,
        Arc::new(ExecutorClient::new(&config.executor_url, Duration::from_secs(2)).unwrap()),
        Arc::new(HttpClientAdapter::new(&config.round_trip)),
        results.clone(),
        Arc::new(RecorderFunctionMetrics),
    ));
    let table = Arc::new(MutableRouteTable::empty());
    let triggers = Arc::new(TriggerSet::new(ctx, table.clone()));
    triggers.apply(&config.functions, &config.triggers).unwrap();

    serve(listener, table.service()).await;

    Agent {
        addr: agent_addr,
        triggers,
        config,
        lookups,
        job_kickoffs,
        batch_kickoffs,
        results,
        http: reqwest::Client::new(),
    }
}

#[tokio::test]
async fn proxy_rewrites_path_and_reuses_cached_address() {
    let agent = start_agent().await;

    let response = agent
        .http
        .get(agent.url("/hello/greet?name=fn"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = response.text().await.unwrap();
    assert!(body.starts_with("path=/greet query=name=fn host=127.0.0.1:"), "{body}");
    assert!(body.ends_with(&format!("xfh={}", agent.addr)), "{body}");

    let response = agent.http.get(agent.url("/hello")).send().await.unwrap();
    assert!(response.text().await.unwrap().starts_with("path=/ "));

    let response = agent.http.get(agent.url("/fn/hello/direct")).send().await.unwrap();
    assert!(response.text().await.unwrap().starts_with("path=/direct "));

    assert_eq!(agent.lookups.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn synchronous_invocation_waits_for_callback_then_serves_stored_result() {
    let agent = start_agent().await;

    let response = agent.http.get(agent.url("/job")).send().await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().contains_key(CORRELATION_HEADER));
    assert_eq!(response.text().await.unwrap(), "result-42");
    assert_eq!(agent.job_kickoffs.load(Ordering::SeqCst), 1);

    let response = agent.http.get(agent.url("/job")).send().await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.text().await.unwrap(), "result-42");
    assert_eq!(agent.job_kickoffs.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn asynchronous_invocation_acknowledges_and_persists_later() {
    let agent = start_agent().await;

    let response = agent.http.post(agent.url("/batch")).body("input").send().await.unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let ack: Value = response.json().await.unwrap();
    assert_eq!(ack["status"], "accepted");
    assert_eq!(ack["function"], "batch");
    assert!(ack["correlation_id"].is_string());

    let mut stored = None;
    for _ in 0..100 {
        if let Ok(value) = agent.results.get("uid-batch").await {
            stored = Some(value);
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(stored.as_deref(), Some(&b"result-42"[..]));
    assert_eq!(agent.batch_kickoffs.load(Ordering::SeqCst), 1);

    let response = agent.http.get(agent.url("/batch")).send().await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.text().await.unwrap(), "result-42");
    assert_eq!(agent.batch_kickoffs.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn unreachable_backend_exhausts_retries() {
    let agent = start_agent().await;

    let response = agent.http.get(agent.url("/dead")).send().await.unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn health_endpoint_reports_state() {
    let agent = start_agent().await;

    let health: Value = agent
        .http
        .get(agent.url("/agent-healthz"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["status"], "ok");
    assert_eq!(health["functions"], 4);
    assert_eq!(health["triggers"], 4);
}

#[tokio::test]
async fn trigger_set_swap_is_visible_to_new_requests() {
    let agent = start_agent().await;
    assert_eq!(
        agent.http.get(agent.url("/hello")).send().await.unwrap().status(),
        StatusCode::OK
    );

    let mut renamed = trigger("hello", Some("/greetings"), None);
    renamed.keep_prefix = true;
    agent
        .triggers
        .apply(&agent.config.functions, &[renamed])
        .unwrap();

    assert_eq!(
        agent.http.get(agent.url("/hello")).send().await.unwrap().status(),
        StatusCode::NOT_FOUND
    );
    let body = agent
        .http
        .get(agent.url("/greetings/x"))
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert!(body.starts_with("path=/greetings/x "), "{body}");

    // A rejected set leaves the installed table alone.
    assert!(
        agent
            .triggers
            .apply(&agent.config.functions, &[trigger("missing", Some("/m"), None)])
            .is_err()
    );
    assert_eq!(
        agent.http.get(agent.url("/greetings")).send().await.unwrap().status(),
        StatusCode::OK
    );
}
