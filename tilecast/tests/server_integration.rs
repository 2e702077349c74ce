//! End-to-end scenarios over the HTTP surface.
//!
//! Each test boots a full stack on a loopback port: real router, real
//! engine, in-memory metastore, filesystem blob store, and a scripted fake
//! upstream whose call counters prove the coalescing invariants.

use std::sync::Arc;
use std::time::Duration;

use tilecast::app::{CoreConfig, CoreContext};
use tilecast::blob::FsBlobStore;
use tilecast::engine::TileEngine;
use tilecast::http::{basic_header, build_router, AppState};
use tilecast::jobs::{
    Campaign, CampaignPoint, CampaignStore, InMemoryCampaignStore, JobEngine, JobEngineConfig,
};
use tilecast::keyspace::{Layer, Period};
use tilecast::meta::{MemoryMetaStore, MetaStore};
use tilecast::upstream::{FakeUpstream, UpstreamClient, UpstreamError};
use tilecast::visparam::VisParamRegistry;

struct TestServer {
    base_url: String,
    client: reqwest::Client,
    upstream: Arc<FakeUpstream>,
    meta: Arc<MemoryMetaStore>,
    campaigns: Arc<InMemoryCampaignStore>,
    engine: Arc<TileEngine>,
    _dir: tempfile::TempDir,
}

async fn spawn_server() -> TestServer {
    spawn_server_with_config(CoreConfig::default()).await
}

async fn spawn_server_with_config(config: CoreConfig) -> TestServer {
    let dir = tempfile::tempdir().unwrap();
    let upstream = Arc::new(FakeUpstream::new());
    let meta = Arc::new(MemoryMetaStore::new());
    let ctx = CoreContext::assemble(
        config,
        Arc::new(VisParamRegistry::with_builtin_catalogue()),
        Arc::clone(&meta) as Arc<dyn MetaStore>,
        Arc::new(FsBlobStore::new(dir.path())),
        Arc::clone(&upstream) as Arc<dyn UpstreamClient>,
    );
    let engine = TileEngine::new(ctx);
    let campaigns = Arc::new(InMemoryCampaignStore::new());
    let jobs = JobEngine::new(
        Arc::clone(&engine),
        Arc::clone(&campaigns) as Arc<dyn CampaignStore>,
        JobEngineConfig {
            pool_size: 2,
            ..JobEngineConfig::default()
        },
    );
    jobs.start();

    let state = AppState::new(
        Arc::clone(&engine),
        jobs,
        Arc::clone(&campaigns) as Arc<dyn CampaignStore>,
    );
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    TestServer {
        base_url: format!("http://{addr}"),
        client: reqwest::Client::new(),
        upstream,
        meta,
        campaigns,
        engine,
        _dir: dir,
    }
}

fn tile_url(server: &TestServer) -> String {
    format!(
        "{}/api/layers/s2_harmonized/100/100/12?period=WET&year=2023&visparam=tvi-red",
        server.base_url
    )
}

fn admin_auth() -> String {
    basic_header("admin", "admin")
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(80)).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cold_miss_populates_cache() {
    let server = spawn_server().await;

    let response = server.client.get(tile_url(&server)).send().await.unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(
        response.headers().get("content-type").unwrap(),
        "image/png"
    );
    assert_eq!(response.headers().get("x-cache").unwrap(), "MISS");
    assert_eq!(
        response.headers().get("cache-control").unwrap(),
        "public, max-age=2592000, immutable"
    );
    assert!(response.headers().contains_key("etag"));
    let body = response.bytes().await.unwrap();
    assert!(!body.is_empty());

    assert_eq!(server.upstream.build_calls(), 1);
    assert_eq!(server.upstream.fetch_calls(), 1);

    settle().await;
    // The blob landed at the canonical path.
    assert!(server
        .engine
        .context()
        .blob
        .exists("tiles/s2_harmonized/WET/2023/tvi-red/12/100/100.png")
        .await
        .unwrap());
    // The mosaic handle is READY in the metastore.
    let raw = server
        .meta
        .get("mosaic:s2_harmonized|WET|2023|tvi-red")
        .await
        .unwrap()
        .expect("mosaic handle persisted");
    let handle: serde_json::Value = serde_json::from_slice(&raw).unwrap();
    assert_eq!(handle["state"], "READY");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_duplicates_coalesce() {
    let server = spawn_server().await;
    server.upstream.set_build_delay(Duration::from_millis(50));

    let mut tasks = Vec::new();
    for _ in 0..300 {
        let client = server.client.clone();
        let url = tile_url(&server);
        tasks.push(tokio::spawn(async move {
            let response = client.get(url).send().await.unwrap();
            assert_eq!(response.status(), 200);
            response.bytes().await.unwrap()
        }));
    }

    let mut bodies = Vec::new();
    for task in tasks {
        bodies.push(task.await.unwrap());
    }

    assert_eq!(server.upstream.build_calls(), 1);
    // One process, one in-flight fetch for the tile.
    assert_eq!(server.upstream.fetch_calls(), 1);
    assert!(bodies.windows(2).all(|pair| pair[0] == pair[1]));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn warm_hit_is_local() {
    let server = spawn_server().await;

    let first = server.client.get(tile_url(&server)).send().await.unwrap();
    assert_eq!(first.headers().get("x-cache").unwrap(), "MISS");
    let first_body = first.bytes().await.unwrap();

    let second = server.client.get(tile_url(&server)).send().await.unwrap();
    assert_eq!(second.headers().get("x-cache").unwrap(), "LOCAL");
    let second_body = second.bytes().await.unwrap();

    assert_eq!(first_body, second_body);
    assert_eq!(server.upstream.fetch_calls(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn etag_round_trip_yields_304() {
    let server = spawn_server().await;

    let first = server.client.get(tile_url(&server)).send().await.unwrap();
    let etag = first.headers().get("etag").unwrap().to_str().unwrap().to_string();

    let second = server
        .client
        .get(tile_url(&server))
        .header("if-none-match", &etag)
        .send()
        .await
        .unwrap();
    assert_eq!(second.status(), 304);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn boundary_validation_statuses() {
    let server = spawn_server().await;
    let cases = [
        // z = 5 and z = 19 are outside the served pyramid.
        (
            format!(
                "{}/api/layers/s2_harmonized/0/0/5?period=WET&year=2023&visparam=tvi-red",
                server.base_url
            ),
            400,
        ),
        (
            format!(
                "{}/api/layers/s2_harmonized/0/0/19?period=WET&year=2023&visparam=tvi-red",
                server.base_url
            ),
            400,
        ),
        // Sentinel-2 starts in 2017.
        (
            format!(
                "{}/api/layers/s2_harmonized/100/100/12?period=WET&year=2016&visparam=tvi-red",
                server.base_url
            ),
            404,
        ),
        // Landsat recipe on a Sentinel layer.
        (
            format!(
                "{}/api/layers/s2_harmonized/100/100/12?period=WET&year=2023&visparam=landsat-ndvi",
                server.base_url
            ),
            404,
        ),
        // MONTH without a month.
        (
            format!(
                "{}/api/layers/s2_harmonized/100/100/12?period=MONTH&year=2023&visparam=tvi-red",
                server.base_url
            ),
            400,
        ),
        // month = 13.
        (
            format!(
                "{}/api/layers/s2_harmonized/100/100/12?period=MONTH&year=2023&month=13&visparam=tvi-red",
                server.base_url
            ),
            400,
        ),
    ];

    for (url, expected) in cases {
        let response = server.client.get(&url).send().await.unwrap();
        assert_eq!(response.status().as_u16(), expected, "{url}");
    }
    // None of the rejects touched the upstream.
    assert_eq!(server.upstream.build_calls(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn invalidation_is_prefix_complete() {
    let server = spawn_server().await;

    // Populate five tiles under one landsat month.
    for x in 100..105 {
        let url = format!(
            "{}/api/layers/landsat/{x}/100/12?period=MONTH&year=2024&month=07&visparam=landsat-tvi-false",
            server.base_url
        );
        let response = server.client.get(&url).send().await.unwrap();
        assert_eq!(response.status(), 200);
    }
    settle().await;
    assert_eq!(server.upstream.build_calls(), 1);

    // Unauthenticated clears bounce.
    let response = server
        .client
        .delete(format!(
            "{}/api/cache/clear?layer=landsat&year=2024&confirm=true",
            server.base_url
        ))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 401);

    // Clears without confirmation bounce.
    let response = server
        .client
        .delete(format!(
            "{}/api/cache/clear?layer=landsat&year=2024",
            server.base_url
        ))
        .header("authorization", admin_auth())
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);

    let response = server
        .client
        .delete(format!(
            "{}/api/cache/clear?layer=landsat&year=2024&confirm=true",
            server.base_url
        ))
        .header("authorization", admin_auth())
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let report: serde_json::Value = response.json().await.unwrap();
    assert_eq!(report["blobs_removed"], 5);

    // A re-request misses everywhere and triggers a fresh mosaic build.
    let url = format!(
        "{}/api/layers/landsat/100/100/12?period=MONTH&year=2024&month=07&visparam=landsat-tvi-false",
        server.base_url
    );
    let response = server.client.get(&url).send().await.unwrap();
    assert_eq!(response.headers().get("x-cache").unwrap(), "MISS");
    assert_eq!(server.upstream.build_calls(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn sustained_quota_opens_the_breaker() {
    let server = spawn_server().await;
    server
        .upstream
        .fail_next_fetches(UpstreamError::Quota("upstream 429".into()), 5);

    // Five consecutive quota failures trip the breaker.
    for _ in 0..5 {
        let response = server.client.get(tile_url(&server)).send().await.unwrap();
        assert_eq!(response.status(), 429);
    }
    let fetches_at_trip = server.upstream.fetch_calls();
    assert_eq!(fetches_at_trip, 5);

    // While open, requests are answered without an upstream call.
    for _ in 0..5 {
        let response = server.client.get(tile_url(&server)).send().await.unwrap();
        assert_eq!(response.status(), 429);
        let retry_after: u64 = response
            .headers()
            .get("retry-after")
            .unwrap()
            .to_str()
            .unwrap()
            .parse()
            .unwrap();
        assert!(retry_after <= 60);
    }
    assert_eq!(server.upstream.fetch_calls(), fetches_at_trip);

    // After the cool-down a single probe goes through and recovery follows.
    tokio::time::sleep(Duration::from_millis(2100)).await;
    let response = server.client.get(tile_url(&server)).send().await.unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(server.upstream.fetch_calls(), fetches_at_trip + 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn campaign_warming_updates_progress() {
    let server = spawn_server().await;
    server.campaigns.insert_campaign(Campaign {
        id: "camp1".to_string(),
        points: (0..5)
            .map(|i| CampaignPoint {
                id: format!("p{i}"),
                lat: -15.0 - i as f64,
                lon: -47.0,
                cached: false,
            })
            .collect(),
        layers: vec![Layer::S2Harmonized],
        periods: vec![Period::Wet],
        years: vec![2023],
        zooms: vec![12],
        visparams: vec!["tvi-red".to_string()],
    });

    let response = server
        .client
        .post(format!("{}/api/cache/campaign/start", server.base_url))
        .header("authorization", admin_auth())
        .json(&serde_json::json!({ "campaign_id": "camp1", "batch_size": 2 }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let started: serde_json::Value = response.json().await.unwrap();
    let task_id = started["task_id"].as_str().unwrap().to_string();

    // Wait for completion via the status endpoints.
    let mut completed = false;
    for _ in 0..200 {
        let response = server
            .client
            .get(format!(
                "{}/api/cache/campaign/camp1/status",
                server.base_url
            ))
            .header("authorization", admin_auth())
            .send()
            .await
            .unwrap();
        let status: serde_json::Value = response.json().await.unwrap();
        if status["progress"]["caching_completed_at"].is_string() {
            assert_eq!(status["progress"]["cached_points"], 5);
            assert_eq!(status["progress"]["cache_percentage"], 100.0);
            assert_eq!(status["progress"]["caching_in_progress"], false);
            completed = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(completed, "campaign never completed");

    let response = server
        .client
        .get(format!("{}/api/tasks/{task_id}", server.base_url))
        .header("authorization", admin_auth())
        .send()
        .await
        .unwrap();
    let record: serde_json::Value = response.json().await.unwrap();
    assert_eq!(record["state"], "SUCCESS");
    assert_eq!(record["counters"]["done"], 5);

    // A second run finds every point cached: zero upstream builds.
    let builds_after_first = server.upstream.build_calls();
    let response = server
        .client
        .post(format!("{}/api/cache/campaign/start", server.base_url))
        .header("authorization", admin_auth())
        .json(&serde_json::json!({ "campaign_id": "camp1", "batch_size": 2 }))
        .send()
        .await
        .unwrap();
    let started: serde_json::Value = response.json().await.unwrap();
    let task_id = started["task_id"].as_str().unwrap().to_string();

    let mut rerun_done = false;
    for _ in 0..100 {
        let response = server
            .client
            .get(format!("{}/api/tasks/{task_id}", server.base_url))
            .header("authorization", admin_auth())
            .send()
            .await
            .unwrap();
        let record: serde_json::Value = response.json().await.unwrap();
        if record["state"] == "SUCCESS" {
            rerun_done = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(rerun_done);
    assert_eq!(server.upstream.build_calls(), builds_after_first);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn capabilities_and_stats() {
    let server = spawn_server().await;

    let response = server
        .client
        .get(format!("{}/api/capabilities", server.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let caps: serde_json::Value = response.json().await.unwrap();
    let collections = caps["collections"].as_array().unwrap();
    assert_eq!(collections.len(), 2);

    // Stats require auth.
    let response = server
        .client
        .get(format!("{}/api/cache/stats", server.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 401);

    server.client.get(tile_url(&server)).send().await.unwrap();
    let response = server
        .client
        .get(format!("{}/api/cache/stats", server.base_url))
        .header("authorization", admin_auth())
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let stats: serde_json::Value = response.json().await.unwrap();
    assert_eq!(stats["metrics"]["mosaic_builds"], 1);
    assert_eq!(stats["upstream"]["breaker"], "closed");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn health_endpoint() {
    let server = spawn_server().await;
    let response = server
        .client
        .get(format!("{}/healthz", server.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
}
