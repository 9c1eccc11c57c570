//! End-to-end gateway behavior against a mock upstream: paging with
//! archival, key rotation on rate limits, and quota exhaustion.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use tourbatch::error::BatchError;
use tourbatch::gateway::archive::RawArchiveWriter;
use tourbatch::gateway::executor::{CallSpec, ExecutorConfig, HttpExecutor};
use tourbatch::gateway::governor::{ConcurrencyGovernor, GovernorConfig};
use tourbatch::keys::quota_store::MemoryQuotaStore;
use tourbatch::keys::{KeyRegistry, KeyState};
use tourbatch::pipeline::transform::ContentType;
use tourbatch::providers::{Paginator, Provider};
use tourbatch::repository::migrations;
use tourbatch::repository::pool::{create_pool, SqlitePool};
use tourbatch::repository::raw::RawDataRepository;

struct Harness {
    executor: Arc<HttpExecutor>,
    registry: Arc<KeyRegistry>,
    raw: RawDataRepository,
    _pool: SqlitePool,
    _dir: tempfile::TempDir,
}

async fn setup(server: &MockServer, kto_keys: &[&str], quota: u32) -> Harness {
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let pool = create_pool(&dir.path().join("test.db")).expect("Failed to create pool");
    migrations::run_migrations(pool.clone())
        .await
        .expect("Failed to run migrations");

    let secrets: Vec<String> = kto_keys.iter().map(|s| s.to_string()).collect();
    let registry = Arc::new(KeyRegistry::new(
        chrono_tz::Asia::Seoul,
        &secrets,
        quota,
        &[],
        quota,
        Arc::new(MemoryQuotaStore::new()),
    ));
    let governor = Arc::new(ConcurrencyGovernor::new(GovernorConfig {
        min_interval: Duration::from_millis(1),
        ..GovernorConfig::default()
    }));
    let raw = RawDataRepository::new(pool.clone());
    let archive = Arc::new(RawArchiveWriter::new(raw.clone()));
    let executor = Arc::new(
        HttpExecutor::new(
            registry.clone(),
            governor,
            archive,
            ExecutorConfig {
                kto_base_url: server.uri(),
                kma_base_url: server.uri(),
                request_timeout: Duration::from_secs(5),
                app_name: "tourbatch".to_string(),
            },
        )
        .expect("executor"),
    );

    Harness {
        executor,
        registry,
        raw,
        _pool: pool,
        _dir: dir,
    }
}

fn page_body(total: u64, items: Vec<Value>) -> Value {
    json!({
        "response": {
            "header": {"resultCode": "0000", "resultMsg": "OK"},
            "body": {
                "totalCount": total,
                "numOfRows": items.len(),
                "items": {"item": items}
            }
        }
    })
}

fn attraction_item(id: u32) -> Value {
    json!({
        "contentid": id.to_string(),
        "title": format!("Spot {id}"),
        "addr1": "Somewhere",
        "areacode": "1",
        "mapx": "127.001",
        "mapy": "37.501",
        "modifiedtime": "20260801120000"
    })
}

#[tokio::test]
async fn paged_harvest_archives_every_page_and_balances_keys() {
    let server = MockServer::start().await;
    for page_no in 1..=3u32 {
        let items: Vec<Value> = (0..2).map(|i| attraction_item(page_no * 10 + i)).collect();
        Mock::given(method("GET"))
            .and(path("/areaBasedList2"))
            .and(query_param("pageNo", page_no.to_string()))
            .respond_with(ResponseTemplate::new(200).set_body_json(page_body(6, items)))
            .mount(&server)
            .await;
    }

    let harness = setup(&server, &["key-a", "key-b"], 1000).await;
    let mut pager = Paginator::new(
        harness.executor.clone(),
        Provider::Kto,
        "areaBasedList2",
        vec![
            ("contentTypeId".to_string(), ContentType::Attraction.code().to_string()),
            ("areaCode".to_string(), "1".to_string()),
        ],
        2,
    );

    let mut collected = 0;
    let mut pages = 0;
    while let Some(page) = pager.next_page().await.expect("page fetch") {
        pages += 1;
        collected += page.items.len();
        assert!(page.raw_id.is_some(), "every page is archived before the next");
        assert_eq!(page.total_count, 6);
    }
    assert_eq!(pages, 3);
    assert_eq!(collected, 6);
    assert_eq!(harness.raw.count().await.expect("raw count"), 3);

    // Round-robin spreads the three calls across both keys.
    let snap = harness.registry.snapshot();
    let usages: Vec<u32> = snap.kto.iter().map(|k| k.usage).collect();
    assert_eq!(usages.iter().sum::<u32>(), 3);
    assert!(usages.iter().max().unwrap() - usages.iter().min().unwrap() <= 1);
}

#[tokio::test]
async fn rate_limited_key_rotates_without_failing_the_call() {
    let server = MockServer::start().await;
    // First hit answers with the gateway's quota-exceeded document; the
    // mock expires after one use and the generic success takes over.
    Mock::given(method("GET"))
        .and(path("/areaCode2"))
        .respond_with(ResponseTemplate::new(200).set_body_string(
            "<OpenAPI_ServiceResponse><cmmMsgHeader><returnAuthMsg>\
             LIMITED_NUMBER_OF_SERVICE_REQUESTS_EXCEEDS_ERROR\
             </returnAuthMsg></cmmMsgHeader></OpenAPI_ServiceResponse>",
        ))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/areaCode2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(page_body(1, vec![json!({"code": "1"})])))
        .mount(&server)
        .await;

    let harness = setup(&server, &["key-a", "key-b", "key-c"], 1000).await;
    let response = harness
        .executor
        .call(CallSpec {
            provider: Provider::Kto,
            endpoint: "areaCode2",
            params: vec![("numOfRows".to_string(), "1".to_string())],
            store_raw: true,
        })
        .await
        .expect("rotation absorbs the rate limit");
    assert_eq!(response.status, 200);

    let snap = harness.registry.snapshot();
    let cooling: Vec<_> = snap
        .kto
        .iter()
        .filter(|k| k.state == KeyState::Cooling)
        .collect();
    assert_eq!(cooling.len(), 1, "the limited key went into cooldown");
    assert_eq!(snap.kto.iter().map(|k| k.usage).sum::<u32>(), 1);
}

#[tokio::test]
async fn quota_exhaustion_surfaces_after_the_last_unit() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/areaCode2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(page_body(1, vec![json!({"code": "1"})])))
        .mount(&server)
        .await;

    let harness = setup(&server, &["only-key"], 5).await;
    for call_no in 0..5 {
        harness
            .executor
            .call(CallSpec {
                provider: Provider::Kto,
                endpoint: "areaCode2",
                params: vec![],
                store_raw: false,
            })
            .await
            .unwrap_or_else(|e| panic!("call {call_no} should succeed: {e}"));
    }

    let result = harness
        .executor
        .call(CallSpec {
            provider: Provider::Kto,
            endpoint: "areaCode2",
            params: vec![],
            store_raw: false,
        })
        .await;
    assert!(matches!(
        result,
        Err(BatchError::QuotaExhausted {
            provider: Provider::Kto
        })
    ));

    let snap = harness.registry.snapshot();
    assert_eq!(snap.kto[0].usage, 5);
    assert_eq!(snap.kto[0].state, KeyState::Exhausted);
}

#[tokio::test]
async fn auth_rejection_disables_the_key() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/areaCode2"))
        .respond_with(ResponseTemplate::new(200).set_body_string(
            "<OpenAPI_ServiceResponse>SERVICE_KEY_IS_NOT_REGISTERED_ERROR</OpenAPI_ServiceResponse>",
        ))
        .mount(&server)
        .await;

    let harness = setup(&server, &["bad-key"], 1000).await;
    let result = harness
        .executor
        .call(CallSpec {
            provider: Provider::Kto,
            endpoint: "areaCode2",
            params: vec![],
            store_raw: false,
        })
        .await;
    // The only key is rejected and disabled; the rotation then finds the
    // lane empty.
    assert!(matches!(
        result,
        Err(BatchError::QuotaExhausted { .. }) | Err(BatchError::Auth { .. })
    ));

    let snap = harness.registry.snapshot();
    assert_eq!(snap.kto[0].state, KeyState::Disabled);
}

#[tokio::test]
async fn detail_common_returns_the_single_enrichment_record() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/detailCommon2"))
        .and(query_param("contentId", "126508"))
        .respond_with(ResponseTemplate::new(200).set_body_json(page_body(
            1,
            vec![json!({"contentid": "126508", "overview": "A palace."})],
        )))
        .mount(&server)
        .await;

    let harness = setup(&server, &["key-a"], 1000).await;
    let api = tourbatch::providers::kto::KtoApi::new(harness.executor.clone(), 100);
    let detail = api
        .detail_common("126508")
        .await
        .expect("detail call")
        .expect("item present");
    assert_eq!(detail["overview"], "A palace.");
    // Detail lookups are archived like any other call.
    assert_eq!(harness.raw.count().await.expect("raw count"), 1);
}

#[tokio::test]
async fn archived_row_redacts_the_service_key() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/areaCode2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(page_body(1, vec![json!({"code": "1"})])))
        .mount(&server)
        .await;

    let harness = setup(&server, &["super-secret-credential"], 1000).await;
    let response = harness
        .executor
        .call(CallSpec {
            provider: Provider::Kto,
            endpoint: "areaCode2",
            params: vec![("numOfRows".to_string(), "1".to_string())],
            store_raw: true,
        })
        .await
        .expect("call");

    let raw_id = response.raw_id.expect("archived");
    let record = harness
        .raw
        .get(&raw_id)
        .await
        .expect("lookup")
        .expect("row present");
    assert!(!record.request_params.contains("super-secret-credential"));
    assert!(!record.api_key_hash.contains("super-secret-credential"));
    assert_eq!(record.provider, "KTO");
    assert!(record.response_size > 0);
}
