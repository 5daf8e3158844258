//! Gating pipeline and middleware integration tests

use async_trait::async_trait;
use axum::{
    body::Body,
    extract::connect_info::ConnectInfo,
    http::{Request, StatusCode},
    middleware,
    routing::get,
    Router,
};
use country_gate::auth::AuthService;
use country_gate::config::{AuthConfig, AuthMode, GeolocationConfig, ProxyConfig};
use country_gate::gate::{
    gate_request, AllowReason, CountryApiResolver, GateDecision, GatePipeline, GateState,
    GeoResolver, RequestScope, Visitor, BLOCK_MESSAGE,
};
use country_gate::gate::BlockPolicyConfig;
use country_gate::models::{CountryCode, CountryStat};
use country_gate::site::create_site_router;
use country_gate::storage::{SqliteStorage, Storage};
use std::collections::{BTreeSet, HashMap};
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tower::{Layer, ServiceExt};

/// Resolver answering from a fixed table, counting every lookup
#[derive(Default)]
struct FakeResolver {
    answers: HashMap<IpAddr, CountryCode>,
    calls: AtomicUsize,
}

impl FakeResolver {
    fn with(entries: &[(&str, &str)]) -> Self {
        Self {
            answers: entries
                .iter()
                .map(|(ip, country)| (ip.parse().unwrap(), code(country)))
                .collect(),
            calls: AtomicUsize::new(0),
        }
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl GeoResolver for FakeResolver {
    async fn resolve(&self, ip: IpAddr, _request_uri: &str) -> Option<CountryCode> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.answers.get(&ip).cloned()
    }
}

/// Inserts a fixed peer address, standing in for `into_make_service_with_connect_info`
#[derive(Clone)]
struct TestConnectInfoLayer(SocketAddr);

impl<S> Layer<S> for TestConnectInfoLayer {
    type Service = TestConnectInfoMiddleware<S>;

    fn layer(&self, inner: S) -> Self::Service {
        TestConnectInfoMiddleware {
            inner,
            addr: self.0,
        }
    }
}

#[derive(Clone)]
struct TestConnectInfoMiddleware<S> {
    inner: S,
    addr: SocketAddr,
}

impl<S, B> tower::Service<Request<B>> for TestConnectInfoMiddleware<S>
where
    S: tower::Service<Request<B>> + Clone,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = S::Future;

    fn poll_ready(
        &mut self,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut req: Request<B>) -> Self::Future {
        req.extensions_mut().insert(ConnectInfo(self.addr));
        self.inner.call(req)
    }
}

fn code(raw: &str) -> CountryCode {
    CountryCode::parse(raw).unwrap()
}

fn peer(ip: &str) -> SocketAddr {
    SocketAddr::new(ip.parse().unwrap(), 40000)
}

fn visitor(ip: &str, privileged: bool) -> Visitor {
    Visitor {
        ip: ip.to_string(),
        privileged,
        request_uri: "/".to_string(),
    }
}

async fn create_test_storage() -> Arc<dyn Storage> {
    let storage = SqliteStorage::new("sqlite::memory:", 1).await.unwrap();
    storage.init().await.unwrap();
    Arc::new(storage)
}

async fn block(storage: &Arc<dyn Storage>, countries: &[&str]) {
    let set: BTreeSet<CountryCode> = countries.iter().map(|c| code(c)).collect();
    storage.save_blocked_countries(&set).await.unwrap();
}

fn api_key_auth() -> Arc<AuthService> {
    Arc::new(AuthService::new(&AuthConfig {
        mode: AuthMode::ApiKey,
        api_keys: vec!["admin-key".to_string()],
    }))
}

fn gate_state(
    storage: &Arc<dyn Storage>,
    resolver: Arc<dyn GeoResolver>,
    auth: Arc<AuthService>,
) -> Arc<GateState> {
    Arc::new(GateState {
        pipeline: Arc::new(GatePipeline::new(Arc::clone(storage), resolver)),
        auth,
        proxy: ProxyConfig::default(),
    })
}

/// File-backed SQLite plus a raw pool on the same file for seeding rows
async fn create_file_storage(name: &str) -> (Arc<dyn Storage>, sqlx::SqlitePool, String) {
    let path = std::env::temp_dir().join(format!(
        "country_gate_gate_{}_{}_{}.db",
        name,
        std::process::id(),
        chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default()
    ));
    let path = path.display().to_string();
    let storage = SqliteStorage::new(&format!("sqlite://{path}?mode=rwc"), 5)
        .await
        .unwrap();
    storage.init().await.unwrap();
    let raw = sqlx::SqlitePool::connect(&format!("sqlite://{path}"))
        .await
        .unwrap();
    (Arc::new(storage), raw, path)
}

fn remove_sqlite_files(path: &str) {
    for suffix in ["", "-wal", "-shm", "-journal"] {
        let _ = std::fs::remove_file(format!("{path}{suffix}"));
    }
}

/// Storage whose writes always fail. Policy reads fail when `policy` is None.
struct FailingStorage {
    policy: Option<BlockPolicyConfig>,
}

#[async_trait]
impl Storage for FailingStorage {
    async fn init(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn record_visit(&self, _country: &CountryCode, _at: i64) -> anyhow::Result<()> {
        anyhow::bail!("database is locked")
    }

    async fn record_blocked(&self, _country: &CountryCode) -> anyhow::Result<bool> {
        anyhow::bail!("database is locked")
    }

    async fn list_stats(&self) -> anyhow::Result<Vec<CountryStat>> {
        Ok(Vec::new())
    }

    async fn get_stat(&self, _country: &CountryCode) -> anyhow::Result<Option<CountryStat>> {
        Ok(None)
    }

    async fn preload(&self, _codes: &[&str]) -> anyhow::Result<u64> {
        anyhow::bail!("database is locked")
    }

    async fn load_policy(&self) -> anyhow::Result<BlockPolicyConfig> {
        self.policy
            .clone()
            .ok_or_else(|| anyhow::anyhow!("no such table: gate_settings"))
    }

    async fn save_blocked_countries(
        &self,
        _countries: &BTreeSet<CountryCode>,
    ) -> anyhow::Result<()> {
        anyhow::bail!("database is locked")
    }

    async fn claim_admin_country(&self, _country: &CountryCode) -> anyhow::Result<bool> {
        anyhow::bail!("database is locked")
    }

    async fn clear_admin_country(&self) -> anyhow::Result<bool> {
        anyhow::bail!("database is locked")
    }
}

/// SQLite storage where another request always claims the admin country
/// between the policy read and our claim
struct RivalClaimStorage {
    inner: Arc<dyn Storage>,
    rival: CountryCode,
}

#[async_trait]
impl Storage for RivalClaimStorage {
    async fn init(&self) -> anyhow::Result<()> {
        self.inner.init().await
    }

    async fn record_visit(&self, country: &CountryCode, at: i64) -> anyhow::Result<()> {
        self.inner.record_visit(country, at).await
    }

    async fn record_blocked(&self, country: &CountryCode) -> anyhow::Result<bool> {
        self.inner.record_blocked(country).await
    }

    async fn list_stats(&self) -> anyhow::Result<Vec<CountryStat>> {
        self.inner.list_stats().await
    }

    async fn get_stat(&self, country: &CountryCode) -> anyhow::Result<Option<CountryStat>> {
        self.inner.get_stat(country).await
    }

    async fn preload(&self, codes: &[&str]) -> anyhow::Result<u64> {
        self.inner.preload(codes).await
    }

    async fn load_policy(&self) -> anyhow::Result<BlockPolicyConfig> {
        self.inner.load_policy().await
    }

    async fn save_blocked_countries(&self, countries: &BTreeSet<CountryCode>) -> anyhow::Result<()> {
        self.inner.save_blocked_countries(countries).await
    }

    async fn claim_admin_country(&self, country: &CountryCode) -> anyhow::Result<bool> {
        self.inner.claim_admin_country(&self.rival).await?;
        self.inner.claim_admin_country(country).await
    }

    async fn clear_admin_country(&self) -> anyhow::Result<bool> {
        self.inner.clear_admin_country().await
    }
}

async fn body_string(response: axum::response::Response) -> String {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

#[tokio::test]
async fn test_blocked_country_is_denied() {
    let storage = create_test_storage().await;
    block(&storage, &["IR"]).await;
    storage.claim_admin_country(&code("US")).await.unwrap();
    let resolver = Arc::new(FakeResolver::with(&[("5.160.0.1", "IR")]));
    let pipeline = GatePipeline::new(Arc::clone(&storage), resolver);

    let decision = pipeline
        .evaluate(&mut RequestScope::new(), &visitor("5.160.0.1", false))
        .await;
    assert_eq!(decision, GateDecision::Deny(code("IR")));

    let stat = storage.get_stat(&code("IR")).await.unwrap().unwrap();
    assert_eq!(stat.total_visits, 1);
    assert_eq!(stat.blocked_visits, 1);
    assert_eq!(
        storage.load_policy().await.unwrap().admin_country,
        Some(code("US"))
    );
}

#[tokio::test]
async fn test_privileged_visitor_claims_admin_country() {
    let storage = create_test_storage().await;
    block(&storage, &["CA"]).await;
    let resolver = Arc::new(FakeResolver::with(&[("24.48.0.1", "CA")]));
    let pipeline = GatePipeline::new(Arc::clone(&storage), resolver);

    let before = chrono::Utc::now().timestamp();
    let decision = pipeline
        .evaluate(&mut RequestScope::new(), &visitor("24.48.0.1", true))
        .await;
    let after = chrono::Utc::now().timestamp();
    assert_eq!(decision, GateDecision::Allow(AllowReason::AdminCountryClaimed));

    let policy = storage.load_policy().await.unwrap();
    assert_eq!(policy.admin_country, Some(code("CA")));

    let stat = storage.get_stat(&code("CA")).await.unwrap().unwrap();
    assert_eq!(stat.total_visits, 1);
    assert_eq!(stat.blocked_visits, 0);
    let first_visit = stat.first_visit.unwrap();
    assert!(first_visit >= before && first_visit <= after);

    // The admin country is exempt from the block list from now on
    let decision = pipeline
        .evaluate(&mut RequestScope::new(), &visitor("24.48.0.1", false))
        .await;
    assert_eq!(decision, GateDecision::Allow(AllowReason::NotBlocked));
}

#[tokio::test]
async fn test_admin_country_is_not_overwritten() {
    let storage = create_test_storage().await;
    storage.claim_admin_country(&code("US")).await.unwrap();
    let resolver = Arc::new(FakeResolver::with(&[("81.2.69.142", "GB")]));
    let pipeline = GatePipeline::new(Arc::clone(&storage), resolver);

    let decision = pipeline
        .evaluate(&mut RequestScope::new(), &visitor("81.2.69.142", true))
        .await;
    assert_eq!(decision, GateDecision::Allow(AllowReason::NotBlocked));
    assert_eq!(
        storage.load_policy().await.unwrap().admin_country,
        Some(code("US"))
    );
}

#[tokio::test]
async fn test_admin_country_exempt_from_block_list() {
    let storage = create_test_storage().await;
    block(&storage, &["FR", "DE"]).await;
    storage.claim_admin_country(&code("FR")).await.unwrap();
    let resolver = Arc::new(FakeResolver::with(&[
        ("90.0.0.1", "FR"),
        ("81.2.69.142", "DE"),
    ]));
    let pipeline = GatePipeline::new(Arc::clone(&storage), resolver);

    let fr = pipeline
        .evaluate(&mut RequestScope::new(), &visitor("90.0.0.1", false))
        .await;
    assert!(fr.is_allowed());

    let de = pipeline
        .evaluate(&mut RequestScope::new(), &visitor("81.2.69.142", false))
        .await;
    assert_eq!(de, GateDecision::Deny(code("DE")));
}

#[tokio::test]
async fn test_geolocation_failure_allows_without_recording() {
    let storage = create_test_storage().await;
    block(&storage, &["DE"]).await;

    // Provider that never answers within the timeout
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let slow = Router::new().route(
        "/{ip}",
        get(|| async {
            tokio::time::sleep(std::time::Duration::from_secs(2)).await;
            "{\"country\":\"DE\"}"
        }),
    );
    tokio::spawn(async move {
        axum::serve(listener, slow).await.unwrap();
    });
    let resolver = Arc::new(
        CountryApiResolver::new(&GeolocationConfig {
            api_url: format!("http://{}", addr),
            timeout_ms: 100,
            ..GeolocationConfig::default()
        })
        .unwrap(),
    );
    let pipeline = GatePipeline::new(Arc::clone(&storage), resolver);

    let decision = pipeline
        .evaluate(&mut RequestScope::new(), &visitor("81.2.69.142", true))
        .await;
    assert_eq!(
        decision,
        GateDecision::Allow(AllowReason::GeolocationUnavailable)
    );
    assert!(storage.list_stats().await.unwrap().is_empty());
    assert!(storage.load_policy().await.unwrap().admin_country.is_none());
}

#[tokio::test]
async fn test_internal_address_skips_everything() {
    let storage = create_test_storage().await;
    let resolver = Arc::new(FakeResolver::default());
    let pipeline = GatePipeline::new(Arc::clone(&storage), resolver.clone());

    for ip in ["127.0.0.1", "10.1.2.3", "192.168.1.1", "::1", "fe80::1", "not-an-ip", ""] {
        let decision = pipeline
            .evaluate(&mut RequestScope::new(), &visitor(ip, true))
            .await;
        assert_eq!(
            decision,
            GateDecision::Allow(AllowReason::InternalAddress),
            "{ip:?} should be internal"
        );
    }

    assert_eq!(resolver.calls(), 0);
    assert!(storage.list_stats().await.unwrap().is_empty());
    assert!(storage.load_policy().await.unwrap().admin_country.is_none());
}

#[tokio::test]
async fn test_same_address_evaluated_once_per_scope() {
    let storage = create_test_storage().await;
    block(&storage, &["DE"]).await;
    let resolver = Arc::new(FakeResolver::with(&[("81.2.69.142", "DE")]));
    let pipeline = GatePipeline::new(Arc::clone(&storage), resolver.clone());

    let mut scope = RequestScope::new();
    let first = pipeline
        .evaluate(&mut scope, &visitor("81.2.69.142", false))
        .await;
    let second = pipeline
        .evaluate(&mut scope, &visitor("81.2.69.142", false))
        .await;

    assert_eq!(first, GateDecision::Deny(code("DE")));
    assert_eq!(second, GateDecision::Allow(AllowReason::AlreadyProcessed));
    assert_eq!(resolver.calls(), 1);

    let stat = storage.get_stat(&code("DE")).await.unwrap().unwrap();
    assert_eq!(stat.total_visits, 1);
    assert_eq!(stat.blocked_visits, 1);

    // A new request starts with a fresh scope
    pipeline
        .evaluate(&mut RequestScope::new(), &visitor("81.2.69.142", false))
        .await;
    let stat = storage.get_stat(&code("DE")).await.unwrap().unwrap();
    assert_eq!(stat.total_visits, 2);
}

#[tokio::test]
async fn test_unblocked_country_only_counts_visit() {
    let storage = create_test_storage().await;
    block(&storage, &["CN"]).await;
    let resolver = Arc::new(FakeResolver::with(&[("8.8.8.8", "US")]));
    let pipeline = GatePipeline::new(Arc::clone(&storage), resolver);

    let decision = pipeline
        .evaluate(&mut RequestScope::new(), &visitor("8.8.8.8", false))
        .await;
    assert_eq!(decision, GateDecision::Allow(AllowReason::NotBlocked));

    let stat = storage.get_stat(&code("US")).await.unwrap().unwrap();
    assert_eq!(stat.total_visits, 1);
    assert_eq!(stat.blocked_visits, 0);
}

#[tokio::test]
async fn test_corrupt_admin_country_is_replaced_by_privileged_visitor() {
    let (storage, raw, path) = create_file_storage("corrupt_admin").await;
    block(&storage, &["DE"]).await;
    sqlx::query("INSERT INTO gate_settings (name, value) VALUES ('admin_country', '')")
        .execute(&raw)
        .await
        .unwrap();
    let resolver = Arc::new(FakeResolver::with(&[("81.2.69.142", "DE")]));
    let pipeline = GatePipeline::new(Arc::clone(&storage), resolver);

    let first = pipeline
        .evaluate(&mut RequestScope::new(), &visitor("81.2.69.142", true))
        .await;
    assert_eq!(first, GateDecision::Allow(AllowReason::AdminCountryClaimed));
    assert_eq!(
        storage.load_policy().await.unwrap().admin_country,
        Some(code("DE"))
    );

    // Later privileged visits go through the normal block check
    for _ in 0..2 {
        let decision = pipeline
            .evaluate(&mut RequestScope::new(), &visitor("81.2.69.142", true))
            .await;
        assert_eq!(decision, GateDecision::Allow(AllowReason::NotBlocked));
    }

    let stat = storage.get_stat(&code("DE")).await.unwrap().unwrap();
    assert_eq!(stat.total_visits, 3);
    assert_eq!(stat.blocked_visits, 0);

    raw.close().await;
    drop(pipeline);
    drop(storage);
    remove_sqlite_files(&path);
}

#[tokio::test]
async fn test_lost_admin_claim_falls_through_to_block_check() {
    let inner = create_test_storage().await;
    block(&inner, &["DE"]).await;
    let storage: Arc<dyn Storage> = Arc::new(RivalClaimStorage {
        inner: Arc::clone(&inner),
        rival: code("US"),
    });
    let resolver = Arc::new(FakeResolver::with(&[("81.2.69.142", "DE")]));
    let pipeline = GatePipeline::new(storage, resolver);

    let decision = pipeline
        .evaluate(&mut RequestScope::new(), &visitor("81.2.69.142", true))
        .await;
    assert_eq!(decision, GateDecision::Deny(code("DE")));
    assert_eq!(
        inner.load_policy().await.unwrap().admin_country,
        Some(code("US"))
    );

    let stat = inner.get_stat(&code("DE")).await.unwrap().unwrap();
    assert_eq!(stat.blocked_visits, 1);
}

#[tokio::test]
async fn test_storage_write_failures_keep_decision() {
    let policy = BlockPolicyConfig {
        blocked_countries: [code("DE")].into_iter().collect(),
        admin_country: None,
    };
    let storage: Arc<dyn Storage> = Arc::new(FailingStorage {
        policy: Some(policy),
    });
    let resolver = Arc::new(FakeResolver::with(&[
        ("81.2.69.142", "DE"),
        ("8.8.8.8", "US"),
    ]));
    let pipeline = GatePipeline::new(storage, resolver);

    let blocked = pipeline
        .evaluate(&mut RequestScope::new(), &visitor("81.2.69.142", false))
        .await;
    assert_eq!(blocked, GateDecision::Deny(code("DE")));

    let allowed = pipeline
        .evaluate(&mut RequestScope::new(), &visitor("8.8.8.8", false))
        .await;
    assert_eq!(allowed, GateDecision::Allow(AllowReason::NotBlocked));

    // A failed admin claim is logged and the request still passes
    let privileged = pipeline
        .evaluate(&mut RequestScope::new(), &visitor("81.2.69.142", true))
        .await;
    assert_eq!(
        privileged,
        GateDecision::Allow(AllowReason::AdminCountryClaimed)
    );
}

#[tokio::test]
async fn test_policy_read_failure_allows() {
    let storage: Arc<dyn Storage> = Arc::new(FailingStorage { policy: None });
    let resolver = Arc::new(FakeResolver::with(&[("81.2.69.142", "DE")]));
    let pipeline = GatePipeline::new(storage, resolver);

    let decision = pipeline
        .evaluate(&mut RequestScope::new(), &visitor("81.2.69.142", false))
        .await;
    assert_eq!(decision, GateDecision::Allow(AllowReason::NotBlocked));
}

#[tokio::test]
async fn test_site_returns_403_for_blocked_country() {
    let storage = create_test_storage().await;
    block(&storage, &["DE"]).await;
    let resolver = Arc::new(FakeResolver::with(&[("81.2.69.142", "DE")]));
    let gate = gate_state(&storage, resolver, api_key_auth());

    let app = create_site_router(gate, None).layer(TestConnectInfoLayer(peer("81.2.69.142")));

    let request = Request::builder().uri("/").body(Body::empty()).unwrap();
    let response = app.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert_eq!(body_string(response).await, BLOCK_MESSAGE);

    let stat = storage.get_stat(&code("DE")).await.unwrap().unwrap();
    assert_eq!(stat.blocked_visits, 1);
}

#[tokio::test]
async fn test_site_serves_allowed_visitor() {
    let storage = create_test_storage().await;
    block(&storage, &["DE"]).await;
    let resolver = Arc::new(FakeResolver::with(&[("8.8.8.8", "US")]));
    let gate = gate_state(&storage, resolver, api_key_auth());

    let app = create_site_router(gate, None).layer(TestConnectInfoLayer(peer("8.8.8.8")));

    let request = Request::builder().uri("/healthz").body(Body::empty()).unwrap();
    let response = app.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let stat = storage.get_stat(&code("US")).await.unwrap().unwrap();
    assert_eq!(stat.total_visits, 1);
}

#[tokio::test]
async fn test_site_privileged_request_sets_admin_country() {
    let storage = create_test_storage().await;
    block(&storage, &["CA"]).await;
    let resolver = Arc::new(FakeResolver::with(&[("24.48.0.1", "CA")]));
    let gate = gate_state(&storage, resolver, api_key_auth());

    let app = create_site_router(gate, None).layer(TestConnectInfoLayer(peer("24.48.0.1")));

    // A wrong key carries no privilege, so the blocked country is denied
    let request = Request::builder()
        .uri("/")
        .header("x-api-key", "wrong-key")
        .body(Body::empty())
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert!(storage.load_policy().await.unwrap().admin_country.is_none());

    let request = Request::builder()
        .uri("/")
        .header("x-api-key", "admin-key")
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        storage.load_policy().await.unwrap().admin_country,
        Some(code("CA"))
    );
}

#[tokio::test]
async fn test_gate_layered_twice_evaluates_once() {
    let storage = create_test_storage().await;
    let resolver = Arc::new(FakeResolver::with(&[("8.8.8.8", "US")]));
    let gate = gate_state(&storage, resolver.clone(), api_key_auth());

    let app = Router::new()
        .route("/", get(|| async { "ok" }))
        .layer(middleware::from_fn_with_state(Arc::clone(&gate), gate_request))
        .layer(middleware::from_fn_with_state(gate, gate_request))
        .layer(TestConnectInfoLayer(peer("8.8.8.8")));

    let request = Request::builder().uri("/").body(Body::empty()).unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    assert_eq!(resolver.calls(), 1);
    let stat = storage.get_stat(&code("US")).await.unwrap().unwrap();
    assert_eq!(stat.total_visits, 1);
}

#[tokio::test]
async fn test_missing_peer_address_is_allowed() {
    let storage = create_test_storage().await;
    block(&storage, &["US"]).await;
    let resolver = Arc::new(FakeResolver::with(&[("8.8.8.8", "US")]));
    let gate = gate_state(&storage, resolver.clone(), api_key_auth());

    let app = create_site_router(gate, None);

    let request = Request::builder().uri("/").body(Body::empty()).unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(resolver.calls(), 0);
}
