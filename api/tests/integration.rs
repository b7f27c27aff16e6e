use std::{
    net::SocketAddr,
    sync::{Arc, Mutex},
    time::Duration,
};

use api::{app::build_router, config::AppConfig, state::AppState};
use async_trait::async_trait;
use auth::{
    AuthResult, BiometricAuthService, ChallengeCache, CredentialStore, EnrollmentService,
    GeneratedChallenge, Mailer, PasswordAuthService, PendingTokenStore, RegisteredCredential,
    SessionManager, SignCountMode, TokenSigner, TokenSignerConfig, UserStore, VerifiedAssertion,
    WebauthnAdapter,
};
use axum::{
    body::{to_bytes, Body},
    extract::connect_info::MockConnectInfo,
    http::{HeaderValue, Request, StatusCode},
    Router,
};
use cache::{Kv, RateLimiter};
use domain::Credential;
use serde_json::{json, Value};
use sqlx::{PgPool, Row};
use tower::ServiceExt;
use uuid::Uuid;
use wallet::{TransferEngine, WalletConfig, WalletService};

const STUB_CREDENTIAL_ID: &str = "stub-credential-1";

/// Canned WebAuthn primitive: every ceremony succeeds and assertions report
/// a configurable sign count.
struct StubWebauthn {
    sign_count_mode: SignCountMode,
    next_sign_count: Mutex<i64>,
    credential_id: String,
}

impl StubWebauthn {
    fn new(sign_count_mode: SignCountMode) -> Self {
        Self {
            sign_count_mode,
            next_sign_count: Mutex::new(1),
            credential_id: STUB_CREDENTIAL_ID.to_string(),
        }
    }

    fn set_next_sign_count(&self, value: i64) {
        *self.next_sign_count.lock().unwrap() = value;
    }
}

impl WebauthnAdapter for StubWebauthn {
    fn generate_registration_options(
        &self,
        user_id: Uuid,
        _user_name: &str,
        _display_name: &str,
        _exclude: &[Credential],
    ) -> AuthResult<GeneratedChallenge> {
        Ok(GeneratedChallenge {
            options: json!({ "challenge": "registration", "user": user_id }),
            state: json!({ "ceremony": "registration" }),
        })
    }

    fn verify_registration(
        &self,
        _response: &Value,
        _state: &Value,
    ) -> AuthResult<Option<RegisteredCredential>> {
        Ok(Some(RegisteredCredential {
            credential_id: self.credential_id.clone(),
            public_key: b"stub-public-key".to_vec(),
            sign_count: 0,
            aaguid: None,
            transports: Some(vec!["internal".to_string()]),
        }))
    }

    fn generate_authentication_options(
        &self,
        allow: &[Credential],
    ) -> AuthResult<GeneratedChallenge> {
        Ok(GeneratedChallenge {
            options: json!({
                "challenge": "authentication",
                "allowCredentials": allow.iter().map(|c| c.credential_id.clone()).collect::<Vec<_>>(),
            }),
            state: json!({ "ceremony": "authentication" }),
        })
    }

    fn verify_authentication(
        &self,
        _response: &Value,
        _state: &Value,
        stored: &Credential,
    ) -> AuthResult<Option<VerifiedAssertion>> {
        Ok(Some(VerifiedAssertion {
            credential_id: stored.credential_id.clone(),
            new_sign_count: *self.next_sign_count.lock().unwrap(),
        }))
    }

    fn challenge_ttl(&self) -> Duration {
        Duration::from_secs(60)
    }

    fn sign_count_mode(&self) -> SignCountMode {
        self.sign_count_mode
    }
}

/// Captures outbound tokens instead of sending mail.
#[derive(Default)]
struct CapturingMailer {
    verifications: Mutex<Vec<(String, String)>>,
    resets: Mutex<Vec<(String, String)>>,
}

impl CapturingMailer {
    fn last_verification(&self, email: &str) -> Option<String> {
        self.verifications
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|(to, _)| to == email)
            .map(|(_, token)| token.clone())
    }

    fn last_reset(&self, email: &str) -> Option<String> {
        self.resets
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|(to, _)| to == email)
            .map(|(_, token)| token.clone())
    }
}

#[async_trait]
impl Mailer for CapturingMailer {
    async fn send_verification(&self, email: &str, token: &str) -> AuthResult<()> {
        self.verifications
            .lock()
            .unwrap()
            .push((email.to_string(), token.to_string()));
        Ok(())
    }

    async fn send_password_reset(&self, email: &str, token: &str) -> AuthResult<()> {
        self.resets
            .lock()
            .unwrap()
            .push((email.to_string(), token.to_string()));
        Ok(())
    }
}

fn test_config(database_url: String) -> AppConfig {
    AppConfig {
        port: 0,
        database_url,
        redis_url: None,
        access_secret: "test-access-secret".to_string(),
        refresh_secret: "test-refresh-secret".to_string(),
        access_ttl: Duration::from_secs(900),
        refresh_ttl: Duration::from_secs(604_800),
        step_up_ttl: Duration::from_secs(120),
        rp_id: "localhost".to_string(),
        rp_name: "Wallet Test".to_string(),
        webauthn_origins: vec!["http://localhost:3000".to_string()],
        challenge_ttl: Duration::from_secs(60),
        sign_count_mode: SignCountMode::Strict,
        transfer_min_amount_minor: 1_000,
        transfer_max_amount_minor: 10_000_000,
        transfer_absolute_max_minor: 50_000_000,
        transfer_daily_limit_minor: 20_000_000,
        high_value_threshold_minor: 5_000_000,
        default_currency: "IDR".to_string(),
    }
}

struct TestHarness {
    router: Router,
    state: AppState,
    mailer: Arc<CapturingMailer>,
    adapter: Arc<StubWebauthn>,
}

fn build_harness(pool: PgPool) -> TestHarness {
    let config = test_config(std::env::var("DATABASE_URL").unwrap_or_default());
    let kv = Kv::in_memory();
    let signer = Arc::new(TokenSigner::new(TokenSignerConfig {
        access_secret: config.access_secret.clone(),
        refresh_secret: config.refresh_secret.clone(),
        access_ttl: config.access_ttl,
        refresh_ttl: config.refresh_ttl,
        step_up_ttl: config.step_up_ttl,
    }));
    let adapter = Arc::new(StubWebauthn::new(config.sign_count_mode));
    let mailer = Arc::new(CapturingMailer::default());

    let users = UserStore::new(pool.clone());
    let credential_store = CredentialStore::new(pool.clone());
    let sessions = SessionManager::new(pool.clone(), signer.clone());
    let challenges = ChallengeCache::new(kv.clone());
    let limiter = RateLimiter::new(kv.clone());

    let password_auth = Arc::new(PasswordAuthService::new(
        users.clone(),
        sessions.clone(),
        PendingTokenStore::new(pool.clone()),
        signer.clone(),
        mailer.clone(),
        limiter.clone(),
    ));
    let biometric = Arc::new(BiometricAuthService::new(
        users.clone(),
        credential_store.clone(),
        challenges.clone(),
        adapter.clone(),
        sessions.clone(),
        signer.clone(),
        limiter.clone(),
    ));
    let enrollment = Arc::new(EnrollmentService::new(
        users,
        credential_store.clone(),
        challenges,
        adapter.clone(),
        limiter,
    ));

    let wallets = Arc::new(WalletService::new(
        pool.clone(),
        WalletConfig {
            default_currency: config.default_currency.clone(),
            min_amount_minor: config.transfer_min_amount_minor,
            max_amount_minor: config.transfer_max_amount_minor,
            absolute_max_minor: config.transfer_absolute_max_minor,
            daily_limit_minor: config.transfer_daily_limit_minor,
            high_value_threshold_minor: config.high_value_threshold_minor,
        },
    ));
    let transfers = Arc::new(TransferEngine::new(
        pool.clone(),
        wallets.clone(),
        signer.clone(),
    ));

    let state = AppState {
        config,
        db: pool,
        kv,
        signer,
        password_auth,
        biometric,
        enrollment,
        credentials: Arc::new(credential_store),
        wallets,
        transfers,
    };

    let router = build_router(
        state.clone(),
        vec![HeaderValue::from_static("http://localhost:3000")],
    )
    .layer(MockConnectInfo(SocketAddr::from(([127, 0, 0, 1], 4100))));

    TestHarness {
        router,
        state,
        mailer,
        adapter,
    }
}

async fn send_json(
    router: &Router,
    method: &str,
    path: &str,
    body: Option<Value>,
    headers: &[(&str, &str)],
) -> (StatusCode, Value, axum::http::HeaderMap) {
    let mut builder = Request::builder().method(method).uri(path);
    for (name, value) in headers {
        builder = builder.header(*name, *value);
    }
    let request = match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };

    let response = router.clone().oneshot(request).await.expect("response");
    let status = response.status();
    let headers = response.headers().clone();
    let bytes = to_bytes(response.into_body(), 1024 * 1024).await.expect("body");
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, body, headers)
}

/// Registers and verifies a user, returning (user_id, access_token).
async fn register_verified_user(harness: &TestHarness, email: &str) -> (Uuid, String) {
    let (status, body, _) = send_json(
        &harness.router,
        "POST",
        "/v1/auth/password/register",
        Some(json!({
            "email": email,
            "password": "Password123!",
            "firstName": "Alice",
            "lastName": "Brown",
        })),
        &[],
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["data"]["user"]["emailVerified"], json!(false));

    let token = harness
        .mailer
        .last_verification(email)
        .expect("verification token was issued");
    let (status, _, _) = send_json(
        &harness.router,
        "POST",
        "/v1/auth/password/verify/confirm",
        Some(json!({ "token": token })),
        &[],
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, body, _) = send_json(
        &harness.router,
        "POST",
        "/v1/auth/password/login",
        Some(json!({ "email": email, "password": "Password123!" })),
        &[],
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["user"]["emailVerified"], json!(true));

    let user_id = Uuid::parse_str(body["data"]["user"]["id"].as_str().unwrap()).unwrap();
    let access = body["data"]["tokens"]["accessToken"].as_str().unwrap().to_string();
    (user_id, access)
}

async fn seed_wallet_balance(pool: &PgPool, user_id: Uuid, balance: i64) {
    sqlx::query(
        "INSERT INTO wallets (id, user_id, currency, available_balance_minor) \
         VALUES ($1, $2, 'IDR', $3) \
         ON CONFLICT (user_id) DO UPDATE SET available_balance_minor = EXCLUDED.available_balance_minor",
    )
    .bind(Uuid::new_v4())
    .bind(user_id)
    .bind(balance)
    .execute(pool)
    .await
    .expect("seed wallet");
}

/// Enrolls the stub credential for a user, returning the device id.
async fn enroll_stub_credential(harness: &TestHarness, access: &str) -> Uuid {
    let bearer = format!("Bearer {access}");
    let (status, body, _) = send_json(
        &harness.router,
        "POST",
        "/v1/enroll/challenge",
        Some(json!({ "deviceName": "Pixel 9" })),
        &[("authorization", bearer.as_str())],
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let challenge_id = body["data"]["challengeId"].as_str().unwrap().to_string();

    let (status, body, _) = send_json(
        &harness.router,
        "POST",
        "/v1/enroll/verify",
        Some(json!({
            "challengeId": challenge_id,
            "credential": { "id": STUB_CREDENTIAL_ID },
        })),
        &[],
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["credentialId"], json!(STUB_CREDENTIAL_ID));
    Uuid::parse_str(body["data"]["deviceId"].as_str().unwrap()).unwrap()
}

#[sqlx::test(migrations = "../migrations")]
async fn health_skips_the_envelope(pool: PgPool) {
    let harness = build_harness(pool);
    let (status, body, headers) = send_json(&harness.router, "GET", "/health", None, &[]).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({ "status": "ok" }));
    assert!(headers.contains_key("x-request-id"));
}

#[sqlx::test(migrations = "../migrations")]
async fn unknown_routes_return_problem_with_trace(pool: PgPool) {
    let harness = build_harness(pool);
    let (status, body, headers) =
        send_json(&harness.router, "GET", "/v1/nope", None, &[]).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], json!("NOT_FOUND"));
    assert!(body["traceId"].is_string());
    assert!(headers.contains_key("x-request-id"));
}

#[sqlx::test(migrations = "../migrations")]
async fn register_verify_login_flow(pool: PgPool) {
    let harness = build_harness(pool);

    let (status, body, _) = send_json(
        &harness.router,
        "POST",
        "/v1/auth/password/register",
        Some(json!({
            "email": "A@x.dev ",
            "password": "Password123!",
            "firstName": "A",
            "lastName": "B",
        })),
        &[],
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["data"]["user"]["email"], json!("a@x.dev"));
    assert_eq!(body["data"]["user"]["emailVerified"], json!(false));
    assert!(body["data"]["tokens"]["accessToken"].is_string());

    // Login before verification is rejected.
    let (status, body, _) = send_json(
        &harness.router,
        "POST",
        "/v1/auth/password/login",
        Some(json!({ "email": "a@x.dev", "password": "Password123!" })),
        &[],
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["code"], json!("EMAIL_NOT_VERIFIED"));

    let token = harness.mailer.last_verification("a@x.dev").unwrap();
    let (status, _, _) = send_json(
        &harness.router,
        "POST",
        "/v1/auth/password/verify/confirm",
        Some(json!({ "token": token })),
        &[],
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, body, _) = send_json(
        &harness.router,
        "POST",
        "/v1/auth/password/login",
        Some(json!({ "email": "a@x.dev", "password": "Password123!" })),
        &[],
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["user"]["emailVerified"], json!(true));

    // Duplicate registration conflicts.
    let (status, body, _) = send_json(
        &harness.router,
        "POST",
        "/v1/auth/password/register",
        Some(json!({
            "email": "a@x.dev",
            "password": "Password123!",
            "firstName": "A",
            "lastName": "B",
        })),
        &[],
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], json!("CONFLICT"));
}

#[sqlx::test(migrations = "../migrations")]
async fn verification_token_is_single_use(pool: PgPool) {
    let harness = build_harness(pool);
    let _ = register_verified_user(&harness, "once@x.dev").await;

    // The token was consumed during registration confirm; replay fails.
    let token = harness.mailer.last_verification("once@x.dev").unwrap();
    let (status, body, _) = send_json(
        &harness.router,
        "POST",
        "/v1/auth/password/verify/confirm",
        Some(json!({ "token": token })),
        &[],
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], json!("VALIDATION_FAILED"));
}

#[sqlx::test(migrations = "../migrations")]
async fn refresh_rotation_is_single_use(pool: PgPool) {
    let harness = build_harness(pool);
    let _ = register_verified_user(&harness, "rotate@x.dev").await;

    let (_, body, _) = send_json(
        &harness.router,
        "POST",
        "/v1/auth/password/login",
        Some(json!({ "email": "rotate@x.dev", "password": "Password123!" })),
        &[],
    )
    .await;
    let r1 = body["data"]["tokens"]["refreshToken"].as_str().unwrap().to_string();

    let (status, body, _) = send_json(
        &harness.router,
        "POST",
        "/v1/auth/password/refresh",
        Some(json!({ "refreshToken": r1 })),
        &[],
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let r2 = body["data"]["tokens"]["refreshToken"].as_str().unwrap().to_string();
    assert_ne!(r1, r2);

    // Replaying the consumed token fails.
    let (status, body, _) = send_json(
        &harness.router,
        "POST",
        "/v1/auth/password/refresh",
        Some(json!({ "refreshToken": r1 })),
        &[],
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["code"], json!("UNAUTHORIZED"));

    // The rotated token still works.
    let (status, _, _) = send_json(
        &harness.router,
        "POST",
        "/v1/auth/password/refresh",
        Some(json!({ "refreshToken": r2 })),
        &[],
    )
    .await;
    assert_eq!(status, StatusCode::OK);
}

#[sqlx::test(migrations = "../migrations")]
async fn password_reset_revokes_outstanding_refresh_tokens(pool: PgPool) {
    let harness = build_harness(pool);
    let _ = register_verified_user(&harness, "reset@x.dev").await;

    let (_, body, _) = send_json(
        &harness.router,
        "POST",
        "/v1/auth/password/login",
        Some(json!({ "email": "reset@x.dev", "password": "Password123!" })),
        &[],
    )
    .await;
    let refresh = body["data"]["tokens"]["refreshToken"].as_str().unwrap().to_string();

    // Unknown emails get the same silent success.
    let (status, body, _) = send_json(
        &harness.router,
        "POST",
        "/v1/auth/password/reset/request",
        Some(json!({ "email": "ghost@x.dev" })),
        &[],
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["success"], json!(true));

    let (status, _, _) = send_json(
        &harness.router,
        "POST",
        "/v1/auth/password/reset/request",
        Some(json!({ "email": "reset@x.dev" })),
        &[],
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let token = harness.mailer.last_reset("reset@x.dev").unwrap();
    let (status, _, _) = send_json(
        &harness.router,
        "POST",
        "/v1/auth/password/reset/confirm",
        Some(json!({ "token": token, "newPassword": "BrandNew123!" })),
        &[],
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, _, _) = send_json(
        &harness.router,
        "POST",
        "/v1/auth/password/refresh",
        Some(json!({ "refreshToken": refresh })),
        &[],
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _, _) = send_json(
        &harness.router,
        "POST",
        "/v1/auth/password/login",
        Some(json!({ "email": "reset@x.dev", "password": "BrandNew123!" })),
        &[],
    )
    .await;
    assert_eq!(status, StatusCode::OK);
}

#[sqlx::test(migrations = "../migrations")]
async fn login_rate_limit_fails_closed(pool: PgPool) {
    let harness = build_harness(pool);
    let _ = register_verified_user(&harness, "limited@x.dev").await;

    for _ in 0..5 {
        let (status, _, _) = send_json(
            &harness.router,
            "POST",
            "/v1/auth/password/login",
            Some(json!({ "email": "limited@x.dev", "password": "wrong-password" })),
            &[],
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    let (status, body, _) = send_json(
        &harness.router,
        "POST",
        "/v1/auth/password/login",
        Some(json!({ "email": "limited@x.dev", "password": "Password123!" })),
        &[],
    )
    .await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(body["code"], json!("RATE_LIMITED"));
}

#[sqlx::test(migrations = "../migrations")]
async fn transfer_happy_path_and_client_reference_idempotency(pool: PgPool) {
    let harness = build_harness(pool.clone());
    let (sender_id, sender_access) = register_verified_user(&harness, "sender@x.dev").await;
    let (_, _) = register_verified_user(&harness, "recipient@x.dev").await;
    seed_wallet_balance(&pool, sender_id, 1_000_000).await;

    let bearer = format!("Bearer {sender_access}");
    let transfer_body = json!({
        "recipient": { "email": "recipient@x.dev" },
        "amountMinor": 100_000,
        "currency": "IDR",
        "clientReference": "c1",
    });

    let (status, body, headers) = send_json(
        &harness.router,
        "POST",
        "/v1/transactions/transfer",
        Some(transfer_body.clone()),
        &[("authorization", bearer.as_str())],
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["data"]["role"], json!("SENDER"));
    assert_eq!(body["data"]["status"], json!("COMPLETED"));
    assert_eq!(body["data"]["stepUpUsed"], json!(false));
    assert_eq!(
        body["data"]["counterparty"]["maskedEmail"],
        json!("rec***@x.dev")
    );
    let transaction_id = body["data"]["id"].as_str().unwrap().to_string();
    assert_eq!(
        headers.get("location").unwrap().to_str().unwrap(),
        format!("/v1/transactions/{transaction_id}")
    );

    let (status, body, _) = send_json(
        &harness.router,
        "GET",
        "/v1/wallets/me",
        None,
        &[("authorization", bearer.as_str())],
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["availableBalanceMinor"], json!(900_000));
    assert_eq!(body["data"]["limits"]["dailyUsedMinor"], json!(100_000));

    // Exact retry returns the same transaction and moves no money.
    let (status, body, _) = send_json(
        &harness.router,
        "POST",
        "/v1/transactions/transfer",
        Some(transfer_body),
        &[("authorization", bearer.as_str())],
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["data"]["id"], json!(transaction_id));

    let ledger_pairs: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM wallet_ledger_entries WHERE transaction_id = $1",
    )
    .bind(Uuid::parse_str(&transaction_id).unwrap())
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(ledger_pairs, 2);

    let balance: i64 = sqlx::query_scalar(
        "SELECT available_balance_minor FROM wallets WHERE user_id = $1",
    )
    .bind(sender_id)
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(balance, 900_000);

    // Same clientReference with different parameters conflicts.
    let (status, body, _) = send_json(
        &harness.router,
        "POST",
        "/v1/transactions/transfer",
        Some(json!({
            "recipient": { "email": "recipient@x.dev" },
            "amountMinor": 50_000,
            "currency": "IDR",
            "clientReference": "c1",
        })),
        &[("authorization", bearer.as_str())],
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], json!("CONFLICT"));

    // Recipient sees the mirrored transaction.
    let (_, body, _) = send_json(
        &harness.router,
        "POST",
        "/v1/auth/password/login",
        Some(json!({ "email": "recipient@x.dev", "password": "Password123!" })),
        &[],
    )
    .await;
    let recipient_access = body["data"]["tokens"]["accessToken"].as_str().unwrap().to_string();
    let recipient_bearer = format!("Bearer {recipient_access}");
    let (status, body, _) = send_json(
        &harness.router,
        "GET",
        &format!("/v1/transactions/{transaction_id}"),
        None,
        &[("authorization", recipient_bearer.as_str())],
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["role"], json!("RECIPIENT"));
    assert_eq!(
        body["data"]["counterparty"]["maskedEmail"],
        json!("sen***@x.dev")
    );

    let (status, body, _) = send_json(
        &harness.router,
        "GET",
        "/v1/wallets/me",
        None,
        &[("authorization", recipient_bearer.as_str())],
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["availableBalanceMinor"], json!(100_000));

    let (status, body, _) = send_json(
        &harness.router,
        "GET",
        "/v1/wallets/me/transactions",
        None,
        &[("authorization", recipient_bearer.as_str())],
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"].as_array().unwrap().len(), 1);
    assert_eq!(body["data"][0]["role"], json!("RECIPIENT"));
}

#[sqlx::test(migrations = "../migrations")]
async fn transfer_guardrails(pool: PgPool) {
    let harness = build_harness(pool.clone());
    let (sender_id, sender_access) = register_verified_user(&harness, "guard@x.dev").await;
    let (_, _) = register_verified_user(&harness, "peer@x.dev").await;
    seed_wallet_balance(&pool, sender_id, 1_000_000).await;
    let bearer = format!("Bearer {sender_access}");

    // Unknown recipient.
    let (status, body, _) = send_json(
        &harness.router,
        "POST",
        "/v1/transactions/transfer",
        Some(json!({
            "recipient": { "email": "ghost@x.dev" },
            "amountMinor": 10_000,
            "currency": "IDR",
        })),
        &[("authorization", bearer.as_str())],
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], json!("RECIPIENT_NOT_FOUND"));

    // Self-transfer.
    let (status, body, _) = send_json(
        &harness.router,
        "POST",
        "/v1/transactions/transfer",
        Some(json!({
            "recipient": { "email": "guard@x.dev" },
            "amountMinor": 10_000,
            "currency": "IDR",
        })),
        &[("authorization", bearer.as_str())],
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], json!("SAME_WALLET_TRANSFER"));

    // Currency mismatch.
    let (status, body, _) = send_json(
        &harness.router,
        "POST",
        "/v1/transactions/transfer",
        Some(json!({
            "recipient": { "email": "peer@x.dev" },
            "amountMinor": 10_000,
            "currency": "USD",
        })),
        &[("authorization", bearer.as_str())],
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], json!("VALIDATION_FAILED"));

    // Below minimum.
    let (status, body, _) = send_json(
        &harness.router,
        "POST",
        "/v1/transactions/transfer",
        Some(json!({
            "recipient": { "email": "peer@x.dev" },
            "amountMinor": 500,
            "currency": "IDR",
        })),
        &[("authorization", bearer.as_str())],
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], json!("LIMIT_EXCEEDED"));

    // More than the balance.
    let (status, body, _) = send_json(
        &harness.router,
        "POST",
        "/v1/transactions/transfer",
        Some(json!({
            "recipient": { "email": "peer@x.dev" },
            "amountMinor": 2_000_000,
            "currency": "IDR",
        })),
        &[("authorization", bearer.as_str())],
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], json!("INSUFFICIENT_FUNDS"));

    // Blocked sender wallet.
    sqlx::query("UPDATE wallets SET status = 'BLOCKED' WHERE user_id = $1")
        .bind(sender_id)
        .execute(&pool)
        .await
        .unwrap();
    let (status, body, _) = send_json(
        &harness.router,
        "POST",
        "/v1/transactions/transfer",
        Some(json!({
            "recipient": { "email": "peer@x.dev" },
            "amountMinor": 10_000,
            "currency": "IDR",
        })),
        &[("authorization", bearer.as_str())],
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["code"], json!("WALLET_BLOCKED"));
}

#[sqlx::test(migrations = "../migrations")]
async fn high_value_transfer_requires_step_up(pool: PgPool) {
    let harness = build_harness(pool.clone());
    let (sender_id, sender_access) = register_verified_user(&harness, "whale@x.dev").await;
    let (_, _) = register_verified_user(&harness, "shore@x.dev").await;
    seed_wallet_balance(&pool, sender_id, 10_000_000).await;
    let bearer = format!("Bearer {sender_access}");

    let transfer = json!({
        "recipient": { "email": "shore@x.dev" },
        "amountMinor": 6_000_000,
        "currency": "IDR",
    });

    let (status, body, _) = send_json(
        &harness.router,
        "POST",
        "/v1/transactions/transfer",
        Some(transfer.clone()),
        &[("authorization", bearer.as_str())],
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["code"], json!("UNAUTHORIZED"));

    // A step-up token scoped to another purpose is rejected.
    let wrong_purpose = harness
        .state
        .signer
        .issue_step_up(sender_id, Some("profile:update".to_string()), "ch-1")
        .unwrap();
    let (status, body, _) = send_json(
        &harness.router,
        "POST",
        "/v1/transactions/transfer",
        Some(transfer.clone()),
        &[
            ("authorization", bearer.as_str()),
            ("x-step-up-token", wrong_purpose.as_str()),
        ],
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["code"], json!("FORBIDDEN"));

    // Another user's step-up token is rejected.
    let foreign = harness
        .state
        .signer
        .issue_step_up(Uuid::new_v4(), Some("transaction:transfer".to_string()), "ch-2")
        .unwrap();
    let (status, _, _) = send_json(
        &harness.router,
        "POST",
        "/v1/transactions/transfer",
        Some(transfer.clone()),
        &[
            ("authorization", bearer.as_str()),
            ("x-step-up-token", foreign.as_str()),
        ],
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let step_up = harness
        .state
        .signer
        .issue_step_up(sender_id, Some("transaction:transfer".to_string()), "ch-3")
        .unwrap();
    let (status, body, _) = send_json(
        &harness.router,
        "POST",
        "/v1/transactions/transfer",
        Some(transfer),
        &[
            ("authorization", bearer.as_str()),
            ("x-step-up-token", step_up.as_str()),
        ],
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["data"]["stepUpUsed"], json!(true));
}

#[sqlx::test(migrations = "../migrations")]
async fn biometric_enroll_login_and_step_up_ceremonies(pool: PgPool) {
    let harness = build_harness(pool.clone());
    let (user_id, access) = register_verified_user(&harness, "passkey@x.dev").await;
    let device_id = enroll_stub_credential(&harness, &access).await;

    // Devices listing shows the enrolled device.
    let bearer = format!("Bearer {access}");
    let (status, body, _) = send_json(
        &harness.router,
        "GET",
        "/v1/devices",
        None,
        &[("authorization", bearer.as_str())],
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"][0]["id"], json!(device_id.to_string()));
    assert_eq!(body["data"][0]["active"], json!(true));
    assert_eq!(body["data"][0]["label"], json!("Pixel 9"));

    // Passkey login.
    let (status, body, _) = send_json(
        &harness.router,
        "POST",
        "/v1/auth/challenge",
        Some(json!({ "email": "passkey@x.dev" })),
        &[],
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let challenge_id = body["data"]["challengeId"].as_str().unwrap().to_string();
    assert!(body["data"]["publicKeyCredentialOptions"].is_object());

    harness.adapter.set_next_sign_count(1);
    let (status, body, _) = send_json(
        &harness.router,
        "POST",
        "/v1/auth/verify",
        Some(json!({
            "challengeId": challenge_id,
            "credential": { "id": STUB_CREDENTIAL_ID },
        })),
        &[],
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["user"]["id"], json!(user_id.to_string()));
    let biometric_access = body["data"]["tokens"]["accessToken"].as_str().unwrap().to_string();

    // A consumed challenge cannot be replayed.
    let (status, body, _) = send_json(
        &harness.router,
        "POST",
        "/v1/auth/verify",
        Some(json!({
            "challengeId": challenge_id,
            "credential": { "id": STUB_CREDENTIAL_ID },
        })),
        &[],
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], json!("NOT_FOUND"));

    // Step-up ceremony mints a purpose-scoped token usable for transfers.
    let biometric_bearer = format!("Bearer {biometric_access}");
    let (status, body, _) = send_json(
        &harness.router,
        "POST",
        "/v1/auth/step-up/challenge",
        Some(json!({ "purpose": "transaction:transfer" })),
        &[("authorization", biometric_bearer.as_str())],
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let step_up_challenge = body["data"]["challengeId"].as_str().unwrap().to_string();

    harness.adapter.set_next_sign_count(2);
    let (status, body, _) = send_json(
        &harness.router,
        "POST",
        "/v1/auth/step-up/verify",
        Some(json!({
            "challengeId": step_up_challenge,
            "credential": { "id": STUB_CREDENTIAL_ID },
        })),
        &[("authorization", biometric_bearer.as_str())],
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let step_up_token = body["data"]["stepUpToken"].as_str().unwrap().to_string();

    let claims = harness.state.signer.verify_step_up(&step_up_token).unwrap();
    assert_eq!(claims.purpose.as_deref(), Some("transaction:transfer"));
    assert_eq!(claims.challenge_id.as_deref(), Some(step_up_challenge.as_str()));

    // Deactivating the only device makes biometric login unavailable.
    let (status, _, _) = send_json(
        &harness.router,
        "DELETE",
        &format!("/v1/devices/{device_id}"),
        None,
        &[("authorization", bearer.as_str())],
    )
    .await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, body, _) = send_json(
        &harness.router,
        "POST",
        "/v1/auth/challenge",
        Some(json!({ "email": "passkey@x.dev" })),
        &[],
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], json!("NO_CREDENTIALS"));
}

#[sqlx::test(migrations = "../migrations")]
async fn sign_count_regression_revokes_credential_and_devices(pool: PgPool) {
    let harness = build_harness(pool.clone());
    let (_, access) = register_verified_user(&harness, "cloned@x.dev").await;
    let _device_id = enroll_stub_credential(&harness, &access).await;

    sqlx::query("UPDATE credentials SET sign_count = 10 WHERE credential_id = $1")
        .bind(STUB_CREDENTIAL_ID)
        .execute(&pool)
        .await
        .unwrap();

    let (status, body, _) = send_json(
        &harness.router,
        "POST",
        "/v1/auth/challenge",
        Some(json!({ "email": "cloned@x.dev" })),
        &[],
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let challenge_id = body["data"]["challengeId"].as_str().unwrap().to_string();

    harness.adapter.set_next_sign_count(5);
    let (status, body, _) = send_json(
        &harness.router,
        "POST",
        "/v1/auth/verify",
        Some(json!({
            "challengeId": challenge_id,
            "credential": { "id": STUB_CREDENTIAL_ID },
        })),
        &[],
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["code"], json!("CREDENTIAL_COMPROMISED"));

    let row = sqlx::query(
        "SELECT revoked, revoked_at FROM credentials WHERE credential_id = $1",
    )
    .bind(STUB_CREDENTIAL_ID)
    .fetch_one(&pool)
    .await
    .unwrap();
    assert!(row.get::<bool, _>("revoked"));
    assert!(row
        .get::<Option<chrono::DateTime<chrono::Utc>>, _>("revoked_at")
        .is_some());

    let devices = sqlx::query(
        "SELECT active, deactivated_reason FROM devices WHERE credential_id = $1",
    )
    .bind(STUB_CREDENTIAL_ID)
    .fetch_all(&pool)
    .await
    .unwrap();
    assert!(!devices.is_empty());
    for device in devices {
        assert!(!device.get::<bool, _>("active"));
        assert_eq!(
            device.get::<Option<String>, _>("deactivated_reason").as_deref(),
            Some("sign_count_regression")
        );
    }
}

#[sqlx::test(migrations = "../migrations")]
async fn idempotency_gate_replays_cached_responses(pool: PgPool) {
    let harness = build_harness(pool.clone());
    let (sender_id, sender_access) = register_verified_user(&harness, "idem@x.dev").await;
    let (_, _) = register_verified_user(&harness, "target@x.dev").await;
    seed_wallet_balance(&pool, sender_id, 1_000_000).await;
    let bearer = format!("Bearer {sender_access}");

    let transfer = json!({
        "recipient": { "email": "target@x.dev" },
        "amountMinor": 100_000,
        "currency": "IDR",
    });

    let (status, body, headers) = send_json(
        &harness.router,
        "POST",
        "/v1/transactions/transfer",
        Some(transfer.clone()),
        &[
            ("authorization", bearer.as_str()),
            ("idempotency-key", "key-1"),
        ],
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert!(headers.get("idempotency-replayed").is_none());
    let transaction_id = body["data"]["id"].as_str().unwrap().to_string();

    // Same key replays the stored response without a second execution,
    // even though no clientReference was supplied.
    let (status, body, headers) = send_json(
        &harness.router,
        "POST",
        "/v1/transactions/transfer",
        Some(transfer),
        &[
            ("authorization", bearer.as_str()),
            ("idempotency-key", "key-1"),
        ],
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(headers.get("idempotency-replayed").unwrap(), "true");
    assert_eq!(body["data"]["id"], json!(transaction_id));
    assert_eq!(
        headers.get("location").unwrap().to_str().unwrap(),
        format!("/v1/transactions/{transaction_id}")
    );

    let balance: i64 = sqlx::query_scalar(
        "SELECT available_balance_minor FROM wallets WHERE user_id = $1",
    )
    .bind(sender_id)
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(balance, 900_000);

    let transfer_count: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM wallet_transactions")
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(transfer_count, 1);
}
