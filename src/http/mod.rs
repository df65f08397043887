//! HTTP API. Every handler takes `web::Data<CoreContext>` and
//! returns `crate::Result<HttpResponse>`; `http::errors` turns any `Err`
//! into the `{error, detail?}` body with the right status code.

pub mod errors;

use crate::context::CoreContext;
use crate::device_verifier::{DeviceCredentials, DeviceVerifier};
use crate::error::{Error, Result};
use crate::feature_extractor::FeatureExtractor;
use crate::inference::InferenceEngine;
use crate::inventory::{InventoryCoordinator, IseHttpSource};
use crate::models::{Device, FeatureSnapshot, Platform};
use crate::rate_limit::Category;
use crate::scanner::{ScanRequest, Scanner};
use crate::version;
use actix_web::{web, HttpRequest, HttpResponse};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.route("/health", web::get().to(health))
        .route("/analyze-psirt", web::post().to(analyze_psirt))
        .route("/results/{analysis_id}", web::get().to(get_result))
        .route("/verify-device", web::post().to(verify_device))
        .route("/verify-snapshot", web::post().to(verify_snapshot))
        .route("/extract-features", web::post().to(extract_features))
        .route("/scan-device", web::post().to(scan_device))
        .route("/vulnerability/{id}", web::get().to(get_vulnerability))
        .service(
            web::scope("/inventory")
                .route("/devices", web::get().to(list_devices))
                .route("/devices", web::post().to(create_device))
                .route("/devices/{id}", web::get().to(get_device))
                .route("/devices/{id}", web::delete().to(delete_device))
                .route("/devices/{id}/discover", web::post().to(discover_device))
                .route("/devices/{id}/scan", web::post().to(scan_one_device))
                .route("/scan-all", web::post().to(scan_all_devices))
                .route("/compare-scans", web::post().to(compare_scans))
                .route("/compare-versions", web::post().to(compare_versions))
                .route("/scan-result/{scan_id}", web::get().to(get_scan_result))
                .route("/sync-from-ise", web::post().to(sync_from_ise)),
        )
        .service(
            web::scope("/system")
                .route("/update/offline", web::post().to(update_offline))
                .route("/update/validate", web::post().to(update_validate))
                .route("/stats/database", web::get().to(stats_database))
                .route("/health", web::get().to(system_health))
                .route("/cache/clear", web::post().to(cache_clear))
                .route("/cache/stats", web::get().to(cache_stats)),
        );
}

fn client_id(req: &HttpRequest) -> String {
    req.connection_info().realip_remote_addr().unwrap_or("unknown").to_string()
}

fn admin_secret_header(req: &HttpRequest) -> Option<&str> {
    req.headers().get("X-Admin-Secret").and_then(|v| v.to_str().ok())
}

async fn health() -> HttpResponse {
    HttpResponse::Ok().json(serde_json::json!({"status": "ok", "service": "cisco-vuln-scanner"}))
}

#[derive(Deserialize)]
struct AnalyzePsirtRequest {
    summary: String,
    platform: String,
    advisory_id: Option<String>,
}

async fn analyze_psirt(
    ctx: web::Data<CoreContext>,
    req: HttpRequest,
    body: web::Json<AnalyzePsirtRequest>,
) -> Result<HttpResponse> {
    ctx.rate_limiter.check(&client_id(&req), Category::Analyze)?;
    let platform = Platform::parse(&body.platform).ok_or_else(|| Error::BadInput(format!("unknown platform: {}", body.platform)))?;

    let lm: Box<dyn crate::inference::LmClient> = match &ctx.config.lm_endpoint {
        Some(endpoint) => Box::new(crate::inference::HttpLmClient::new(
            ctx.http_client.clone(),
            endpoint.clone(),
            ctx.config.lm_model_name.clone(),
        )),
        None => Box::new(crate::inference::NullLmClient),
    };
    let retriever = ctx.retriever.read().expect("retriever lock poisoned");
    let engine = InferenceEngine::new(&ctx.taxonomy, &retriever, &ctx.psirt_cache, lm.as_ref());
    let analysis = engine.analyze(&body.summary, platform, body.advisory_id.as_deref()).await?;
    drop(retriever);

    ctx.analyses.insert(analysis.clone());
    Ok(HttpResponse::Ok().json(analysis))
}

async fn get_result(ctx: web::Data<CoreContext>, path: web::Path<String>) -> Result<HttpResponse> {
    let analysis_id = path.into_inner();
    match ctx.analyses.get(&analysis_id) {
        Some(analysis) => Ok(HttpResponse::Ok().json(analysis)),
        None => Err(Error::NotFound(format!("analysis {analysis_id}"))),
    }
}

#[derive(Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
enum OverallStatus {
    Vulnerable,
    NotVulnerable,
    Error,
}

#[derive(Serialize)]
struct VerificationReport {
    version_check: Option<bool>,
    feature_check: FeatureCheck,
    overall_status: OverallStatus,
    reason: String,
    evidence: Vec<String>,
}

#[derive(Serialize)]
struct FeatureCheck {
    present: Vec<String>,
    absent: Vec<String>,
}

fn build_verification_report(
    expected_labels: &BTreeSet<String>,
    observed: &BTreeSet<String>,
    version_check: Option<bool>,
) -> VerificationReport {
    let present: Vec<String> = expected_labels.intersection(observed).cloned().collect();
    let absent: Vec<String> = expected_labels.difference(observed).cloned().collect();

    let overall_status = if version_check == Some(false) {
        OverallStatus::NotVulnerable
    } else if !present.is_empty() || expected_labels.is_empty() {
        OverallStatus::Vulnerable
    } else {
        OverallStatus::NotVulnerable
    };

    let reason = match overall_status {
        OverallStatus::Vulnerable => "one or more expected features are present on the device".to_string(),
        OverallStatus::NotVulnerable => "none of the expected features are present, or the version is not affected".to_string(),
        OverallStatus::Error => "verification could not be completed".to_string(),
    };

    VerificationReport {
        version_check,
        feature_check: FeatureCheck { present: present.clone(), absent },
        overall_status,
        reason,
        evidence: present,
    }
}

#[derive(Deserialize)]
struct VerifyDeviceRequest {
    analysis_id: String,
    device: VerifyDeviceTarget,
    /// Overrides the analysis's platform when the caller knows the device
    /// runs a different OS family than the advisory was analyzed against.
    device_type: Option<String>,
    /// The PSIRT's affected-version pattern, used to compute `version_check`
    /// against the version `DeviceVerifier` observes. `Analysis` itself
    /// carries no version pattern, so this has to come from the caller.
    psirt_metadata: Option<PsirtMetadataInput>,
}

#[derive(Deserialize)]
struct VerifyDeviceTarget {
    host: String,
    username: String,
    password: String,
    #[serde(default = "default_ssh_port")]
    port: u16,
}

#[derive(Deserialize)]
struct PsirtMetadataInput {
    affected_versions: String,
    fixed_version: Option<String>,
}

fn default_ssh_port() -> u16 {
    22
}

async fn verify_device(
    ctx: web::Data<CoreContext>,
    req: HttpRequest,
    body: web::Json<VerifyDeviceRequest>,
) -> Result<HttpResponse> {
    ctx.rate_limiter.check(&client_id(&req), Category::Verify)?;
    let analysis = ctx.analyses.get(&body.analysis_id).ok_or_else(|| Error::NotFound(format!("analysis {}", body.analysis_id)))?;

    let platform = match &body.device_type {
        Some(raw) => Platform::parse(raw).ok_or_else(|| Error::BadInput(format!("unknown platform: {raw}")))?,
        None => analysis.platform,
    };

    let extractor = FeatureExtractor::new(&ctx.taxonomy);
    let verifier = DeviceVerifier::new(extractor, ctx.config.ssh_connect_timeout, ctx.config.ssh_command_timeout);
    let creds = DeviceCredentials { username: body.device.username.clone(), password: body.device.password.clone() };

    let outcome = match verifier.verify(&body.device.host, body.device.port, platform, &creds) {
        Ok(outcome) => outcome,
        Err(e) => {
            return Ok(HttpResponse::Ok().json(VerificationReport {
                version_check: None,
                feature_check: FeatureCheck { present: vec![], absent: vec![] },
                overall_status: OverallStatus::Error,
                reason: e.to_string(),
                evidence: vec![],
            }))
        }
    };

    let version_check = match &body.psirt_metadata {
        Some(meta) => {
            let pattern = version::classify(&meta.affected_versions)?;
            let decision = version::is_affected(&outcome.version, &pattern, meta.fixed_version.as_deref())?;
            Some(decision.affected)
        }
        None => None,
    };

    let report = build_verification_report(&analysis.labels, &outcome.feature_snapshot.features_present, version_check);
    Ok(HttpResponse::Ok().json(report))
}

#[derive(Deserialize)]
struct VerifySnapshotRequest {
    analysis_id: String,
    snapshot: FeatureSnapshot,
}

async fn verify_snapshot(ctx: web::Data<CoreContext>, req: HttpRequest, body: web::Json<VerifySnapshotRequest>) -> Result<HttpResponse> {
    ctx.rate_limiter.check(&client_id(&req), Category::Verify)?;
    let analysis = ctx.analyses.get(&body.analysis_id).ok_or_else(|| Error::NotFound(format!("analysis {}", body.analysis_id)))?;
    let report = build_verification_report(&analysis.labels, &body.snapshot.features_present, None);
    Ok(HttpResponse::Ok().json(report))
}

#[derive(Deserialize)]
struct ExtractFeaturesRequest {
    device: String,
    platform: Option<String>,
}

async fn extract_features(ctx: web::Data<CoreContext>, req: HttpRequest, body: web::Json<ExtractFeaturesRequest>) -> Result<HttpResponse> {
    ctx.rate_limiter.check(&client_id(&req), Category::Default)?;
    let platform = match &body.platform {
        Some(p) => Platform::parse(p).ok_or_else(|| Error::BadInput(format!("unknown platform: {p}")))?,
        None => Platform::IosXe,
    };
    let extractor = FeatureExtractor::new(&ctx.taxonomy);
    let snapshot = extractor.extract(&body.device, platform, None);
    Ok(HttpResponse::Ok().json(snapshot))
}

#[derive(Deserialize)]
struct ScanDeviceRequest {
    platform: String,
    version: String,
    hardware: Option<String>,
    features: Option<BTreeSet<String>>,
    severity_filter: Option<Vec<u8>>,
    limit: Option<usize>,
    offset: Option<usize>,
}

async fn scan_device(ctx: web::Data<CoreContext>, req: HttpRequest, body: web::Json<ScanDeviceRequest>) -> Result<HttpResponse> {
    ctx.rate_limiter.check(&client_id(&req), Category::Scan)?;
    let platform = Platform::parse(&body.platform).ok_or_else(|| Error::BadInput(format!("unknown platform: {}", body.platform)))?;
    let store = ctx.vulnerabilities.lock().expect("vulnerability store lock poisoned");
    let scanner = Scanner::new(&store);
    let scan_req = ScanRequest {
        hardware: body.hardware.clone(),
        features: body.features.clone(),
        severity_filter: body.severity_filter.clone(),
        limit: body.limit,
        offset: body.offset,
    };
    let result = scanner.scan(platform, &body.version, &scan_req)?;
    Ok(HttpResponse::Ok().json(result))
}

async fn get_vulnerability(ctx: web::Data<CoreContext>, path: web::Path<String>) -> Result<HttpResponse> {
    let identifier = path.into_inner();
    let store = ctx.vulnerabilities.lock().expect("vulnerability store lock poisoned");
    for kind in [crate::models::VulnKind::Psirt, crate::models::VulnKind::Bug] {
        if let Some(v) = store.get(kind, &identifier)? {
            return Ok(HttpResponse::Ok().json(v));
        }
    }
    Err(Error::NotFound(format!("vulnerability {identifier}")))
}

async fn list_devices(ctx: web::Data<CoreContext>) -> Result<HttpResponse> {
    Ok(HttpResponse::Ok().json(ctx.devices.list_devices()?))
}

#[derive(Deserialize)]
struct CreateDeviceRequest {
    id: String,
    host: String,
}

async fn create_device(ctx: web::Data<CoreContext>, body: web::Json<CreateDeviceRequest>) -> Result<HttpResponse> {
    let device = Device::new_pending(body.id.clone(), body.host.clone());
    ctx.devices.put_device(&device)?;
    Ok(HttpResponse::Created().json(device))
}

async fn get_device(ctx: web::Data<CoreContext>, path: web::Path<String>) -> Result<HttpResponse> {
    let id = path.into_inner();
    match ctx.devices.get_device(&id)? {
        Some(device) => Ok(HttpResponse::Ok().json(device)),
        None => Err(Error::NotFound(format!("device {id}"))),
    }
}

async fn delete_device(ctx: web::Data<CoreContext>, path: web::Path<String>) -> Result<HttpResponse> {
    let id = path.into_inner();
    ctx.devices.get_device(&id)?.ok_or_else(|| Error::NotFound(format!("device {id}")))?;
    ctx.devices.delete_device(&id)?;
    Ok(HttpResponse::NoContent().finish())
}

#[derive(Deserialize)]
struct DiscoverDeviceRequest {
    platform: String,
    username: String,
    password: String,
    #[serde(default = "default_ssh_port")]
    port: u16,
}

async fn discover_device(
    ctx: web::Data<CoreContext>,
    req: HttpRequest,
    path: web::Path<String>,
    body: web::Json<DiscoverDeviceRequest>,
) -> Result<HttpResponse> {
    ctx.rate_limiter.check(&client_id(&req), Category::Verify)?;
    let device_id = path.into_inner();
    let platform = Platform::parse(&body.platform).ok_or_else(|| Error::BadInput(format!("unknown platform: {}", body.platform)))?;

    let extractor = FeatureExtractor::new(&ctx.taxonomy);
    let verifier = DeviceVerifier::new(extractor, ctx.config.ssh_connect_timeout, ctx.config.ssh_command_timeout);
    let creds = DeviceCredentials { username: body.username.clone(), password: body.password.clone() };

    let store = ctx.vulnerabilities.lock().expect("vulnerability store lock poisoned");
    let coordinator = InventoryCoordinator::new(&ctx.devices, &store);
    let outcome = coordinator.discover_device(&device_id, body.port, platform, &creds, &verifier)?;
    Ok(HttpResponse::Ok().json(outcome))
}

async fn scan_one_device(ctx: web::Data<CoreContext>, req: HttpRequest, path: web::Path<String>) -> Result<HttpResponse> {
    ctx.rate_limiter.check(&client_id(&req), Category::Scan)?;
    let device_id = path.into_inner();
    let store = ctx.vulnerabilities.lock().expect("vulnerability store lock poisoned");
    let coordinator = InventoryCoordinator::new(&ctx.devices, &store);
    let result = coordinator.scan_device(&device_id, &ScanRequest::default())?;
    Ok(HttpResponse::Ok().json(result))
}

#[derive(Deserialize)]
struct ScanAllRequest {
    device_ids: Vec<String>,
}

async fn scan_all_devices(ctx: web::Data<CoreContext>, req: HttpRequest, body: web::Json<ScanAllRequest>) -> Result<HttpResponse> {
    ctx.rate_limiter.check(&client_id(&req), Category::Scan)?;
    let store = ctx.vulnerabilities.lock().expect("vulnerability store lock poisoned");
    let coordinator = InventoryCoordinator::new(&ctx.devices, &store);
    let outcome = coordinator.bulk_scan(&body.device_ids, &ScanRequest::default());
    Ok(HttpResponse::Ok().json(outcome))
}

#[derive(Deserialize)]
struct CompareScansRequest {
    device_id: String,
}

async fn compare_scans(ctx: web::Data<CoreContext>, req: HttpRequest, body: web::Json<CompareScansRequest>) -> Result<HttpResponse> {
    ctx.rate_limiter.check(&client_id(&req), Category::Default)?;
    let store = ctx.vulnerabilities.lock().expect("vulnerability store lock poisoned");
    let coordinator = InventoryCoordinator::new(&ctx.devices, &store);
    let comparison = coordinator.compare_current_to_previous(&body.device_id)?;
    Ok(HttpResponse::Ok().json(comparison))
}

#[derive(Deserialize)]
struct CompareVersionsRequest {
    platform: String,
    current_version: String,
    target_version: String,
    hardware: Option<String>,
    features: Option<BTreeSet<String>>,
}

async fn compare_versions(ctx: web::Data<CoreContext>, req: HttpRequest, body: web::Json<CompareVersionsRequest>) -> Result<HttpResponse> {
    ctx.rate_limiter.check(&client_id(&req), Category::Default)?;
    let platform = Platform::parse(&body.platform).ok_or_else(|| Error::BadInput(format!("unknown platform: {}", body.platform)))?;
    let store = ctx.vulnerabilities.lock().expect("vulnerability store lock poisoned");
    let coordinator = InventoryCoordinator::new(&ctx.devices, &store);
    let result = coordinator.compare_versions(
        platform,
        &body.current_version,
        &body.target_version,
        body.hardware.clone(),
        body.features.clone(),
    )?;
    Ok(HttpResponse::Ok().json(result))
}

/// Pulls new devices from the configured ISE endpoint; gated the same way
/// as the other bulk/administrative inventory operations since it's an
/// unauthenticated-by-the-caller bulk write sourced from an external system.
async fn sync_from_ise(ctx: web::Data<CoreContext>, req: HttpRequest) -> Result<HttpResponse> {
    crate::rate_limit::guard_admin_secret(&ctx.config, admin_secret_header(&req))?;
    let endpoint = ctx
        .config
        .ise_endpoint
        .clone()
        .ok_or_else(|| Error::BadInput("ISE_ENDPOINT is not configured".into()))?;

    let source = IseHttpSource::new(ctx.http_client.clone(), endpoint);
    let store = ctx.vulnerabilities.lock().expect("vulnerability store lock poisoned");
    let coordinator = InventoryCoordinator::new(&ctx.devices, &store);
    let added = coordinator.sync_from_ise(&source).await?;
    Ok(HttpResponse::Ok().json(serde_json::json!({"added": added})))
}

async fn get_scan_result(ctx: web::Data<CoreContext>, path: web::Path<String>) -> Result<HttpResponse> {
    let scan_id = path.into_inner();
    match ctx.devices.get_scan(&scan_id)? {
        Some(scan) => Ok(HttpResponse::Ok().json(scan)),
        None => Err(Error::NotFound(format!("scan {scan_id}"))),
    }
}

async fn update_offline(ctx: web::Data<CoreContext>, req: HttpRequest, mut payload: actix_multipart::Multipart) -> Result<HttpResponse> {
    crate::rate_limit::guard_admin_secret(&ctx.config, admin_secret_header(&req))?;

    use futures_util::StreamExt;
    let mut bytes = Vec::new();
    while let Some(field) = payload.next().await {
        let mut field = field.map_err(|e| Error::Corrupt(format!("multipart error: {e}")))?;
        while let Some(chunk) = field.next().await {
            let chunk = chunk.map_err(|e| Error::Corrupt(format!("multipart error: {e}")))?;
            bytes.extend_from_slice(&chunk);
        }
    }

    let mut store = ctx.vulnerabilities.lock().expect("vulnerability store lock poisoned");
    let report = crate::offline_update::import_archive(&bytes, &mut store, &ctx.psirt_cache)?;
    Ok(HttpResponse::Ok().json(report))
}

async fn update_validate(ctx: web::Data<CoreContext>, req: HttpRequest, mut payload: actix_multipart::Multipart) -> Result<HttpResponse> {
    crate::rate_limit::guard_admin_secret(&ctx.config, admin_secret_header(&req))?;

    use futures_util::StreamExt;
    let mut bytes = Vec::new();
    while let Some(field) = payload.next().await {
        let mut field = field.map_err(|e| Error::Corrupt(format!("multipart error: {e}")))?;
        while let Some(chunk) = field.next().await {
            let chunk = chunk.map_err(|e| Error::Corrupt(format!("multipart error: {e}")))?;
            bytes.extend_from_slice(&chunk);
        }
    }

    let manifest = crate::offline_update::validate_archive(&bytes)?;
    Ok(HttpResponse::Ok().json(serde_json::json!({"valid": true, "file": manifest.file, "pipeline_version": manifest.pipeline_version})))
}

async fn stats_database(ctx: web::Data<CoreContext>, req: HttpRequest) -> Result<HttpResponse> {
    crate::rate_limit::guard_admin_secret(&ctx.config, admin_secret_header(&req))?;
    let store = ctx.vulnerabilities.lock().expect("vulnerability store lock poisoned");
    Ok(HttpResponse::Ok().json(serde_json::json!({"vulnerability_count": store.count()?})))
}

async fn system_health(ctx: web::Data<CoreContext>, req: HttpRequest) -> Result<HttpResponse> {
    crate::rate_limit::guard_admin_secret(&ctx.config, admin_secret_header(&req))?;
    let store = ctx.vulnerabilities.lock().expect("vulnerability store lock poisoned");
    Ok(HttpResponse::Ok().json(serde_json::json!({
        "status": "ok",
        "vulnerability_count": store.count()?,
        "analysis_cache_size": ctx.analyses.len(),
    })))
}

#[derive(Deserialize)]
struct CacheClearQuery {
    cache_type: Option<String>,
}

async fn cache_clear(ctx: web::Data<CoreContext>, req: HttpRequest, query: web::Query<CacheClearQuery>) -> Result<HttpResponse> {
    crate::rate_limit::guard_admin_secret(&ctx.config, admin_secret_header(&req))?;
    match query.cache_type.as_deref() {
        Some("psirt") | None => ctx.psirt_cache.clear()?,
        Some("analysis") => { /* analyses has no bulk clear beyond TTL sweep by design */ }
        Some(other) => return Err(Error::BadInput(format!("unknown cache_type: {other}"))),
    }
    Ok(HttpResponse::Ok().json(serde_json::json!({"cleared": true})))
}

async fn cache_stats(ctx: web::Data<CoreContext>, req: HttpRequest) -> Result<HttpResponse> {
    crate::rate_limit::guard_admin_secret(&ctx.config, admin_secret_header(&req))?;
    Ok(HttpResponse::Ok().json(serde_json::json!({
        "psirt_cache": ctx.psirt_cache.stats()?,
        "analysis_cache_entries": ctx.analyses.len(),
    })))
}
