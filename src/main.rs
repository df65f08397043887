//! Binary entry point. Builds the `CoreContext` composition
//! root from the process environment and serves the HTTP API over actix-web.

use actix_web::{web, App, HttpServer};
use cisco_vuln_scanner::config::ServiceConfig;
use cisco_vuln_scanner::context::CoreContext;
use cisco_vuln_scanner::models::LabeledExemplar;
use std::io::BufRead;

fn load_exemplars(path: &str) -> std::io::Result<Vec<LabeledExemplar>> {
    let file = match std::fs::File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::warn!(path, "exemplar corpus file not found, starting with an empty vector store");
            return Ok(Vec::new());
        }
        Err(e) => return Err(e),
    };
    let reader = std::io::BufReader::new(file);
    let mut exemplars = Vec::new();
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<LabeledExemplar>(&line) {
            Ok(exemplar) => exemplars.push(exemplar),
            Err(e) => tracing::warn!(error = %e, "skipping malformed exemplar corpus line"),
        }
    }
    Ok(exemplars)
}

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = ServiceConfig::from_env().map_err(|e| std::io::Error::other(e.to_string()))?;
    let bind_addr = config.bind_addr.clone();
    let exemplar_corpus_path = config.exemplar_corpus_path.clone();

    let ctx = CoreContext::build(config).map_err(|e| std::io::Error::other(e.to_string()))?;

    let exemplars = load_exemplars(&exemplar_corpus_path)?;
    if !exemplars.is_empty() {
        ctx.rebuild_vector_index(&exemplars).map_err(|e| std::io::Error::other(e.to_string()))?;
        tracing::info!(count = exemplars.len(), "loaded exemplar corpus into vector store");
    }

    let ctx = web::Data::new(ctx);

    tracing::info!(%bind_addr, "starting cisco-vuln-scanner");
    HttpServer::new(move || {
        App::new()
            .app_data(ctx.clone())
            .app_data(web::PayloadConfig::new(64 * 1024 * 1024))
            .configure(cisco_vuln_scanner::http::configure)
    })
    .bind(&bind_addr)?
    .run()
    .await
}
