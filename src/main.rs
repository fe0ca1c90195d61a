//! Taxonomy Engine - builds concept taxonomies from spreadsheets and grows
//! them with extracted concepts.

mod builder;
mod concept;
mod config;
mod definition;
mod error;
mod index;
mod node;
mod ollama;
mod openrouter;
mod service;
mod sheet_parser;
mod sqlite_index;
mod store;
mod supabase;
mod taxonomy;
mod tree;

use axum::{
    extract::{DefaultBodyLimit, Multipart, Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Json},
    routing::{get, post},
    Router,
};
use concept::Concept;
use config::{Settings, StoreKind};
use definition::LlmDefinitionGenerator;
use error::TaxonomyError;
use index::{IndexProvider, InMemoryVectorStore};
use ollama::OllamaEmbedder;
use openrouter::OpenRouterClient;
use service::{TaxonomyService, TaxonomySummary, UploadSummary};
use sqlite_index::SqliteVectorStore;
use std::sync::Arc;
use store::{FileTaxonomyStore, InMemoryTaxonomyStore, TaxonomyStore};
use supabase::SupabaseTaxonomyStore;
use taxonomy::{Engine, InsertAttemptResult};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

/// Application state shared across handlers.
#[derive(Clone)]
struct AppState {
    service: TaxonomyService,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| "taxonomy_engine=debug,tower_http=debug".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let settings = Settings::from_env()?;

    let store: Arc<dyn TaxonomyStore> = match settings.store {
        StoreKind::File => Arc::new(FileTaxonomyStore::open(&settings.data_dir)?),
        StoreKind::Memory => {
            warn!("Using in-memory taxonomy store; taxonomies are lost on restart");
            Arc::new(InMemoryTaxonomyStore::new())
        }
        StoreKind::Supabase => Arc::new(SupabaseTaxonomyStore::from_env()?),
    };

    let embedder = Arc::new(OllamaEmbedder::new(
        &settings.ollama_url,
        settings.embedding_model.clone(),
    ));
    info!(
        "Embedding with {} at {}",
        settings.embedding_model, settings.ollama_url
    );

    let indexes: Arc<dyn IndexProvider> = match settings.store {
        StoreKind::Memory => {
            warn!("Using in-memory vector index; it is rebuilt from each taxonomy on first use");
            Arc::new(InMemoryVectorStore::new(embedder))
        }
        StoreKind::File | StoreKind::Supabase => {
            Arc::new(SqliteVectorStore::open(&settings.index_path, embedder)?)
        }
    };

    let openrouter = OpenRouterClient::from_env()?
        .with_model(settings.definition_model.clone())
        .with_temperature(settings.definition_temperature);
    info!("OpenRouter client initialized");

    let engine = Engine {
        store,
        indexes,
        thresholds: settings.thresholds,
        timeouts: settings.timeouts.clone(),
    };
    let state = AppState {
        service: TaxonomyService::new(engine, Arc::new(LlmDefinitionGenerator::new(openrouter)))
            .with_cache_capacity(settings.cache_capacity),
    };

    // Build router
    let app = Router::new()
        .route("/health", get(health))
        .route("/taxonomies", post(upload_taxonomy))
        .route("/taxonomies/:id", get(get_taxonomy))
        .route("/taxonomies/:id/concepts", post(insert_concept))
        .route("/taxonomies/:id/display", get(display_taxonomy))
        .route("/taxonomies/:id/export", get(export_taxonomy))
        .layer(DefaultBodyLimit::max(100 * 1024 * 1024)) // 100MB
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state);

    // Run server
    let listener = tokio::net::TcpListener::bind(&settings.bind).await?;
    info!("Server listening on http://{}", settings.bind);
    axum::serve(listener, app).await?;

    Ok(())
}

// ============================================================================
// Handlers
// ============================================================================

type ApiError = (StatusCode, String);

fn status_for(e: &TaxonomyError) -> StatusCode {
    match e {
        TaxonomyError::Validation(_) | TaxonomyError::Structural(_) | TaxonomyError::Format(_) => {
            StatusCode::BAD_REQUEST
        }
        TaxonomyError::NotFound(_) => StatusCode::NOT_FOUND,
        TaxonomyError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn api_error(e: TaxonomyError) -> ApiError {
    let status = status_for(&e);
    if status.is_server_error() {
        error!("Request failed: {}", e);
    }
    (status, e.to_string())
}

/// Health check endpoint.
async fn health() -> &'static str {
    "ok"
}

/// Upload a taxonomy spreadsheet and build it.
async fn upload_taxonomy(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<UploadSummary>, ApiError> {
    let mut filename = String::new();
    let mut file_data = Vec::new();

    while let Some(field) = multipart.next_field().await.map_err(|e| {
        (StatusCode::BAD_REQUEST, format!("Multipart error: {}", e))
    })? {
        if field.name() == Some("file") {
            filename = field.file_name().unwrap_or("taxonomy").to_string();
            file_data = field.bytes().await.map_err(|e| {
                (StatusCode::BAD_REQUEST, format!("Failed to read file: {}", e))
            })?.to_vec();
            break;
        }
    }

    if file_data.is_empty() {
        return Err((StatusCode::BAD_REQUEST, "No file uploaded".to_string()));
    }

    info!("Received file: {} ({} bytes)", filename, file_data.len());

    let summary = state
        .service
        .create_from_table(&filename, &file_data)
        .await
        .map_err(api_error)?;

    info!("Taxonomy created: {} ({} concepts)", summary.id, summary.n_concepts);
    Ok(Json(summary))
}

async fn get_taxonomy(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<TaxonomySummary>, ApiError> {
    state.service.get(id).await.map(Json).map_err(api_error)
}

/// Offer a concept for insertion.
async fn insert_concept(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(concept): Json<Concept>,
) -> Result<Json<InsertAttemptResult>, ApiError> {
    state
        .service
        .insert(id, &concept)
        .await
        .map(Json)
        .map_err(api_error)
}

async fn display_taxonomy(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<String, ApiError> {
    state.service.display(id).await.map_err(api_error)
}

/// Download the taxonomy as CSV.
async fn export_taxonomy(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let table = state.service.export(id).await.map_err(api_error)?;
    let disposition = format!("attachment; filename=\"{}\"", table.filename);
    Ok((
        [
            (header::CONTENT_TYPE, "text/csv; charset=utf-8".to_string()),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        table.data,
    ))
}
