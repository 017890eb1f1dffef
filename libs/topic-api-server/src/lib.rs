mod error;
mod http;
mod query;

use std::sync::Arc;

use axum::Router;
use axum::extract::State;
use axum::routing::get;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

pub use error::ApiError;
pub use query::{EndpointConfig, EndpointView, QueryService};

#[derive(Clone)]
pub(crate) struct AppState {
    query: Arc<QueryService>,
}

/// HTTP маршруты: по одному `GET` на endpoint + `GET /api/topics`.
pub fn router(query: Arc<QueryService>) -> Router {
    let mut app = Router::new().route("/api/topics", get(http::handle_list_topics));

    for endpoint in query.endpoints() {
        let topic = endpoint.topic.clone();
        app = app.route(
            &endpoint.path,
            get(move |State(state): State<AppState>| async move {
                http::render_endpoint(&state, &topic)
            }),
        );
    }

    app.with_state(AppState { query })
}

/// Занять порт API. Ошибка здесь фатальна для сервера.
pub async fn bind(port: u16) -> Result<TcpListener, ApiError> {
    TcpListener::bind(format!("0.0.0.0:{port}"))
        .await
        .map_err(|source| ApiError::Bind { port, source })
}

/// Обслуживать запросы до отмены `shutdown`.
pub async fn serve(
    listener: TcpListener,
    app: Router,
    shutdown: CancellationToken,
) -> Result<(), ApiError> {
    if let Ok(addr) = listener.local_addr() {
        tracing::info!(%addr, "api server listening");
    }
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await
        .map_err(ApiError::Serve)?;
    tracing::info!("api server stopped");
    Ok(())
}

/// Query Service HTTP API: bind + serve.
pub async fn run(
    port: u16,
    query: Arc<QueryService>,
    shutdown: CancellationToken,
) -> Result<(), ApiError> {
    let listener = bind(port).await?;
    serve(listener, router(query), shutdown).await
}
