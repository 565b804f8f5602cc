use crate::config::Listener as ListenerConfig;
use crate::message_log::{LogError, ReleaseMessageLog};
use crate::service::{NotificationService, NotifierError, PollOutcome, PollRequest};
use crate::types::{ClientNotification, ReleaseMessage};
use axum::{
    Json, Router,
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::net::TcpListener;

pub fn router(service: Arc<NotificationService>) -> Router {
    Router::new()
        .route("/notifications/v2", get(poll_handler))
        .route("/notifications/v2/queryactive", get(query_active_handler))
        .route(
            "/notifications/v2/queryactiveByNamespace",
            get(query_active_by_namespace_handler),
        )
        .route("/gray-releases/match", get(gray_release_handler))
        .route("/release-messages", post(publish_handler))
        .with_state(service)
}

pub async fn serve(
    listener: ListenerConfig,
    service: Arc<NotificationService>,
) -> Result<(), NotifierError> {
    let addr = format!("{}:{}", listener.host, listener.port);
    let listener = TcpListener::bind(addr).await?;
    tracing::info!(addr = %listener.local_addr()?, "notification api listening");
    serve_listener(listener, service).await
}

pub async fn serve_listener(
    listener: TcpListener,
    service: Arc<NotificationService>,
) -> Result<(), NotifierError> {
    axum::serve(listener, router(service)).await?;
    Ok(())
}

#[derive(Serialize)]
struct ApiErrorResponse {
    error_message: String,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct PollParams {
    app_id: String,
    cluster: String,
    notifications: String,
    data_center: Option<String>,
    ip: Option<String>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct QueryActiveParams {
    app_id: String,
    cluster_name: String,
    release_id: i64,
    data_center: Option<String>,
    ip: String,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct QueryActiveByNamespaceParams {
    app_id: String,
    cluster_name: String,
    namespace_name: String,
    data_center: Option<String>,
    ip: String,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct GrayReleaseParams {
    client_app_id: String,
    ip: String,
    app_id: String,
    cluster_name: String,
    namespace_name: String,
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
struct GrayReleaseMatch {
    release_id: Option<i64>,
}

#[derive(Deserialize, Debug)]
struct PublishBody {
    message: String,
}

async fn poll_handler(
    State(service): State<Arc<NotificationService>>,
    Query(params): Query<PollParams>,
) -> Result<Response, NotifierError> {
    let notifications: Vec<ClientNotification> = serde_json::from_str(&params.notifications)
        .map_err(|e| NotifierError::BadRequest(format!("invalid notifications: {e}")))?;

    let outcome = service
        .poll(PollRequest {
            app_id: params.app_id,
            cluster: params.cluster,
            notifications,
            data_center: params.data_center,
            client_ip: params.ip,
        })
        .await?;

    Ok(match outcome {
        PollOutcome::Notified(notifications) => (StatusCode::OK, Json(notifications)).into_response(),
        PollOutcome::NotModified => StatusCode::NOT_MODIFIED.into_response(),
    })
}

async fn query_active_handler(
    State(service): State<Arc<NotificationService>>,
    Query(params): Query<QueryActiveParams>,
) -> Json<bool> {
    Json(service.query_active_instance(
        &params.app_id,
        &params.cluster_name,
        params.release_id,
        params.data_center.as_deref(),
        &params.ip,
    ))
}

async fn query_active_by_namespace_handler(
    State(service): State<Arc<NotificationService>>,
    Query(params): Query<QueryActiveByNamespaceParams>,
) -> Json<bool> {
    Json(service.query_active_instance_by_namespace(
        &params.app_id,
        &params.cluster_name,
        &params.namespace_name,
        params.data_center.as_deref(),
        &params.ip,
    ))
}

async fn gray_release_handler(
    State(service): State<Arc<NotificationService>>,
    Query(params): Query<GrayReleaseParams>,
) -> Json<GrayReleaseMatch> {
    Json(GrayReleaseMatch {
        release_id: service.find_gray_release_id(
            &params.client_app_id,
            &params.ip,
            &params.app_id,
            &params.cluster_name,
            &params.namespace_name,
        ),
    })
}

async fn publish_handler(
    State(service): State<Arc<NotificationService>>,
    Json(body): Json<PublishBody>,
) -> Result<Json<ReleaseMessage>, NotifierError> {
    let message = service.log().append(&body.message).await?;
    tracing::info!(id = message.id, content = %message.content, "release message appended");
    Ok(Json(message))
}

impl IntoResponse for NotifierError {
    fn into_response(self) -> Response {
        let status = match &self {
            NotifierError::BadRequest(_) => StatusCode::BAD_REQUEST,
            NotifierError::Log(LogError::InvalidContent(_)) => StatusCode::BAD_REQUEST,
            NotifierError::Log(LogError::Unavailable(_)) => StatusCode::SERVICE_UNAVAILABLE,
            NotifierError::InvalidConfig(_) | NotifierError::Io(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        }

        let body = Json(ApiErrorResponse {
            error_message: self.to_string(),
        });

        (status, body).into_response()
    }
}
