//! Read-only HTTP surface over the task table and the result backend.

use std::{sync::Arc, time::Duration};

use axum::{
    Json, Router,
    extract::{Path, State},
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use test_system_broker::results::ResultStore;
use test_system_shared::{
    config::SchedulerConfig, constants::API_VERSION, models::TaskResultResponse, state::TaskState,
};
use tracing::warn;

use crate::storage::TaskStorage;

const RESULT_FETCH_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Clone)]
pub struct ApiState {
    pub config: Arc<SchedulerConfig>,
    pub storage: Arc<TaskStorage>,
    pub results: Arc<ResultStore>,
}

#[must_use]
pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/tasks/:task_id/result", get(get_task_result))
        .with_state(state)
}

/// Verifies the `Bearer` token against the configured secret and algorithm.
fn authenticate(headers: &HeaderMap, config: &SchedulerConfig) -> Result<(), Response> {
    let header_value = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();
    // The token is the part after the last whitespace, tolerating a doubled
    // scheme prefix.
    let token = header_value.rsplit(' ').next().unwrap_or_default();

    let algorithm = config
        .hashing_algorithm
        .parse::<Algorithm>()
        .unwrap_or(Algorithm::HS256);
    let mut validation = Validation::new(algorithm);
    validation.required_spec_claims = std::collections::HashSet::new();

    match jsonwebtoken::decode::<serde_json::Value>(
        token,
        &DecodingKey::from_secret(config.jwt_secret.as_bytes()),
        &validation,
    ) {
        Ok(_) => Ok(()),
        Err(error) => {
            warn!(error = %error, "could not validate credentials");
            Err(unauthorized())
        }
    }
}

fn unauthorized() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        [(header::WWW_AUTHENTICATE, "Bearer")],
        Json(serde_json::json!({"detail": "Could not validate credentials"})),
    )
        .into_response()
}

/// Task state plus, best-effort, the reported result value. When the result
/// backend does not answer within the timeout only the stored state is
/// returned.
pub async fn get_task_result(
    State(state): State<ApiState>,
    Path(task_id): Path<String>,
    headers: HeaderMap,
) -> Response {
    if let Err(response) = authenticate(&headers, &state.config) {
        return response;
    }

    match state
        .results
        .fetch_with_timeout(&task_id, RESULT_FETCH_TIMEOUT)
        .await
    {
        Ok(record) => Json(TaskResultResponse {
            state: record.state.to_string(),
            result: record.result,
            api_version: API_VERSION.to_owned(),
        })
        .into_response(),
        Err(error) => {
            warn!(task_id = %task_id, error = %error, "result backend fetch failed");
            let stored = state
                .storage
                .task_status(&task_id)
                .ok()
                .flatten()
                .unwrap_or_else(|| TaskState::Pending.as_str().to_owned());
            Json(TaskResultResponse {
                state: stored,
                result: None,
                api_version: API_VERSION.to_owned(),
            })
            .into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use axum::http::HeaderValue;
    use jsonwebtoken::{EncodingKey, Header, encode};
    use object_store::memory::InMemory;

    use super::*;

    fn config() -> Arc<SchedulerConfig> {
        Arc::new(
            serde_yaml::from_str(
                r"
rabbitmq_host: broker.local
rabbitmq_user: guest
rabbitmq_password: guest
rabbitmq_vhost: test_system
s3_access_key_id: key
s3_secret_access_key: secret
s3_bucket: artifacts
s3_region: eu-north-1
jwt_secret: s3cret
bs_host: https://bs.local
bs_tasks_endpoint: /tasks
bs_token: token
",
            )
            .unwrap(),
        )
    }

    fn api_state() -> ApiState {
        ApiState {
            config: config(),
            storage: Arc::new(TaskStorage::open_in_memory().unwrap()),
            results: Arc::new(ResultStore::with_store(
                Arc::new(InMemory::new()),
                "task_result_backend/".to_owned(),
            )),
        }
    }

    fn bearer(secret: &str) -> HeaderMap {
        let token = encode(
            &Header::default(),
            &serde_json::json!({"email": "user@example.invalid"}),
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap();
        let mut headers = HeaderMap::new();
        headers.insert(
            header::AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {token}")).unwrap(),
        );
        headers
    }

    #[tokio::test]
    async fn missing_token_is_unauthorized() {
        let response = get_task_result(
            State(api_state()),
            Path("t-1".to_owned()),
            HeaderMap::new(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            response.headers().get(header::WWW_AUTHENTICATE).unwrap(),
            "Bearer"
        );
    }

    #[tokio::test]
    async fn wrong_secret_is_unauthorized() {
        let response =
            get_task_result(State(api_state()), Path("t-1".to_owned()), bearer("wrong")).await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn valid_token_reads_the_reported_state() {
        let state = api_state();
        state
            .results
            .write_state("t-1", TaskState::Success, None)
            .await
            .unwrap();

        let response =
            get_task_result(State(state), Path("t-1".to_owned()), bearer("s3cret")).await;
        assert_eq!(response.status(), StatusCode::OK);
    }
}
