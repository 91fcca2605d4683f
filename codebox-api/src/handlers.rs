use std::str::FromStr;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use tracing::error;
use uuid::Uuid;

use codebox_common::job::{JobRequest, JobStatus};
use codebox_common::ops::{JobOps, OpsError};

pub fn add_routes(router: Router, ops: JobOps) -> Router {
    router.merge(
        Router::new()
            .route("/", get(index))
            .route("/jobs", post(create_job).get(list_jobs))
            .route("/jobs/:job_id", get(get_job).delete(cancel_job))
            .route("/jobs/:job_id/logs", get(get_job_logs))
            .route("/queue/counts", get(queue_counts))
            .route("/queue/pending", delete(clear_pending))
            .with_state(ops),
    )
}

async fn index() -> &'static str {
    "codebox api"
}

fn internal_error(err: OpsError) -> (StatusCode, Json<serde_json::Value>) {
    error!("request failed: {}", err);
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({"error": "internal error"})),
    )
}

async fn create_job(
    State(ops): State<JobOps>,
    Json(request): Json<JobRequest>,
) -> (StatusCode, Json<serde_json::Value>) {
    match ops.enqueue(request).await {
        Ok(job_id) => (StatusCode::CREATED, Json(json!({"job_id": job_id}))),
        Err(OpsError::Validation(err)) => (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": err.to_string()})),
        ),
        Err(err) => internal_error(err),
    }
}

async fn get_job(
    State(ops): State<JobOps>,
    Path(job_id): Path<Uuid>,
) -> (StatusCode, Json<serde_json::Value>) {
    match ops.get(job_id).await {
        Ok(Some(snapshot)) => (
            StatusCode::OK,
            Json(serde_json::to_value(&snapshot).unwrap_or_default()),
        ),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(json!({"error": "job not found"})),
        ),
        Err(err) => internal_error(err),
    }
}

#[derive(Deserialize)]
struct ListParams {
    /// Comma-separated status filter, e.g. `?status=waiting,active`.
    status: Option<String>,
}

async fn list_jobs(
    State(ops): State<JobOps>,
    Query(params): Query<ListParams>,
) -> (StatusCode, Json<serde_json::Value>) {
    let statuses = match parse_statuses(params.status.as_deref()) {
        Ok(statuses) => statuses,
        Err(invalid) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({"error": format!("{invalid} is not a valid status")})),
            )
        }
    };

    match ops.list(&statuses).await {
        Ok(snapshots) => (
            StatusCode::OK,
            Json(serde_json::to_value(&snapshots).unwrap_or_default()),
        ),
        Err(err) => internal_error(err),
    }
}

fn parse_statuses(param: Option<&str>) -> Result<Vec<JobStatus>, String> {
    let Some(param) = param else {
        return Ok(vec![]);
    };
    param
        .split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(|part| JobStatus::from_str(part).map_err(|_| part.to_owned()))
        .collect()
}

async fn get_job_logs(
    State(ops): State<JobOps>,
    Path(job_id): Path<Uuid>,
) -> (StatusCode, Json<serde_json::Value>) {
    match ops.logs(job_id).await {
        Ok(records) => {
            let records: Vec<serde_json::Value> = records
                .iter()
                .map(|record| {
                    json!({
                        "type": record.kind.to_string(),
                        "content": record.content,
                        "timestamp": record.created_at,
                    })
                })
                .collect();
            (StatusCode::OK, Json(json!(records)))
        }
        Err(err) => internal_error(err),
    }
}

async fn cancel_job(
    State(ops): State<JobOps>,
    Path(job_id): Path<Uuid>,
) -> (StatusCode, Json<serde_json::Value>) {
    match ops.cancel(job_id).await {
        Ok(true) => (StatusCode::ACCEPTED, Json(json!({"cancelled": true}))),
        Ok(false) => (
            StatusCode::NOT_FOUND,
            Json(json!({"error": "job not found or already finished"})),
        ),
        Err(err) => internal_error(err),
    }
}

async fn queue_counts(State(ops): State<JobOps>) -> (StatusCode, Json<serde_json::Value>) {
    match ops.counts().await {
        Ok(counts) => (
            StatusCode::OK,
            Json(json!({
                "waiting": counts.waiting,
                "active": counts.active,
                "completed": counts.completed,
                "failed": counts.failed,
                "delayed": counts.delayed,
                "dead": counts.dead,
            })),
        ),
        Err(err) => internal_error(err),
    }
}

async fn clear_pending(State(ops): State<JobOps>) -> (StatusCode, Json<serde_json::Value>) {
    match ops.clear_pending().await {
        Ok(cleared) => (StatusCode::OK, Json(json!({"cleared": cleared}))),
        Err(err) => internal_error(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use codebox_common::pgqueue::PgQueue;
    use codebox_common::runtime::RuntimeCatalog;
    use codebox_common::store::PgJobStore;
    use http_body_util::BodyExt;
    use sqlx::PgPool;
    use std::sync::Arc;
    use tower::ServiceExt;

    fn app(db: PgPool) -> Router {
        let ops = JobOps::new(
            PgQueue::new_from_pool("test_api", db.clone()),
            Arc::new(PgJobStore::new_from_pool(db)),
            RuntimeCatalog::default(),
        );
        add_routes(Router::new(), ops)
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = response
            .into_body()
            .collect()
            .await
            .expect("failed to read body")
            .to_bytes();
        serde_json::from_slice(&bytes).expect("body is not valid JSON")
    }

    fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .expect("failed to build request")
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn test_submit_and_fetch_job(db: PgPool) {
        let app = app(db);

        let response = app
            .clone()
            .oneshot(post_json(
                "/jobs",
                serde_json::json!({
                    "submission_type": "raw_code",
                    "raw_code": "print('hi')",
                    "runtime": "python",
                }),
            ))
            .await
            .expect("request failed");
        assert_eq!(response.status(), StatusCode::CREATED);
        let body = body_json(response).await;
        let job_id = body["job_id"].as_str().expect("missing job_id").to_owned();

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri(format!("/jobs/{job_id}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .expect("request failed");
        assert_eq!(response.status(), StatusCode::OK);
        let snapshot = body_json(response).await;
        assert_eq!(snapshot["status"], "waiting");
        assert_eq!(snapshot["request"]["raw_code"], "print('hi')");

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/queue/counts")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .expect("request failed");
        let counts = body_json(response).await;
        assert_eq!(counts["waiting"], 1);
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn test_validation_failures_are_bad_requests(db: PgPool) {
        let app = app(db);

        // Over the timeout cap.
        let response = app
            .clone()
            .oneshot(post_json(
                "/jobs",
                serde_json::json!({
                    "submission_type": "raw_code",
                    "raw_code": "print('hi')",
                    "runtime": "python",
                    "timeout_ms": 300_001,
                }),
            ))
            .await
            .expect("request failed");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        // No source at all: the tagged union rejects it at the JSON layer.
        let response = app
            .clone()
            .oneshot(post_json(
                "/jobs",
                serde_json::json!({"runtime": "python"}),
            ))
            .await
            .expect("request failed");
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn test_unknown_job_is_not_found(db: PgPool) {
        let app = app(db);

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri(format!("/jobs/{}", Uuid::now_v7()))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .expect("request failed");
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn test_list_with_status_filter(db: PgPool) {
        let app = app(db);

        app.clone()
            .oneshot(post_json(
                "/jobs",
                serde_json::json!({
                    "submission_type": "git_repo",
                    "git_link": "https://example.com/repo.git",
                }),
            ))
            .await
            .expect("request failed");

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/jobs?status=waiting,active")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .expect("request failed");
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body.as_array().map(Vec::len), Some(1));

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/jobs?status=sideways")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .expect("request failed");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn test_cancel_and_clear_endpoints(db: PgPool) {
        let app = app(db);

        let response = app
            .clone()
            .oneshot(post_json(
                "/jobs",
                serde_json::json!({
                    "submission_type": "raw_code",
                    "raw_code": "print('hi')",
                    "runtime": "python",
                }),
            ))
            .await
            .expect("request failed");
        let job_id = body_json(response).await["job_id"]
            .as_str()
            .unwrap()
            .to_owned();

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("DELETE")
                    .uri(format!("/jobs/{job_id}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .expect("request failed");
        assert_eq!(response.status(), StatusCode::ACCEPTED);

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("DELETE")
                    .uri("/queue/pending")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .expect("request failed");
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["cleared"], 0);
    }
}
