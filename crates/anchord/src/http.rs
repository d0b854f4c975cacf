//! REST surface of the face service.
//!
//! Routes are mounted under `/api/v1/face`; errors are returned as
//! `{"detail": "<message>"}`.

use std::collections::HashMap;
use std::path::Path;

use anchor_core::{Embedding, NewPerson, Person, PersonId, PersonPatch};
use axum::extract::multipart::{MultipartError, MultipartRejection};
use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{DefaultBodyLimit, Multipart, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post, put};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;

use crate::service::{FaceService, ScanOutcome, ServiceError};
use crate::storage::StorageError;

/// An error response with its HTTP status.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    detail: String,
}

impl ApiError {
    fn bad_request(detail: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            detail: detail.into(),
        }
    }

    /// Map a service failure onto the status taxonomy. Unexpected failures
    /// become 500 with the cause surfaced as `Failed to <action>: <cause>`.
    fn from_service(action: &str, err: ServiceError) -> Self {
        let status = match &err {
            ServiceError::InvalidInput(_)
            | ServiceError::NoFaceDetected
            | ServiceError::NoFaceInNewImage
            | ServiceError::NothingToUpdate
            | ServiceError::Storage(StorageError::NotAnImage) => StatusCode::BAD_REQUEST,
            ServiceError::PersonNotFound(_) => StatusCode::NOT_FOUND,
            ServiceError::Storage(_) | ServiceError::Store(_) | ServiceError::Provider(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(error = %err, "failed to {action}");
            Self {
                status,
                detail: format!("Failed to {action}: {err}"),
            }
        } else {
            Self {
                status,
                detail: err.to_string(),
            }
        }
    }
}

/// Extractor rejections keep their status but answer with a `detail` body.
macro_rules! rejection_into_api_error {
    ($($rejection:ty),+) => {
        $(
            impl From<$rejection> for ApiError {
                fn from(rejection: $rejection) -> Self {
                    Self {
                        status: rejection.status(),
                        detail: rejection.body_text(),
                    }
                }
            }
        )+
    };
}

rejection_into_api_error!(QueryRejection, JsonRejection, MultipartRejection, MultipartError);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "detail": self.detail }))).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

/// Collected multipart form: text fields plus the optional `image` file.
#[derive(Default)]
struct FormData {
    fields: HashMap<String, String>,
    image: Option<Vec<u8>>,
}

impl FormData {
    /// Oversized bodies surface as 413 through [`MultipartError::status`].
    async fn read(multipart: Result<Multipart, MultipartRejection>) -> ApiResult<Self> {
        let mut multipart = multipart?;
        let mut form = Self::default();
        while let Some(field) = multipart.next_field().await? {
            let Some(name) = field.name().map(str::to_string) else {
                continue;
            };
            if name == "image" {
                let bytes = field.bytes().await?;
                // An empty file part means no file was chosen.
                if !bytes.is_empty() {
                    form.image = Some(bytes.to_vec());
                }
            } else {
                let value = field.text().await?;
                form.fields.insert(name, value);
            }
        }
        Ok(form)
    }

    /// A present, non-empty text field. Empty values count as absent.
    fn optional(&mut self, name: &str) -> Option<String> {
        self.fields.remove(name).filter(|v| !v.is_empty())
    }

    fn required(&mut self, name: &str) -> ApiResult<String> {
        self.optional(name)
            .ok_or_else(|| ApiError::bad_request(format!("{name} is required")))
    }

    /// Parse an optional field; `expected` describes the accepted values.
    fn optional_parsed<T: std::str::FromStr>(
        &mut self,
        name: &str,
        expected: &str,
    ) -> ApiResult<Option<T>> {
        self.optional(name)
            .map(|raw| parse_field(name, &raw, expected))
            .transpose()
    }

    fn required_image(&mut self) -> ApiResult<Vec<u8>> {
        self.image
            .take()
            .ok_or_else(|| ApiError::bad_request("image is required"))
    }
}

fn parse_field<T: std::str::FromStr>(name: &str, raw: &str, expected: &str) -> ApiResult<T> {
    raw.trim()
        .parse()
        .map_err(|_| ApiError::bad_request(format!("{name} must be {expected}")))
}

#[derive(Debug, Deserialize)]
struct PairQuery {
    pair_id: String,
}

#[derive(Debug, Deserialize)]
struct PersonQuery {
    person_id: PersonId,
}

#[derive(Debug, Deserialize)]
struct ScanRequest {
    pair_id: String,
    embedding: Embedding,
}

#[derive(Debug, Serialize)]
struct PeopleList {
    people: Vec<Person>,
    count: usize,
}

#[derive(Debug, Serialize)]
struct SuccessResponse {
    success: bool,
    message: String,
}

/// Build the application router.
///
/// `storage_dir` is served read-only under `/images` so that public image
/// links resolve.
pub fn router(service: FaceService, storage_dir: &Path, max_upload_bytes: usize) -> Router {
    let face = Router::new()
        .route("/addPerson", post(add_person))
        .route("/getPeople", get(get_people))
        .route("/scan", post(scan))
        .route("/scanImage", post(scan_image))
        .route("/updatePerson", put(update_person))
        .route("/deletePerson", delete(delete_person));

    Router::new()
        .route("/health", get(health))
        .nest("/api/v1/face", face)
        .nest_service("/images", ServeDir::new(storage_dir))
        .layer(DefaultBodyLimit::max(max_upload_bytes))
        .layer(TraceLayer::new_for_http())
        .with_state(service)
}

/// GET /health
async fn health(State(service): State<FaceService>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "embedding_dim": service.embedding_dim(),
        "threshold": service.threshold(),
    }))
}

/// POST /addPerson
async fn add_person(
    State(service): State<FaceService>,
    multipart: Result<Multipart, MultipartRejection>,
) -> ApiResult<(StatusCode, Json<Person>)> {
    let mut form = FormData::read(multipart).await?;
    let person = NewPerson {
        pair_id: form.required("pair_id")?,
        name: form.required("name")?,
        relationship: form.required("relationship")?,
        occupation: form.required("occupation")?,
        age: form.optional_parsed("age", "a non-negative integer")?,
        notes: form.optional("notes"),
    };
    let image = form.required_image()?;

    let created = service
        .enroll(person, image)
        .await
        .map_err(|e| ApiError::from_service("add person", e))?;
    Ok((StatusCode::CREATED, Json(created)))
}

/// GET /getPeople?pair_id=...
async fn get_people(
    State(service): State<FaceService>,
    query: Result<Query<PairQuery>, QueryRejection>,
) -> ApiResult<Json<PeopleList>> {
    let Query(query) = query?;
    let people = service
        .list_people(&query.pair_id)
        .await
        .map_err(|e| ApiError::from_service("fetch people", e))?;
    let count = people.len();
    Ok(Json(PeopleList { people, count }))
}

/// POST /scan
async fn scan(
    State(service): State<FaceService>,
    request: Result<Json<ScanRequest>, JsonRejection>,
) -> ApiResult<Json<ScanOutcome>> {
    let Json(request) = request?;
    let outcome = service
        .scan_embedding(&request.pair_id, &request.embedding)
        .await
        .map_err(|e| ApiError::from_service("scan face", e))?;
    Ok(Json(outcome))
}

/// POST /scanImage
async fn scan_image(
    State(service): State<FaceService>,
    multipart: Result<Multipart, MultipartRejection>,
) -> ApiResult<Json<ScanOutcome>> {
    let mut form = FormData::read(multipart).await?;
    let pair_id = form.required("pair_id")?;
    let image = form.required_image()?;

    let outcome = service
        .scan_image(&pair_id, image)
        .await
        .map_err(|e| ApiError::from_service("scan face", e))?;
    Ok(Json(outcome))
}

/// PUT /updatePerson
async fn update_person(
    State(service): State<FaceService>,
    multipart: Result<Multipart, MultipartRejection>,
) -> ApiResult<Json<Person>> {
    let mut form = FormData::read(multipart).await?;
    let person_id: PersonId = parse_field("person_id", &form.required("person_id")?, "an integer")?;
    let patch = PersonPatch {
        name: form.optional("name"),
        relationship: form.optional("relationship"),
        occupation: form.optional("occupation"),
        age: form.optional_parsed("age", "a non-negative integer")?,
        notes: form.optional("notes"),
        image_url: None,
    };

    let updated = service
        .update(person_id, patch, form.image.take())
        .await
        .map_err(|e| ApiError::from_service("update person", e))?;
    Ok(Json(updated))
}

/// DELETE /deletePerson?person_id=...
async fn delete_person(
    State(service): State<FaceService>,
    query: Result<Query<PersonQuery>, QueryRejection>,
) -> ApiResult<Json<SuccessResponse>> {
    let Query(query) = query?;
    service
        .delete(query.person_id)
        .await
        .map_err(|e| ApiError::from_service("delete person", e))?;
    Ok(Json(SuccessResponse {
        success: true,
        message: format!("Person {} deleted successfully", query.person_id),
    }))
}
