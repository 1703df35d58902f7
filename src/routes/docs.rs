use axum::Router;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use crate::{services::documentation::ApiDoc, state::SharedState};

/// Path of the generated OpenAPI document.
pub const OPENAPI_PATH: &str = "/api-doc/openapi.json";

/// Swagger UI on `/docs`, reading the document served at [`OPENAPI_PATH`].
pub fn router(state: SharedState) -> Router<SharedState> {
    let ui: Router<SharedState> = SwaggerUi::new("/docs").url(OPENAPI_PATH, ApiDoc::openapi()).into();
    ui.with_state(state)
}

#[cfg(test)]
mod tests {
    use axum::{
        body::Body,
        http::{Request, StatusCode},
    };
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    use super::OPENAPI_PATH;
    use crate::{config::AppConfig, routes, state::AppState};

    #[tokio::test]
    async fn openapi_document_lists_the_live_routes() {
        let app = routes::router(AppState::with_local_hub(AppConfig::default()));
        let response = app
            .oneshot(Request::builder().uri(OPENAPI_PATH).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = response.into_body().collect().await.unwrap().to_bytes();
        let doc: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert!(doc["paths"]["/live/buzzer/arm"].is_object());
    }
}
