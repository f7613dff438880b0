//! `GET /`: the workbench HTML shell.

use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::Response;
use serde_json::json;

use crate::error::ApiError;
use crate::AppState;

/// Placeholder in the HTML template replaced with the configuration blob.
const WEB_CONFIG_PLACEHOLDER: &str = "{{WORKBENCH_WEB_CONFIGURATION}}";

/// CSP applied to the workbench page.
const CONTENT_SECURITY_POLICY: &str = "require-trusted-types-for 'script'";

pub async fn workbench(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let template_path = state.config.app_root.join("workbench.html");
    let template = tokio::fs::read_to_string(&template_path).await.map_err(|err| {
        tracing::error!(path = %template_path.display(), %err, "workbench template unreadable");
        ApiError::not_found("workbench template not found")
    })?;

    let authority = super::derive_authority(
        headers.get(header::HOST).and_then(|v| v.to_str().ok()),
        headers.get("x-forwarded-proto").and_then(|v| v.to_str().ok()),
    )
    .unwrap_or_else(|| format!("localhost:{}", state.config.port));

    let web_config = json!({
        "remoteAuthority": authority,
        "welcomeBanner": state.config.welcome_banner,
    });
    let filled = template.replace(
        WEB_CONFIG_PLACEHOLDER,
        &escape_attribute(&web_config.to_string()),
    );

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/html; charset=utf-8")
        .header(header::CONTENT_SECURITY_POLICY, CONTENT_SECURITY_POLICY)
        .body(filled.into())
        .map_err(|_| ApiError::internal("response build failed"))
}

/// HTML-attribute escaping for the configuration blob.
fn escape_attribute(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            c => out.push(c),
        }
    }
    out
}
