use axum::routing::get;
use axum::Router;

use crate::AppState;

use super::{assets, workbench};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(workbench::workbench))
        .route("/static/{*path}", get(assets::static_asset))
        .route("/vscode-remote-resource", get(assets::remote_resource))
        .route("/favicon.ico", get(assets::favicon))
        .route("/manifest.json", get(assets::manifest))
        .fallback(assets::no_matching_request)
}
