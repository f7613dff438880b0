use std::path::PathBuf;

/// Gateway configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Port the HTTP/WebSocket listener binds to.
    pub port: u16,
    /// Root of the workbench installation: HTML template plus `static/` assets.
    pub app_root: PathBuf,
    /// Path to the extension-host worker binary the gateway forks.
    pub exthost_binary: PathBuf,
    /// Path handed to the worker as `--uriTransformerPath`.
    pub uri_transformer_path: PathBuf,
    /// Root of the built-in extensions shipped with the workbench.
    pub builtin_extensions_dir: PathBuf,
    /// Root of user-installed extensions.
    pub user_extensions_dir: PathBuf,
    /// Per-user data directory (settings, logs, storage).
    pub user_data_dir: PathBuf,
    /// Product commit the server was built from, if known.
    pub commit: Option<String>,
    /// Optional banner surfaced in the workbench configuration blob.
    pub welcome_banner: Option<String>,
    /// Log level forwarded to forked workers as `VSCODE_LOG_LEVEL`.
    pub log_level: String,
    /// NLS configuration JSON forwarded as `VSCODE_NLS_CONFIG`.
    pub nls_config: String,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Panics with a descriptive message if a required variable is missing.
    pub fn from_env() -> Self {
        let app_root = PathBuf::from(required_var("WORKBENCH_APP_ROOT"));
        Self {
            port: std::env::var("PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(8080),
            exthost_binary: optional_path("WORKBENCH_EXTHOST_BINARY")
                .unwrap_or_else(|| app_root.join("bin").join("extension-host")),
            uri_transformer_path: optional_path("WORKBENCH_URI_TRANSFORMER")
                .unwrap_or_else(|| app_root.join("uri-transformer.js")),
            builtin_extensions_dir: optional_path("WORKBENCH_BUILTIN_EXTENSIONS")
                .unwrap_or_else(|| app_root.join("extensions")),
            user_extensions_dir: optional_path("WORKBENCH_USER_EXTENSIONS")
                .unwrap_or_else(|| default_user_dir().join("extensions")),
            user_data_dir: optional_path("WORKBENCH_USER_DATA")
                .unwrap_or_else(|| default_user_dir().join("data")),
            commit: std::env::var("WORKBENCH_COMMIT").ok().filter(|s| !s.is_empty()),
            welcome_banner: std::env::var("WORKBENCH_WELCOME_BANNER")
                .ok()
                .filter(|s| !s.is_empty()),
            log_level: std::env::var("WORKBENCH_LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            nls_config: std::env::var("VSCODE_NLS_CONFIG")
                .unwrap_or_else(|_| r#"{"locale":"en","availableLanguages":{}}"#.to_string()),
            app_root,
        }
    }
}

fn required_var(name: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| panic!("{name} env var is required"))
}

fn optional_path(name: &str) -> Option<PathBuf> {
    std::env::var(name)
        .ok()
        .filter(|s| !s.is_empty())
        .map(PathBuf::from)
}

fn default_user_dir() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
        .join(".workbench-server")
}
