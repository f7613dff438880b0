//! Extension scanning and the `extensions` management channel.
//!
//! Extensions are directories carrying a `package.json` manifest, rooted
//! either in the built-in tree shipped with the workbench or in the per-user
//! tree. Scanning is shared between the environment channel
//! (`scanExtensions`) and the management channel (`getInstalled`).

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::uri::UriComponents;

use super::fs::copy_dir_recursive;
use super::{ChannelError, EventStream, ServerChannel, SessionContext};

/// One discovered extension.
#[derive(Debug, Clone)]
pub struct ScannedExtension {
    /// `publisher.name`, lowercased.
    pub id: String,
    pub manifest: Value,
    pub path: PathBuf,
    pub is_builtin: bool,
}

impl ScannedExtension {
    /// Wire shape with the location URI rewritten outward.
    pub fn to_wire(&self, ctx: &SessionContext) -> Value {
        let location = ctx
            .transformer
            .transform_outgoing(&UriComponents::file(self.path.to_string_lossy()));
        serde_json::json!({
            "identifier": { "id": self.id },
            "manifest": self.manifest,
            "location": location,
            "isBuiltin": self.is_builtin,
            "type": if self.is_builtin { 0 } else { 1 },
        })
    }
}

/// Scans the built-in and user extension roots.
#[derive(Clone)]
pub struct ExtensionScanner {
    builtin_dir: PathBuf,
    user_dir: PathBuf,
}

impl ExtensionScanner {
    pub fn new(builtin_dir: PathBuf, user_dir: PathBuf) -> Self {
        Self {
            builtin_dir,
            user_dir,
        }
    }

    pub fn user_dir(&self) -> &Path {
        &self.user_dir
    }

    pub async fn scan_all(&self) -> Vec<ScannedExtension> {
        let mut found = self.scan_root(&self.builtin_dir, true).await;
        found.extend(self.scan_root(&self.user_dir, false).await);
        found
    }

    pub async fn scan_user(&self) -> Vec<ScannedExtension> {
        self.scan_root(&self.user_dir, false).await
    }

    async fn scan_root(&self, root: &Path, is_builtin: bool) -> Vec<ScannedExtension> {
        let mut found = Vec::new();
        let Ok(mut entries) = tokio::fs::read_dir(root).await else {
            return found;
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            match Self::scan_one(&path, is_builtin).await {
                Ok(extension) => found.push(extension),
                Err(err) => {
                    tracing::debug!(path = %path.display(), %err, "skipping non-extension entry");
                }
            }
        }
        found.sort_by(|a, b| a.id.cmp(&b.id));
        found
    }

    /// Scan one candidate extension directory.
    pub async fn scan_one(path: &Path, is_builtin: bool) -> Result<ScannedExtension, ChannelError> {
        let manifest_path = path.join("package.json");
        let raw = tokio::fs::read(&manifest_path).await?;
        let manifest: Value = serde_json::from_slice(&raw)
            .map_err(|e| ChannelError::Failed(format!("bad manifest: {e}")))?;
        let publisher = manifest
            .get("publisher")
            .and_then(Value::as_str)
            .ok_or_else(|| ChannelError::Failed("manifest missing `publisher`".into()))?;
        let name = manifest
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| ChannelError::Failed("manifest missing `name`".into()))?;
        Ok(ScannedExtension {
            id: format!("{publisher}.{name}").to_lowercase(),
            manifest,
            path: path.to_path_buf(),
            is_builtin,
        })
    }
}

/// `extensions` channel: management operations over the user tree.
pub struct ExtensionManagementChannel {
    scanner: Arc<ExtensionScanner>,
}

impl ExtensionManagementChannel {
    pub fn new(scanner: Arc<ExtensionScanner>) -> Self {
        Self { scanner }
    }
}

#[async_trait]
impl ServerChannel for ExtensionManagementChannel {
    async fn call(
        &self,
        ctx: &SessionContext,
        command: &str,
        args: Value,
        _cancel: CancellationToken,
    ) -> Result<Value, ChannelError> {
        match command {
            "getInstalled" => {
                let wire: Vec<Value> = self
                    .scanner
                    .scan_all()
                    .await
                    .iter()
                    .map(|e| e.to_wire(ctx))
                    .collect();
                Ok(Value::Array(wire))
            }
            "installFromLocation" => {
                let location: UriComponents =
                    serde_json::from_value(args.get("location").cloned().unwrap_or(Value::Null))
                        .map_err(|e| ChannelError::BadArgs(e.to_string()))?;
                let source = PathBuf::from(ctx.transformer.transform_incoming(&location).path);
                let extension = ExtensionScanner::scan_one(&source, false).await?;
                let target = self.scanner.user_dir().join(&extension.id);
                copy_dir_recursive(&source, &target).await?;
                let installed = ExtensionScanner::scan_one(&target, false).await?;
                Ok(installed.to_wire(ctx))
            }
            "uninstall" => {
                let id = args
                    .get("identifier")
                    .and_then(|i| i.get("id"))
                    .and_then(Value::as_str)
                    .ok_or_else(|| ChannelError::BadArgs("missing `identifier.id`".into()))?
                    .to_lowercase();
                let installed = self.scanner.scan_user().await;
                let Some(found) = installed.iter().find(|e| e.id == id) else {
                    return Err(ChannelError::Failed(format!("extension `{id}` is not installed")));
                };
                tokio::fs::remove_dir_all(&found.path).await?;
                Ok(Value::Null)
            }
            other => Err(ChannelError::UnknownCommand(other.to_string())),
        }
    }

    fn listen(
        &self,
        _ctx: &SessionContext,
        event: &str,
        _args: Value,
        _cancel: CancellationToken,
    ) -> Result<EventStream, ChannelError> {
        Err(ChannelError::UnknownEvent(event.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn write_extension(root: &Path, publisher: &str, name: &str) -> PathBuf {
        let dir = root.join(format!("{publisher}.{name}"));
        tokio::fs::create_dir_all(&dir).await.unwrap();
        let manifest = serde_json::json!({
            "publisher": publisher,
            "name": name,
            "version": "1.0.0",
            "engines": { "vscode": "^1.80.0" },
        });
        tokio::fs::write(dir.join("package.json"), manifest.to_string())
            .await
            .unwrap();
        dir
    }

    #[tokio::test]
    async fn scans_both_roots() {
        let builtin = tempfile::tempdir().unwrap();
        let user = tempfile::tempdir().unwrap();
        write_extension(builtin.path(), "ms", "theme").await;
        write_extension(user.path(), "acme", "linter").await;
        // A stray file is not an extension.
        tokio::fs::write(user.path().join("notes.txt"), "x").await.unwrap();

        let scanner = ExtensionScanner::new(
            builtin.path().to_path_buf(),
            user.path().to_path_buf(),
        );
        let found = scanner.scan_all().await;
        assert_eq!(found.len(), 2);
        let theme = found.iter().find(|e| e.id == "ms.theme").unwrap();
        assert!(theme.is_builtin);
        let linter = found.iter().find(|e| e.id == "acme.linter").unwrap();
        assert!(!linter.is_builtin);
    }

    #[tokio::test]
    async fn install_and_uninstall_round_trip() {
        let user = tempfile::tempdir().unwrap();
        let staging = tempfile::tempdir().unwrap();
        let source = write_extension(staging.path(), "acme", "tool").await;

        let scanner = Arc::new(ExtensionScanner::new(
            PathBuf::from("/nonexistent"),
            user.path().to_path_buf(),
        ));
        let channel = ExtensionManagementChannel::new(scanner.clone());
        let ctx = SessionContext::new("localhost:8080".into(), "tok".into());

        let location = ctx
            .transformer
            .transform_outgoing(&UriComponents::file(source.to_string_lossy()));
        let installed = channel
            .call(
                &ctx,
                "installFromLocation",
                serde_json::json!({ "location": location }),
                CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(installed["identifier"]["id"], "acme.tool");
        assert_eq!(scanner.scan_user().await.len(), 1);

        channel
            .call(
                &ctx,
                "uninstall",
                serde_json::json!({ "identifier": { "id": "acme.tool" } }),
                CancellationToken::new(),
            )
            .await
            .unwrap();
        assert!(scanner.scan_user().await.is_empty());
    }
}
