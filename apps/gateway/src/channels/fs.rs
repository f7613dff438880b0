//! `remotefilesystem`: disk access for the workbench, URI-transformed per
//! session, with open-handle IO, watch streams, and a cancellable
//! `readFileStream`.

use std::collections::HashMap;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::UNIX_EPOCH;

use async_trait::async_trait;
use base64::Engine;
use notify::{RecursiveMode, Watcher};
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::uri::UriComponents;

use super::{ChannelError, EventStream, ServerChannel, SessionContext};

/// File type bits as the workbench encodes them.
const TYPE_FILE: u64 = 1;
const TYPE_DIRECTORY: u64 = 2;
const TYPE_SYMLINK: u64 = 64;

/// Change kinds for `filechange` events.
const CHANGE_UPDATED: u64 = 0;
const CHANGE_ADDED: u64 = 1;
const CHANGE_DELETED: u64 = 2;

/// Chunk size for `readFileStream`.
const STREAM_CHUNK: usize = 64 * 1024;

struct FsState {
    handles: tokio::sync::Mutex<HashMap<u64, tokio::fs::File>>,
    next_handle: AtomicU64,
    /// `filechange` senders, keyed by watch session id.
    streams: parking_lot::Mutex<HashMap<String, mpsc::UnboundedSender<Value>>>,
    /// Live watchers, keyed by `session|path`.
    watchers: parking_lot::Mutex<HashMap<String, notify::RecommendedWatcher>>,
}

pub struct RemoteFilesystemChannel {
    state: Arc<FsState>,
}

impl RemoteFilesystemChannel {
    pub fn new() -> Self {
        Self {
            state: Arc::new(FsState {
                handles: tokio::sync::Mutex::new(HashMap::new()),
                next_handle: AtomicU64::new(1),
                streams: parking_lot::Mutex::new(HashMap::new()),
                watchers: parking_lot::Mutex::new(HashMap::new()),
            }),
        }
    }
}

impl Default for RemoteFilesystemChannel {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ServerChannel for RemoteFilesystemChannel {
    async fn call(
        &self,
        ctx: &SessionContext,
        command: &str,
        args: Value,
        _cancel: CancellationToken,
    ) -> Result<Value, ChannelError> {
        match command {
            "stat" => {
                let path = resource_path(ctx, &args, "resource")?;
                stat_value(&path).await
            }
            "readdir" => {
                let path = resource_path(ctx, &args, "resource")?;
                let mut entries = tokio::fs::read_dir(&path).await.map_err(fs_error)?;
                let mut out = Vec::new();
                while let Some(entry) = entries.next_entry().await.map_err(fs_error)? {
                    let kind = entry
                        .file_type()
                        .await
                        .map(type_bits_of)
                        .unwrap_or(0);
                    out.push(serde_json::json!([entry.file_name().to_string_lossy(), kind]));
                }
                Ok(Value::Array(out))
            }
            "mkdir" => {
                let path = resource_path(ctx, &args, "resource")?;
                tokio::fs::create_dir(&path).await.map_err(fs_error)?;
                Ok(Value::Null)
            }
            "readFile" => {
                let path = resource_path(ctx, &args, "resource")?;
                let data = tokio::fs::read(&path).await.map_err(fs_error)?;
                Ok(serde_json::json!({
                    "data": base64::engine::general_purpose::STANDARD.encode(data),
                }))
            }
            "writeFile" => {
                let path = resource_path(ctx, &args, "resource")?;
                let data = base64_arg(&args, "data")?;
                let overwrite = args
                    .get("opts")
                    .and_then(|o| o.get("overwrite"))
                    .and_then(Value::as_bool)
                    .unwrap_or(true);
                if !overwrite && tokio::fs::try_exists(&path).await.unwrap_or(false) {
                    return Err(ChannelError::Failed(format!(
                        "EEXIST: file already exists: {}",
                        path.display()
                    )));
                }
                tokio::fs::write(&path, data).await.map_err(fs_error)?;
                Ok(Value::Null)
            }
            "open" => {
                let path = resource_path(ctx, &args, "resource")?;
                let create = args
                    .get("opts")
                    .and_then(|o| o.get("create"))
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
                let file = tokio::fs::OpenOptions::new()
                    .read(true)
                    .write(create)
                    .create(create)
                    .open(&path)
                    .await
                    .map_err(fs_error)?;
                let handle = self.state.next_handle.fetch_add(1, Ordering::Relaxed);
                self.state.handles.lock().await.insert(handle, file);
                Ok(Value::from(handle))
            }
            "close" => {
                let handle = u64_arg(&args, "handle")?;
                self.state.handles.lock().await.remove(&handle);
                Ok(Value::Null)
            }
            "read" => {
                let handle = u64_arg(&args, "handle")?;
                let pos = u64_arg(&args, "pos")?;
                let length = u64_arg(&args, "length")? as usize;
                let mut handles = self.state.handles.lock().await;
                let file = handles
                    .get_mut(&handle)
                    .ok_or_else(|| ChannelError::BadArgs(format!("unknown handle {handle}")))?;
                file.seek(SeekFrom::Start(pos)).await.map_err(fs_error)?;
                let mut buf = vec![0u8; length];
                let mut filled = 0usize;
                loop {
                    let n = file.read(&mut buf[filled..]).await.map_err(fs_error)?;
                    if n == 0 {
                        break;
                    }
                    filled += n;
                    if filled == length {
                        break;
                    }
                }
                buf.truncate(filled);
                Ok(serde_json::json!({
                    "bytesRead": filled,
                    "data": base64::engine::general_purpose::STANDARD.encode(buf),
                }))
            }
            "write" => {
                let handle = u64_arg(&args, "handle")?;
                let pos = u64_arg(&args, "pos")?;
                let data = base64_arg(&args, "data")?;
                let mut handles = self.state.handles.lock().await;
                let file = handles
                    .get_mut(&handle)
                    .ok_or_else(|| ChannelError::BadArgs(format!("unknown handle {handle}")))?;
                file.seek(SeekFrom::Start(pos)).await.map_err(fs_error)?;
                file.write_all(&data).await.map_err(fs_error)?;
                file.flush().await.map_err(fs_error)?;
                Ok(Value::from(data.len() as u64))
            }
            "delete" => {
                let path = resource_path(ctx, &args, "resource")?;
                let recursive = args
                    .get("opts")
                    .and_then(|o| o.get("recursive"))
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
                let metadata = tokio::fs::symlink_metadata(&path).await.map_err(fs_error)?;
                if metadata.is_dir() {
                    if recursive {
                        tokio::fs::remove_dir_all(&path).await.map_err(fs_error)?;
                    } else {
                        tokio::fs::remove_dir(&path).await.map_err(fs_error)?;
                    }
                } else {
                    tokio::fs::remove_file(&path).await.map_err(fs_error)?;
                }
                Ok(Value::Null)
            }
            "rename" => {
                let source = resource_path(ctx, &args, "source")?;
                let target = resource_path(ctx, &args, "target")?;
                check_overwrite(&args, &target).await?;
                tokio::fs::rename(&source, &target).await.map_err(fs_error)?;
                Ok(Value::Null)
            }
            "copy" => {
                let source = resource_path(ctx, &args, "source")?;
                let target = resource_path(ctx, &args, "target")?;
                check_overwrite(&args, &target).await?;
                let metadata = tokio::fs::metadata(&source).await.map_err(fs_error)?;
                if metadata.is_dir() {
                    copy_dir_recursive(&source, &target).await?;
                } else {
                    tokio::fs::copy(&source, &target).await.map_err(fs_error)?;
                }
                Ok(Value::Null)
            }
            "watch" => {
                let session = string_arg(&args, "session")?;
                let path = resource_path(ctx, &args, "resource")?;
                let recursive = args
                    .get("recursive")
                    .and_then(Value::as_bool)
                    .unwrap_or(true);
                self.start_watch(ctx, &session, &path, recursive)
            }
            "unwatch" => {
                let session = string_arg(&args, "session")?;
                let path = resource_path(ctx, &args, "resource")?;
                let key = watch_key(&session, &path);
                self.state.watchers.lock().remove(&key);
                Ok(Value::Null)
            }
            other => Err(ChannelError::UnknownCommand(other.to_string())),
        }
    }

    fn listen(
        &self,
        ctx: &SessionContext,
        event: &str,
        args: Value,
        cancel: CancellationToken,
    ) -> Result<EventStream, ChannelError> {
        match event {
            "filechange" => {
                let session = match &args {
                    Value::String(s) => s.clone(),
                    other => string_arg(other, "session")?,
                };
                let (tx, rx) = mpsc::unbounded_channel();
                self.state.streams.lock().insert(session.clone(), tx);
                let state = self.state.clone();
                tokio::spawn(async move {
                    cancel.cancelled().await;
                    state.streams.lock().remove(&session);
                    let prefix = format!("{session}|");
                    state.watchers.lock().retain(|key, _| !key.starts_with(&prefix));
                });
                Ok(rx)
            }
            "readFileStream" => {
                let path = resource_path(ctx, &args, "resource")?;
                let (tx, rx) = mpsc::unbounded_channel();
                tokio::spawn(async move {
                    stream_file(path, tx, cancel).await;
                });
                Ok(rx)
            }
            other => Err(ChannelError::UnknownEvent(other.to_string())),
        }
    }
}

impl RemoteFilesystemChannel {
    fn start_watch(
        &self,
        ctx: &SessionContext,
        session: &str,
        path: &Path,
        recursive: bool,
    ) -> Result<Value, ChannelError> {
        let sender = self
            .state
            .streams
            .lock()
            .get(session)
            .cloned()
            .ok_or_else(|| {
                ChannelError::Failed(format!("no filechange listener for session `{session}`"))
            })?;
        let transformer = ctx.transformer.clone();
        let mut watcher = notify::recommended_watcher(
            move |result: Result<notify::Event, notify::Error>| {
                let Ok(event) = result else { return };
                let change_type = match event.kind {
                    notify::EventKind::Create(_) => CHANGE_ADDED,
                    notify::EventKind::Remove(_) => CHANGE_DELETED,
                    notify::EventKind::Modify(_) => CHANGE_UPDATED,
                    _ => return,
                };
                let changes: Vec<Value> = event
                    .paths
                    .iter()
                    .map(|p| {
                        let resource = transformer
                            .transform_outgoing(&UriComponents::file(p.to_string_lossy()));
                        serde_json::json!({ "type": change_type, "resource": resource })
                    })
                    .collect();
                if !changes.is_empty() {
                    let _ = sender.send(Value::Array(changes));
                }
            },
        )
        .map_err(|e| ChannelError::Failed(e.to_string()))?;
        let mode = if recursive {
            RecursiveMode::Recursive
        } else {
            RecursiveMode::NonRecursive
        };
        watcher
            .watch(path, mode)
            .map_err(|e| ChannelError::Failed(e.to_string()))?;
        self.state
            .watchers
            .lock()
            .insert(watch_key(session, path), watcher);
        Ok(Value::Null)
    }
}

async fn stream_file(path: PathBuf, tx: mpsc::UnboundedSender<Value>, cancel: CancellationToken) {
    let mut file = match tokio::fs::File::open(&path).await {
        Ok(file) => file,
        Err(err) => {
            let _ = tx.send(serde_json::json!({ "error": err.to_string() }));
            return;
        }
    };
    let mut chunk = vec![0u8; STREAM_CHUNK];
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            read = file.read(&mut chunk) => match read {
                Ok(0) => {
                    let _ = tx.send(serde_json::json!({ "end": true }));
                    return;
                }
                Ok(n) => {
                    let data = base64::engine::general_purpose::STANDARD.encode(&chunk[..n]);
                    if tx.send(serde_json::json!({ "data": data })).is_err() {
                        return;
                    }
                }
                Err(err) => {
                    let _ = tx.send(serde_json::json!({ "error": err.to_string() }));
                    return;
                }
            },
        }
    }
}

async fn stat_value(path: &Path) -> Result<Value, ChannelError> {
    let symlink = tokio::fs::symlink_metadata(path).await.map_err(fs_error)?;
    let mut bits = 0u64;
    let metadata = if symlink.file_type().is_symlink() {
        bits |= TYPE_SYMLINK;
        // Follow the link for size/kind; a dangling link keeps the bare bit.
        match tokio::fs::metadata(path).await {
            Ok(target) => target,
            Err(_) => symlink,
        }
    } else {
        symlink
    };
    if metadata.is_dir() {
        bits |= TYPE_DIRECTORY;
    } else if metadata.is_file() {
        bits |= TYPE_FILE;
    }
    let to_ms = |time: std::io::Result<std::time::SystemTime>| {
        time.ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    };
    Ok(serde_json::json!({
        "type": bits,
        "ctime": to_ms(metadata.created()),
        "mtime": to_ms(metadata.modified()),
        "size": metadata.len(),
    }))
}

fn type_bits_of(file_type: std::fs::FileType) -> u64 {
    if file_type.is_symlink() {
        TYPE_SYMLINK
    } else if file_type.is_dir() {
        TYPE_DIRECTORY
    } else if file_type.is_file() {
        TYPE_FILE
    } else {
        0
    }
}

fn watch_key(session: &str, path: &Path) -> String {
    format!("{session}|{}", path.display())
}

async fn check_overwrite(args: &Value, target: &Path) -> Result<(), ChannelError> {
    let overwrite = args
        .get("opts")
        .and_then(|o| o.get("overwrite"))
        .and_then(Value::as_bool)
        .unwrap_or(false);
    if !overwrite && tokio::fs::try_exists(target).await.unwrap_or(false) {
        return Err(ChannelError::Failed(format!(
            "EEXIST: target already exists: {}",
            target.display()
        )));
    }
    Ok(())
}

/// Resolve a URI argument through the session transformer to a local path.
fn resource_path(ctx: &SessionContext, args: &Value, field: &str) -> Result<PathBuf, ChannelError> {
    let uri: UriComponents =
        serde_json::from_value(args.get(field).cloned().unwrap_or(Value::Null))
            .map_err(|e| ChannelError::BadArgs(format!("bad `{field}` uri: {e}")))?;
    let local = ctx.transformer.transform_incoming(&uri);
    if local.scheme != "file" {
        return Err(ChannelError::BadArgs(format!(
            "`{field}` does not resolve to a local file (scheme `{}`)",
            local.scheme
        )));
    }
    Ok(PathBuf::from(local.path))
}

fn string_arg(args: &Value, field: &str) -> Result<String, ChannelError> {
    args.get(field)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| ChannelError::BadArgs(format!("missing `{field}`")))
}

fn u64_arg(args: &Value, field: &str) -> Result<u64, ChannelError> {
    args.get(field)
        .and_then(Value::as_u64)
        .ok_or_else(|| ChannelError::BadArgs(format!("missing `{field}`")))
}

fn base64_arg(args: &Value, field: &str) -> Result<Vec<u8>, ChannelError> {
    let raw = args
        .get(field)
        .and_then(Value::as_str)
        .ok_or_else(|| ChannelError::BadArgs(format!("missing `{field}`")))?;
    base64::engine::general_purpose::STANDARD
        .decode(raw)
        .map_err(|e| ChannelError::BadArgs(format!("bad base64 in `{field}`: {e}")))
}

fn fs_error(err: std::io::Error) -> ChannelError {
    let code = match err.kind() {
        std::io::ErrorKind::NotFound => "ENOENT",
        std::io::ErrorKind::PermissionDenied => "EACCES",
        std::io::ErrorKind::AlreadyExists => "EEXIST",
        _ => "EUNKNOWN",
    };
    ChannelError::Failed(format!("{code}: {err}"))
}

/// Copy a directory tree. Symlinks are skipped.
pub(crate) async fn copy_dir_recursive(source: &Path, target: &Path) -> Result<(), ChannelError> {
    tokio::fs::create_dir_all(target).await.map_err(fs_error)?;
    let mut pending = vec![(source.to_path_buf(), target.to_path_buf())];
    while let Some((src, dst)) = pending.pop() {
        let mut entries = tokio::fs::read_dir(&src).await.map_err(fs_error)?;
        while let Some(entry) = entries.next_entry().await.map_err(fs_error)? {
            let file_type = entry.file_type().await.map_err(fs_error)?;
            let from = entry.path();
            let to = dst.join(entry.file_name());
            if file_type.is_dir() {
                tokio::fs::create_dir_all(&to).await.map_err(fs_error)?;
                pending.push((from, to));
            } else if file_type.is_file() {
                tokio::fs::copy(&from, &to).await.map_err(fs_error)?;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> SessionContext {
        SessionContext::new("localhost:8080".into(), "tok".into())
    }

    fn remote(ctx: &SessionContext, path: &Path) -> Value {
        let uri = ctx
            .transformer
            .transform_outgoing(&UriComponents::file(path.to_string_lossy()));
        serde_json::to_value(uri).unwrap()
    }

    #[tokio::test]
    async fn stat_readdir_and_read_file() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join("a.txt"), b"hello").await.unwrap();
        tokio::fs::create_dir(dir.path().join("sub")).await.unwrap();

        let channel = RemoteFilesystemChannel::new();
        let ctx = ctx();

        let stat = channel
            .call(
                &ctx,
                "stat",
                serde_json::json!({ "resource": remote(&ctx, &dir.path().join("a.txt")) }),
                CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(stat["type"], TYPE_FILE);
        assert_eq!(stat["size"], 5);

        let listing = channel
            .call(
                &ctx,
                "readdir",
                serde_json::json!({ "resource": remote(&ctx, dir.path()) }),
                CancellationToken::new(),
            )
            .await
            .unwrap();
        let mut names: Vec<(String, u64)> = listing
            .as_array()
            .unwrap()
            .iter()
            .map(|e| {
                (
                    e[0].as_str().unwrap().to_string(),
                    e[1].as_u64().unwrap(),
                )
            })
            .collect();
        names.sort();
        assert_eq!(
            names,
            vec![("a.txt".to_string(), TYPE_FILE), ("sub".to_string(), TYPE_DIRECTORY)]
        );

        let read = channel
            .call(
                &ctx,
                "readFile",
                serde_json::json!({ "resource": remote(&ctx, &dir.path().join("a.txt")) }),
                CancellationToken::new(),
            )
            .await
            .unwrap();
        let data = base64::engine::general_purpose::STANDARD
            .decode(read["data"].as_str().unwrap())
            .unwrap();
        assert_eq!(data, b"hello");
    }

    #[tokio::test]
    async fn missing_file_reports_enoent() {
        let dir = tempfile::tempdir().unwrap();
        let channel = RemoteFilesystemChannel::new();
        let ctx = ctx();
        let err = channel
            .call(
                &ctx,
                "readFile",
                serde_json::json!({ "resource": remote(&ctx, &dir.path().join("gone")) }),
                CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(err.to_string().starts_with("ENOENT"));
    }

    #[tokio::test]
    async fn open_read_write_close() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("io.bin");
        let channel = RemoteFilesystemChannel::new();
        let ctx = ctx();

        let handle = channel
            .call(
                &ctx,
                "open",
                serde_json::json!({
                    "resource": remote(&ctx, &path),
                    "opts": { "create": true },
                }),
                CancellationToken::new(),
            )
            .await
            .unwrap()
            .as_u64()
            .unwrap();

        let payload = base64::engine::general_purpose::STANDARD.encode(b"0123456789");
        channel
            .call(
                &ctx,
                "write",
                serde_json::json!({ "handle": handle, "pos": 0, "data": payload }),
                CancellationToken::new(),
            )
            .await
            .unwrap();

        let read = channel
            .call(
                &ctx,
                "read",
                serde_json::json!({ "handle": handle, "pos": 3, "length": 4 }),
                CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(read["bytesRead"], 4);
        let data = base64::engine::general_purpose::STANDARD
            .decode(read["data"].as_str().unwrap())
            .unwrap();
        assert_eq!(data, b"3456");

        channel
            .call(
                &ctx,
                "close",
                serde_json::json!({ "handle": handle }),
                CancellationToken::new(),
            )
            .await
            .unwrap();
        let err = channel
            .call(
                &ctx,
                "read",
                serde_json::json!({ "handle": handle, "pos": 0, "length": 1 }),
                CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ChannelError::BadArgs(_)));
    }

    #[tokio::test]
    async fn rename_respects_overwrite_flag() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a");
        let b = dir.path().join("b");
        tokio::fs::write(&a, b"A").await.unwrap();
        tokio::fs::write(&b, b"B").await.unwrap();
        let channel = RemoteFilesystemChannel::new();
        let ctx = ctx();

        let err = channel
            .call(
                &ctx,
                "rename",
                serde_json::json!({
                    "source": remote(&ctx, &a),
                    "target": remote(&ctx, &b),
                }),
                CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(err.to_string().starts_with("EEXIST"));

        channel
            .call(
                &ctx,
                "rename",
                serde_json::json!({
                    "source": remote(&ctx, &a),
                    "target": remote(&ctx, &b),
                    "opts": { "overwrite": true },
                }),
                CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(tokio::fs::read(&b).await.unwrap(), b"A");
    }

    #[tokio::test]
    async fn read_file_stream_chunks_until_end() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("big.bin");
        let content = vec![7u8; STREAM_CHUNK + 100];
        tokio::fs::write(&path, &content).await.unwrap();

        let channel = RemoteFilesystemChannel::new();
        let ctx = ctx();
        let mut stream = channel
            .listen(
                &ctx,
                "readFileStream",
                serde_json::json!({ "resource": remote(&ctx, &path) }),
                CancellationToken::new(),
            )
            .unwrap();

        let mut collected = Vec::new();
        loop {
            let event = stream.recv().await.unwrap();
            if event.get("end").is_some() {
                break;
            }
            let chunk = base64::engine::general_purpose::STANDARD
                .decode(event["data"].as_str().unwrap())
                .unwrap();
            collected.extend(chunk);
        }
        assert_eq!(collected, content);
    }

    #[tokio::test]
    async fn watch_delivers_filechange_events() {
        let dir = tempfile::tempdir().unwrap();
        let channel = RemoteFilesystemChannel::new();
        let ctx = ctx();

        let mut stream = channel
            .listen(
                &ctx,
                "filechange",
                Value::String("w1".into()),
                CancellationToken::new(),
            )
            .unwrap();
        channel
            .call(
                &ctx,
                "watch",
                serde_json::json!({
                    "session": "w1",
                    "resource": remote(&ctx, dir.path()),
                    "recursive": true,
                }),
                CancellationToken::new(),
            )
            .await
            .unwrap();

        tokio::fs::write(dir.path().join("new.txt"), b"x").await.unwrap();

        let event = tokio::time::timeout(std::time::Duration::from_secs(5), stream.recv())
            .await
            .expect("timed out waiting for filechange")
            .unwrap();
        let changes = event.as_array().unwrap();
        assert!(!changes.is_empty());
        assert_eq!(changes[0]["resource"]["scheme"], "vscode-remote");
    }

    #[tokio::test]
    async fn unwatch_stops_events() {
        let dir = tempfile::tempdir().unwrap();
        let channel = RemoteFilesystemChannel::new();
        let ctx = ctx();

        let mut stream = channel
            .listen(
                &ctx,
                "filechange",
                Value::String("w2".into()),
                CancellationToken::new(),
            )
            .unwrap();
        channel
            .call(
                &ctx,
                "watch",
                serde_json::json!({
                    "session": "w2",
                    "resource": remote(&ctx, dir.path()),
                }),
                CancellationToken::new(),
            )
            .await
            .unwrap();
        channel
            .call(
                &ctx,
                "unwatch",
                serde_json::json!({
                    "session": "w2",
                    "resource": remote(&ctx, dir.path()),
                }),
                CancellationToken::new(),
            )
            .await
            .unwrap();

        tokio::fs::write(dir.path().join("late.txt"), b"x").await.unwrap();
        let got = tokio::time::timeout(std::time::Duration::from_millis(400), stream.recv()).await;
        assert!(got.is_err(), "no events expected after unwatch");
    }
}
