use crate::broker::SftpBroker;
use crate::error::CoreError;
use crate::events::{Event, EventBus};
use crate::listing::{sort_items, ItemKind, RemoteItem};
use crate::path::{join_remote, local_path_for, normalize_remote, parent_remote};
use forgeterm_config::SftpConfig;
use forgeterm_ssh::{FsError, RemoteFs};
use futures::future::{BoxFuture, FutureExt};
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

#[derive(Clone, Debug, PartialEq)]
pub struct TransferProgress {
    pub batch_id: Uuid,
    pub file_name: String,
    pub bytes_transferred: u64,
    pub bytes_total: u64,
    pub percent: f64,
}

impl TransferProgress {
    fn new(batch_id: Uuid, file_name: &str, done: u64, total: u64) -> Self {
        let percent = if total == 0 {
            100.0
        } else {
            done as f64 / total as f64 * 100.0
        };
        Self {
            batch_id,
            file_name: file_name.to_string(),
            bytes_transferred: done,
            bytes_total: total,
            percent,
        }
    }
}

pub type ProgressFn = Arc<dyn Fn(&TransferProgress) + Send + Sync>;

/// One file of a flattened download plan.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransferItem {
    pub remote_path: String,
    pub local_path: PathBuf,
    /// `/`-separated path relative to the download root, used for display.
    pub display_name: String,
    pub kind: ItemKind,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TransferReport {
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    pub error: Option<String>,
}

impl TransferReport {
    pub fn success(&self) -> bool {
        self.failed == 0 && self.error.is_none()
    }

    fn aborted(message: impl Into<String>) -> Self {
        Self {
            error: Some(message.into()),
            ..Default::default()
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DirectoryListing {
    pub path: String,
    pub items: Vec<RemoteItem>,
}

#[derive(Debug, Default)]
struct DownloadPlan {
    dirs: Vec<PathBuf>,
    files: Vec<TransferItem>,
}

/// File operations over the session's SFTP channel. Every public operation
/// runs on its own task; the returned handle resolves exactly once.
#[derive(Clone)]
pub struct TransferEngine {
    broker: SftpBroker,
    settings: SftpConfig,
    current_path: Arc<Mutex<String>>,
}

impl TransferEngine {
    pub fn new(broker: SftpBroker, settings: SftpConfig) -> Self {
        let current_path = Arc::new(Mutex::new(settings.default_remote_path.clone()));
        Self {
            broker,
            settings,
            current_path,
        }
    }

    pub fn broker(&self) -> &SftpBroker {
        &self.broker
    }

    pub fn current_path(&self) -> String {
        self.current_path.lock().clone()
    }

    pub fn set_current_path(&self, path: impl Into<String>) {
        *self.current_path.lock() = path.into();
    }

    fn bus(&self) -> &EventBus {
        self.broker.session().bus()
    }

    pub fn list_directory(
        &self,
        path: Option<String>,
    ) -> JoinHandle<Result<DirectoryListing, CoreError>> {
        let engine = self.clone();
        tokio::spawn(async move { engine.list_now(path).await })
    }

    pub fn download_files(
        &self,
        items: Vec<RemoteItem>,
        local_dir: PathBuf,
        progress: Option<ProgressFn>,
    ) -> JoinHandle<TransferReport> {
        let engine = self.clone();
        tokio::spawn(async move { engine.download_now(items, local_dir, progress).await })
    }

    pub fn upload_files(
        &self,
        local_files: Vec<PathBuf>,
        remote_dir: String,
        overwrite: bool,
        progress: Option<ProgressFn>,
    ) -> JoinHandle<TransferReport> {
        let engine = self.clone();
        tokio::spawn(async move {
            engine
                .upload_now(local_files, remote_dir, overwrite, progress)
                .await
        })
    }

    pub fn create_directory(
        &self,
        parent: String,
        name: String,
    ) -> JoinHandle<Result<(), CoreError>> {
        let engine = self.clone();
        tokio::spawn(async move { engine.create_directory_now(&parent, &name).await })
    }

    pub fn delete_item(&self, item: RemoteItem) -> JoinHandle<Result<(), CoreError>> {
        let engine = self.clone();
        tokio::spawn(async move { engine.delete_now(&item).await })
    }

    pub fn rename_item(
        &self,
        item: RemoteItem,
        new_name: String,
    ) -> JoinHandle<Result<(), CoreError>> {
        let engine = self.clone();
        tokio::spawn(async move { engine.rename_now(&item, &new_name).await })
    }

    pub fn get_file_content(&self, path: String) -> JoinHandle<Result<String, CoreError>> {
        let engine = self.clone();
        tokio::spawn(async move { engine.read_now(&path).await })
    }

    pub fn save_file_content(
        &self,
        path: String,
        content: String,
    ) -> JoinHandle<Result<(), CoreError>> {
        let engine = self.clone();
        tokio::spawn(async move { engine.write_now(&path, &content).await })
    }

    async fn channel(&self) -> Result<Arc<dyn RemoteFs>, CoreError> {
        self.broker.channel().await.ok_or(CoreError::ChannelUnavailable)
    }

    /// Fire-and-forget listing; the result reaches subscribers as
    /// `Event::DirectoryListed`.
    fn refresh(&self, path: &str) {
        drop(self.list_directory(Some(path.to_string())));
    }

    async fn list_now(&self, path: Option<String>) -> Result<DirectoryListing, CoreError> {
        let requested = path.unwrap_or_else(|| self.current_path());
        let fs = self.channel().await?;
        self.bus().status(format!("Listing {requested}..."));

        let result = async {
            let path = if requested.is_empty() || requested == "." {
                fs.canonicalize(".").await?
            } else {
                normalize_remote(&requested)
            };
            let entries = fs.read_dir(&path).await?;
            Ok::<_, FsError>((path, entries))
        }
        .await;

        let (path, entries) = match result {
            Ok(found) => found,
            Err(err) => {
                let message = format!("Error listing directory {requested}: {err}");
                error!(path = %requested, error = %err, "listing failed");
                self.bus().status("Error listing directory");
                return Err(remote_error(err, message));
            }
        };

        let mut items: Vec<RemoteItem> = entries
            .iter()
            .map(|entry| RemoteItem::from_entry(&path, entry))
            .collect();
        let parent = parent_remote(&path);
        if path != "/" && parent != path {
            items.push(RemoteItem::parent(parent));
        }
        sort_items(&mut items);

        self.set_current_path(path.clone());
        let host = self
            .broker
            .session()
            .endpoint()
            .map(|e| e.hostname)
            .unwrap_or_default();
        self.bus().status(format!("Connected to {host}"));
        debug!(path = %path, count = items.len(), "listed directory");
        self.bus().send(Event::DirectoryListed {
            path: path.clone(),
            items: items.clone(),
        });
        Ok(DirectoryListing { path, items })
    }

    async fn download_now(
        &self,
        items: Vec<RemoteItem>,
        local_dir: PathBuf,
        progress: Option<ProgressFn>,
    ) -> TransferReport {
        let mut fs = match self.channel().await {
            Ok(fs) => fs,
            Err(err) => return TransferReport::aborted(err.to_string()),
        };
        let batch_id = Uuid::new_v4();

        let mut plan = DownloadPlan::default();
        for item in items.iter().filter(|item| !item.is_parent()) {
            if item.is_dir() {
                expand_directory(
                    fs.as_ref(),
                    normalize_remote(&item.path),
                    item.name.clone(),
                    &local_dir,
                    &mut plan,
                )
                .await;
            } else {
                plan.files.push(TransferItem {
                    remote_path: normalize_remote(&item.path),
                    local_path: local_path_for(&local_dir, &item.name),
                    display_name: item.name.clone(),
                    kind: item.kind,
                });
            }
        }
        debug!(dirs = plan.dirs.len(), files = plan.files.len(), "download plan ready");

        for dir in &plan.dirs {
            if let Err(err) = tokio::fs::create_dir_all(dir).await {
                warn!(path = %dir.display(), error = %err, "failed to create local directory");
            }
        }

        let total = plan.files.len();
        let mut report = TransferReport::default();
        for (index, file) in plan.files.iter().enumerate() {
            self.bus().status(format!(
                "Downloading {} ({}/{})...",
                file.display_name,
                index + 1,
                total
            ));
            if let Some(parent) = file.local_path.parent() {
                if let Err(err) = tokio::fs::create_dir_all(parent).await {
                    warn!(path = %parent.display(), error = %err, "local mkdir failed");
                }
            }
            match self.download_one(&mut fs, file, batch_id, &progress).await {
                Ok(bytes) => {
                    report.succeeded += 1;
                    info!(
                        remote = %file.remote_path,
                        local = %file.local_path.display(),
                        bytes,
                        "downloaded"
                    );
                }
                Err(err) => {
                    report.failed += 1;
                    error!(
                        remote = %file.remote_path,
                        local = %file.local_path.display(),
                        error = %err,
                        "download failed"
                    );
                }
            }
        }

        let mut status = format!("Download complete: {} files downloaded", report.succeeded);
        if report.failed > 0 {
            status.push_str(&format!(", {} failed", report.failed));
            report.error = Some("Some files failed to download".to_string());
        }
        info!("{status}");
        self.bus().status(status);
        report
    }

    async fn download_one(
        &self,
        fs: &mut Arc<dyn RemoteFs>,
        file: &TransferItem,
        batch_id: Uuid,
        progress: &Option<ProgressFn>,
    ) -> Result<u64, FsError> {
        let attempts = self.settings.download_retries + 1;
        let bus = self.bus();
        let mut sink = |done: u64, total: u64| {
            report_progress(bus, progress, batch_id, "Downloading", &file.display_name, done, total)
        };
        let mut attempt = 1;
        loop {
            debug!(remote = %file.remote_path, attempt, "download attempt");
            let result = match fs.stat(&file.remote_path).await {
                Ok(_) => fs.download(&file.remote_path, &file.local_path, &mut sink).await,
                Err(err) => Err(err),
            };
            let err = match result {
                Ok(bytes) => return Ok(bytes),
                Err(err) => err,
            };
            warn!(remote = %file.remote_path, attempt, error = %err, "download attempt failed");
            if attempt >= attempts {
                return Err(err);
            }
            attempt += 1;
            tokio::time::sleep(Duration::from_millis(self.settings.retry_backoff_ms)).await;
            if let Some(fresh) = self.broker.channel().await {
                *fs = fresh;
            }
        }
    }

    async fn upload_now(
        &self,
        local_files: Vec<PathBuf>,
        remote_dir: String,
        overwrite: bool,
        progress: Option<ProgressFn>,
    ) -> TransferReport {
        let fs = match self.channel().await {
            Ok(fs) => fs,
            Err(err) => return TransferReport::aborted(err.to_string()),
        };
        let batch_id = Uuid::new_v4();
        let bus = self.bus();
        let total = local_files.len();
        let mut report = TransferReport::default();

        for (index, local) in local_files.iter().enumerate() {
            let Some(name) = local.file_name().map(|n| n.to_string_lossy().into_owned()) else {
                report.failed += 1;
                error!(local = %local.display(), "upload source has no file name");
                continue;
            };
            let remote = join_remote(&remote_dir, &name);
            bus.status(format!("Uploading {} ({}/{})...", name, index + 1, total));

            if !overwrite && fs.stat(&remote).await.is_ok() {
                report.skipped += 1;
                info!(local = %local.display(), remote = %remote, "skipped, already exists");
                continue;
            }

            let mut sink = |done: u64, all: u64| {
                report_progress(bus, &progress, batch_id, "Uploading", &name, done, all)
            };
            match fs.upload(local, &remote, &mut sink).await {
                Ok(bytes) => {
                    report.succeeded += 1;
                    info!(local = %local.display(), remote = %remote, bytes, "uploaded");
                }
                Err(err) => {
                    report.failed += 1;
                    error!(
                        local = %local.display(),
                        remote = %remote,
                        error = %err,
                        "upload failed"
                    );
                }
            }
        }

        let mut status = format!("Upload complete: {} files uploaded", report.succeeded);
        if report.skipped > 0 {
            status.push_str(&format!(", {} skipped", report.skipped));
        }
        if report.failed > 0 {
            status.push_str(&format!(", {} failed", report.failed));
            report.error = Some("Some files failed to upload".to_string());
        }
        info!("{status}");
        bus.status(status);

        if report.success() && report.succeeded > 0 {
            self.refresh(&remote_dir);
        }
        report
    }

    async fn create_directory_now(&self, parent: &str, name: &str) -> Result<(), CoreError> {
        let fs = self.channel().await?;
        let target = join_remote(parent, name);
        if fs.stat(&target).await.is_ok() {
            return Err(CoreError::AlreadyExists(format!(
                "Directory {name} already exists"
            )));
        }
        fs.create_dir(&target).await.map_err(|err| {
            let message = format!("Error creating directory {name}: {err}");
            error!(path = %target, error = %err, "mkdir failed");
            remote_error(err, message)
        })?;
        info!(path = %target, "created directory");
        self.refresh(parent);
        Ok(())
    }

    async fn delete_now(&self, item: &RemoteItem) -> Result<(), CoreError> {
        if item.is_parent() {
            return Err(CoreError::RemoteIo("Cannot delete the parent entry".to_string()));
        }
        let fs = self.channel().await?;
        let path = normalize_remote(&item.path);
        let result = if item.is_dir() {
            delete_tree(fs.as_ref(), path.clone()).await
        } else {
            fs.remove_file(&path).await
        };
        if let Err(err) = result {
            let message = format!("Error deleting {path}: {err}");
            error!(path = %path, error = %err, "delete failed");
            return Err(remote_error(err, message));
        }
        info!(path = %path, kind = item.kind.label(), "deleted");
        self.refresh(&parent_remote(&path));
        Ok(())
    }

    async fn rename_now(&self, item: &RemoteItem, new_name: &str) -> Result<(), CoreError> {
        let fs = self.channel().await?;
        let old_path = normalize_remote(&item.path);
        let parent = parent_remote(&old_path);
        let new_path = join_remote(&parent, new_name);
        if fs.stat(&new_path).await.is_ok() {
            return Err(CoreError::AlreadyExists(format!(
                "A file or directory named {new_name} already exists"
            )));
        }
        fs.rename(&old_path, &new_path).await.map_err(|err| {
            let message = format!("Error renaming {old_path}: {err}");
            error!(from = %old_path, to = %new_path, error = %err, "rename failed");
            remote_error(err, message)
        })?;
        info!(from = %old_path, to = %new_path, "renamed");
        self.refresh(&parent);
        Ok(())
    }

    async fn read_now(&self, path: &str) -> Result<String, CoreError> {
        let path = normalize_remote(path);
        let fs = self.channel().await?;
        let bytes = fs.read_file(&path).await.map_err(|err| {
            let message = format!("Error reading file {path}: {err}");
            error!(path = %path, error = %err, "read failed");
            remote_error(err, message)
        })?;
        debug!(path = %path, bytes = bytes.len(), "read file");
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    async fn write_now(&self, path: &str, content: &str) -> Result<(), CoreError> {
        let path = normalize_remote(path);
        let fs = self.channel().await?;
        fs.write_file(&path, content.as_bytes()).await.map_err(|err| {
            let message = format!("Error saving file {path}: {err}");
            error!(path = %path, error = %err, "write failed");
            remote_error(err, message)
        })?;
        info!(path = %path, "saved file");
        Ok(())
    }
}

fn report_progress(
    bus: &EventBus,
    progress: &Option<ProgressFn>,
    batch_id: Uuid,
    verb: &str,
    name: &str,
    done: u64,
    total: u64,
) {
    let update = TransferProgress::new(batch_id, name, done, total);
    bus.status(format!(
        "{verb} {name}: {done}/{total} bytes ({:.1}%)",
        update.percent
    ));
    if let Some(cb) = progress {
        cb(&update);
    }
    bus.send(Event::TransferProgress(update));
}

fn remote_error(err: FsError, message: String) -> CoreError {
    if err.is_not_found() {
        CoreError::RemoteNotFound(message)
    } else {
        CoreError::RemoteIo(message)
    }
}

/// Depth-first in listing order. A subtree that cannot be listed is logged
/// and skipped.
fn expand_directory<'a>(
    fs: &'a dyn RemoteFs,
    remote: String,
    relative: String,
    local_root: &'a Path,
    plan: &'a mut DownloadPlan,
) -> BoxFuture<'a, ()> {
    async move {
        plan.dirs.push(local_path_for(local_root, &relative));
        let entries = match fs.read_dir(&remote).await {
            Ok(entries) => entries,
            Err(err) => {
                warn!(path = %remote, error = %err, "cannot list directory, skipping");
                return;
            }
        };
        let mut children: Vec<RemoteItem> = entries
            .iter()
            .map(|entry| RemoteItem::from_entry(&remote, entry))
            .collect();
        sort_items(&mut children);
        for child in children {
            let child_relative = format!("{relative}/{}", child.name);
            if child.is_dir() {
                expand_directory(fs, child.path, child_relative, local_root, plan).await;
            } else {
                plan.files.push(TransferItem {
                    local_path: local_path_for(local_root, &child_relative),
                    remote_path: child.path,
                    display_name: child_relative,
                    kind: child.kind,
                });
            }
        }
    }
    .boxed()
}

/// Children are classified without following links, so a symlink to a
/// directory is unlinked rather than descended into.
fn delete_tree(fs: &dyn RemoteFs, dir: String) -> BoxFuture<'_, Result<(), FsError>> {
    async move {
        let entries = fs.read_dir(&dir).await?;
        for entry in entries {
            let child = join_remote(&dir, &entry.name);
            let result = if entry.metadata.is_dir() {
                delete_tree(fs, child.clone()).await
            } else {
                fs.remove_file(&child).await
            };
            if let Err(err) = result {
                warn!(path = %child, error = %err, "failed to delete child, continuing");
            }
        }
        fs.remove_dir(&dir).await
    }
    .boxed()
}
