//! 打开的归档状态
//!
//! 一个 [`ArchiveState`] 对应一个打开的归档：持有目录树、当前焦点、错误信息和
//! 本次打开创建的临时目录。同一时刻最多一个打开操作和一个提取操作在进行；
//! 新的打开会取消进行中的打开和提取，新的提取会取消上一次提取。
//!
//! 操作结果只有在该操作仍是"最新"的打开时才发布，被取代的加载结果直接丢弃。

use crate::archive::detector::DetectionResult;
use crate::archive::engine::{ArchiveEntry, Engine};
use crate::archive::loader::{ArchiveLoader, LoadedArchive};
use crate::archive::nested_archive_config::NestedArchiveConfig;
use crate::archive::progress_reporter::ProgressReporter;
use crate::archive::status::{OperationContext, Status, StatusReporter};
use crate::archive::tree::{ArchiveItem, ArchiveTree, BoundArchive, ItemId, ItemKind};
use crate::error::{AppError, Result};
use crate::platform::{ExternalOpener, ScopedAccess, SystemOpener, UnrestrictedAccess};
use crate::utils::fs_move::move_into;
use crate::utils::temp_storage::TempStorage;
use parking_lot::{Mutex, RwLock};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// `open` 的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenOutcome {
    /// 已加载为归档
    Opened,
    /// 不是归档，已交给外部程序
    OpenedExternally,
    /// 被取消或被更新的打开取代
    Cancelled,
}

/// `open_item` 的结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemOutcome {
    Focused(ItemId),
    Unfolded(ItemId),
    OpenedExternally(PathBuf),
    Cancelled,
}

#[derive(Debug, Default)]
struct Inner {
    tree: Option<ArchiveTree>,
    focused: Option<ItemId>,
    source: Option<PathBuf>,
    detection: Option<DetectionResult>,
    error: Option<String>,
    scratch_dirs: Vec<PathBuf>,
}

impl Inner {
    /// 清空为"没有打开的归档"，返回需要删除的临时目录
    fn reset(&mut self) -> Vec<PathBuf> {
        self.tree = None;
        self.focused = None;
        self.source = None;
        self.detection = None;
        std::mem::take(&mut self.scratch_dirs)
    }
}

enum Opened {
    Archive(LoadedArchive),
    External,
}

pub struct ArchiveState {
    loader: Arc<ArchiveLoader>,
    temp: Arc<TempStorage>,
    opener: Arc<dyn ExternalOpener>,
    access: Arc<dyn ScopedAccess>,
    nested: NestedArchiveConfig,
    inner: RwLock<Inner>,
    open_token: Mutex<Option<CancellationToken>>,
    extract_token: Mutex<Option<CancellationToken>>,
    generation: AtomicU64,
    status: Arc<watch::Sender<Status>>,
    next_events: Mutex<Option<mpsc::UnboundedSender<Status>>>,
}

impl ArchiveState {
    pub fn new(loader: Arc<ArchiveLoader>, temp: Arc<TempStorage>) -> Self {
        let (status, _) = watch::channel(Status::Idle);
        Self {
            loader,
            temp,
            opener: Arc::new(SystemOpener),
            access: Arc::new(UnrestrictedAccess),
            nested: NestedArchiveConfig::default(),
            inner: RwLock::new(Inner::default()),
            open_token: Mutex::new(None),
            extract_token: Mutex::new(None),
            generation: AtomicU64::new(0),
            status: Arc::new(status),
            next_events: Mutex::new(None),
        }
    }

    pub fn with_opener(mut self, opener: Arc<dyn ExternalOpener>) -> Self {
        self.opener = opener;
        self
    }

    pub fn with_scoped_access(mut self, access: Arc<dyn ScopedAccess>) -> Self {
        self.access = access;
        self
    }

    pub fn with_nested_config(mut self, nested: NestedArchiveConfig) -> Self {
        self.nested = nested;
        self
    }

    pub fn loader(&self) -> &Arc<ArchiveLoader> {
        &self.loader
    }

    // ========== 状态通道 ==========

    /// 订阅最新状态
    pub fn subscribe_status(&self) -> watch::Receiver<Status> {
        self.status.subscribe()
    }

    pub fn status(&self) -> Status {
        self.status.borrow().clone()
    }

    /// 下一个启动的操作把每条状态推送到返回的接收端，操作结束后通道关闭
    pub fn operation_events(&self) -> mpsc::UnboundedReceiver<Status> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.next_events.lock() = Some(tx);
        rx
    }

    fn context(&self, token: CancellationToken) -> OperationContext {
        let events = self.next_events.lock().take();
        OperationContext::new(
            token,
            StatusReporter::new(Arc::clone(&self.status), events),
            Arc::clone(&self.temp),
        )
    }

    // ========== 查询 ==========

    pub fn root(&self) -> Option<ItemId> {
        self.inner.read().tree.as_ref().map(|tree| tree.root())
    }

    pub fn focused(&self) -> Option<ItemId> {
        self.inner.read().focused
    }

    pub fn item(&self, id: ItemId) -> Option<ArchiveItem> {
        self.inner.read().tree.as_ref()?.get(id).cloned()
    }

    pub fn children_sorted(&self, id: ItemId) -> Vec<ItemId> {
        self.inner
            .read()
            .tree
            .as_ref()
            .map(|tree| tree.children_sorted(id))
            .unwrap_or_default()
    }

    pub fn error(&self) -> Option<String> {
        self.inner.read().error.clone()
    }

    pub fn source_path(&self) -> Option<PathBuf> {
        self.inner.read().source.clone()
    }

    pub fn detection(&self) -> Option<DetectionResult> {
        self.inner.read().detection.clone()
    }

    pub fn is_open(&self) -> bool {
        self.inner.read().tree.is_some()
    }

    /// 在读锁下访问整棵树
    pub fn with_tree<R>(&self, f: impl FnOnce(&ArchiveTree) -> R) -> Option<R> {
        self.inner.read().tree.as_ref().map(f)
    }

    // ========== 打开 / 关闭 ==========

    /// 打开文件
    ///
    /// 取消进行中的打开和提取并清空当前状态。不是归档的文件交给外部程序。
    /// 失败时记录错误信息并返回错误；取消不算错误。
    pub async fn open(&self, path: &Path) -> Result<OpenOutcome> {
        let token = CancellationToken::new();
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        replace_token(&self.open_token, Some(token.clone()));
        replace_token(&self.extract_token, None);

        let stale = {
            let mut inner = self.inner.write();
            inner.error = None;
            inner.reset()
        };
        self.remove_dirs(stale).await;

        let ctx = self.context(token.clone());
        ctx.status.processing("Opening");
        info!(path = %path.display(), "Opening");

        let result = tokio::select! {
            biased;
            _ = token.cancelled() => Err(AppError::Cancelled),
            result = self.open_inner(path, &ctx) => result,
        };

        let current = self.generation.load(Ordering::SeqCst) == generation;
        if current {
            self.open_token.lock().take();
        }

        match result {
            Ok(Opened::Archive(loaded)) if current => {
                let root = loaded.tree.root();
                let mut inner = self.inner.write();
                inner.source = Some(path.to_path_buf());
                inner.detection = Some(loaded.detection);
                inner.tree = Some(loaded.tree);
                inner.focused = Some(root);
                inner.scratch_dirs = loaded.scratch_dirs;
                drop(inner);
                ctx.status.send(Status::Done);
                Ok(OpenOutcome::Opened)
            }
            Ok(Opened::Archive(loaded)) => {
                debug!(path = %path.display(), "Discarding superseded load result");
                self.remove_dirs(loaded.scratch_dirs).await;
                Ok(OpenOutcome::Cancelled)
            }
            Ok(Opened::External) => {
                if current {
                    ctx.status.send(Status::Done);
                }
                Ok(OpenOutcome::OpenedExternally)
            }
            Err(AppError::Cancelled) => {
                info!(path = %path.display(), "Open cancelled");
                self.remove_dirs(ctx.take_scratch_dirs()).await;
                if current {
                    ctx.status.send(Status::Cancelled);
                }
                Ok(OpenOutcome::Cancelled)
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Open failed");
                self.remove_dirs(ctx.take_scratch_dirs()).await;
                if current {
                    let stale = {
                        let mut inner = self.inner.write();
                        inner.error = Some(e.to_string());
                        inner.reset()
                    };
                    self.remove_dirs(stale).await;
                    ctx.status.send(Status::Error {
                        message: e.to_string(),
                    });
                }
                Err(e)
            }
        }
    }

    async fn open_inner(&self, path: &Path, ctx: &OperationContext) -> Result<Opened> {
        let path = dunce::canonicalize(path)
            .map_err(|e| AppError::from(e).with_context(format!("Cannot open {}", path.display())))?;

        match self.loader.detect(&path, true).await? {
            Some(detection) => {
                let loaded = self.loader.load_detected(&path, detection, ctx).await?;
                Ok(Opened::Archive(loaded))
            }
            None => {
                info!(path = %path.display(), "Not an archive");
                self.opener.open(&path).await?;
                Ok(Opened::External)
            }
        }
    }

    /// 取消进行中的打开和提取
    pub fn cancel(&self) {
        replace_token(&self.open_token, None);
        replace_token(&self.extract_token, None);
    }

    /// 关闭归档并删除它的临时目录
    pub async fn close(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.cancel();
        let stale = {
            let mut inner = self.inner.write();
            inner.error = None;
            inner.reset()
        };
        self.remove_dirs(stale).await;
        self.status.send_replace(Status::Idle);
        debug!("Archive closed");
    }

    // ========== 导航 ==========

    /// 打开一个条目
    ///
    /// 目录和已展开的归档获得焦点；未展开的文件被提取到临时目录并检测，
    /// 是归档则构建子树挂到该节点上，否则交给外部程序。失败不影响已有的树。
    pub async fn open_item(&self, id: ItemId) -> Result<ItemOutcome> {
        let (item, owner, depth) = {
            let mut inner = self.inner.write();
            let tree = inner
                .tree
                .as_ref()
                .ok_or_else(|| AppError::navigation("No archive is open"))?;
            let item = tree
                .get(id)
                .cloned()
                .ok_or_else(|| AppError::navigation(format!("Unknown item {:?}", id)))?;
            let owner = tree.owner_of(id).cloned();
            let depth = tree.depth_of(id);

            if item.is_container() || item.is_unfolded() {
                inner.focused = Some(id);
                return Ok(ItemOutcome::Focused(id));
            }
            (item, owner, depth)
        };

        if item.kind == ItemKind::Unknown {
            return Err(AppError::navigation(format!(
                "Cannot open '{}': unsupported entry type",
                item.name
            )));
        }
        if !self.nested.allows_unfold(depth) {
            return Err(AppError::navigation(format!(
                "Cannot open '{}': nested archive depth limit ({}) reached",
                item.name, self.nested.max_depth
            )));
        }
        let owner = owner.ok_or_else(|| {
            AppError::navigation(format!("'{}' has no owning archive", item.name))
        })?;

        let generation = self.generation.load(Ordering::SeqCst);
        let token = CancellationToken::new();
        replace_token(&self.open_token, Some(token.clone()));
        let ctx = self.context(token.clone());
        ctx.status.processing(format!("Opening {}", item.name));

        let result = tokio::select! {
            biased;
            _ = token.cancelled() => Err(AppError::Cancelled),
            result = self.unfold(id, &item, &owner, &ctx) => result,
        };

        let current = self.generation.load(Ordering::SeqCst) == generation;
        match result {
            Ok(Unfold::Subtree(subtree)) if current => {
                {
                    let mut guard = self.inner.write();
                    let inner = &mut *guard;
                    if let Some(tree) = inner.tree.as_mut() {
                        if !tree.graft(id, subtree) {
                            debug!(item = ?id, "Item already unfolded");
                        }
                        inner.focused = Some(id);
                        inner.scratch_dirs.extend(ctx.take_scratch_dirs());
                    }
                }
                // 树已被关闭时剩下的目录
                self.remove_dirs(ctx.take_scratch_dirs()).await;
                ctx.status.send(Status::Done);
                Ok(ItemOutcome::Unfolded(id))
            }
            Ok(Unfold::External(path)) if current => {
                // 外部程序可能仍在读取，文件保留到归档关闭
                self.inner.write().scratch_dirs.extend(ctx.take_scratch_dirs());
                ctx.status.send(Status::Done);
                Ok(ItemOutcome::OpenedExternally(path))
            }
            Ok(_) | Err(AppError::Cancelled) => {
                self.remove_dirs(ctx.take_scratch_dirs()).await;
                if current {
                    ctx.status.send(Status::Cancelled);
                }
                Ok(ItemOutcome::Cancelled)
            }
            Err(e) => {
                warn!(item = %item.virtual_path, error = %e, "Failed to open item");
                self.remove_dirs(ctx.take_scratch_dirs()).await;
                if current {
                    self.inner.write().error = Some(e.to_string());
                    ctx.status.send(Status::Error {
                        message: e.to_string(),
                    });
                }
                Err(e)
            }
        }
    }

    async fn unfold(
        &self,
        id: ItemId,
        item: &ArchiveItem,
        owner: &BoundArchive,
        ctx: &OperationContext,
    ) -> Result<Unfold> {
        let engine = self.engine_for(owner)?;
        let dir = ctx.scratch_dir().await?;
        let extracted = engine
            .extract_entry(&item.to_entry(), &owner.path, &dir)
            .await?
            .ok_or_else(|| {
                AppError::extraction_failed(
                    format!("'{}' was not found in the archive", item.virtual_path),
                    Some(owner.path.clone()),
                )
            })?;
        ctx.check_cancelled()?;

        let detection = self.loader.detect(&extracted, false).await?;
        match detection {
            Some(detection) if self.loader.selector().engine(detection.type_id()).is_some() => {
                info!(
                    item = ?id,
                    format = %detection.type_id(),
                    "Unfolding nested archive"
                );
                let bound = BoundArchive {
                    path: extracted,
                    format_id: detection.type_id().to_string(),
                };
                let subtree = self.loader.load_nested(bound, &item.name, ctx).await?;
                Ok(Unfold::Subtree(subtree))
            }
            _ => {
                self.opener.open(&extracted).await?;
                Ok(Unfold::External(extracted))
            }
        }
    }

    /// 焦点移到父节点
    pub fn go_up(&self) -> Result<ItemId> {
        let mut inner = self.inner.write();
        let focused = inner
            .focused
            .ok_or_else(|| AppError::navigation("No archive is open"))?;
        let parent = inner
            .tree
            .as_ref()
            .and_then(|tree| tree.get(focused))
            .and_then(|item| item.parent)
            .ok_or_else(|| AppError::navigation("Already at the archive root"))?;
        inner.focused = Some(parent);
        Ok(parent)
    }

    // ========== 提取 ==========

    /// 提取选中的条目到 `destination`，返回目标目录中的新路径
    ///
    /// 每个条目由其所属归档的引擎提取到私有临时目录，然后移动到目标目录；
    /// 目录与目标中的同名目录合并，冲突的文件被覆盖。
    pub async fn extract_items(&self, ids: &[ItemId], destination: &Path) -> Result<Vec<PathBuf>> {
        let jobs = {
            let inner = self.inner.read();
            let tree = inner
                .tree
                .as_ref()
                .ok_or_else(|| AppError::navigation("No archive is open"))?;
            ids.iter()
                .map(|&id| {
                    let item = tree
                        .get(id)
                        .ok_or_else(|| AppError::navigation(format!("Unknown item {:?}", id)))?;
                    let owner = tree.owner_of(id).cloned().ok_or_else(|| {
                        AppError::InvalidPath("The archive root cannot be extracted as an item".into())
                    })?;
                    Ok((item.to_entry(), owner))
                })
                .collect::<Result<Vec<_>>>()?
        };

        self.run_extraction(destination, |ctx, op_dir| self.extract_jobs(jobs, op_dir, destination, ctx))
            .await
    }

    /// 提取整个归档到 `destination`，返回移动后的顶层路径
    pub async fn extract_all(&self, destination: &Path) -> Result<Vec<PathBuf>> {
        let bound = self
            .with_tree(|tree| tree.get(tree.root()).and_then(|root| root.bound.clone()))
            .flatten()
            .ok_or_else(|| AppError::navigation("No archive is open"))?;

        self.run_extraction(destination, |ctx, op_dir| async move {
            let engine = self.engine_for(&bound)?;
            ctx.status.processing("Extracting archive");
            until_cancelled(&ctx.token, engine.extract_all(&bound.path, &op_dir)).await?;
            move_children(&op_dir, destination, ctx.token.clone()).await
        })
        .await
    }

    /// 提取的公共流程：访问授权、取消令牌、操作目录、状态与清理
    ///
    /// 取消只打断写入操作目录的阶段；向目标目录的移动一旦开始就等待其完成，
    /// 操作目录在所有移动结束后才删除。
    async fn run_extraction<F, Fut>(&self, destination: &Path, work: F) -> Result<Vec<PathBuf>>
    where
        F: FnOnce(OperationContext, PathBuf) -> Fut,
        Fut: std::future::Future<Output = Result<Vec<PathBuf>>>,
    {
        if !self.access.acquire(destination) {
            return Err(AppError::InvalidPath(format!(
                "Access to {} was not granted",
                destination.display()
            )));
        }
        let access = Arc::clone(&self.access);
        let _release = scopeguard::guard(destination.to_path_buf(), move |dest| access.release(&dest));

        let token = CancellationToken::new();
        replace_token(&self.extract_token, Some(token.clone()));
        let ctx = self.context(token);
        ctx.status.processing("Extracting");

        let result = async {
            let op_dir = ctx.scratch_dir().await?;
            work(ctx.clone(), op_dir).await
        }
        .await;

        self.remove_dirs(ctx.take_scratch_dirs()).await;

        match &result {
            Ok(paths) => {
                info!(
                    destination = %destination.display(),
                    count = paths.len(),
                    "Extraction complete"
                );
                ctx.status.send(Status::Done);
            }
            Err(AppError::Cancelled) => {
                info!("Extraction cancelled");
                ctx.status.send(Status::Cancelled);
            }
            Err(e) => {
                warn!(error = %e, "Extraction failed");
                ctx.status.send(Status::Error {
                    message: e.to_string(),
                });
            }
        }
        result
    }

    async fn extract_jobs(
        &self,
        jobs: Vec<(ArchiveEntry, BoundArchive)>,
        op_dir: PathBuf,
        destination: &Path,
        ctx: OperationContext,
    ) -> Result<Vec<PathBuf>> {
        let mut reporter = ProgressReporter::new("Extracting", jobs.len(), 1);
        let mut moved = Vec::with_capacity(jobs.len());

        for (index, (entry, owner)) in jobs.into_iter().enumerate() {
            ctx.check_cancelled()?;
            let engine = self.engine_for(&owner)?;
            // 每个条目单独的子目录，来自不同归档的同名条目互不覆盖
            let item_dir = op_dir.join(index.to_string());
            tokio::fs::create_dir_all(&item_dir).await?;

            let extracted =
                until_cancelled(&ctx.token, engine.extract_entry(&entry, &owner.path, &item_dir))
                    .await?;
            match extracted {
                Some(extracted) => {
                    ctx.check_cancelled()?;
                    let dest = destination.to_path_buf();
                    let target =
                        tokio::task::spawn_blocking(move || move_into(&extracted, &dest)).await??;
                    debug!(entry = %entry.path, target = %target.display(), "Entry extracted");
                    moved.push(target);
                }
                None => warn!(entry = %entry.path, "Entry produced no output"),
            }

            reporter.inc();
            if let Some((fraction, message)) = reporter.poll() {
                ctx.status.progress(fraction, message);
            }
        }
        Ok(moved)
    }

    fn engine_for(&self, bound: &BoundArchive) -> Result<Arc<dyn Engine>> {
        self.loader.selector().engine(&bound.format_id).ok_or_else(|| {
            AppError::invalid_archive(
                format!("No engine available for format '{}'", bound.format_id),
                Some(bound.path.clone()),
            )
        })
    }

    async fn remove_dirs(&self, dirs: Vec<PathBuf>) {
        for dir in dirs {
            self.temp.remove(&dir).await;
        }
    }
}

enum Unfold {
    Subtree(ArchiveTree),
    External(PathBuf),
}

/// 替换令牌槽位，旧令牌被取消
fn replace_token(slot: &Mutex<Option<CancellationToken>>, token: Option<CancellationToken>) {
    let previous = std::mem::replace(&mut *slot.lock(), token);
    if let Some(previous) = previous {
        previous.cancel();
    }
}

/// 引擎只写入私有操作目录，取消时直接放弃
async fn until_cancelled<T>(
    token: &CancellationToken,
    work: impl std::future::Future<Output = Result<T>>,
) -> Result<T> {
    tokio::select! {
        biased;
        _ = token.cancelled() => Err(AppError::Cancelled),
        result = work => result,
    }
}

/// 把 `source` 下的每个顶层项移动到 `destination`
///
/// 每次移动开始前检查取消，已开始的移动总是完成。
async fn move_children(
    source: &Path,
    destination: &Path,
    token: CancellationToken,
) -> Result<Vec<PathBuf>> {
    let source = source.to_path_buf();
    let destination = destination.to_path_buf();
    tokio::task::spawn_blocking(move || -> Result<Vec<PathBuf>> {
        let mut moved = Vec::new();
        for entry in std::fs::read_dir(&source)? {
            if token.is_cancelled() {
                debug!(moved = moved.len(), "Extraction cancelled between moves");
                return Err(AppError::Cancelled);
            }
            moved.push(move_into(&entry?.path(), &destination)?);
        }
        moved.sort();
        Ok(moved)
    })
    .await?
}
