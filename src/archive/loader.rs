//! 归档加载器
//!
//! 检测格式、逐层剥掉复合格式的外层压缩、通过引擎列出条目并构建目录树。
//! 各步骤之间检查取消；被取消的加载返回 `AppError::Cancelled`，不产生树。

use crate::archive::detector::{DetectionResult, TypeDetector};
use crate::archive::selector::EngineSelector;
use crate::archive::status::OperationContext;
use crate::archive::tree::{ArchiveTree, BoundArchive};
use crate::error::{AppError, Result};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// 加载阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadPhase {
    Idle,
    Listing,
    DecompressingOuterLayer,
    ListingInner,
    BuildingTree,
    Done,
    Error,
    Cancelled,
}

impl LoadPhase {
    /// 加载结束时的终态
    pub fn finished<T>(result: &Result<T>) -> Self {
        match result {
            Ok(_) => LoadPhase::Done,
            Err(AppError::Cancelled) => LoadPhase::Cancelled,
            Err(_) => LoadPhase::Error,
        }
    }

    /// 进行中的阶段，作为 `Processing` 状态上报
    pub fn is_in_flight(&self) -> bool {
        matches!(
            self,
            LoadPhase::Listing
                | LoadPhase::DecompressingOuterLayer
                | LoadPhase::ListingInner
                | LoadPhase::BuildingTree
        )
    }
}

impl fmt::Display for LoadPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            LoadPhase::Idle => "Idle",
            LoadPhase::Listing => "Listing entries",
            LoadPhase::DecompressingOuterLayer => "Decompressing outer layer",
            LoadPhase::ListingInner => "Listing inner archive",
            LoadPhase::BuildingTree => "Building tree",
            LoadPhase::Done => "Done",
            LoadPhase::Error => "Error",
            LoadPhase::Cancelled => "Cancelled",
        };
        f.write_str(text)
    }
}

/// 加载成功的结果
#[derive(Debug)]
pub struct LoadedArchive {
    pub detection: DetectionResult,
    pub tree: ArchiveTree,
    /// 剥层时创建的操作目录，归档关闭时删除
    pub scratch_dirs: Vec<PathBuf>,
}

pub struct ArchiveLoader {
    detector: Arc<TypeDetector>,
    selector: Arc<EngineSelector>,
}

impl ArchiveLoader {
    pub fn new(detector: Arc<TypeDetector>, selector: Arc<EngineSelector>) -> Self {
        Self { detector, selector }
    }

    pub fn detector(&self) -> &Arc<TypeDetector> {
        &self.detector
    }

    pub fn selector(&self) -> &Arc<EngineSelector> {
        &self.selector
    }

    /// 在阻塞线程中检测，文件读取不占用异步工作线程
    pub async fn detect(&self, path: &Path, consider_composition: bool) -> Result<Option<DetectionResult>> {
        let detector = Arc::clone(&self.detector);
        let path = path.to_path_buf();
        Ok(tokio::task::spawn_blocking(move || detector.detect(&path, consider_composition)).await?)
    }

    /// 检测并加载；不是归档时返回 `InvalidArchive`
    pub async fn load(&self, path: &Path, ctx: &OperationContext) -> Result<LoadedArchive> {
        self.enter_phase(ctx, LoadPhase::Idle);
        let detection = match self.detect(path, true).await {
            Ok(Some(detection)) => detection,
            Ok(None) => {
                return self.finish(
                    ctx,
                    Err(AppError::invalid_archive(
                        "Not a recognized archive",
                        Some(path.to_path_buf()),
                    )),
                )
            }
            Err(e) => return self.finish(ctx, Err(e)),
        };
        self.load_detected(path, detection, ctx).await
    }

    /// 用已有的检测结果加载
    pub async fn load_detected(
        &self,
        path: &Path,
        detection: DetectionResult,
        ctx: &OperationContext,
    ) -> Result<LoadedArchive> {
        let result = self.load_layers(path, detection, ctx).await;
        self.finish(ctx, result)
    }

    async fn load_layers(
        &self,
        path: &Path,
        detection: DetectionResult,
        ctx: &OperationContext,
    ) -> Result<LoadedArchive> {
        ctx.check_cancelled()?;
        info!(
            path = %path.display(),
            format = %detection.type_id(),
            compound = detection.is_compound(),
            "Loading archive"
        );

        let mut current = path.to_path_buf();

        if let Some(composition) = &detection.composition {
            // components = [容器, …, 最外层]，从最外层向内剥
            for layer in composition.components[1..].iter().rev() {
                ctx.check_cancelled()?;
                self.enter_phase(ctx, LoadPhase::DecompressingOuterLayer);
                current = self.peel_layer(layer, &current, ctx).await?;
            }
        }

        ctx.check_cancelled()?;
        let root_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        let phase = if detection.is_compound() {
            LoadPhase::ListingInner
        } else {
            LoadPhase::Listing
        };
        let bound = BoundArchive {
            path: current,
            format_id: detection.type_id().to_string(),
        };
        let tree = self.build_tree(bound, root_name, phase, ctx).await?;

        Ok(LoadedArchive {
            detection,
            tree,
            scratch_dirs: ctx.take_scratch_dirs(),
        })
    }

    /// 为已提取到磁盘的嵌套归档构建子树
    pub async fn load_nested(
        &self,
        bound: BoundArchive,
        display_name: &str,
        ctx: &OperationContext,
    ) -> Result<ArchiveTree> {
        self.enter_phase(ctx, LoadPhase::Idle);
        let result = match ctx.check_cancelled() {
            Ok(()) => {
                self.build_tree(bound, display_name.to_string(), LoadPhase::ListingInner, ctx)
                    .await
            }
            Err(e) => Err(e),
        };
        self.finish(ctx, result)
    }

    async fn peel_layer(&self, layer: &str, current: &Path, ctx: &OperationContext) -> Result<PathBuf> {
        let engine = self.selector.engine(layer).ok_or_else(|| {
            AppError::invalid_archive(
                format!("No engine available for format '{}'", layer),
                Some(current.to_path_buf()),
            )
        })?;

        let entries = engine.load_entries(current).await?;
        let first = entries.first().ok_or_else(|| {
            AppError::extraction_failed(
                format!("Compressed layer '{}' contains no entries", layer),
                Some(current.to_path_buf()),
            )
        })?;

        ctx.check_cancelled()?;
        let dir = ctx.scratch_dir().await?;
        let extracted = engine
            .extract_entry(first, current, &dir)
            .await?
            .ok_or_else(|| {
                AppError::extraction_failed(
                    format!("Failed to extract '{}' from {} layer", first.path, layer),
                    Some(current.to_path_buf()),
                )
            })?;

        debug!(layer = %layer, output = %extracted.display(), "Peeled compression layer");
        Ok(extracted)
    }

    /// 引擎选择、列出条目、构建树（在阻塞线程中）
    async fn build_tree(
        &self,
        bound: BoundArchive,
        root_name: String,
        phase: LoadPhase,
        ctx: &OperationContext,
    ) -> Result<ArchiveTree> {
        let engine = self.selector.engine(&bound.format_id).ok_or_else(|| {
            AppError::invalid_archive(
                format!("No engine available for format '{}'", bound.format_id),
                Some(bound.path.clone()),
            )
        })?;

        self.enter_phase(ctx, phase);
        let entries = engine.load_entries(&bound.path).await?;

        ctx.check_cancelled()?;
        self.enter_phase(ctx, LoadPhase::BuildingTree);
        let status = ctx.status.clone();
        let engine_id = engine.id().to_string();
        let tree = tokio::task::spawn_blocking(move || {
            ArchiveTree::build(root_name, bound, &entries, |fraction, message| {
                status.progress(fraction, message)
            })
        })
        .await?;

        ctx.check_cancelled()?;
        debug!(engine = %engine_id, nodes = tree.len(), "Archive tree ready");
        Ok(tree)
    }

    /// 终态只记录日志，由持有操作的一方决定是否上报
    fn enter_phase(&self, ctx: &OperationContext, phase: LoadPhase) {
        debug!(phase = %phase, "Loader phase");
        if phase.is_in_flight() {
            ctx.status.processing(phase.to_string());
        }
    }

    fn finish<T>(&self, ctx: &OperationContext, result: Result<T>) -> Result<T> {
        let phase = LoadPhase::finished(&result);
        match &result {
            Err(e) if phase == LoadPhase::Error => {
                warn!(phase = %phase, error = %e, "Loader phase")
            }
            _ => self.enter_phase(ctx, phase),
        }
        result
    }
}
