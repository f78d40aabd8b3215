//! 虚拟目录树
//!
//! 节点保存在 arena 中，以 [`ItemId`] 句柄互相引用。每棵树有一个合成根节点，
//! 根节点总是绑定到一个物理归档；嵌套归档惰性展开时，对应的文件节点被绑定
//! 并挂上子树。

use crate::archive::engine::{ArchiveEntry, EntryKind};
use crate::archive::progress_reporter::ProgressReporter;
use chrono::NaiveDateTime;
use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use tracing::{debug, warn};

/// arena 中节点的句柄
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ItemId(usize);

impl ItemId {
    pub fn index(self) -> usize {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemKind {
    Root,
    File,
    Directory,
    Unknown,
}

impl From<EntryKind> for ItemKind {
    fn from(kind: EntryKind) -> Self {
        match kind {
            EntryKind::File => ItemKind::File,
            EntryKind::Directory => ItemKind::Directory,
            EntryKind::Unknown => ItemKind::Unknown,
        }
    }
}

/// 节点对应的物理归档文件
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BoundArchive {
    pub path: PathBuf,
    pub format_id: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ArchiveItem {
    pub name: String,
    /// 在所属归档中的路径，根节点为空串
    pub virtual_path: String,
    pub kind: ItemKind,
    pub parent: Option<ItemId>,
    /// 目录和根节点总是 `Some`；文件在展开前为 `None`
    pub children: Option<Vec<ItemId>>,
    pub bound: Option<BoundArchive>,
    pub compressed_size: i64,
    pub uncompressed_size: i64,
    pub modified: Option<NaiveDateTime>,
    pub permissions: Option<u32>,
}

impl ArchiveItem {
    fn root(name: String, bound: BoundArchive) -> Self {
        Self {
            name,
            virtual_path: String::new(),
            kind: ItemKind::Root,
            parent: None,
            children: Some(Vec::new()),
            bound: Some(bound),
            compressed_size: -1,
            uncompressed_size: -1,
            modified: None,
            permissions: None,
        }
    }

    fn implicit_directory(path: &str, parent: ItemId) -> Self {
        Self {
            name: last_segment(path).to_string(),
            virtual_path: path.to_string(),
            kind: ItemKind::Directory,
            parent: Some(parent),
            children: Some(Vec::new()),
            bound: None,
            compressed_size: -1,
            uncompressed_size: -1,
            modified: None,
            permissions: None,
        }
    }

    fn from_entry(entry: &ArchiveEntry, parent: ItemId) -> Self {
        let kind = ItemKind::from(entry.kind);
        Self {
            name: entry.name().to_string(),
            virtual_path: entry.path.clone(),
            kind,
            parent: Some(parent),
            children: (kind == ItemKind::Directory).then(Vec::new),
            bound: None,
            compressed_size: entry.compressed_size,
            uncompressed_size: entry.uncompressed_size,
            modified: entry.modified,
            permissions: entry.permissions,
        }
    }

    pub fn is_container(&self) -> bool {
        matches!(self.kind, ItemKind::Root | ItemKind::Directory)
    }

    /// 已展开的嵌套归档文件
    pub fn is_unfolded(&self) -> bool {
        self.kind == ItemKind::File && self.children.is_some()
    }

    /// 交给引擎提取时使用的条目描述
    pub fn to_entry(&self) -> ArchiveEntry {
        let kind = match self.kind {
            ItemKind::Directory => EntryKind::Directory,
            ItemKind::Unknown => EntryKind::Unknown,
            ItemKind::File | ItemKind::Root => EntryKind::File,
        };
        ArchiveEntry::new(&self.virtual_path, kind)
            .with_sizes(self.compressed_size, self.uncompressed_size)
            .with_modified(self.modified)
            .with_permissions(self.permissions)
    }
}

/// 一次打开的归档对应的整棵树
#[derive(Debug, Clone)]
pub struct ArchiveTree {
    items: Vec<ArchiveItem>,
}

const ROOT: ItemId = ItemId(0);

impl ArchiveTree {
    /// 从扁平条目列表构建树
    ///
    /// 缺失的父目录按需创建；重复条目静默跳过；文件与目录同名冲突时保留先到者。
    /// 结果与条目顺序无关（子节点顺序除外）。
    pub fn build(
        root_name: impl Into<String>,
        bound: BoundArchive,
        entries: &[ArchiveEntry],
        mut on_progress: impl FnMut(f32, String),
    ) -> Self {
        let mut tree = Self {
            items: vec![ArchiveItem::root(root_name.into(), bound)],
        };
        // 路径 -> 节点，包含目录和文件，根为 ""
        let mut cache: HashMap<String, ItemId> = HashMap::with_capacity(entries.len() + 1);
        cache.insert(String::new(), ROOT);

        let mut reporter = ProgressReporter::new("Building tree", entries.len(), 5);

        for entry in entries {
            tree.insert(entry, &mut cache);
            reporter.inc();
            if let Some((fraction, message)) = reporter.poll() {
                on_progress(fraction, message);
            }
        }

        debug!(entries = entries.len(), nodes = tree.items.len(), "Archive tree built");
        tree
    }

    fn insert(&mut self, entry: &ArchiveEntry, cache: &mut HashMap<String, ItemId>) {
        if entry.path.is_empty() {
            return;
        }

        let parent_path = parent_path(&entry.path);
        let Some(parent) = self.ensure_directory(parent_path, cache) else {
            warn!(entry = %entry.path, "Parent path is a file, skipping entry");
            return;
        };

        if let Some(&existing) = cache.get(&entry.path) {
            let existing_kind = self.items[existing.0].kind;
            match (existing_kind, entry.kind) {
                (ItemKind::Directory, EntryKind::Directory) => {
                    // 显式目录条目晚于隐式创建到达时补全元数据
                    let item = &mut self.items[existing.0];
                    if item.modified.is_none() {
                        item.modified = entry.modified;
                    }
                    if item.permissions.is_none() {
                        item.permissions = entry.permissions;
                    }
                }
                (ItemKind::Directory, _) | (_, EntryKind::Directory) => {
                    warn!(entry = %entry.path, "File and directory share a path, keeping the first");
                }
                _ => {}
            }
            return;
        }

        let id = self.push(ArchiveItem::from_entry(entry, parent));
        cache.insert(entry.path.clone(), id);
    }

    /// 返回目录节点，沿途创建缺失的祖先；路径被文件占用时返回 `None`
    fn ensure_directory(
        &mut self,
        path: &str,
        cache: &mut HashMap<String, ItemId>,
    ) -> Option<ItemId> {
        if let Some(&id) = cache.get(path) {
            return self.items[id.0].is_container().then_some(id);
        }

        // 找到最近的已缓存祖先，再向下补齐
        let mut missing = vec![path];
        let mut cursor = parent_path(path);
        let mut ancestor = loop {
            if let Some(&id) = cache.get(cursor) {
                break id;
            }
            missing.push(cursor);
            cursor = parent_path(cursor);
        };
        if !self.items[ancestor.0].is_container() {
            return None;
        }

        for dir_path in missing.into_iter().rev() {
            let id = self.push(ArchiveItem::implicit_directory(dir_path, ancestor));
            cache.insert(dir_path.to_string(), id);
            ancestor = id;
        }
        Some(ancestor)
    }

    fn push(&mut self, item: ArchiveItem) -> ItemId {
        let id = ItemId(self.items.len());
        let parent = item.parent;
        self.items.push(item);
        if let Some(parent) = parent {
            if let Some(children) = self.items[parent.0].children.as_mut() {
                children.push(id);
            }
        }
        id
    }

    pub fn root(&self) -> ItemId {
        ROOT
    }

    pub fn get(&self, id: ItemId) -> Option<&ArchiveItem> {
        self.items.get(id.0)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.len() <= 1
    }

    pub fn children(&self, id: ItemId) -> &[ItemId] {
        self.get(id)
            .and_then(|item| item.children.as_deref())
            .unwrap_or(&[])
    }

    /// 目录在前，然后按名称（不区分大小写）排序
    pub fn children_sorted(&self, id: ItemId) -> Vec<ItemId> {
        let mut children = self.children(id).to_vec();
        children.sort_by(|a, b| {
            let (a, b) = (&self.items[a.0], &self.items[b.0]);
            b.is_container()
                .cmp(&a.is_container())
                .then_with(|| a.name.to_lowercase().cmp(&b.name.to_lowercase()))
                .then_with(|| a.name.cmp(&b.name))
        });
        children
    }

    /// 从 `from` 出发按 `/` 分隔的名称逐级查找
    pub fn find_by_path(&self, from: ItemId, path: &str) -> Option<ItemId> {
        path.split('/')
            .filter(|segment| !segment.is_empty() && *segment != ".")
            .try_fold(from, |current, segment| {
                self.children(current)
                    .iter()
                    .copied()
                    .find(|child| self.items[child.0].name == segment)
            })
    }

    /// 包含 `id` 这个条目的物理归档，即从父节点起最近的绑定祖先
    ///
    /// 根节点没有所属归档。
    pub fn owner_of(&self, id: ItemId) -> Option<&BoundArchive> {
        let mut cursor = self.get(id)?.parent;
        while let Some(current) = cursor {
            let item = &self.items[current.0];
            if let Some(bound) = &item.bound {
                return Some(bound);
            }
            cursor = item.parent;
        }
        None
    }

    /// 嵌套深度：顶层归档内的条目为 0，每穿过一层已展开的嵌套归档加 1
    pub fn depth_of(&self, id: ItemId) -> usize {
        let mut depth = 0;
        let mut cursor = self.get(id).and_then(|item| item.parent);
        while let Some(current) = cursor {
            let item = &self.items[current.0];
            if item.bound.is_some() && item.parent.is_some() {
                depth += 1;
            }
            cursor = item.parent;
        }
        depth
    }

    /// 将独立构建的子树挂到 `at` 上
    ///
    /// `at` 获得子树根的绑定和子节点；子树根本身被丢弃。`at` 已展开或
    /// 不是文件时不做任何改变并返回 `false`。
    pub fn graft(&mut self, at: ItemId, subtree: ArchiveTree) -> bool {
        match self.get(at) {
            Some(item) if item.kind == ItemKind::File && item.children.is_none() => {}
            _ => return false,
        }

        let base = self.items.len();
        // 子树中 i (>0) 映射到 base + i - 1，子树根映射到 at
        let remap = |id: ItemId| {
            if id == ROOT {
                at
            } else {
                ItemId(base + id.0 - 1)
            }
        };

        let mut sub_items = subtree.items.into_iter();
        let Some(sub_root) = sub_items.next() else {
            return false;
        };

        for mut item in sub_items {
            item.parent = item.parent.map(remap);
            if let Some(children) = item.children.as_mut() {
                for child in children.iter_mut() {
                    *child = remap(*child);
                }
            }
            self.items.push(item);
        }

        let target = &mut self.items[at.0];
        target.bound = sub_root.bound;
        target.children = Some(
            sub_root
                .children
                .unwrap_or_default()
                .into_iter()
                .map(remap)
                .collect(),
        );
        true
    }

    /// 深度优先遍历 `from` 下的所有节点（不含 `from`）
    pub fn descendants(&self, from: ItemId) -> Vec<ItemId> {
        let mut result = Vec::new();
        let mut stack: Vec<ItemId> = self.children(from).iter().rev().copied().collect();
        while let Some(id) = stack.pop() {
            result.push(id);
            stack.extend(self.children(id).iter().rev().copied());
        }
        result
    }
}

fn parent_path(path: &str) -> &str {
    path.rfind('/').map(|i| &path[..i]).unwrap_or("")
}

fn last_segment(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}
