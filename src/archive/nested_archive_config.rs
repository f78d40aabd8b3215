//! 嵌套压缩包配置
//!
//! 控制在浏览时可以惰性展开多少层嵌套归档

use serde::{Deserialize, Serialize};

/// 嵌套归档展开配置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NestedArchiveConfig {
    /// 最大嵌套深度（打开的顶层归档深度为 0）
    #[serde(default = "default_max_depth")]
    pub max_depth: usize,

    /// 是否允许展开嵌套归档；关闭时嵌套归档交给外部程序打开
    #[serde(default = "default_true")]
    pub unfold_nested: bool,
}

fn default_max_depth() -> usize {
    15
}

fn default_true() -> bool {
    true
}

impl Default for NestedArchiveConfig {
    fn default() -> Self {
        Self {
            max_depth: default_max_depth(),
            unfold_nested: default_true(),
        }
    }
}

impl NestedArchiveConfig {
    /// 当前深度为 `depth` 的文件能否再展开一层
    pub fn allows_unfold(&self, depth: usize) -> bool {
        self.unfold_nested && depth < self.max_depth
    }

    /// 验证配置有效性
    pub fn validate(&self) -> Result<(), String> {
        if self.max_depth == 0 {
            return Err("max_depth must be positive".to_string());
        }
        if self.max_depth > 64 {
            return Err(format!(
                "max_depth {} is unreasonably large (limit 64)",
                self.max_depth
            ));
        }
        Ok(())
    }
}
