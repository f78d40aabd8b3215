//! 进度报告器
//!
//! 树构建和多条目提取共用，按百分比间隔或时间间隔节流状态消息

use std::time::{Duration, Instant};

const MAX_SILENCE: Duration = Duration::from_secs(2);

/// 节流的进度计数器
#[derive(Debug)]
pub struct ProgressReporter {
    /// 动作名，出现在消息开头，如 "Building tree"
    label: String,
    total: usize,
    processed: usize,
    last_reported_percentage: u8,
    /// 报告间隔(百分比)
    report_interval: u8,
    start_time: Instant,
    last_report_time: Instant,
}

impl ProgressReporter {
    /// # Arguments
    ///
    /// * `label` - 消息前缀
    /// * `total` - 总条目数
    /// * `report_interval` - 报告间隔(百分比)
    pub fn new(label: impl Into<String>, total: usize, report_interval: u8) -> Self {
        let now = Instant::now();
        Self {
            label: label.into(),
            total,
            processed: 0,
            last_reported_percentage: 0,
            report_interval: report_interval.max(1),
            start_time: now,
            last_report_time: now,
        }
    }

    /// 记录一个条目处理完成
    pub fn inc(&mut self) {
        self.processed = (self.processed + 1).min(self.total);
    }

    /// 百分比跨过间隔、超过 2 秒未报告，或到达最后一个条目时返回 true
    pub fn should_report(&self) -> bool {
        if self.total == 0 {
            return false;
        }

        let current_pct = self.percentage();
        let pct_changed =
            current_pct >= self.last_reported_percentage.saturating_add(self.report_interval);
        let time_elapsed = self.last_report_time.elapsed() >= MAX_SILENCE;
        let is_last = self.processed == self.total;

        pct_changed || time_elapsed || is_last
    }

    pub fn percentage(&self) -> u8 {
        if self.total == 0 {
            return 0;
        }
        (self.processed * 100 / self.total) as u8
    }

    /// 0.0 ..= 1.0，用于 `Status::Processing::progress`
    pub fn fraction(&self) -> f32 {
        if self.total == 0 {
            return 0.0;
        }
        self.processed as f32 / self.total as f32
    }

    pub fn message(&self) -> String {
        if self.total == 0 {
            return format!("{}...", self.label);
        }

        let elapsed = self.start_time.elapsed().as_secs_f64();
        let speed = if elapsed > 0.0 {
            self.processed as f64 / elapsed
        } else {
            0.0
        };

        format!(
            "{}... {}% ({}/{}, {:.1} items/s)",
            self.label,
            self.percentage(),
            self.processed,
            self.total,
            speed
        )
    }

    pub fn mark_reported(&mut self) {
        self.last_reported_percentage = self.percentage();
        self.last_report_time = Instant::now();
    }

    /// 如果应该报告，返回 `(fraction, message)` 并标记已报告
    pub fn poll(&mut self) -> Option<(f32, String)> {
        if !self.should_report() {
            return None;
        }
        let update = (self.fraction(), self.message());
        self.mark_reported();
        Some(update)
    }
}
