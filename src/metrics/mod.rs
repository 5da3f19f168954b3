//! # Prometheus 指标收集模块
//!
//! 会话引擎的变更计数、投递结果与 outbox 积压。

use once_cell::sync::Lazy;
use prometheus::{HistogramOpts, HistogramVec, IntCounterVec, IntGauge, Opts, Registry};

/// 全局指标注册表
pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

/// 全局会话引擎指标
pub static CHAT_METRICS: Lazy<ChatMetrics> = Lazy::new(ChatMetrics::new);

/// 会话引擎指标
pub struct ChatMetrics {
    /// 变更操作总数
    pub mutations_total: IntCounterVec,
    /// 变更操作耗时（秒）
    pub mutation_duration_seconds: HistogramVec,
    /// 实时投递次数（按通道与结果）
    pub deliveries_total: IntCounterVec,
    /// 待投递 outbox 记录数
    pub outbox_pending: IntGauge,
}

impl ChatMetrics {
    pub fn new() -> Self {
        let mutations_total = IntCounterVec::new(
            Opts::new("chat_mutations_total", "Total number of chat mutations"),
            &["operation", "outcome"],
        )
        .expect("Failed to create chat_mutations_total metric");

        let mutation_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "chat_mutation_duration_seconds",
                "Chat mutation duration in seconds",
            )
            .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0]),
            &["operation"],
        )
        .expect("Failed to create chat_mutation_duration_seconds metric");

        let deliveries_total = IntCounterVec::new(
            Opts::new(
                "chat_deliveries_total",
                "Total number of realtime delivery attempts",
            ),
            &["channel", "outcome"],
        )
        .expect("Failed to create chat_deliveries_total metric");

        let outbox_pending = IntGauge::new(
            "chat_outbox_pending",
            "Number of undelivered outbox records",
        )
        .expect("Failed to create chat_outbox_pending metric");

        // 注册指标，忽略重复注册错误（测试中可能重复创建）
        let _ = REGISTRY.register(Box::new(mutations_total.clone()));
        let _ = REGISTRY.register(Box::new(mutation_duration_seconds.clone()));
        let _ = REGISTRY.register(Box::new(deliveries_total.clone()));
        let _ = REGISTRY.register(Box::new(outbox_pending.clone()));

        Self {
            mutations_total,
            mutation_duration_seconds,
            deliveries_total,
            outbox_pending,
        }
    }

    pub fn record_mutation(&self, operation: &str, ok: bool, elapsed_secs: f64) {
        let outcome = if ok { "ok" } else { "error" };
        self.mutations_total
            .with_label_values(&[operation, outcome])
            .inc();
        self.mutation_duration_seconds
            .with_label_values(&[operation])
            .observe(elapsed_secs);
    }

    pub fn record_delivery(&self, channel: &str, ok: bool) {
        let outcome = if ok { "delivered" } else { "failed" };
        self.deliveries_total
            .with_label_values(&[channel, outcome])
            .inc();
    }
}

impl Default for ChatMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_record() {
        let metrics = &*CHAT_METRICS;
        let before = metrics
            .deliveries_total
            .with_label_values(&["user_topic", "failed"])
            .get();
        metrics.record_delivery("user_topic", false);
        let after = metrics
            .deliveries_total
            .with_label_values(&["user_topic", "failed"])
            .get();
        assert_eq!(after, before + 1);

        metrics.record_mutation("send", true, 0.002);
        assert!(
            metrics
                .mutations_total
                .with_label_values(&["send", "ok"])
                .get()
                >= 1
        );
    }
}
