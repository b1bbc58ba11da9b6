//! Prometheus exposition of the stats snapshot.
//!
//! Gauges are refreshed from a fresh [`StatsSnapshot`] on every scrape, so
//! the text output always agrees with `/v1/cache/stats`.

use prometheus::{Encoder, Gauge, GaugeVec, IntGaugeVec, Opts, Registry, TextEncoder};

use crate::cache::stats::{StatsSnapshot, TierStats};

pub struct Metrics {
    registry: Registry,
    hit_rate: GaugeVec,
    size_bytes: IntGaugeVec,
    item_count: IntGaugeVec,
    evictions_per_hour: GaugeVec,
    arc_target_bytes: IntGaugeVec,
    predictive_accuracy: Gauge,
    prefetch_efficiency: Gauge,
    semantic_entries: IntGaugeVec,
    semantic_matches: IntGaugeVec,
    semantic_utilization: Gauge,
    semantic_similarity: Gauge,
}

impl Metrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new_custom(Some("vfs_cache".to_string()), None)?;

        let hit_rate = GaugeVec::new(Opts::new("hit_rate", "Tier hit rate in [0, 1]"), &["tier"])?;
        let size_bytes = IntGaugeVec::new(Opts::new("size_bytes", "Bytes resident in the tier"), &["tier"])?;
        let item_count = IntGaugeVec::new(Opts::new("item_count", "Entries resident in the tier"), &["tier"])?;
        let evictions_per_hour = GaugeVec::new(
            Opts::new("evictions_per_hour", "Evictions in the trailing hour"),
            &["tier"],
        )?;
        let arc_target_bytes = IntGaugeVec::new(
            Opts::new("arc_target_t1_bytes", "ARC adaptive target p for T1"),
            &["tier"],
        )?;
        let predictive_accuracy = Gauge::new(
            "prefetch_predictive_accuracy",
            "Prefetched keys accessed within the hit TTL over all prefetched keys",
        )?;
        let prefetch_efficiency = Gauge::new(
            "prefetch_efficiency",
            "Prefetched keys consumed before eviction over all settled prefetches",
        )?;
        let semantic_entries = IntGaugeVec::new(
            Opts::new("semantic_cache_entries", "Semantic cache entries"),
            &["model"],
        )?;
        let semantic_matches = IntGaugeVec::new(
            Opts::new("semantic_matches", "Semantic cache matches by kind"),
            &["kind"],
        )?;
        let semantic_utilization =
            Gauge::new("semantic_cache_utilization", "Semantic cache entries over capacity")?;
        let semantic_similarity =
            Gauge::new("semantic_average_similarity", "Mean similarity of semantic matches")?;

        registry.register(Box::new(hit_rate.clone()))?;
        registry.register(Box::new(size_bytes.clone()))?;
        registry.register(Box::new(item_count.clone()))?;
        registry.register(Box::new(evictions_per_hour.clone()))?;
        registry.register(Box::new(arc_target_bytes.clone()))?;
        registry.register(Box::new(predictive_accuracy.clone()))?;
        registry.register(Box::new(prefetch_efficiency.clone()))?;
        registry.register(Box::new(semantic_entries.clone()))?;
        registry.register(Box::new(semantic_matches.clone()))?;
        registry.register(Box::new(semantic_utilization.clone()))?;
        registry.register(Box::new(semantic_similarity.clone()))?;

        Ok(Self {
            registry,
            hit_rate,
            size_bytes,
            item_count,
            evictions_per_hour,
            arc_target_bytes,
            predictive_accuracy,
            prefetch_efficiency,
            semantic_entries,
            semantic_matches,
            semantic_utilization,
            semantic_similarity,
        })
    }

    fn set_tier(&self, tier: &str, stats: &TierStats, p_bytes: u64) {
        self.hit_rate.with_label_values(&[tier]).set(stats.hit_rate);
        self.size_bytes
            .with_label_values(&[tier])
            .set(stats.size_bytes as i64);
        self.item_count
            .with_label_values(&[tier])
            .set(stats.item_count as i64);
        self.evictions_per_hour
            .with_label_values(&[tier])
            .set(stats.evictions_per_hour);
        self.arc_target_bytes
            .with_label_values(&[tier])
            .set(p_bytes as i64);
    }

    /// Refresh every gauge from `snapshot` and render the text format.
    pub fn render(&self, snapshot: &StatsSnapshot) -> Result<String, prometheus::Error> {
        self.set_tier("memory", &snapshot.memory, snapshot.arc.memory.p_bytes);
        self.set_tier("disk", &snapshot.disk, snapshot.arc.disk.p_bytes);

        self.predictive_accuracy
            .set(snapshot.prefetcher.predictive_accuracy);
        self.prefetch_efficiency
            .set(snapshot.prefetcher.prefetch_efficiency);

        let semantic = &snapshot.semantic_cache;
        self.semantic_entries
            .with_label_values(&[semantic.embedding_model_name.as_str()])
            .set(semantic.cache_entries as i64);
        self.semantic_matches
            .with_label_values(&["exact"])
            .set(semantic.exact_matches as i64);
        self.semantic_matches
            .with_label_values(&["similarity"])
            .set(semantic.similarity_matches as i64);
        self.semantic_utilization.set(semantic.cache_utilization);
        self.semantic_similarity.set(semantic.average_similarity);

        let mut buf = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buf)?;
        String::from_utf8(buf).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::stats::CacheStats;

    #[test]
    fn test_render_contains_tier_gauges() {
        let stats = CacheStats::new();
        stats.memory.record_hit();
        stats.memory.record_miss();

        let metrics = Metrics::new().unwrap();
        let text = metrics.render(&stats.snapshot("all-MiniLM-L6-v2", 0.92)).unwrap();

        assert!(text.contains("vfs_cache_hit_rate{tier=\"memory\"} 0.5"));
        assert!(text.contains("vfs_cache_item_count{tier=\"disk\"} 0"));
        assert!(text.contains("model=\"all-MiniLM-L6-v2\""));
    }
}
