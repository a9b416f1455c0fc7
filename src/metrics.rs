use std::sync::LazyLock;

use prometheus::*;

static METRIC_SEARCH_COUNT: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!("clip_search_count", "count of the search requests", &["kind", "model"])
        .unwrap()
});

static METRIC_SEARCH_DURATION: LazyLock<HistogramVec> = LazyLock::new(|| {
    register_histogram_vec!(
        "clip_search_duration",
        "duration of the per-query search in seconds",
        &["kind", "model"]
    )
    .unwrap()
});

static METRIC_SEARCH_MAX_SCORE: LazyLock<HistogramVec> = LazyLock::new(|| {
    register_histogram_vec!(
        "clip_search_max_score",
        "max cosine similarity of the per-query search",
        &["kind", "model"],
        (-10..=10).map(|x| x as f64 / 10.).collect()
    )
    .unwrap()
});

static METRIC_INDEXED: LazyLock<IntGaugeVec> = LazyLock::new(|| {
    register_int_gauge_vec!("clip_indexed_images", "number of images in the vector index", &["model"])
        .unwrap()
});

static METRIC_EMBEDDED: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!("clip_embedded_images", "count of the embedded images", &["model"])
        .unwrap()
});

static METRIC_FAILED: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!("clip_failed_images", "count of the images failed to embed", &["model"])
        .unwrap()
});

/// 查询类型
#[derive(Debug, Clone, Copy)]
pub enum QueryKind {
    Text,
    Image,
    Similar,
}

impl QueryKind {
    fn as_str(&self) -> &'static str {
        match self {
            QueryKind::Text => "text",
            QueryKind::Image => "image",
            QueryKind::Similar => "similar",
        }
    }
}

pub fn inc_search_count(kind: QueryKind, model: &str) {
    METRIC_SEARCH_COUNT.with_label_values(&[kind.as_str(), model]).inc();
}

pub fn inc_search_duration(kind: QueryKind, model: &str, duration: f32) {
    METRIC_SEARCH_DURATION.with_label_values(&[kind.as_str(), model]).observe(duration as f64);
}

pub fn inc_search_max_score(kind: QueryKind, model: &str, score: f32) {
    METRIC_SEARCH_MAX_SCORE.with_label_values(&[kind.as_str(), model]).observe(score as f64);
}

pub fn set_indexed_count(model: &str, count: usize) {
    METRIC_INDEXED.with_label_values(&[model]).set(count as i64);
}

pub fn inc_embedded(model: &str) {
    METRIC_EMBEDDED.with_label_values(&[model]).inc();
}

pub fn inc_failed(model: &str) {
    METRIC_FAILED.with_label_values(&[model]).inc();
}
