use std::sync::{Arc, OnceLock};

use prometheus::{
    CounterVec, Encoder, GaugeVec, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder,
};

#[derive(Clone, Debug)]
pub struct MetricsRegistry {
    inner: Arc<MetricsInner>,
}

#[derive(Debug)]
struct MetricsInner {
    registry: Registry,
    stage_rows_read: CounterVec,
    stage_rows_written: CounterVec,
    stage_rows_rejected: CounterVec,
    stage_errors: CounterVec,
    stage_time_seconds: HistogramVec,
    spill_bytes: CounterVec,
    spill_rows: CounterVec,
    spill_time_seconds: HistogramVec,
    scheduler_running_stages: GaugeVec,
    pipeline_runs: CounterVec,
}

/// Final counter values of one stage instance, as recorded into the registry.
#[derive(Debug, Clone, Copy, Default)]
pub struct StageSample {
    pub rows_read: u64,
    pub rows_written: u64,
    pub rows_rejected: u64,
    pub errors: u64,
    pub secs: f64,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MetricsInner::new()),
        }
    }

    pub fn record_stage(&self, run_id: &str, stage: &str, copy: u32, sample: StageSample) {
        let labels = [run_id, stage, &copy.to_string()];
        self.inner
            .stage_rows_read
            .with_label_values(&labels)
            .inc_by(sample.rows_read as f64);
        self.inner
            .stage_rows_written
            .with_label_values(&labels)
            .inc_by(sample.rows_written as f64);
        self.inner
            .stage_rows_rejected
            .with_label_values(&labels)
            .inc_by(sample.rows_rejected as f64);
        self.inner
            .stage_errors
            .with_label_values(&labels)
            .inc_by(sample.errors as f64);
        self.inner
            .stage_time_seconds
            .with_label_values(&labels)
            .observe(sample.secs.max(0.0));
    }

    pub fn record_spill(
        &self,
        run_id: &str,
        stage: &str,
        kind: &str,
        rows: u64,
        bytes: u64,
        secs: f64,
    ) {
        let labels = [run_id, stage, kind];
        self.inner
            .spill_bytes
            .with_label_values(&labels)
            .inc_by(bytes as f64);
        self.inner
            .spill_rows
            .with_label_values(&labels)
            .inc_by(rows as f64);
        self.inner
            .spill_time_seconds
            .with_label_values(&labels)
            .observe(secs.max(0.0));
    }

    pub fn set_running_stages(&self, run_id: &str, running: u64) {
        self.inner
            .scheduler_running_stages
            .with_label_values(&[run_id])
            .set(running as f64);
    }

    pub fn inc_pipeline_runs(&self, pipeline: &str, status: &str) {
        self.inner
            .pipeline_runs
            .with_label_values(&[pipeline, status])
            .inc();
    }

    pub fn render_prometheus(&self) -> String {
        let metric_families = self.inner.registry.gather();
        let mut out = Vec::new();
        let enc = TextEncoder::new();
        if enc.encode(&metric_families, &mut out).is_err() {
            return String::new();
        }
        String::from_utf8_lossy(&out).to_string()
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsInner {
    fn new() -> Self {
        let registry = Registry::new();

        let stage_rows_read = counter_vec(
            &registry,
            "rowflow_stage_rows_read_total",
            "Rows read from input channels per stage instance",
            &["run_id", "stage", "copy"],
        );
        let stage_rows_written = counter_vec(
            &registry,
            "rowflow_stage_rows_written_total",
            "Rows written to output channels per stage instance",
            &["run_id", "stage", "copy"],
        );
        let stage_rows_rejected = counter_vec(
            &registry,
            "rowflow_stage_rows_rejected_total",
            "Rows redirected to the error channel per stage instance",
            &["run_id", "stage", "copy"],
        );
        let stage_errors = counter_vec(
            &registry,
            "rowflow_stage_errors_total",
            "Fatal errors per stage instance",
            &["run_id", "stage", "copy"],
        );
        let stage_time_seconds = histogram_vec(
            &registry,
            "rowflow_stage_time_seconds",
            "Wall time of each stage instance",
            &["run_id", "stage", "copy"],
        );

        let spill_bytes = counter_vec(
            &registry,
            "rowflow_spill_bytes_total",
            "Spill bytes written",
            &["run_id", "stage", "kind"],
        );
        let spill_rows = counter_vec(
            &registry,
            "rowflow_spill_rows_total",
            "Spill rows written",
            &["run_id", "stage", "kind"],
        );
        let spill_time_seconds = histogram_vec(
            &registry,
            "rowflow_spill_time_seconds",
            "Spill write time",
            &["run_id", "stage", "kind"],
        );

        let scheduler_running_stages = gauge_vec(
            &registry,
            "rowflow_scheduler_running_stages",
            "Stage instance threads currently running",
            &["run_id"],
        );
        let pipeline_runs = counter_vec(
            &registry,
            "rowflow_pipeline_runs_total",
            "Completed pipeline runs by outcome",
            &["pipeline", "status"],
        );

        Self {
            registry,
            stage_rows_read,
            stage_rows_written,
            stage_rows_rejected,
            stage_errors,
            stage_time_seconds,
            spill_bytes,
            spill_rows,
            spill_time_seconds,
            scheduler_running_stages,
            pipeline_runs,
        }
    }
}

fn counter_vec(registry: &Registry, name: &str, help: &str, labels: &[&str]) -> CounterVec {
    let c = CounterVec::new(Opts::new(name, help), labels).expect("counter vec");
    registry
        .register(Box::new(c.clone()))
        .expect("register counter");
    c
}

fn gauge_vec(registry: &Registry, name: &str, help: &str, labels: &[&str]) -> GaugeVec {
    let g = GaugeVec::new(Opts::new(name, help), labels).expect("gauge vec");
    registry
        .register(Box::new(g.clone()))
        .expect("register gauge");
    g
}

fn histogram_vec(registry: &Registry, name: &str, help: &str, labels: &[&str]) -> HistogramVec {
    let h = HistogramVec::new(HistogramOpts::new(name, help), labels).expect("histogram vec");
    registry
        .register(Box::new(h.clone()))
        .expect("register histogram");
    h
}

static GLOBAL_METRICS: OnceLock<MetricsRegistry> = OnceLock::new();

pub fn global_metrics() -> &'static MetricsRegistry {
    GLOBAL_METRICS.get_or_init(MetricsRegistry::new)
}

#[cfg(test)]
mod tests {
    use super::{MetricsRegistry, StageSample};

    #[test]
    fn renders_prometheus_text() {
        let m = MetricsRegistry::new();
        m.record_stage(
            "1",
            "group",
            0,
            StageSample {
                rows_read: 10,
                rows_written: 3,
                ..StageSample::default()
            },
        );
        let text = m.render_prometheus();
        assert!(text.contains("rowflow_stage_rows_read_total"));
        assert!(text.contains("group"));
    }

    #[test]
    fn renders_all_metric_families() {
        let m = MetricsRegistry::new();
        m.record_stage("7", "src", 1, StageSample::default());
        m.record_spill("7", "group", "group_by", 3, 512, 0.005);
        m.set_running_stages("7", 4);
        m.inc_pipeline_runs("demo", "success");
        let text = m.render_prometheus();

        assert!(text.contains("rowflow_stage_rows_read_total"));
        assert!(text.contains("rowflow_stage_rows_written_total"));
        assert!(text.contains("rowflow_stage_rows_rejected_total"));
        assert!(text.contains("rowflow_stage_errors_total"));
        assert!(text.contains("rowflow_stage_time_seconds"));
        assert!(text.contains("rowflow_spill_bytes_total"));
        assert!(text.contains("rowflow_spill_rows_total"));
        assert!(text.contains("rowflow_spill_time_seconds"));
        assert!(text.contains("rowflow_scheduler_running_stages"));
        assert!(text.contains("rowflow_pipeline_runs_total"));
    }
}
