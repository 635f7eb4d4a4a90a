use std::collections::HashMap;

use rowflow_execution::{Row, SchemaRef};
use rowflow_runtime::PipelineResult;
use serde_json::{Map, Value as Json, json};

/// A finished run plus the output layout of every stage, for rendering collected rows.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub result: PipelineResult,
    schemas: HashMap<String, SchemaRef>,
}

impl RunReport {
    pub fn new(result: PipelineResult, schemas: HashMap<String, SchemaRef>) -> Self {
        Self { result, schemas }
    }

    pub fn success(&self) -> bool {
        self.result.success
    }

    pub fn schema(&self, stage: &str) -> Option<&SchemaRef> {
        self.schemas.get(stage)
    }

    /// Rows collected by `stage` as JSON objects keyed by field name.
    pub fn rows_json(&self, stage: &str) -> Vec<Json> {
        let rows = self.result.rows(stage);
        match self.schemas.get(stage) {
            Some(schema) => rows.iter().map(|r| row_object(schema, r)).collect(),
            None => rows
                .iter()
                .map(|r| Json::Array(r.values().iter().map(|v| v.to_json()).collect()))
                .collect(),
        }
    }

    /// Run status, per-stage counters, and every collected output.
    pub fn to_json(&self) -> Json {
        let stages = self
            .result
            .stages
            .iter()
            .map(|s| {
                json!({
                    "stage": s.instance.stage,
                    "copy": s.instance.copy,
                    "read": s.counters.read,
                    "written": s.counters.written,
                    "input": s.counters.input,
                    "output": s.counters.output,
                    "rejected": s.counters.rejected,
                    "errors": s.counters.errors,
                    "secs": s.secs,
                    "failure": s.failure,
                })
            })
            .collect::<Vec<_>>();
        let mut names = self.result.outputs.keys().collect::<Vec<_>>();
        names.sort();
        let outputs = names
            .into_iter()
            .map(|name| (name.clone(), Json::Array(self.rows_json(name))))
            .collect::<Map<_, _>>();
        json!({
            "pipeline": self.result.pipeline,
            "run_id": self.result.run_id.to_string(),
            "success": self.result.success,
            "stopped": self.result.stopped,
            "errors": self.result.errors,
            "rejected": self.result.rejected,
            "stages": stages,
            "outputs": outputs,
        })
    }
}

fn row_object(schema: &SchemaRef, row: &Row) -> Json {
    let mut obj = Map::with_capacity(row.len());
    for (i, value) in row.values().iter().enumerate() {
        let key = if i < schema.len() {
            schema.field(i).name.clone()
        } else {
            format!("_{i}")
        };
        obj.insert(key, value.to_json());
    }
    Json::Object(obj)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Arc;

    use rowflow_common::RunId;
    use rowflow_execution::{FieldMeta, Row, Schema, Value, ValueType};
    use rowflow_runtime::PipelineResult;
    use serde_json::json;

    use super::RunReport;

    #[test]
    fn renders_rows_by_field_name() {
        let schema = Arc::new(Schema::new(vec![
            FieldMeta::new("k", ValueType::String),
            FieldMeta::new("total", ValueType::Integer),
        ]));
        let result = PipelineResult {
            pipeline: "p".to_string(),
            run_id: RunId::next(),
            success: true,
            stopped: false,
            errors: 0,
            rejected: 0,
            stages: Vec::new(),
            outputs: HashMap::from([(
                "out".to_string(),
                vec![Row::new(vec![Value::from("A"), Value::Integer(6)])],
            )]),
        };
        let report = RunReport::new(result, HashMap::from([("out".to_string(), schema)]));
        assert_eq!(report.rows_json("out"), vec![json!({"k": "A", "total": 6})]);
        assert_eq!(report.to_json()["outputs"]["out"][0]["total"], json!(6));
        assert!(report.rows_json("missing").is_empty());
    }
}
