use formats::{AssembledLayers, LayerResult};
use futures_util::future::try_join_all;
use runtime::{Hooks, Stage};

use crate::executor::{ExecutionError, LayerExecutor, Statement};
use crate::query::QuerySpec;
use crate::template::TemplateError;

/// Layer name used when a definition returns a single statement.
pub const DEFAULT_LAYER: &str = "vectile";

/// The statements one tile needs, one entry per output layer.
///
/// `None` marks a layer that is present in the output but never queried.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RenderPlan {
    layers: Vec<(String, Option<Statement>)>,
}

impl RenderPlan {
    /// Plans a resolved query.
    ///
    /// * `Empty` plans nothing.
    /// * `Mapping` plans one layer per key.
    /// * `Text` or `Sequence` plans the single layer [`DEFAULT_LAYER`].
    pub fn from_resolved(spec: &QuerySpec) -> Result<Self, TemplateError> {
        let layers = match spec {
            QuerySpec::Empty => Vec::new(),
            QuerySpec::Mapping(entries) => entries
                .iter()
                .map(|(name, entry)| {
                    let statement = match entry {
                        QuerySpec::Empty => None,
                        other => Some(Statement::from_resolved(name, other)?),
                    };
                    Ok((name.clone(), statement))
                })
                .collect::<Result<Vec<_>, TemplateError>>()?,
            other => vec![(
                DEFAULT_LAYER.to_string(),
                Some(Statement::from_resolved(DEFAULT_LAYER, other)?),
            )],
        };
        Ok(Self { layers })
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    pub fn layer_names(&self) -> impl Iterator<Item = &str> {
        self.layers.iter().map(|(name, _)| name.as_str())
    }

    /// Number of layers that will reach the executor.
    pub fn query_count(&self) -> usize {
        self.layers.iter().filter(|(_, s)| s.is_some()).count()
    }
}

/// Runs every planned layer concurrently and assembles the results.
///
/// The first failing layer fails the render; results of its siblings are
/// dropped and still-running siblings are cancelled.
pub async fn render_layers(
    executor: &dyn LayerExecutor,
    plan: &RenderPlan,
    hooks: &Hooks,
) -> Result<AssembledLayers, ExecutionError> {
    let jobs = plan.layers.iter().map(|(name, statement)| async move {
        let features: LayerResult = match statement {
            None => Vec::new(),
            Some(statement) => {
                tracing::debug!(layer = %name, statement = %statement, "running layer query");
                hooks
                    .timed(Stage::LayerQuery, name.as_str(), executor.execute(statement))
                    .await
                    .inspect_err(|e| tracing::warn!(layer = %name, error = %e, "layer query failed"))?
            }
        };
        Ok::<_, ExecutionError>((name.clone(), features))
    });

    let layers: AssembledLayers = try_join_all(jobs).await?.into_iter().collect();
    tracing::debug!(
        layers = layers.len(),
        features = layers.feature_count(),
        "layers assembled"
    );
    Ok(layers)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;
    use runtime::{Hooks, Instrumentation, Outcome, Stage, StageEvent};
    use serde_json::json;

    use super::{DEFAULT_LAYER, RenderPlan, render_layers};
    use crate::executor::{ExecutionError, GEOMETRY_COLUMN, MemoryExecutor, row};
    use crate::query::QuerySpec;

    fn point_rows(n: usize) -> Vec<crate::executor::Row> {
        (0..n)
            .map(|i| {
                row([
                    (GEOMETRY_COLUMN, json!({"type": "Point", "coordinates": [i, i]})),
                    ("i", json!(i)),
                ])
            })
            .collect()
    }

    #[derive(Default)]
    struct Recorder(Mutex<Vec<StageEvent>>);

    impl Instrumentation for Recorder {
        fn on_stage(&self, event: &StageEvent) {
            self.0.lock().push(event.clone());
        }
    }

    #[test]
    fn plans_by_shape() {
        assert!(RenderPlan::from_resolved(&QuerySpec::Empty).unwrap().is_empty());

        let single = RenderPlan::from_resolved(&QuerySpec::from("SELECT 1")).unwrap();
        assert_eq!(single.layer_names().collect::<Vec<_>>(), vec![DEFAULT_LAYER]);

        let multi = RenderPlan::from_resolved(&QuerySpec::layers([
            ("b", QuerySpec::from("SELECT 2")),
            ("a", QuerySpec::Empty),
        ]))
        .unwrap();
        assert_eq!(multi.layer_names().collect::<Vec<_>>(), vec!["a", "b"]);
        assert_eq!(multi.query_count(), 1);

        assert!(RenderPlan::from_resolved(&QuerySpec::from(5i64)).is_err());
    }

    #[tokio::test]
    async fn empty_spec_never_reaches_the_executor() {
        let exec = MemoryExecutor::new("mem");
        let plan = RenderPlan::from_resolved(&QuerySpec::Empty).unwrap();
        let layers = render_layers(&exec, &plan, &Hooks::none()).await.unwrap();
        assert!(layers.is_empty());
        assert_eq!(exec.calls(), 0);
    }

    #[tokio::test]
    async fn assembles_every_layer_and_times_each_query() {
        let exec = MemoryExecutor::new("mem")
            .with_rows("FROM roads", point_rows(2))
            .with_rows("FROM water", point_rows(3));
        let rec = Arc::new(Recorder::default());
        let hooks = Hooks::none().with(rec.clone());

        let plan = RenderPlan::from_resolved(&QuerySpec::layers([
            ("roads", QuerySpec::from("SELECT * FROM roads")),
            ("water", QuerySpec::from("SELECT * FROM water")),
            ("labels", QuerySpec::Empty),
        ]))
        .unwrap();
        let layers = render_layers(&exec, &plan, &hooks).await.unwrap();

        assert_eq!(
            layers.layer_names().collect::<Vec<_>>(),
            vec!["labels", "roads", "water"]
        );
        assert_eq!(layers.get("roads").unwrap().len(), 2);
        assert_eq!(layers.get("water").unwrap().len(), 3);
        assert!(layers.get("labels").unwrap().is_empty());
        assert_eq!(exec.calls(), 2);

        let mut labels: Vec<String> = rec
            .0
            .lock()
            .iter()
            .filter(|e| e.stage == Stage::LayerQuery && e.outcome == Outcome::Success)
            .map(|e| e.label.clone())
            .collect();
        labels.sort();
        assert_eq!(labels, vec!["roads", "water"]);
    }

    #[tokio::test]
    async fn one_failing_layer_fails_the_render() {
        let exec = MemoryExecutor::new("mem")
            .with_rows("FROM roads", point_rows(1))
            .with_failure("FROM water", "boom");
        let plan = RenderPlan::from_resolved(&QuerySpec::layers([
            ("roads", QuerySpec::from("SELECT * FROM roads")),
            ("water", QuerySpec::from("SELECT * FROM water")),
        ]))
        .unwrap();

        let err = render_layers(&exec, &plan, &Hooks::none()).await.unwrap_err();
        assert!(matches!(err, ExecutionError::Query { ref statement, .. } if statement.contains("water")));
    }
}
