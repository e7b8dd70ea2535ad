//! Declarative pipeline descriptions (YAML) and their two directions:
//! building a [`Pipeline`] from a description and emitting a description
//! from a live pipeline.

use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::connection::AnyConnection;
use crate::error::{PipelineError, PipelineResult};
use crate::pipeline::Pipeline;
use crate::registry::{Registry, StageWiring};
use crate::slot::Strategy;
use crate::stage::{StageKind, StageParams};

/// Complete pipeline description
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PipelineDescription {
    /// Stages, parents before children
    #[serde(default)]
    pub stages: Vec<StageDecl>,
}

/// Individual stage declaration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StageDecl {
    /// Registry key of the stage type
    pub name: String,
    /// Unique stage id within the pipeline
    pub id: String,
    #[serde(rename = "type")]
    pub kind: StageKind,
    /// Output capacity; producing stages only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capacity: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy: Option<Strategy>,
    /// Id of the stage whose output this stage consumes
    #[serde(rename = "parentId", default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    #[serde(default, skip_serializing_if = "StageParams::is_empty")]
    pub params: StageParams,
}

impl PipelineDescription {
    pub fn from_yaml(yaml: &str) -> PipelineResult<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    pub fn from_file(path: impl AsRef<Path>) -> PipelineResult<Self> {
        let path = path.as_ref();
        debug!("Loading pipeline description from {}", path.display());
        Self::from_yaml(&fs::read_to_string(path)?)
    }

    pub fn to_yaml(&self) -> PipelineResult<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Structural checks that need no registry.
    pub fn validate(&self) -> PipelineResult<()> {
        let mut declared: HashMap<&str, StageKind> = HashMap::new();

        for stage in &self.stages {
            if declared.contains_key(stage.id.as_str()) {
                return Err(PipelineError::config(format!(
                    "stage id '{}' is declared more than once",
                    stage.id
                )));
            }

            let consumes = stage.kind.consumes();
            if consumes != stage.strategy.is_some() {
                return Err(PipelineError::config(if consumes {
                    format!("{} stage '{}' needs a strategy", stage.kind, stage.id)
                } else {
                    format!("{} stage '{}' cannot have a strategy", stage.kind, stage.id)
                }));
            }

            match (&stage.parent_id, consumes) {
                (None, true) => {
                    return Err(PipelineError::config(format!(
                        "{} stage '{}' needs a parentId",
                        stage.kind, stage.id
                    )))
                }
                (Some(_), false) => {
                    return Err(PipelineError::config(format!(
                        "{} stage '{}' cannot have a parentId",
                        stage.kind, stage.id
                    )))
                }
                (Some(parent), true) => match declared.get(parent.as_str()) {
                    None => {
                        return Err(PipelineError::config(format!(
                            "parent '{}' of stage '{}' is not declared before it",
                            parent, stage.id
                        )))
                    }
                    Some(kind) if !kind.produces() => {
                        return Err(PipelineError::config(format!(
                            "parent '{}' of stage '{}' is a {} and produces nothing",
                            parent, stage.id, kind
                        )))
                    }
                    Some(_) => {}
                },
                (None, false) => {}
            }

            match stage.capacity {
                Some(_) if !stage.kind.produces() => {
                    return Err(PipelineError::config(format!(
                        "{} stage '{}' has no output to size",
                        stage.kind, stage.id
                    )))
                }
                Some(0) => {
                    return Err(PipelineError::config(format!(
                        "stage '{}' declares a capacity of zero",
                        stage.id
                    )))
                }
                _ => {}
            }

            declared.insert(stage.id.as_str(), stage.kind);
        }
        Ok(())
    }

    /// Instantiates every declared stage and its output connection.
    pub fn build(&self, registry: &Registry) -> PipelineResult<Pipeline> {
        self.validate()?;

        let mut pipeline = Pipeline::new();
        let mut outputs: HashMap<&str, Arc<dyn AnyConnection>> = HashMap::new();

        for decl in &self.stages {
            let registered = registry.kind_of(&decl.name).ok_or_else(|| {
                PipelineError::UnknownStageType {
                    stage_type: decl.name.clone(),
                }
            })?;
            if registered != decl.kind {
                return Err(PipelineError::config(format!(
                    "stage '{}' is declared as {} but '{}' is registered as {}",
                    decl.id, decl.kind, decl.name, registered
                )));
            }

            let input = decl
                .parent_id
                .as_deref()
                .and_then(|parent| outputs.get(parent).cloned());

            let output = if decl.kind.produces() {
                let connection = registry.create_connection(
                    &decl.name,
                    &format!("{}.out", decl.id),
                    decl.capacity,
                )?;
                pipeline.add_connection(Arc::clone(&connection))?;
                Some(connection)
            } else {
                None
            };

            let stage = registry.create_stage(
                &decl.name,
                StageWiring {
                    id: &decl.id,
                    params: &decl.params,
                    strategy: decl.strategy,
                    input,
                    output: output.clone(),
                },
            )?;
            if stage.kind() != registered || stage.name() != decl.name {
                return Err(PipelineError::config(format!(
                    "factory for '{}' built a {} stage named '{}'",
                    decl.name,
                    stage.kind(),
                    stage.name()
                )));
            }
            debug!("Built stage '{}' of type '{}'", decl.id, decl.name);

            if let Some(output) = output {
                outputs.insert(decl.id.as_str(), output);
            }
            pipeline.add_stage(stage)?;
        }

        info!("Built pipeline with {} stages", self.stages.len());
        Ok(pipeline)
    }

    /// Describes a live pipeline, parents before children.
    pub fn from_pipeline(pipeline: &Pipeline) -> PipelineResult<Self> {
        let stages = pipeline.stages();

        let mut ids = HashSet::new();
        for stage in stages {
            if !ids.insert(stage.id()) {
                return Err(PipelineError::config(format!(
                    "stage id '{}' is used more than once",
                    stage.id()
                )));
            }
        }

        let producers: HashMap<Uuid, usize> = stages
            .iter()
            .enumerate()
            .filter_map(|(i, stage)| stage.output_connection().map(|c| (c.id(), i)))
            .collect();

        let mut graph = DiGraph::<usize, ()>::new();
        let nodes: Vec<NodeIndex> = (0..stages.len()).map(|i| graph.add_node(i)).collect();
        let mut parents: Vec<Option<usize>> = vec![None; stages.len()];

        for (i, stage) in stages.iter().enumerate() {
            if let Some(input) = stage.input_connection() {
                let parent = *producers.get(&input.id()).ok_or_else(|| {
                    PipelineError::config(format!(
                        "stage '{}' consumes connection '{}' that no stage in the pipeline produces",
                        stage.id(),
                        input.name()
                    ))
                })?;
                parents[i] = Some(parent);
                graph.add_edge(nodes[parent], nodes[i], ());
            }
        }

        let order = toposort(&graph, None).map_err(|_| PipelineError::CircularDependency)?;

        let stages = order
            .into_iter()
            .map(|node| {
                let i = graph[node];
                let stage = &stages[i];
                StageDecl {
                    name: stage.name().to_string(),
                    id: stage.id().to_string(),
                    kind: stage.kind(),
                    capacity: stage.output_connection().map(|c| c.capacity()),
                    strategy: stage.strategy(),
                    parent_id: parents[i].map(|p| stages[p].id().to_string()),
                    params: stage.params().clone(),
                }
            })
            .collect();

        Ok(Self { stages })
    }
}
