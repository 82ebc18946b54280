//! Pipeline Graph Model: stage declarations, validation and graph queries.
//!
//! A [`PipelineDefinition`] is an unchecked list of stages. [`Pipeline::register`]
//! validates it once and freezes it into index-based adjacency lists, so the
//! executor never has to re-validate or look names up on the hot path.
//!
//! Validation order is fixed so the same broken definition always produces
//! the same error: empty name, duplicate name, unknown parent, cycle.

use crate::error::DocflowError;
use crate::pipeline::step::StageHandler;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// Characters of the parent key used in a parallel group's name.
const GROUP_KEY_CHARS: usize = 8;

// ── Definitions ──────────────────────────────────────────────────────────────

/// One node of a pipeline graph, before validation.
#[derive(Clone)]
pub struct StageDefinition {
    pub name: String,
    pub parents: Vec<String>,
    /// Additional attempts after the first failure. Default: 0.
    pub retries: u32,
    pub handler: Arc<dyn StageHandler>,
}

impl StageDefinition {
    pub fn new(name: impl Into<String>, handler: Arc<dyn StageHandler>) -> Self {
        Self {
            name: name.into(),
            parents: Vec::new(),
            retries: 0,
            handler,
        }
    }

    /// Declare the stages that must succeed before this one runs.
    pub fn after<I, S>(mut self, parents: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.parents.extend(parents.into_iter().map(Into::into));
        self
    }

    pub fn retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }
}

impl fmt::Debug for StageDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StageDefinition")
            .field("name", &self.name)
            .field("parents", &self.parents)
            .field("retries", &self.retries)
            .field("input_type", &self.handler.input_type())
            .field("output_type", &self.handler.output_type())
            .finish()
    }
}

/// An unvalidated pipeline: a name, the events that trigger it, and its stages.
#[derive(Debug, Clone, Default)]
pub struct PipelineDefinition {
    pub name: String,
    pub events: Vec<String>,
    pub stages: Vec<StageDefinition>,
}

impl PipelineDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Subscribe the pipeline to a trigger event such as `document:uploaded`.
    pub fn on_event(mut self, event: impl Into<String>) -> Self {
        self.events.push(event.into());
        self
    }

    pub fn stage(mut self, stage: StageDefinition) -> Self {
        self.stages.push(stage);
        self
    }
}

// ── Registration surface ─────────────────────────────────────────────────────

/// Stages that share an identical, non-empty parent set and so run side by side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParallelGroup {
    pub name: String,
    /// Sorted parent names shared by every member.
    pub parents: Vec<String>,
    /// Members in declaration order.
    pub stages: Vec<String>,
}

/// What an external orchestrator needs to know about one stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageRegistration {
    pub name: String,
    pub parents: Vec<String>,
    pub retries: u32,
    pub input_type: String,
    pub output_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parallel_group: Option<String>,
}

// ── Validated pipeline ───────────────────────────────────────────────────────

/// A validated, immutable pipeline graph.
///
/// Stage indices follow declaration order and are stable for the lifetime
/// of the value; [`crate::pipeline::RunState`] is indexed the same way.
#[derive(Debug)]
pub struct Pipeline {
    name: String,
    events: Vec<String>,
    stages: Vec<StageDefinition>,
    index: HashMap<String, usize>,
    parents: Vec<Vec<usize>>,
    children: Vec<Vec<usize>>,
    order: Vec<usize>,
    groups: Vec<ParallelGroup>,
    group_of: Vec<Option<usize>>,
}

impl Pipeline {
    /// Validate `definition` and freeze it.
    ///
    /// Repeated parent names are collapsed to one edge.
    ///
    /// # Errors
    /// [`DocflowError::EmptyStageName`], [`DocflowError::DuplicateStage`],
    /// [`DocflowError::UnknownParent`] or [`DocflowError::Cycle`], in that
    /// order of precedence.
    pub fn register(definition: PipelineDefinition) -> Result<Self, DocflowError> {
        let PipelineDefinition {
            name,
            events,
            mut stages,
        } = definition;

        let mut index = HashMap::with_capacity(stages.len());
        for (i, stage) in stages.iter().enumerate() {
            if stage.name.trim().is_empty() {
                return Err(DocflowError::EmptyStageName { pipeline: name });
            }
            if index.insert(stage.name.clone(), i).is_some() {
                return Err(DocflowError::DuplicateStage {
                    pipeline: name,
                    stage: stage.name.clone(),
                });
            }
        }

        let mut parents = Vec::with_capacity(stages.len());
        for stage in stages.iter_mut() {
            let mut seen = BTreeSet::new();
            stage.parents.retain(|p| seen.insert(p.clone()));

            let mut idx = Vec::with_capacity(stage.parents.len());
            for parent in &stage.parents {
                match index.get(parent) {
                    Some(&p) => idx.push(p),
                    None => {
                        return Err(DocflowError::UnknownParent {
                            pipeline: name,
                            stage: stage.name.clone(),
                            parent: parent.clone(),
                        })
                    }
                }
            }
            parents.push(idx);
        }

        let mut children = vec![Vec::new(); stages.len()];
        for (child, ps) in parents.iter().enumerate() {
            for &p in ps {
                children[p].push(child);
            }
        }

        let order = match kahn_order(&parents, &children) {
            Ok(order) => order,
            Err(stuck) => {
                let mut cyclic: Vec<String> =
                    stuck.into_iter().map(|i| stages[i].name.clone()).collect();
                cyclic.sort();
                return Err(DocflowError::Cycle {
                    pipeline: name,
                    stages: cyclic,
                });
            }
        };

        let (groups, group_of) = detect_parallel_groups(&stages, &parents);
        debug!(
            pipeline = %name,
            stages = stages.len(),
            parallel_groups = groups.len(),
            "Pipeline validated"
        );

        Ok(Self {
            name,
            events,
            stages,
            index,
            parents,
            children,
            order,
            groups,
            group_of,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn events(&self) -> &[String] {
        &self.events
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn stages(&self) -> &[StageDefinition] {
        &self.stages
    }

    pub fn stage(&self, name: &str) -> Option<&StageDefinition> {
        self.index.get(name).map(|&i| &self.stages[i])
    }

    /// A valid execution order; ties are broken by declaration order.
    pub fn topological_order(&self) -> Vec<&str> {
        self.order.iter().map(|&i| self.stage_name(i)).collect()
    }

    /// Stages without parents, in declaration order.
    pub fn roots(&self) -> Vec<&str> {
        (0..self.stages.len())
            .filter(|&i| self.parents[i].is_empty())
            .map(|i| self.stage_name(i))
            .collect()
    }

    /// Direct children of `name`; empty for unknown stages.
    pub fn children(&self, name: &str) -> Vec<&str> {
        self.index
            .get(name)
            .map(|&i| self.children[i].iter().map(|&c| self.stage_name(c)).collect())
            .unwrap_or_default()
    }

    /// Direct parents of `name`; empty for unknown stages.
    pub fn parents(&self, name: &str) -> Vec<&str> {
        self.index
            .get(name)
            .map(|&i| self.parents[i].iter().map(|&p| self.stage_name(p)).collect())
            .unwrap_or_default()
    }

    /// Every stage reachable from `name`, in topological order.
    pub fn descendants(&self, name: &str) -> Vec<&str> {
        let Some(&start) = self.index.get(name) else {
            return Vec::new();
        };
        let reachable = self.descendant_indices(start);
        self.order
            .iter()
            .filter(|i| reachable.contains(i))
            .map(|&i| self.stage_name(i))
            .collect()
    }

    pub fn parallel_groups(&self) -> &[ParallelGroup] {
        &self.groups
    }

    /// Name of the parallel group `name` belongs to, if any.
    pub fn parallel_group_of(&self, name: &str) -> Option<&str> {
        let &i = self.index.get(name)?;
        self.group_of[i].map(|g| self.groups[g].name.as_str())
    }

    /// Registration records for an external orchestrator, in declaration order.
    pub fn registrations(&self) -> Vec<StageRegistration> {
        self.stages
            .iter()
            .enumerate()
            .map(|(i, s)| StageRegistration {
                name: s.name.clone(),
                parents: s.parents.clone(),
                retries: s.retries,
                input_type: s.handler.input_type().to_string(),
                output_type: s.handler.output_type().to_string(),
                parallel_group: self.group_of[i].map(|g| self.groups[g].name.clone()),
            })
            .collect()
    }

    // ── Index-based accessors for the executor ──

    pub(crate) fn stage_name(&self, i: usize) -> &str {
        &self.stages[i].name
    }

    pub(crate) fn stage_at(&self, i: usize) -> &StageDefinition {
        &self.stages[i]
    }

    pub(crate) fn parent_indices(&self, i: usize) -> &[usize] {
        &self.parents[i]
    }

    pub(crate) fn child_indices(&self, i: usize) -> &[usize] {
        &self.children[i]
    }

    pub(crate) fn order_indices(&self) -> &[usize] {
        &self.order
    }

    pub(crate) fn descendant_indices(&self, start: usize) -> BTreeSet<usize> {
        let mut seen = BTreeSet::new();
        let mut stack: Vec<usize> = self.children[start].clone();
        while let Some(i) = stack.pop() {
            if seen.insert(i) {
                stack.extend(self.children[i].iter().copied());
            }
        }
        seen
    }
}

/// Kahn's algorithm. Returns the order, or the stages left with in-degree > 0.
fn kahn_order(parents: &[Vec<usize>], children: &[Vec<usize>]) -> Result<Vec<usize>, Vec<usize>> {
    let mut in_degree: Vec<usize> = parents.iter().map(Vec::len).collect();
    let mut ready: BTreeSet<usize> = (0..parents.len()).filter(|&i| in_degree[i] == 0).collect();
    let mut order = Vec::with_capacity(parents.len());

    while let Some(i) = ready.pop_first() {
        order.push(i);
        for &c in &children[i] {
            in_degree[c] -= 1;
            if in_degree[c] == 0 {
                ready.insert(c);
            }
        }
    }

    if order.len() == parents.len() {
        Ok(order)
    } else {
        Err((0..parents.len()).filter(|&i| in_degree[i] > 0).collect())
    }
}

/// Group stages by their sorted parent set; sets shared by 2+ stages are parallel.
fn detect_parallel_groups(
    stages: &[StageDefinition],
    parents: &[Vec<usize>],
) -> (Vec<ParallelGroup>, Vec<Option<usize>>) {
    let mut by_key: Vec<(String, Vec<String>, Vec<usize>)> = Vec::new();
    for (i, ps) in parents.iter().enumerate() {
        if ps.is_empty() {
            continue;
        }
        let mut names: Vec<String> = ps.iter().map(|&p| stages[p].name.clone()).collect();
        names.sort();
        let key = names.join(",");
        match by_key.iter_mut().find(|(k, _, _)| *k == key) {
            Some((_, _, members)) => members.push(i),
            None => by_key.push((key, names, vec![i])),
        }
    }

    let mut groups = Vec::new();
    let mut group_of = vec![None; stages.len()];
    for (key, names, members) in by_key {
        if members.len() < 2 {
            continue;
        }
        let short: String = key.chars().take(GROUP_KEY_CHARS).collect();
        for &m in &members {
            group_of[m] = Some(groups.len());
        }
        groups.push(ParallelGroup {
            name: format!("parallel-{}", short),
            parents: names,
            stages: members.iter().map(|&m| stages[m].name.clone()).collect(),
        });
    }
    (groups, group_of)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::step::step_fn;
    use crate::error::StepError;
    use serde_json::Value;

    fn noop() -> Arc<dyn StageHandler> {
        step_fn(|_ctx, input: Value| async move { Ok::<_, StepError>(input) })
    }

    fn stage(name: &str, parents: &[&str]) -> StageDefinition {
        StageDefinition::new(name, noop()).after(parents.iter().copied())
    }

    fn diamond() -> PipelineDefinition {
        PipelineDefinition::new("diamond")
            .stage(stage("a", &[]))
            .stage(stage("b", &["a"]))
            .stage(stage("c", &["a"]))
            .stage(stage("d", &["b", "c"]))
    }

    #[test]
    fn diamond_registers_in_order() {
        let p = Pipeline::register(diamond()).unwrap();
        assert_eq!(p.topological_order(), vec!["a", "b", "c", "d"]);
        assert_eq!(p.roots(), vec!["a"]);
        assert_eq!(p.children("a"), vec!["b", "c"]);
        assert_eq!(p.parents("d"), vec!["b", "c"]);
        assert_eq!(p.descendants("b"), vec!["d"]);
        assert_eq!(p.descendants("a"), vec!["b", "c", "d"]);
        assert!(p.descendants("d").is_empty());
    }

    #[test]
    fn declaration_order_does_not_need_to_be_topological() {
        let def = PipelineDefinition::new("backwards")
            .stage(stage("z", &["y"]))
            .stage(stage("y", &["x"]))
            .stage(stage("x", &[]));
        let p = Pipeline::register(def).unwrap();
        assert_eq!(p.topological_order(), vec!["x", "y", "z"]);
    }

    #[test]
    fn cycle_is_rejected_with_stage_set() {
        let def = PipelineDefinition::new("loop")
            .stage(stage("root", &[]))
            .stage(stage("a", &["c"]))
            .stage(stage("b", &["a"]))
            .stage(stage("c", &["b"]));
        match Pipeline::register(def).unwrap_err() {
            DocflowError::Cycle { pipeline, stages } => {
                assert_eq!(pipeline, "loop");
                assert_eq!(stages, vec!["a", "b", "c"]);
            }
            other => panic!("expected cycle, got {other:?}"),
        }
    }

    #[test]
    fn self_parent_is_a_cycle() {
        let def = PipelineDefinition::new("self").stage(stage("a", &["a"]));
        assert!(matches!(
            Pipeline::register(def),
            Err(DocflowError::Cycle { .. })
        ));
    }

    #[test]
    fn unknown_parent_is_rejected() {
        let def = PipelineDefinition::new("typo")
            .stage(stage("upload", &[]))
            .stage(stage("validate", &["uplaod"]));
        match Pipeline::register(def).unwrap_err() {
            DocflowError::UnknownParent { stage, parent, .. } => {
                assert_eq!(stage, "validate");
                assert_eq!(parent, "uplaod");
            }
            other => panic!("expected unknown parent, got {other:?}"),
        }
    }

    #[test]
    fn duplicate_and_empty_names_are_rejected() {
        let dup = PipelineDefinition::new("dup")
            .stage(stage("a", &[]))
            .stage(stage("a", &[]));
        assert!(matches!(
            Pipeline::register(dup),
            Err(DocflowError::DuplicateStage { .. })
        ));

        let empty = PipelineDefinition::new("empty").stage(stage("", &[]));
        assert!(matches!(
            Pipeline::register(empty),
            Err(DocflowError::EmptyStageName { .. })
        ));
    }

    #[test]
    fn duplicate_check_precedes_parent_check() {
        let def = PipelineDefinition::new("p")
            .stage(stage("a", &["missing"]))
            .stage(stage("a", &[]));
        assert!(matches!(
            Pipeline::register(def),
            Err(DocflowError::DuplicateStage { .. })
        ));
    }

    #[test]
    fn repeated_parent_is_one_edge() {
        let def = PipelineDefinition::new("p")
            .stage(stage("a", &[]))
            .stage(stage("b", &["a", "a"]));
        let p = Pipeline::register(def).unwrap();
        assert_eq!(p.parents("b"), vec!["a"]);
        assert_eq!(p.children("a"), vec!["b"]);
    }

    #[test]
    fn parallel_groups_share_parent_sets() {
        let p = Pipeline::register(diamond()).unwrap();
        let groups = p.parallel_groups();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].name, "parallel-a");
        assert_eq!(groups[0].stages, vec!["b", "c"]);
        assert_eq!(p.parallel_group_of("c"), Some("parallel-a"));
        assert_eq!(p.parallel_group_of("d"), None);
    }

    #[test]
    fn group_name_truncates_parent_key() {
        let def = PipelineDefinition::new("p")
            .stage(stage("transform", &[]))
            .stage(stage("store-db", &["transform"]))
            .stage(stage("store-s3", &["transform"]));
        let p = Pipeline::register(def).unwrap();
        assert_eq!(p.parallel_groups()[0].name, "parallel-transfor");
    }

    #[test]
    fn registrations_expose_schema_and_group() {
        let p = Pipeline::register(diamond().stage(stage("e", &["d"]).retries(2))).unwrap();
        let regs = p.registrations();
        assert_eq!(regs.len(), 5);
        let e = regs.iter().find(|r| r.name == "e").unwrap();
        assert_eq!(e.retries, 2);
        assert_eq!(e.parents, vec!["d"]);
        assert!(e.input_type.ends_with("Value"));
        let b = regs.iter().find(|r| r.name == "b").unwrap();
        assert_eq!(b.parallel_group.as_deref(), Some("parallel-a"));
    }
}
