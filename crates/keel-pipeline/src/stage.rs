//! Stage definitions and the dependency graph they form.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use keel_core::{KeelError, KeelResult};
use keel_state::{StagePolicy, StageRecord};

/// What a stage does. The engine dispatches on this.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StageKind {
    Checkout,
    Compile,
    Test,
    DependencyScan,
    QualityGate,
    Package,
    ImageBuild,
    ImageScan,
    Push,
    ManifestUpdate,
    Commit,
}

impl StageKind {
    /// The standard delivery order.
    pub const ALL: [StageKind; 11] = [
        Self::Checkout,
        Self::Compile,
        Self::Test,
        Self::DependencyScan,
        Self::QualityGate,
        Self::Package,
        Self::ImageBuild,
        Self::ImageScan,
        Self::Push,
        Self::ManifestUpdate,
        Self::Commit,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::Checkout => "checkout",
            Self::Compile => "compile",
            Self::Test => "test",
            Self::DependencyScan => "dependency-scan",
            Self::QualityGate => "quality-gate",
            Self::Package => "package",
            Self::ImageBuild => "image-build",
            Self::ImageScan => "image-scan",
            Self::Push => "push",
            Self::ManifestUpdate => "manifest-update",
            Self::Commit => "commit",
        }
    }
}

/// Static definition of one stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageSpec {
    pub name: String,
    pub kind: StageKind,
    pub depends_on: Vec<String>,
    pub policy: StagePolicy,
}

impl StageSpec {
    pub fn new(kind: StageKind) -> Self {
        Self {
            name: kind.name().to_string(),
            kind,
            depends_on: Vec::new(),
            policy: StagePolicy::Required,
        }
    }

    pub fn named(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    pub fn after(mut self, deps: &[&str]) -> Self {
        self.depends_on = deps.iter().map(|d| d.to_string()).collect();
        self
    }

    pub fn best_effort(mut self) -> Self {
        self.policy = StagePolicy::BestEffort;
        self
    }
}

/// A validated, acyclic set of stages grouped into topological levels.
///
/// Stages in the same level have no dependency on one another and may run
/// concurrently. Ordinals follow level order, then declaration order.
#[derive(Debug, Clone)]
pub struct StageGraph {
    stages: Vec<StageSpec>,
    levels: Vec<Vec<usize>>,
}

impl StageGraph {
    pub fn new(stages: Vec<StageSpec>) -> KeelResult<Self> {
        if stages.is_empty() {
            return Err(KeelError::InvalidGraph("no stages".to_string()));
        }

        let mut index = HashMap::new();
        for (i, stage) in stages.iter().enumerate() {
            if index.insert(stage.name.as_str(), i).is_some() {
                return Err(KeelError::InvalidGraph(format!(
                    "duplicate stage '{}'",
                    stage.name
                )));
            }
        }

        let mut in_degree = vec![0usize; stages.len()];
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); stages.len()];
        for (i, stage) in stages.iter().enumerate() {
            for dep in &stage.depends_on {
                let Some(&d) = index.get(dep.as_str()) else {
                    return Err(KeelError::InvalidGraph(format!(
                        "stage '{}' depends on unknown stage '{dep}'",
                        stage.name
                    )));
                };
                if d == i {
                    return Err(KeelError::InvalidGraph(format!(
                        "stage '{}' depends on itself",
                        stage.name
                    )));
                }
                in_degree[i] += 1;
                dependents[d].push(i);
            }
        }

        // Kahn's algorithm, one level at a time.
        let mut levels = Vec::new();
        let mut ready: Vec<usize> = (0..stages.len()).filter(|&i| in_degree[i] == 0).collect();
        let mut placed = 0;
        while !ready.is_empty() {
            ready.sort_unstable();
            placed += ready.len();
            let mut next = Vec::new();
            for &i in &ready {
                for &j in &dependents[i] {
                    in_degree[j] -= 1;
                    if in_degree[j] == 0 {
                        next.push(j);
                    }
                }
            }
            levels.push(std::mem::replace(&mut ready, next));
        }

        if placed != stages.len() {
            let cyclic: Vec<&str> = (0..stages.len())
                .filter(|&i| in_degree[i] > 0)
                .map(|i| stages[i].name.as_str())
                .collect();
            return Err(KeelError::InvalidGraph(format!(
                "dependency cycle among: {}",
                cyclic.join(", ")
            )));
        }

        Ok(Self { stages, levels })
    }

    /// The eleven delivery stages in a single chain. Dependency scanning is
    /// advisory; everything else is required.
    pub fn standard() -> Self {
        let mut stages = Vec::with_capacity(StageKind::ALL.len());
        let mut prev: Option<&'static str> = None;
        for kind in StageKind::ALL {
            let mut spec = StageSpec::new(kind);
            if let Some(p) = prev {
                spec = spec.after(&[p]);
            }
            if kind == StageKind::DependencyScan {
                spec = spec.best_effort();
            }
            stages.push(spec);
            prev = Some(kind.name());
        }
        let levels = (0..stages.len()).map(|i| vec![i]).collect();
        Self { stages, levels }
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Stages grouped by level, in execution order.
    pub fn levels(&self) -> impl Iterator<Item = Vec<&StageSpec>> {
        self.levels
            .iter()
            .map(|level| level.iter().map(|&i| &self.stages[i]).collect())
    }

    /// Fresh pending records, one per stage, ordered by ordinal.
    pub fn records(&self) -> Vec<StageRecord> {
        self.levels
            .iter()
            .flatten()
            .enumerate()
            .map(|(ordinal, &i)| {
                let spec = &self.stages[i];
                StageRecord::pending(&spec.name, ordinal as u32, spec.policy)
            })
            .collect()
    }

    /// Level index of each stage, keyed by name.
    pub fn level_of(&self) -> BTreeMap<&str, usize> {
        self.levels
            .iter()
            .enumerate()
            .flat_map(|(l, level)| level.iter().map(move |&i| (l, i)))
            .map(|(l, i)| (self.stages[i].name.as_str(), l))
            .collect()
    }
}
