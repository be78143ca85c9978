//! Plugin dependency resolution
//!
//! [`DependencyResolver`] keeps forward (`plugin -> dependencies`) and
//! reverse (`plugin -> dependents`) adjacency for every registered plugin.
//! Edges to plugins that are not registered yet are kept, so a dependency
//! registered later is wired up without touching its dependents.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};

use semver::{Version, VersionReq};
use serde::{Deserialize, Serialize};

use crate::descriptor::PluginDescriptor;
use crate::error::{PluginResult, PluginRuntimeError};

/// Plugins affected by removing one plugin
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImpactAnalysis {
    /// Plugins declaring a dependency on it
    pub direct: Vec<String>,
    /// Plugins reaching it only through other dependents
    pub indirect: Vec<String>,
    pub total_impact: usize,
}

/// Shape of the dependency graph
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DependencyStats {
    pub total_plugins: usize,
    pub total_edges: usize,
    pub average_fan_out: f64,
    pub max_fan_out: usize,
    /// Plugins currently lying on a cycle
    pub cyclic_plugins: usize,
    pub optional_edges: usize,
}

#[derive(Debug, Clone, Default)]
pub struct DependencyResolver {
    /// Live edges per registered plugin, in declaration order
    forward: HashMap<String, Vec<String>>,
    reverse: HashMap<String, BTreeSet<String>>,
    /// Declarations, kept so edges pruned by a removal can be restored
    declared: HashMap<String, Vec<String>>,
    optional: HashMap<String, HashSet<String>>,
    order: Vec<String>,
    versions: HashMap<String, Version>,
    requirements: HashMap<String, BTreeMap<String, VersionReq>>,
}

impl DependencyResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.forward.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Add a plugin and its declared edges. Never rejects; call
    /// [`DependencyResolver::validate_dependencies`] afterwards.
    pub fn add_plugin(&mut self, descriptor: &PluginDescriptor) {
        let id = descriptor.id().to_string();
        if self.contains(&id) {
            self.remove_plugin(&id);
        }

        let declared = descriptor.declared_dependencies();
        for dependency in &declared {
            self.reverse
                .entry(dependency.clone())
                .or_default()
                .insert(id.clone());
        }

        // Restore edges pruned when this id was last removed.
        for (other, dependencies) in &self.declared {
            if dependencies.contains(&id) {
                if let Some(edges) = self.forward.get_mut(other) {
                    if !edges.contains(&id) {
                        edges.push(id.clone());
                    }
                }
                self.reverse.entry(id.clone()).or_default().insert(other.clone());
            }
        }

        let optional = declared
            .iter()
            .filter(|dependency| descriptor.is_optional(dependency))
            .cloned()
            .collect();
        let requirements = descriptor
            .metadata
            .dependency_versions
            .iter()
            .filter_map(|(dependency, requirement)| {
                VersionReq::parse(requirement)
                    .ok()
                    .map(|parsed| (dependency.clone(), parsed))
            })
            .collect();

        if let Ok(version) = Version::parse(&descriptor.metadata.version) {
            self.versions.insert(id.clone(), version);
        }
        self.requirements.insert(id.clone(), requirements);
        self.optional.insert(id.clone(), optional);
        self.forward.insert(id.clone(), declared.clone());
        self.declared.insert(id.clone(), declared);
        self.order.push(id);
    }

    /// Remove a plugin and every edge that references it
    pub fn remove_plugin(&mut self, id: &str) {
        if self.forward.remove(id).is_none() {
            return;
        }
        self.declared.remove(id);
        self.optional.remove(id);
        self.versions.remove(id);
        self.requirements.remove(id);
        self.order.retain(|node| node != id);

        self.reverse.remove(id);
        for dependents in self.reverse.values_mut() {
            dependents.remove(id);
        }
        self.reverse.retain(|_, dependents| !dependents.is_empty());
        for edges in self.forward.values_mut() {
            edges.retain(|dependency| dependency != id);
        }
    }

    /// Whether a cycle is reachable from `id` through its dependencies
    pub fn has_cyclic_dependencies(&self, id: &str) -> bool {
        let mut visited = HashSet::new();
        let mut stack = HashSet::new();
        self.cycle_from(id, &mut visited, &mut stack)
    }

    fn cycle_from<'a>(
        &'a self,
        node: &'a str,
        visited: &mut HashSet<&'a str>,
        stack: &mut HashSet<&'a str>,
    ) -> bool {
        if stack.contains(node) {
            return true;
        }
        if !visited.insert(node) {
            return false;
        }
        stack.insert(node);
        let cyclic = self
            .forward
            .get(node)
            .is_some_and(|edges| edges.iter().any(|dep| self.cycle_from(dep, visited, stack)));
        stack.remove(node);
        cyclic
    }

    /// Registered plugins with every dependency before its dependents.
    ///
    /// Deterministic for a given graph and registration order. Members of a
    /// cycle are each emitted once.
    pub fn get_load_order(&self) -> Vec<String> {
        let mut visited = HashSet::new();
        let mut order = Vec::with_capacity(self.order.len());
        for id in &self.order {
            self.post_order(id, &mut visited, &mut order);
        }
        order
    }

    fn post_order<'a>(&'a self, node: &'a str, visited: &mut HashSet<&'a str>, order: &mut Vec<String>) {
        if !visited.insert(node) {
            return;
        }
        let Some(edges) = self.forward.get(node) else {
            return;
        };
        for dependency in edges {
            if self.contains(dependency) {
                self.post_order(dependency, visited, order);
            }
        }
        order.push(node.to_string());
    }

    pub fn get_unload_order(&self) -> Vec<String> {
        let mut order = self.get_load_order();
        order.reverse();
        order
    }

    /// Load order split into waves; a plugin's registered dependencies all
    /// sit in earlier waves, except back edges of a cycle.
    pub fn get_load_waves(&self) -> Vec<Vec<String>> {
        let mut level: HashMap<&str, usize> = HashMap::new();
        let mut waves: Vec<Vec<String>> = Vec::new();
        let order = self.get_load_order();
        for id in &order {
            let wave = self
                .forward
                .get(id.as_str())
                .into_iter()
                .flatten()
                .filter_map(|dependency| level.get(dependency.as_str()))
                .map(|dependency_level| dependency_level + 1)
                .max()
                .unwrap_or(0);
            level.insert(id.as_str(), wave);
            if waves.len() <= wave {
                waves.resize_with(wave + 1, Vec::new);
            }
            if let Some(slot) = waves.get_mut(wave) {
                slot.push(id.clone());
            }
        }
        waves
    }

    /// Strict validation: missing required dependencies are an error.
    ///
    /// # Errors
    ///
    /// See [`DependencyResolver::validate_dependencies_with`].
    pub fn validate_dependencies(&self, id: &str) -> PluginResult<()> {
        self.validate_dependencies_with(id, false)
    }

    /// Check that `id` can be initialized as far as the graph is concerned.
    ///
    /// # Errors
    ///
    /// In order of precedence: `PluginNotFound`, `MissingDependency` (unless
    /// `allow_missing`), `CyclicDependency`, `IncompatibleVersion`. Optional
    /// dependencies never fail when absent.
    pub fn validate_dependencies_with(&self, id: &str, allow_missing: bool) -> PluginResult<()> {
        let declared = self
            .declared
            .get(id)
            .ok_or_else(|| PluginRuntimeError::PluginNotFound(id.to_string()))?;

        if !allow_missing {
            let optional = self.optional.get(id);
            let missing = declared.iter().find(|dependency| {
                !self.contains(dependency) && !optional.is_some_and(|set| set.contains(*dependency))
            });
            if let Some(dependency) = missing {
                return Err(PluginRuntimeError::MissingDependency {
                    plugin_id: id.to_string(),
                    dependency: dependency.clone(),
                });
            }
        }

        if self.has_cyclic_dependencies(id) {
            return Err(PluginRuntimeError::CyclicDependency {
                plugin_id: id.to_string(),
            });
        }

        for (dependency, requirement) in self.requirements.get(id).into_iter().flatten() {
            if let Some(found) = self.versions.get(dependency) {
                if !requirement.matches(found) {
                    return Err(PluginRuntimeError::IncompatibleVersion {
                        plugin_id: id.to_string(),
                        dependency: dependency.clone(),
                        required: requirement.to_string(),
                        found: found.to_string(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Validate `descriptor` as if it were registered, without registering it.
    ///
    /// # Errors
    ///
    /// Same as [`DependencyResolver::validate_dependencies_with`].
    pub fn validate_candidate(&self, descriptor: &PluginDescriptor, allow_missing: bool) -> PluginResult<()> {
        let mut trial = self.clone();
        trial.add_plugin(descriptor);
        trial.validate_dependencies_with(descriptor.id(), allow_missing)
    }

    /// Plugins that currently depend on `id`
    pub fn get_dependents(&self, id: &str) -> BTreeSet<String> {
        self.reverse.get(id).cloned().unwrap_or_default()
    }

    /// Current dependency edges of `id`
    pub fn get_dependencies(&self, id: &str) -> BTreeSet<String> {
        self.forward
            .get(id)
            .map(|edges| edges.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn get_impact_analysis(&self, id: &str) -> ImpactAnalysis {
        let direct = self.get_dependents(id);
        let mut reached: BTreeSet<String> = BTreeSet::new();
        let mut queue: VecDeque<&str> = VecDeque::from([id]);
        while let Some(node) = queue.pop_front() {
            for dependent in self.reverse.get(node).into_iter().flatten() {
                if dependent != id && reached.insert(dependent.clone()) {
                    queue.push_back(dependent);
                }
            }
        }

        let total_impact = reached.len();
        let indirect = reached.difference(&direct).cloned().collect();
        ImpactAnalysis {
            direct: direct.into_iter().collect(),
            indirect,
            total_impact,
        }
    }

    pub fn get_dependency_stats(&self) -> DependencyStats {
        let total_plugins = self.order.len();
        let fan_out: Vec<usize> = self.order.iter().map(|id| self.forward.get(id).map_or(0, Vec::len)).collect();
        let total_edges: usize = fan_out.iter().sum();
        let optional_edges = self
            .forward
            .iter()
            .map(|(id, edges)| {
                let optional = self.optional.get(id);
                edges
                    .iter()
                    .filter(|dependency| optional.is_some_and(|set| set.contains(*dependency)))
                    .count()
            })
            .sum();
        let cyclic_plugins = self.order.iter().filter(|id| self.on_cycle(id)).count();

        let average_fan_out = if total_plugins == 0 {
            0.0
        } else {
            total_edges as f64 / total_plugins as f64
        };

        DependencyStats {
            total_plugins,
            total_edges,
            average_fan_out,
            max_fan_out: fan_out.into_iter().max().unwrap_or(0),
            cyclic_plugins,
            optional_edges,
        }
    }

    /// Whether `id` can reach itself
    fn on_cycle(&self, id: &str) -> bool {
        let mut seen: HashSet<&str> = HashSet::new();
        let mut pending: Vec<&str> = self
            .forward
            .get(id)
            .map(|edges| edges.iter().map(String::as_str).collect())
            .unwrap_or_default();
        while let Some(node) = pending.pop() {
            if node == id {
                return true;
            }
            if seen.insert(node) {
                if let Some(edges) = self.forward.get(node) {
                    pending.extend(edges.iter().map(String::as_str));
                }
            }
        }
        false
    }
}
