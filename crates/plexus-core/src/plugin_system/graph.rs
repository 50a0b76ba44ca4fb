//! Dependency graph construction and load ordering.
//!
//! A [`DependencyGraph`] is built from a [`DescriptorSet`] in one pass and is
//! never mutated afterwards; the manager swaps in a freshly built graph
//! whenever descriptors are added.
use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, BinaryHeap, HashMap, VecDeque};
use std::sync::Arc;

use crate::plugin_system::dependency::{
    DependencyError, PackageDependency, PackagePolicy, PackageProbe, PluginDependency,
};
use crate::plugin_system::descriptor::{LoadingMode, PluginDescriptor};
use crate::plugin_system::error::{PluginResult, PluginSystemError};
use crate::plugin_system::report::{Condition, ConditionKind};
use crate::plugin_system::version::Version;

/// Every descriptor known to the system, grouped by id
#[derive(Debug, Clone, Default)]
pub struct DescriptorSet {
    /// Candidates per id, highest version first
    by_id: BTreeMap<String, Vec<Arc<PluginDescriptor>>>,
}

impl DescriptorSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a descriptor. Several versions of one id may coexist, an
    /// identical `(id, version)` pair may not.
    pub fn insert(&mut self, descriptor: PluginDescriptor) -> PluginResult<()> {
        let candidates = self.by_id.entry(descriptor.id().to_string()).or_default();
        if candidates.iter().any(|existing| existing.version() == descriptor.version()) {
            return Err(PluginSystemError::DuplicateDescriptor {
                plugin_id: descriptor.id().to_string(),
                version: descriptor.version().clone(),
            });
        }
        candidates.push(Arc::new(descriptor));
        candidates.sort_by(|a, b| b.version().cmp(a.version()));
        Ok(())
    }

    /// Add a batch of descriptors; nothing is added if any of them is a duplicate.
    pub fn extend(&mut self, descriptors: impl IntoIterator<Item = PluginDescriptor>) -> PluginResult<()> {
        let mut next = self.clone();
        for descriptor in descriptors {
            next.insert(descriptor)?;
        }
        *self = next;
        Ok(())
    }

    pub fn candidates(&self, id: &str) -> &[Arc<PluginDescriptor>] {
        self.by_id.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn latest(&self, id: &str) -> Option<&Arc<PluginDescriptor>> {
        self.candidates(id).first()
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.by_id.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<PluginDescriptor>> {
        self.by_id.values().flatten()
    }

    /// Number of descriptors (all versions)
    pub fn len(&self) -> usize {
        self.by_id.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}

/// A hard dependency bound to a concrete descriptor version
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedDependency {
    pub plugin_id: String,
    pub version: Version,
    /// Injection slot name
    pub slot: String,
}

/// Outcome of resolving one `PluginDependency`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Resolved(ResolvedDependency),
    Unresolved {
        dependency: PluginDependency,
        /// Effective version of the target id, when the id is known at all
        found: Option<Version>,
    },
}

/// One plugin id in the graph
#[derive(Debug, Clone)]
pub struct GraphNode {
    descriptor: Arc<PluginDescriptor>,
    resolutions: Vec<Resolution>,
    missing_packages: Vec<PackageDependency>,
    blocked: Option<DependencyError>,
}

impl GraphNode {
    /// The effective descriptor chosen for this id
    pub fn descriptor(&self) -> &Arc<PluginDescriptor> {
        &self.descriptor
    }

    pub fn resolutions(&self) -> &[Resolution] {
        &self.resolutions
    }

    pub fn resolved(&self) -> impl Iterator<Item = &ResolvedDependency> {
        self.resolutions.iter().filter_map(|resolution| match resolution {
            Resolution::Resolved(resolved) => Some(resolved),
            Resolution::Unresolved { .. } => None,
        })
    }

    pub fn missing_packages(&self) -> &[PackageDependency] {
        &self.missing_packages
    }

    pub fn blocked_reason(&self) -> Option<&DependencyError> {
        self.blocked.as_ref()
    }

    pub fn is_blocked(&self) -> bool {
        self.blocked.is_some()
    }
}

/// Immutable dependency graph over the effective descriptor of every id
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    nodes: BTreeMap<String, GraphNode>,
    /// dependency id -> ids holding it as a resolved hard dependency
    dependents: BTreeMap<String, BTreeSet<String>>,
    /// capability tag -> ids providing it
    providers: BTreeMap<String, BTreeSet<String>>,
    /// Topological order of every non-blocked node
    order: Vec<String>,
    conditions: Vec<Condition>,
}

impl DependencyGraph {
    /// Resolve, detect cycles, propagate blocking and compute the load order.
    pub fn build(set: &DescriptorSet, probe: &dyn PackageProbe, policy: PackagePolicy) -> Self {
        let effective = select_effective(set);
        let mut conditions = Vec::new();

        let mut nodes: BTreeMap<String, GraphNode> = BTreeMap::new();
        for (id, descriptor) in &effective {
            let mut blocked = None;

            let resolutions: Vec<Resolution> = descriptor
                .plugin_dependencies()
                .map(|dep| match effective.get(dep.plugin_id.as_str()) {
                    Some(target) if dep.is_satisfied_by(target.version()) => {
                        Resolution::Resolved(ResolvedDependency {
                            plugin_id: dep.plugin_id.clone(),
                            version: target.version().clone(),
                            slot: dep.slot_name().to_string(),
                        })
                    }
                    target => Resolution::Unresolved {
                        dependency: dep.clone(),
                        found: target.map(|t| t.version().clone()),
                    },
                })
                .collect();

            for resolution in &resolutions {
                if let Resolution::Unresolved { dependency, found } = resolution {
                    let reason = DependencyError::Unresolved {
                        dependency_id: dependency.plugin_id.clone(),
                        pattern: dependency.pattern.clone(),
                        found: found.clone(),
                    };
                    log::warn!("Plugin '{}' is blocked: {}", id, reason);
                    conditions.push(Condition::new(id, ConditionKind::DependencyUnresolved, reason.to_string()));
                    blocked.get_or_insert(reason);
                }
            }

            let missing_packages: Vec<PackageDependency> = descriptor
                .package_dependencies()
                .filter(|dep| dep.applies_here() && !probe.is_available(dep))
                .cloned()
                .collect();
            for package in &missing_packages {
                let message = match policy {
                    PackagePolicy::Advisory => format!("{} is not available (advisory)", package),
                    PackagePolicy::Enforce => format!("{} is not available (enforced)", package),
                };
                log::warn!("Plugin '{}': {}", id, message);
                conditions.push(Condition::new(id, ConditionKind::PackageMissing, message));
                if policy == PackagePolicy::Enforce {
                    blocked.get_or_insert(DependencyError::MissingPackage(package.name.clone()));
                }
            }

            nodes.insert(
                id.to_string(),
                GraphNode {
                    descriptor: Arc::clone(descriptor),
                    resolutions,
                    missing_packages,
                    blocked,
                },
            );
        }

        let edges: BTreeMap<String, Vec<String>> = nodes
            .iter()
            .map(|(id, node)| (id.clone(), node.resolved().map(|r| r.plugin_id.clone()).collect()))
            .collect();

        for component in strongly_connected_components(&edges) {
            let is_cycle = component.len() > 1
                || edges.get(&component[0]).is_some_and(|deps| deps.contains(&component[0]));
            if !is_cycle {
                continue;
            }
            let path = cycle_path(&component, &edges);
            let reason = DependencyError::Cycle(path);
            log::error!("{}", reason);
            conditions.push(Condition::new(&component[0], ConditionKind::DependencyCycle, reason.to_string()));
            for member in &component {
                if let Some(node) = nodes.get_mut(member) {
                    node.blocked = Some(reason.clone());
                }
            }
        }

        // Anything that (transitively) depends on a blocked node is blocked too
        loop {
            let newly_blocked: Vec<(String, String)> = nodes
                .iter()
                .filter(|(_, node)| !node.is_blocked())
                .filter_map(|(id, node)| {
                    node.resolved()
                        .find(|dep| nodes.get(&dep.plugin_id).is_some_and(GraphNode::is_blocked))
                        .map(|dep| (id.clone(), dep.plugin_id.clone()))
                })
                .collect();
            if newly_blocked.is_empty() {
                break;
            }
            for (id, dependency_id) in newly_blocked {
                let reason = DependencyError::BlockedDependency(dependency_id);
                log::warn!("Plugin '{}' is blocked: {}", id, reason);
                conditions.push(Condition::new(&id, ConditionKind::DependencyUnresolved, reason.to_string()));
                if let Some(node) = nodes.get_mut(&id) {
                    node.blocked = Some(reason);
                }
            }
        }

        let mut dependents: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        let mut providers: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for (id, node) in &nodes {
            for dep in node.resolved() {
                dependents.entry(dep.plugin_id.clone()).or_default().insert(id.clone());
            }
            for tag in node.descriptor.provided() {
                providers.entry(tag.clone()).or_default().insert(id.clone());
            }
        }

        let order = topological_order(&nodes);
        log::debug!("Dependency graph built: {} node(s), order {:?}", nodes.len(), order);

        Self {
            nodes,
            dependents,
            providers,
            order,
            conditions,
        }
    }

    pub fn node(&self, id: &str) -> Option<&GraphNode> {
        self.nodes.get(id)
    }

    pub fn nodes(&self) -> impl Iterator<Item = (&str, &GraphNode)> {
        self.nodes.iter().map(|(id, node)| (id.as_str(), node))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.nodes.contains_key(id)
    }

    pub fn is_blocked(&self, id: &str) -> bool {
        self.nodes.get(id).is_some_and(GraphNode::is_blocked)
    }

    pub fn blocked_ids(&self) -> Vec<&str> {
        self.nodes
            .iter()
            .filter(|(_, node)| node.is_blocked())
            .map(|(id, _)| id.as_str())
            .collect()
    }

    /// Ids holding `id` as a resolved hard dependency
    pub fn dependents(&self, id: &str) -> impl Iterator<Item = &str> {
        self.dependents.get(id).into_iter().flatten().map(String::as_str)
    }

    /// Ids whose effective descriptor provides `tag`
    pub fn providers_of(&self, tag: &str) -> impl Iterator<Item = &str> {
        self.providers.get(tag).into_iter().flatten().map(String::as_str)
    }

    /// Topological order of all non-blocked nodes, dependencies first
    pub fn topological_order(&self) -> &[String] {
        &self.order
    }

    /// Startup sequence: non-blocked eager nodes, dependencies first, ties by ascending id
    pub fn load_order(&self) -> Vec<&str> {
        self.order
            .iter()
            .filter(|id| {
                self.nodes
                    .get(id.as_str())
                    .is_some_and(|node| node.descriptor.loading_mode() == LoadingMode::Eager)
            })
            .map(String::as_str)
            .collect()
    }

    /// The given ids in topological order; blocked or unknown ids are dropped
    pub fn order_subset<'a>(&'a self, ids: &BTreeSet<String>) -> Vec<&'a str> {
        self.order
            .iter()
            .filter(|id| ids.contains(id.as_str()))
            .map(String::as_str)
            .collect()
    }

    /// Conditions raised while building (unresolved, cyclic, missing packages)
    pub fn conditions(&self) -> &[Condition] {
        &self.conditions
    }
}

/// Pick the effective descriptor of every id: the highest version that
/// satisfies every pattern of the other effective descriptors referencing it,
/// or the highest version when no single candidate satisfies them all.
///
/// Starts from the highest version of every id and re-picks until the
/// choice is stable; a choice that keeps flipping stops after one round
/// per descriptor.
fn select_effective(set: &DescriptorSet) -> BTreeMap<&str, &Arc<PluginDescriptor>> {
    let mut chosen: BTreeMap<&str, &Arc<PluginDescriptor>> =
        set.ids().filter_map(|id| set.latest(id).map(|latest| (id, latest))).collect();
    for _ in 0..set.len() {
        let next = pick_versions(set, &chosen);
        let stable = next
            .iter()
            .all(|(id, descriptor)| chosen.get(id).is_some_and(|current| Arc::ptr_eq(current, descriptor)));
        chosen = next;
        if stable {
            break;
        }
    }
    for (id, descriptor) in &chosen {
        let candidates = set.candidates(id).len();
        if candidates > 1 {
            log::debug!("Plugin '{}': using version {} of {} candidate(s)", id, descriptor.version(), candidates);
        }
    }
    chosen
}

/// One selection round against the requirements of `current`.
fn pick_versions<'s>(
    set: &'s DescriptorSet,
    current: &BTreeMap<&'s str, &'s Arc<PluginDescriptor>>,
) -> BTreeMap<&'s str, &'s Arc<PluginDescriptor>> {
    let mut patterns: HashMap<&str, Vec<&PluginDependency>> = HashMap::new();
    for (id, descriptor) in current {
        for dep in descriptor.plugin_dependencies() {
            if dep.plugin_id != *id {
                patterns.entry(dep.plugin_id.as_str()).or_default().push(dep);
            }
        }
    }

    set.ids()
        .filter_map(|id| {
            let candidates = set.candidates(id);
            let wanted = patterns.get(id).map(Vec::as_slice).unwrap_or(&[]);
            let chosen = candidates
                .iter()
                .find(|candidate| wanted.iter().all(|dep| dep.is_satisfied_by(candidate.version())))
                .or_else(|| candidates.first())?;
            Some((id, chosen))
        })
        .collect()
}

/// Tarjan's algorithm; components come out with their members sorted.
fn strongly_connected_components(edges: &BTreeMap<String, Vec<String>>) -> Vec<Vec<String>> {
    struct State<'a> {
        edges: &'a BTreeMap<String, Vec<String>>,
        index: usize,
        indices: HashMap<&'a str, usize>,
        lowlink: HashMap<&'a str, usize>,
        stack: Vec<&'a str>,
        on_stack: BTreeSet<&'a str>,
        components: Vec<Vec<String>>,
    }

    fn visit<'a>(state: &mut State<'a>, node: &'a str) {
        state.indices.insert(node, state.index);
        state.lowlink.insert(node, state.index);
        state.index += 1;
        state.stack.push(node);
        state.on_stack.insert(node);

        let edges = state.edges;
        for next in edges.get(node).into_iter().flatten() {
            let next = next.as_str();
            if !edges.contains_key(next) {
                continue;
            }
            if !state.indices.contains_key(next) {
                visit(state, next);
                let low = state.lowlink[node].min(state.lowlink[next]);
                state.lowlink.insert(node, low);
            } else if state.on_stack.contains(next) {
                let low = state.lowlink[node].min(state.indices[next]);
                state.lowlink.insert(node, low);
            }
        }

        if state.lowlink[node] == state.indices[node] {
            let mut component = Vec::new();
            while let Some(member) = state.stack.pop() {
                state.on_stack.remove(member);
                component.push(member.to_string());
                if member == node {
                    break;
                }
            }
            component.sort();
            state.components.push(component);
        }
    }

    let mut state = State {
        edges,
        index: 0,
        indices: HashMap::new(),
        lowlink: HashMap::new(),
        stack: Vec::new(),
        on_stack: BTreeSet::new(),
        components: Vec::new(),
    };
    for node in edges.keys() {
        if !state.indices.contains_key(node.as_str()) {
            visit(&mut state, node);
        }
    }
    state.components
}

/// Shortest cycle through the smallest member of a strongly connected component,
/// as `[start, .., start]`.
fn cycle_path(component: &[String], edges: &BTreeMap<String, Vec<String>>) -> Vec<String> {
    let start = component[0].as_str();
    let members: BTreeSet<&str> = component.iter().map(String::as_str).collect();
    let adjacency: HashMap<&str, Vec<&str>> = members
        .iter()
        .map(|member| {
            let next: Vec<&str> = edges
                .get(*member)
                .into_iter()
                .flatten()
                .map(String::as_str)
                .filter(|next| members.contains(next))
                .collect();
            (*member, next)
        })
        .collect();

    let mut parent: HashMap<&str, &str> = HashMap::new();
    let mut queue = VecDeque::from([start]);
    while let Some(node) = queue.pop_front() {
        for &next in adjacency.get(node).into_iter().flatten() {
            if next == start {
                let mut path = vec![start.to_string()];
                let mut cursor = node;
                let mut tail = Vec::new();
                while cursor != start {
                    tail.push(cursor.to_string());
                    cursor = parent[cursor];
                }
                tail.reverse();
                path.extend(tail);
                path.push(start.to_string());
                return path;
            }
            if !parent.contains_key(next) {
                parent.insert(next, node);
                queue.push_back(next);
            }
        }
    }
    component.to_vec()
}

/// Kahn's algorithm over non-blocked nodes, always releasing the smallest ready id first.
fn topological_order(nodes: &BTreeMap<String, GraphNode>) -> Vec<String> {
    let mut in_degree: BTreeMap<&str, usize> = BTreeMap::new();
    let mut dependents: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
    for (id, node) in nodes.iter().filter(|(_, node)| !node.is_blocked()) {
        in_degree.entry(id.as_str()).or_insert(0);
        for dep in node.resolved() {
            *in_degree.entry(id.as_str()).or_insert(0) += 1;
            dependents.entry(dep.plugin_id.as_str()).or_default().push(id.as_str());
        }
    }

    let mut ready: BinaryHeap<Reverse<&str>> = in_degree
        .iter()
        .filter(|(_, degree)| **degree == 0)
        .map(|(id, _)| Reverse(*id))
        .collect();
    let mut order = Vec::with_capacity(in_degree.len());
    while let Some(Reverse(id)) = ready.pop() {
        order.push(id.to_string());
        for dependent in dependents.get(id).into_iter().flatten() {
            if let Some(degree) = in_degree.get_mut(dependent) {
                *degree -= 1;
                if *degree == 0 {
                    ready.push(Reverse(*dependent));
                }
            }
        }
    }
    order
}
