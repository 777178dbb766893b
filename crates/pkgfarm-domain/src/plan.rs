use std::collections::{BTreeSet, HashMap, HashSet};

use petgraph::unionfind::UnionFind;

use crate::catalog::PackageMap;

/// Read-only view of the artifact store, collected by the orchestrator before
/// planning.
#[derive(Debug, Clone, Default)]
pub struct StoreSnapshot {
    /// `P -> contents of pkgs/P.orig-CHECKSUM`.
    pub orig_checksums: HashMap<String, String>,
    /// Packages with a `fail/P` transcript on disk.
    pub failed: HashSet<String>,
    /// Packages with both `pkgs/P.zip` and `pkgs/P.zip.CHECKSUM` on disk.
    pub archived: HashSet<String>,
}

impl StoreSnapshot {
    fn orig_matches(&self, pkg: &str, checksum: &str) -> bool {
        !checksum.is_empty()
            && self
                .orig_checksums
                .get(pkg)
                .is_some_and(|have| have == checksum)
    }
}

/// One element of the ordered plan: a single package, or a set of mutually
/// dependent packages that must be attempted together.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlanItem {
    One(String),
    Cycle(Vec<String>),
}

impl PlanItem {
    #[must_use]
    pub fn members(&self) -> &[String] {
        match self {
            PlanItem::One(name) => std::slice::from_ref(name),
            PlanItem::Cycle(names) => names,
        }
    }

    #[must_use]
    pub fn is_cycle(&self) -> bool {
        matches!(self, PlanItem::Cycle(_))
    }
}

/// The planner's full output. `items` is ordered so that every dependency of
/// an item is installed, already failed, already built, or earlier in the
/// list.
#[derive(Debug, Clone, Default)]
pub struct BuildPlan {
    /// Up-to-date failures: excluded from building, treated as satisfied for
    /// ordering purposes.
    pub failed_pkgs: BTreeSet<String>,
    /// Packages whose stored state disagrees with the catalog.
    pub changed_pkgs: BTreeSet<String>,
    /// `changed_pkgs` closed over reverse dependencies; the store cleanup set.
    pub update_pkgs: BTreeSet<String>,
    /// The packages actually attempted this run.
    pub need_pkgs: BTreeSet<String>,
    pub items: Vec<PlanItem>,
}

/// Compute the build plan for one run.
///
/// A package is *current* when its recorded source checksum matches the
/// catalog and it is either part of the baseline install, a recorded failure,
/// or fully archived. Everything else has changed; changes propagate to every
/// non-baseline transitive consumer.
#[must_use]
pub fn plan_builds(
    details: &PackageMap,
    installed: &BTreeSet<String>,
    store: &StoreSnapshot,
) -> BuildPlan {
    let failed_pkgs: BTreeSet<String> = details
        .iter()
        .filter(|(pkg, d)| {
            !installed.contains(*pkg)
                && store.orig_matches(pkg, &d.checksum)
                && store.failed.contains(*pkg)
        })
        .map(|(pkg, _)| pkg.clone())
        .collect();

    let changed_pkgs: BTreeSet<String> = details
        .iter()
        .filter(|(pkg, d)| {
            let current = store.orig_matches(pkg, &d.checksum)
                && (installed.contains(*pkg)
                    || store.failed.contains(*pkg)
                    || store.archived.contains(*pkg));
            !current
        })
        .map(|(pkg, _)| pkg.clone())
        .collect();

    let update_pkgs = close_over_consumers(&changed_pkgs, details, installed);

    let need_pkgs: BTreeSet<String> = update_pkgs
        .iter()
        .filter(|pkg| !installed.contains(*pkg) && !failed_pkgs.contains(*pkg))
        .cloned()
        .collect();

    let items = order_needed(&need_pkgs, details);

    BuildPlan {
        failed_pkgs,
        changed_pkgs,
        update_pkgs,
        need_pkgs,
        items,
    }
}

/// Least fixed point of `changed` under "a non-baseline package with an
/// updated dependency is itself updated".
fn close_over_consumers(
    changed: &BTreeSet<String>,
    details: &PackageMap,
    installed: &BTreeSet<String>,
) -> BTreeSet<String> {
    let mut update = changed.clone();
    loop {
        let mut grew = false;
        for (pkg, d) in details {
            if update.contains(pkg) || installed.contains(pkg) {
                continue;
            }
            if d.dependency_names().any(|dep| update.contains(dep)) {
                update.insert(pkg.clone());
                grew = true;
            }
        }
        if !grew {
            break;
        }
    }
    update
}

/// Depth-first ordering of the needed packages with cycle collapsing.
///
/// Packages are visited in lexicographic order. An edge into a package still
/// on the DFS path unions the whole cycle; when a package's visit completes
/// it is emitted and elected representative of its set, so the set surfaces
/// in the plan only after every prerequisite discovered through any of its
/// members has been emitted.
fn order_needed(need: &BTreeSet<String>, details: &PackageMap) -> Vec<PlanItem> {
    let names: Vec<&str> = need.iter().map(String::as_str).collect();
    if names.is_empty() {
        return Vec::new();
    }
    let index: HashMap<&str, usize> = names
        .iter()
        .enumerate()
        .map(|(idx, name)| (*name, idx))
        .collect();

    let mut walk = Walk {
        names: &names,
        index: &index,
        details,
        sets: UnionFind::new(names.len()),
        state: vec![Visit::New; names.len()],
        path: Vec::new(),
        emitted: Vec::new(),
    };
    for idx in 0..names.len() {
        walk.visit(idx);
    }

    let Walk {
        mut sets, emitted, ..
    } = walk;

    let mut emit_pos = vec![0usize; names.len()];
    for (pos, &idx) in emitted.iter().enumerate() {
        emit_pos[idx] = pos;
    }
    let mut groups: HashMap<usize, Vec<usize>> = HashMap::new();
    for idx in 0..names.len() {
        groups.entry(sets.find_mut(idx)).or_default().push(idx);
    }

    let mut items = Vec::new();
    for &idx in &emitted {
        let members = &groups[&sets.find_mut(idx)];
        // The representative is the member whose visit finished last.
        let rep = members
            .iter()
            .copied()
            .max_by_key(|&member| emit_pos[member])
            .unwrap_or(idx);
        if rep != idx {
            continue;
        }
        if members.len() == 1 {
            items.push(PlanItem::One(names[idx].to_string()));
        } else {
            let mut group: Vec<String> =
                members.iter().map(|&member| names[member].to_string()).collect();
            group.sort();
            items.push(PlanItem::Cycle(group));
        }
    }
    items
}

#[derive(Clone, Copy, PartialEq)]
enum Visit {
    New,
    /// On the DFS path, at the recorded position.
    Open(usize),
    Done,
}

struct Walk<'a> {
    names: &'a [&'a str],
    index: &'a HashMap<&'a str, usize>,
    details: &'a PackageMap,
    sets: UnionFind<usize>,
    state: Vec<Visit>,
    path: Vec<usize>,
    emitted: Vec<usize>,
}

impl Walk<'_> {
    fn visit(&mut self, idx: usize) {
        match self.state[idx] {
            Visit::Done => {}
            Visit::Open(pos) => {
                // Everything from the cycle root down to the current frame is
                // mutually dependent.
                for &other in &self.path[pos..] {
                    self.sets.union(idx, other);
                }
            }
            Visit::New => {
                self.state[idx] = Visit::Open(self.path.len());
                self.path.push(idx);
                if let Some(details) = self.details.get(self.names[idx]) {
                    let deps: Vec<usize> = details
                        .dependency_names()
                        .filter_map(|dep| self.index.get(dep).copied())
                        .collect();
                    for dep in deps {
                        self.visit(dep);
                    }
                }
                self.path.pop();
                self.state[idx] = Visit::Done;
                self.emitted.push(idx);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{Dependency, PackageDetails};
    use petgraph::algo::tarjan_scc;
    use petgraph::graph::DiGraph;

    fn pkg(checksum: &str, deps: &[&str]) -> PackageDetails {
        PackageDetails {
            checksum: checksum.to_string(),
            source: format!("http://example.invalid/{checksum}.zip"),
            dependencies: deps
                .iter()
                .map(|d| Dependency::Name((*d).to_string()))
                .collect(),
        }
    }

    fn catalog(entries: &[(&str, &str, &[&str])]) -> PackageMap {
        entries
            .iter()
            .map(|(name, checksum, deps)| ((*name).to_string(), pkg(checksum, deps)))
            .collect()
    }

    fn set(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|n| (*n).to_string()).collect()
    }

    fn built(store: &mut StoreSnapshot, pkg: &str, checksum: &str) {
        store
            .orig_checksums
            .insert(pkg.to_string(), checksum.to_string());
        store.archived.insert(pkg.to_string());
    }

    #[test]
    fn fresh_catalog_builds_in_dependency_order() {
        let details = catalog(&[("a", "h1", &[]), ("b", "h2", &["a"])]);
        let plan = plan_builds(&details, &BTreeSet::new(), &StoreSnapshot::default());
        assert_eq!(plan.need_pkgs, set(&["a", "b"]));
        assert_eq!(
            plan.items,
            vec![
                PlanItem::One("a".to_string()),
                PlanItem::One("b".to_string())
            ]
        );
    }

    #[test]
    fn checksum_bump_invalidates_consumers() {
        let details = catalog(&[("a", "h1-new", &[]), ("b", "h2", &["a"])]);
        let mut store = StoreSnapshot::default();
        built(&mut store, "a", "h1");
        built(&mut store, "b", "h2");
        let plan = plan_builds(&details, &BTreeSet::new(), &store);
        assert_eq!(plan.changed_pkgs, set(&["a"]));
        assert_eq!(plan.update_pkgs, set(&["a", "b"]));
        assert_eq!(plan.need_pkgs, set(&["a", "b"]));
    }

    #[test]
    fn up_to_date_catalog_is_a_no_op() {
        let details = catalog(&[("a", "h1", &[]), ("b", "h2", &["a"])]);
        let mut store = StoreSnapshot::default();
        built(&mut store, "a", "h1");
        built(&mut store, "b", "h2");
        let plan = plan_builds(&details, &BTreeSet::new(), &store);
        assert!(plan.need_pkgs.is_empty());
        assert!(plan.items.is_empty());
    }

    #[test]
    fn mutual_dependency_collapses_into_one_group() {
        let details = catalog(&[("a", "h1", &["b"]), ("b", "h2", &["a"])]);
        let plan = plan_builds(&details, &BTreeSet::new(), &StoreSnapshot::default());
        assert_eq!(
            plan.items,
            vec![PlanItem::Cycle(vec!["a".to_string(), "b".to_string()])]
        );
    }

    #[test]
    fn cycle_prerequisites_precede_the_group() {
        // lib <- {x, y} mutually dependent <- app
        let details = catalog(&[
            ("app", "h4", &["x"]),
            ("lib", "h1", &[]),
            ("x", "h2", &["y", "lib"]),
            ("y", "h3", &["x"]),
        ]);
        let plan = plan_builds(&details, &BTreeSet::new(), &StoreSnapshot::default());
        assert_eq!(
            plan.items,
            vec![
                PlanItem::One("lib".to_string()),
                PlanItem::Cycle(vec!["x".to_string(), "y".to_string()]),
                PlanItem::One("app".to_string()),
            ]
        );
    }

    #[test]
    fn baseline_packages_are_never_planned() {
        let details = catalog(&[("base", "h0", &[]), ("b", "h2", &["base"])]);
        let installed = set(&["base"]);
        let mut store = StoreSnapshot::default();
        store
            .orig_checksums
            .insert("base".to_string(), "h0".to_string());
        let plan = plan_builds(&details, &installed, &store);
        assert_eq!(plan.need_pkgs, set(&["b"]));
        // Even a baseline checksum bump never schedules the baseline package.
        let details = catalog(&[("base", "h0-new", &[]), ("b", "h2", &["base"])]);
        let plan = plan_builds(&details, &installed, &store);
        assert!(!plan.need_pkgs.contains("base"));
    }

    #[test]
    fn recorded_failures_keep_their_slot_free() {
        let details = catalog(&[("bad", "h1", &[]), ("b", "h2", &["bad"])]);
        let mut store = StoreSnapshot::default();
        store
            .orig_checksums
            .insert("bad".to_string(), "h1".to_string());
        store.failed.insert("bad".to_string());
        let plan = plan_builds(&details, &BTreeSet::new(), &store);
        assert_eq!(plan.failed_pkgs, set(&["bad"]));
        assert!(!plan.need_pkgs.contains("bad"));
        // The consumer of an up-to-date failure still gets its own attempt.
        assert!(plan.need_pkgs.contains("b"));
    }

    #[test]
    fn failure_with_changed_checksum_is_retried() {
        let details = catalog(&[("bad", "h1-new", &[])]);
        let mut store = StoreSnapshot::default();
        store
            .orig_checksums
            .insert("bad".to_string(), "h1".to_string());
        store.failed.insert("bad".to_string());
        let plan = plan_builds(&details, &BTreeSet::new(), &store);
        assert!(plan.failed_pkgs.is_empty());
        assert_eq!(plan.need_pkgs, set(&["bad"]));
    }

    #[test]
    fn invalidation_is_transitive() {
        let details = catalog(&[
            ("a", "h1-new", &[]),
            ("b", "h2", &["a"]),
            ("c", "h3", &["b"]),
            ("d", "h4", &[]),
        ]);
        let mut store = StoreSnapshot::default();
        for (name, checksum) in [("a", "h1"), ("b", "h2"), ("c", "h3"), ("d", "h4")] {
            built(&mut store, name, checksum);
        }
        let plan = plan_builds(&details, &BTreeSet::new(), &store);
        assert_eq!(plan.need_pkgs, set(&["a", "b", "c"]));
        assert!(!plan.need_pkgs.contains("d"));
    }

    #[test]
    fn adding_a_package_is_monotonic() {
        let details = catalog(&[("a", "h1", &[])]);
        let mut store = StoreSnapshot::default();
        built(&mut store, "a", "h1");
        let before = plan_builds(&details, &BTreeSet::new(), &store);
        assert!(before.need_pkgs.is_empty());

        let details = catalog(&[("a", "h1", &[]), ("new", "h9", &["a"])]);
        let after = plan_builds(&details, &BTreeSet::new(), &store);
        assert_eq!(after.need_pkgs, set(&["new"]));
    }

    #[test]
    fn self_dependency_is_a_single_item() {
        let details = catalog(&[("selfish", "h1", &["selfish"])]);
        let plan = plan_builds(&details, &BTreeSet::new(), &StoreSnapshot::default());
        assert_eq!(plan.items, vec![PlanItem::One("selfish".to_string())]);
    }

    #[test]
    fn missing_zip_checksum_counts_as_changed() {
        let details = catalog(&[("a", "h1", &[])]);
        let mut store = StoreSnapshot::default();
        store
            .orig_checksums
            .insert("a".to_string(), "h1".to_string());
        // orig matches but the archive pair is incomplete.
        let plan = plan_builds(&details, &BTreeSet::new(), &store);
        assert_eq!(plan.need_pkgs, set(&["a"]));
    }

    #[test]
    fn plan_order_satisfies_dependencies() {
        let details = catalog(&[
            ("a", "h1", &[]),
            ("b", "h2", &["a"]),
            ("c", "h3", &["b", "e"]),
            ("d", "h4", &["c"]),
            ("e", "h5", &["f"]),
            ("f", "h6", &["e", "a"]),
        ]);
        let plan = plan_builds(&details, &BTreeSet::new(), &StoreSnapshot::default());
        let mut done: BTreeSet<&str> = BTreeSet::new();
        for item in &plan.items {
            let members: BTreeSet<&str> =
                item.members().iter().map(String::as_str).collect();
            for member in &members {
                for dep in details[*member].dependency_names() {
                    if !plan.need_pkgs.contains(dep) {
                        continue;
                    }
                    assert!(
                        done.contains(dep) || members.contains(dep),
                        "{member} attempted before its dependency {dep}"
                    );
                }
            }
            done.extend(members);
        }
        assert_eq!(done.len(), plan.need_pkgs.len());
    }

    #[test]
    fn grouping_matches_tarjan_condensation() {
        let details = catalog(&[
            ("a", "h1", &["b"]),
            ("b", "h2", &["c"]),
            ("c", "h3", &["a"]),
            ("d", "h4", &["a", "e"]),
            ("e", "h5", &["d"]),
            ("f", "h6", &["d"]),
        ]);
        let plan = plan_builds(&details, &BTreeSet::new(), &StoreSnapshot::default());

        let names: Vec<&String> = plan.need_pkgs.iter().collect();
        let mut graph = DiGraph::<&str, ()>::new();
        let nodes: HashMap<&str, _> = names
            .iter()
            .map(|name| (name.as_str(), graph.add_node(name.as_str())))
            .collect();
        for name in &names {
            for dep in details[name.as_str()].dependency_names() {
                if let Some(&to) = nodes.get(dep) {
                    graph.add_edge(nodes[name.as_str()], to, ());
                }
            }
        }
        let mut expected: Vec<BTreeSet<&str>> = tarjan_scc(&graph)
            .into_iter()
            .map(|component| component.into_iter().map(|n| graph[n]).collect())
            .collect();
        let mut actual: Vec<BTreeSet<&str>> = plan
            .items
            .iter()
            .map(|item| item.members().iter().map(String::as_str).collect())
            .collect();
        expected.sort();
        actual.sort();
        assert_eq!(actual, expected);
    }
}
