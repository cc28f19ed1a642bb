//! Course prerequisite graph and forward risk propagation.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::io::Read;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::config::PropagationConfig;
use crate::error::{Result, RiskError};

const DEFAULT_GRAPH: &str = include_str!("../assets/course_graph.csv");

/// Course name → projected failure probability.
pub type PropagatedRisk = BTreeMap<String, f64>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CourseEdge {
    pub prerequisite: String,
    pub course: String,
    pub strength: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Neighbor {
    pub course: String,
    pub strength: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CriticalPrerequisite {
    pub course: String,
    pub dependent_courses: Vec<String>,
    pub avg_strength: f64,
    pub criticality: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GraphExport {
    pub nodes: Vec<String>,
    pub edges: Vec<CourseEdge>,
}

/// Directed graph, prerequisite → dependent course. Self loops are rejected;
/// longer cycles are allowed.
#[derive(Debug, Clone, Default)]
pub struct CourseGraph {
    outgoing: BTreeMap<String, BTreeMap<String, f64>>,
    incoming: BTreeMap<String, BTreeMap<String, f64>>,
}

impl CourseGraph {
    pub fn from_edges(edges: impl IntoIterator<Item = CourseEdge>) -> Result<Self> {
        let mut graph = Self::default();
        for edge in edges {
            graph.insert(edge)?;
        }
        Ok(graph)
    }

    pub fn from_csv<R: Read>(reader: R) -> Result<Self> {
        let mut csv_reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .from_reader(reader);
        let mut edges = Vec::new();
        for (line, row) in csv_reader.deserialize::<CourseEdge>().enumerate() {
            let edge = row
                .map_err(|e| RiskError::InvalidGraph(format!("row {}: {e}", line + 1)))?;
            edges.push(edge);
        }
        Self::from_edges(edges)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let file = std::fs::File::open(path).map_err(|e| {
            RiskError::InvalidGraph(format!("cannot open {}: {e}", path.display()))
        })?;
        Self::from_csv(file)
    }

    /// The embedded institutional default graph.
    pub fn bundled() -> Result<Self> {
        Self::from_csv(DEFAULT_GRAPH.as_bytes())
    }

    fn insert(&mut self, edge: CourseEdge) -> Result<()> {
        if edge.prerequisite.is_empty() || edge.course.is_empty() {
            return Err(RiskError::InvalidGraph("empty course name".into()));
        }
        if edge.prerequisite == edge.course {
            return Err(RiskError::InvalidGraph(format!(
                "{} cannot be its own prerequisite",
                edge.course
            )));
        }
        if !(edge.strength > 0.0 && edge.strength <= 1.0) {
            return Err(RiskError::InvalidGraph(format!(
                "strength of {} -> {} must be in (0, 1], got {}",
                edge.prerequisite, edge.course, edge.strength
            )));
        }
        self.outgoing
            .entry(edge.prerequisite.clone())
            .or_default()
            .insert(edge.course.clone(), edge.strength);
        self.incoming
            .entry(edge.course.clone())
            .or_default()
            .insert(edge.prerequisite.clone(), edge.strength);
        self.outgoing.entry(edge.course).or_default();
        self.incoming.entry(edge.prerequisite).or_default();
        Ok(())
    }

    pub fn contains(&self, course: &str) -> bool {
        self.outgoing.contains_key(course)
    }

    pub fn course_count(&self) -> usize {
        self.outgoing.len()
    }

    /// Breadth-first projection of `probability` from `source` onto every
    /// downstream course. Values at or below the cutoff are dropped and not
    /// expanded; a course reached by several paths keeps the maximum.
    pub fn propagate(
        &self,
        source: &str,
        probability: f64,
        config: &PropagationConfig,
    ) -> PropagatedRisk {
        let mut risks = PropagatedRisk::new();
        if !self.contains(source) {
            tracing::debug!(course = source, "course not in graph, nothing to propagate");
            return risks;
        }

        let mut queue = VecDeque::from([(source.to_string(), probability)]);
        while let Some((course, incoming)) = queue.pop_front() {
            // a better value for this course arrived after it was queued
            if course != source && risks.get(&course).is_some_and(|best| *best > incoming) {
                continue;
            }
            for (dependent, strength) in self.outgoing.get(&course).into_iter().flatten() {
                let value = incoming * strength * config.decay;
                if value <= config.cutoff || dependent == source {
                    continue;
                }
                let improved = risks.get(dependent).map_or(true, |best| value > *best);
                if improved {
                    risks.insert(dependent.clone(), value);
                    queue.push_back((dependent.clone(), value));
                }
            }
        }
        risks
    }

    /// Project a student's probability over each current course above the
    /// configured minimum, merging results with max-aggregation.
    pub fn propagate_many<'s>(
        &self,
        sources: impl IntoIterator<Item = &'s str>,
        probability: f64,
        config: &PropagationConfig,
    ) -> PropagatedRisk {
        let mut merged = PropagatedRisk::new();
        if probability <= config.min_source_probability {
            return merged;
        }
        for source in sources {
            for (course, value) in self.propagate(source, probability, config) {
                merged
                    .entry(course)
                    .and_modify(|best| *best = best.max(value))
                    .or_insert(value);
            }
        }
        merged
    }

    pub fn prerequisites(&self, course: &str) -> Vec<Neighbor> {
        sorted_neighbors(self.incoming.get(course))
    }

    pub fn dependents(&self, course: &str) -> Vec<Neighbor> {
        sorted_neighbors(self.outgoing.get(course))
    }

    /// Length of the longest prerequisite chain ending at `course`. A chain
    /// never visits a course twice, so cycles do not inflate it.
    pub fn dependency_depth(&self, course: &str) -> usize {
        let Some((course, _)) = self.incoming.get_key_value(course) else {
            return 0;
        };
        let ancestors: BTreeSet<&str> = self.ancestors(course).into_iter().collect();
        let order = self.study_order(&ancestors);
        if order.len() < ancestors.len() {
            let mut on_chain = BTreeSet::new();
            return self.longest_simple_chain(course, &mut on_chain);
        }

        let mut depth: BTreeMap<&str, usize> = BTreeMap::new();
        for current in order {
            let longest = self
                .incoming
                .get(current)
                .into_iter()
                .flat_map(|m| m.keys())
                .filter_map(|prereq| depth.get(prereq.as_str()))
                .map(|d| d + 1)
                .max()
                .unwrap_or(0);
            depth.insert(current, longest);
        }
        depth.get(course.as_str()).copied().unwrap_or(0)
    }

    fn longest_simple_chain<'g>(&'g self, course: &'g str, on_chain: &mut BTreeSet<&'g str>) -> usize {
        on_chain.insert(course);
        let mut longest = 0;
        for prereq in self.incoming.get(course).into_iter().flat_map(|m| m.keys()) {
            if !on_chain.contains(prereq.as_str()) {
                longest = longest.max(self.longest_simple_chain(prereq, on_chain) + 1);
            }
        }
        on_chain.remove(course);
        longest
    }

    /// Every ancestor of `target` in study order, ending with the target.
    /// Courses caught in a prerequisite cycle have no study order; they
    /// follow the ordered ones, farthest from the target first.
    pub fn learning_path(&self, target: &str) -> Vec<String> {
        let Some((name, _)) = self.incoming.get_key_value(target) else {
            return vec![target.to_string()];
        };
        let discovered = self.ancestors(name);
        let members: BTreeSet<&str> = discovered.iter().copied().collect();
        let mut path = self.study_order(&members);
        if path.len() < members.len() {
            let placed: BTreeSet<&str> = path.iter().copied().collect();
            let stuck: Vec<&str> = discovered
                .iter()
                .rev()
                .copied()
                .filter(|course| !placed.contains(course))
                .collect();
            tracing::debug!(course = target, cycle = ?stuck, "learning path crosses a prerequisite cycle");
            path.extend(stuck);
        }
        path.into_iter().map(str::to_string).collect()
    }

    /// `course` followed by every course it transitively requires, in
    /// breadth-first discovery order.
    fn ancestors<'g>(&'g self, course: &'g str) -> Vec<&'g str> {
        let mut seen = BTreeSet::from([course]);
        let mut discovered = vec![course];
        let mut queue = VecDeque::from([course]);
        while let Some(current) = queue.pop_front() {
            for prereq in self.incoming.get(current).into_iter().flat_map(|m| m.keys()) {
                if seen.insert(prereq.as_str()) {
                    discovered.push(prereq.as_str());
                    queue.push_back(prereq.as_str());
                }
            }
        }
        discovered
    }

    /// Prerequisites shared by the current courses, ranked by
    /// dependents count × mean edge strength.
    pub fn critical_prerequisites(&self, current: &[String]) -> Vec<CriticalPrerequisite> {
        let mut dependents: BTreeMap<&str, Vec<(&str, f64)>> = BTreeMap::new();
        let unique: BTreeSet<&str> = current.iter().map(String::as_str).collect();
        for course in unique {
            for (prereq, strength) in self.incoming.get(course).into_iter().flatten() {
                dependents
                    .entry(prereq.as_str())
                    .or_default()
                    .push((course, *strength));
            }
        }

        let mut critical: Vec<CriticalPrerequisite> = dependents
            .into_iter()
            .map(|(course, deps)| {
                let avg_strength = deps.iter().map(|(_, s)| s).sum::<f64>() / deps.len() as f64;
                CriticalPrerequisite {
                    course: course.to_string(),
                    criticality: deps.len() as f64 * avg_strength,
                    avg_strength,
                    dependent_courses: deps.into_iter().map(|(c, _)| c.to_string()).collect(),
                }
            })
            .collect();
        critical.sort_by(|a, b| {
            b.criticality
                .total_cmp(&a.criticality)
                .then_with(|| a.course.cmp(&b.course))
        });
        critical
    }

    pub fn export(&self) -> GraphExport {
        GraphExport {
            nodes: self.outgoing.keys().cloned().collect(),
            edges: self
                .outgoing
                .iter()
                .flat_map(|(prereq, deps)| {
                    deps.iter().map(move |(course, strength)| CourseEdge {
                        prerequisite: prereq.clone(),
                        course: course.clone(),
                        strength: *strength,
                    })
                })
                .collect(),
        }
    }

    /// Kahn's algorithm over `members`, alphabetical among ready courses.
    /// Courses on or behind a cycle never become ready and are left out.
    fn study_order<'g>(&'g self, members: &BTreeSet<&'g str>) -> Vec<&'g str> {
        let mut pending: BTreeMap<&str, usize> = members
            .iter()
            .map(|&course| {
                let degree = self
                    .incoming
                    .get(course)
                    .into_iter()
                    .flat_map(|m| m.keys())
                    .filter(|prereq| members.contains(prereq.as_str()))
                    .count();
                (course, degree)
            })
            .collect();
        let mut ready: BTreeSet<&str> = pending
            .iter()
            .filter(|(_, degree)| **degree == 0)
            .map(|(course, _)| *course)
            .collect();

        let mut order = Vec::with_capacity(pending.len());
        while let Some(course) = ready.pop_first() {
            order.push(course);
            for dependent in self.outgoing.get(course).into_iter().flat_map(|m| m.keys()) {
                if let Some(degree) = pending.get_mut(dependent.as_str()) {
                    *degree -= 1;
                    if *degree == 0 {
                        ready.insert(dependent.as_str());
                    }
                }
            }
        }
        order
    }
}

fn sorted_neighbors(map: Option<&BTreeMap<String, f64>>) -> Vec<Neighbor> {
    let mut neighbors: Vec<Neighbor> = map
        .into_iter()
        .flatten()
        .map(|(course, strength)| Neighbor {
            course: course.clone(),
            strength: *strength,
        })
        .collect();
    neighbors.sort_by(|a, b| {
        b.strength
            .total_cmp(&a.strength)
            .then_with(|| a.course.cmp(&b.course))
    });
    neighbors
}

#[cfg(test)]
mod tests {
    use super::*;

    fn edge(prerequisite: &str, course: &str, strength: f64) -> CourseEdge {
        CourseEdge {
            prerequisite: prerequisite.to_string(),
            course: course.to_string(),
            strength,
        }
    }

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn direct_dependent_gets_decayed_probability() {
        let graph = CourseGraph::from_edges([edge("Calculus I", "Calculus II", 0.9)]).unwrap();
        let risks = graph.propagate("Calculus I", 0.70, &PropagationConfig::default());
        assert_eq!(risks.len(), 1);
        assert!(close(risks["Calculus II"], 0.504));
    }

    #[test]
    fn values_at_or_below_cutoff_are_dropped() {
        let graph = CourseGraph::from_edges([
            edge("A", "B", 0.9),
            edge("B", "C", 0.5),
            edge("C", "D", 1.0),
        ])
        .unwrap();
        let risks = graph.propagate("A", 0.70, &PropagationConfig::default());
        // B = 0.504, C = 0.2016, D would only be reached through C
        assert!(close(risks["B"], 0.504));
        assert!(close(risks["C"], 0.2016));
        assert!(!risks.contains_key("D"));

        let weak = CourseGraph::from_edges([edge("A", "B", 0.25)]).unwrap();
        assert!(weak.propagate("A", 1.0, &PropagationConfig::default()).is_empty());
    }

    #[test]
    fn convergent_paths_keep_maximum() {
        // S -> X directly gives 0.50, S -> M -> X gives 0.39
        let config = PropagationConfig {
            decay: 1.0,
            cutoff: 0.2,
            min_source_probability: 0.3,
        };
        let graph = CourseGraph::from_edges([
            edge("S", "X", 0.5),
            edge("S", "M", 0.78),
            edge("M", "X", 0.5),
        ])
        .unwrap();
        let risks = graph.propagate("S", 1.0, &config);
        assert!(close(risks["M"], 0.78));
        assert!(close(risks["X"], 0.50));

        // when the longer path is riskier it wins, and its tail is re-expanded
        let graph = CourseGraph::from_edges([
            edge("S", "X", 0.3),
            edge("S", "M", 1.0),
            edge("M", "X", 0.9),
            edge("X", "Y", 1.0),
        ])
        .unwrap();
        let risks = graph.propagate("S", 1.0, &config);
        assert!(close(risks["X"], 0.9));
        assert!(close(risks["Y"], 0.9));
    }

    #[test]
    fn unknown_source_yields_empty_mapping() {
        let graph = CourseGraph::bundled().unwrap();
        assert!(graph
            .propagate("Underwater Basket Weaving", 0.9, &PropagationConfig::default())
            .is_empty());
    }

    #[test]
    fn propagate_many_skips_low_probability_and_merges() {
        let graph = CourseGraph::bundled().unwrap();
        let config = PropagationConfig::default();
        assert!(graph
            .propagate_many(["Calculus I"], 0.3, &config)
            .is_empty());

        let merged = graph.propagate_many(["Calculus I", "Programming Fundamentals"], 0.8, &config);
        assert!(close(merged["Calculus II"], 0.8 * 0.9 * 0.8));
        assert!(close(merged["Data Structures"], 0.8 * 0.95 * 0.8));
        // Machine Learning: max of 0.8*0.8*0.8 direct and the Linear Algebra path
        assert!(close(merged["Machine Learning"], 0.512));
    }

    #[test]
    fn rejects_malformed_edges() {
        assert!(matches!(
            CourseGraph::from_edges([edge("A", "A", 0.5)]),
            Err(RiskError::InvalidGraph(_))
        ));
        assert!(matches!(
            CourseGraph::from_edges([edge("A", "B", 1.5)]),
            Err(RiskError::InvalidGraph(_))
        ));
        assert!(matches!(
            CourseGraph::from_edges([edge("A", "B", 0.0)]),
            Err(RiskError::InvalidGraph(_))
        ));
    }

    #[test]
    fn cycles_are_accepted_and_propagation_terminates() {
        let graph = CourseGraph::from_edges([
            edge("A", "B", 0.9),
            edge("B", "C", 0.9),
            edge("C", "A", 0.5),
        ])
        .unwrap();
        assert_eq!(graph.course_count(), 3);

        let risks = graph.propagate("B", 1.0, &PropagationConfig::default());
        assert_eq!(risks.len(), 2);
        assert!(close(risks["C"], 0.72));
        assert!(close(risks["A"], 0.288));
        assert!(!risks.contains_key("B"));

        // with no decay and full strength nothing ever shrinks; only strict
        // improvements are re-queued
        let config = PropagationConfig {
            decay: 1.0,
            cutoff: 0.2,
            min_source_probability: 0.3,
        };
        let loop_graph = CourseGraph::from_edges([
            edge("A", "B", 1.0),
            edge("B", "C", 1.0),
            edge("C", "A", 1.0),
        ])
        .unwrap();
        let risks = loop_graph.propagate("A", 0.9, &config);
        assert!(close(risks["B"], 0.9));
        assert!(close(risks["C"], 0.9));
        assert!(!risks.contains_key("A"));
    }

    #[test]
    fn depth_and_learning_path_through_a_cycle() {
        let graph = CourseGraph::from_edges([
            edge("Intro", "A", 0.6),
            edge("A", "B", 0.9),
            edge("B", "C", 0.9),
            edge("C", "A", 0.5),
        ])
        .unwrap();
        assert_eq!(graph.dependency_depth("C"), 3);
        assert_eq!(graph.dependency_depth("A"), 2);
        assert_eq!(graph.dependency_depth("Intro"), 0);
        assert_eq!(graph.learning_path("C"), vec!["Intro", "A", "B", "C"]);
        assert_eq!(graph.learning_path("Intro"), vec!["Intro"]);
    }

    #[test]
    fn loads_csv_with_whitespace() {
        let csv = "prerequisite, course, strength\nIntro, Advanced, 0.6\n";
        let graph = CourseGraph::from_csv(csv.as_bytes()).unwrap();
        assert_eq!(graph.course_count(), 2);
        assert!(matches!(
            CourseGraph::from_csv("prerequisite,course,strength\nA,B,strong\n".as_bytes()),
            Err(RiskError::InvalidGraph(_))
        ));
    }

    #[test]
    fn neighbors_sorted_by_strength_then_name() {
        let graph = CourseGraph::bundled().unwrap();
        let deps: Vec<String> = graph
            .dependents("Calculus I")
            .into_iter()
            .map(|n| n.course)
            .collect();
        assert_eq!(
            deps,
            vec![
                "Calculus II",
                "Physics I",
                "Linear Algebra",
                "Probability and Statistics"
            ]
        );
        let prereqs = graph.prerequisites("Machine Learning");
        assert_eq!(prereqs[0].course, "Linear Algebra");
        assert!(graph.prerequisites("Calculus I").is_empty());
    }

    #[test]
    fn depth_and_learning_path() {
        let graph = CourseGraph::bundled().unwrap();
        assert_eq!(graph.dependency_depth("Calculus I"), 0);
        assert_eq!(graph.dependency_depth("Quantum Mechanics"), 3);
        assert_eq!(graph.dependency_depth("Advanced Algorithms"), 3);

        let path = graph.learning_path("Machine Learning");
        assert_eq!(
            path,
            vec![
                "Calculus I",
                "Linear Algebra",
                "Programming Fundamentals",
                "Machine Learning"
            ]
        );
        assert_eq!(graph.learning_path("Pottery"), vec!["Pottery"]);
    }

    #[test]
    fn critical_prerequisites_rank_shared_foundations() {
        let graph = CourseGraph::bundled().unwrap();
        let current = vec![
            "Calculus II".to_string(),
            "Linear Algebra".to_string(),
            "Data Structures".to_string(),
        ];
        let critical = graph.critical_prerequisites(&current);
        assert_eq!(critical[0].course, "Calculus I");
        assert_eq!(critical[0].dependent_courses.len(), 2);
        assert!(close(critical[0].avg_strength, 0.8));
        assert!(close(critical[0].criticality, 1.6));
        assert_eq!(critical[1].course, "Programming Fundamentals");
    }

    #[test]
    fn export_lists_every_edge() {
        let graph = CourseGraph::bundled().unwrap();
        let export = graph.export();
        assert_eq!(export.edges.len(), 18);
        assert_eq!(export.nodes.len(), graph.course_count());
        let round_trip = CourseGraph::from_edges(export.edges).unwrap();
        assert_eq!(round_trip.course_count(), graph.course_count());
    }
}
