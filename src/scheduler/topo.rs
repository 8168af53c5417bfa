//! Dependency ordering for story assignment.
//!
//! Kahn's algorithm over the dependency graph restricted to the input set:
//! edges pointing at stories outside the set are ignored, so a batch of
//! planned stories sorts cleanly even while their prerequisites are already
//! in flight elsewhere.

use std::collections::{HashMap, HashSet};

use crate::db::models::{Story, StoryDependency};
use crate::errors::SchedulerError;

/// Order `stories` so every in-set prerequisite precedes its dependents.
/// Ready stories are drained in ascending id order, keeping the output
/// deterministic. Fails iff the in-set edges contain a cycle.
pub fn topological_sort(
    stories: Vec<Story>,
    dependencies: &[StoryDependency],
) -> Result<Vec<Story>, SchedulerError> {
    let ids: HashSet<i64> = stories.iter().map(|s| s.id).collect();

    let mut in_degree: HashMap<i64, usize> = stories.iter().map(|s| (s.id, 0)).collect();
    let mut dependents: HashMap<i64, Vec<i64>> = HashMap::new();
    for dep in dependencies {
        if ids.contains(&dep.story_id) && ids.contains(&dep.depends_on_story_id) {
            *in_degree.entry(dep.story_id).or_default() += 1;
            dependents
                .entry(dep.depends_on_story_id)
                .or_default()
                .push(dep.story_id);
        }
    }

    let mut ready: Vec<i64> = in_degree
        .iter()
        .filter(|(_, degree)| **degree == 0)
        .map(|(id, _)| *id)
        .collect();
    ready.sort_unstable();

    let mut order = Vec::with_capacity(stories.len());
    while let Some(id) = ready.first().copied() {
        ready.remove(0);
        order.push(id);
        for dependent in dependents.remove(&id).unwrap_or_default() {
            let degree = in_degree.entry(dependent).or_default();
            *degree -= 1;
            if *degree == 0 {
                let position = ready.partition_point(|&other| other < dependent);
                ready.insert(position, dependent);
            }
        }
    }

    if order.len() != stories.len() {
        let placed: HashSet<i64> = order.iter().copied().collect();
        let mut remaining: Vec<i64> = ids.difference(&placed).copied().collect();
        remaining.sort_unstable();
        return Err(SchedulerError::CircularDependency { remaining });
    }

    let mut by_id: HashMap<i64, Story> = stories.into_iter().map(|s| (s.id, s)).collect();
    Ok(order
        .into_iter()
        .filter_map(|id| by_id.remove(&id))
        .collect())
}

/// True when every prerequisite of `story_id` is at least in progress.
/// Prerequisites unknown to the store are treated as unsatisfied.
pub fn dependencies_satisfied(
    story_id: i64,
    dependencies: &[StoryDependency],
    all_stories: &HashMap<i64, Story>,
) -> bool {
    dependencies
        .iter()
        .filter(|dep| dep.story_id == story_id)
        .all(|dep| {
            all_stories
                .get(&dep.depends_on_story_id)
                .map(|prereq| prereq.status.satisfies_dependency())
                .unwrap_or(false)
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::StoryStatus;

    fn story(id: i64, status: StoryStatus) -> Story {
        Story {
            id,
            requirement_id: None,
            team_id: Some(1),
            title: format!("story {}", id),
            description: String::new(),
            acceptance_criteria: Vec::new(),
            complexity_score: Some(3),
            story_points: None,
            status,
            assigned_agent_id: None,
            branch_name: None,
            pr_url: None,
            external_issue_key: None,
            external_issue_id: None,
            external_issue_provider: None,
            created_at: String::new(),
            updated_at: String::new(),
        }
    }

    fn edge(story_id: i64, depends_on: i64) -> StoryDependency {
        StoryDependency {
            story_id,
            depends_on_story_id: depends_on,
        }
    }

    #[test]
    fn test_sort_respects_dependencies() {
        let stories = vec![
            story(3, StoryStatus::Planned),
            story(1, StoryStatus::Planned),
            story(2, StoryStatus::Planned),
        ];
        // 1 depends on 2, 2 depends on 3.
        let deps = vec![edge(1, 2), edge(2, 3)];
        let sorted = topological_sort(stories, &deps).unwrap();
        let ids: Vec<i64> = sorted.iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![3, 2, 1]);
    }

    #[test]
    fn test_sort_without_edges_is_id_order() {
        let stories = vec![
            story(5, StoryStatus::Planned),
            story(2, StoryStatus::Planned),
            story(9, StoryStatus::Planned),
        ];
        let sorted = topological_sort(stories, &[]).unwrap();
        let ids: Vec<i64> = sorted.iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![2, 5, 9]);
    }

    #[test]
    fn test_cycle_is_reported_with_member_ids() {
        let stories = vec![
            story(1, StoryStatus::Planned),
            story(2, StoryStatus::Planned),
            story(3, StoryStatus::Planned),
        ];
        let deps = vec![edge(1, 2), edge(2, 1)];
        match topological_sort(stories, &deps) {
            Err(SchedulerError::CircularDependency { remaining }) => {
                assert_eq!(remaining, vec![1, 2]);
            }
            other => panic!("Expected CircularDependency, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_out_of_set_edges_are_ignored() {
        let stories = vec![story(1, StoryStatus::Planned)];
        // Depends on a story not in the input set.
        let deps = vec![edge(1, 99)];
        let sorted = topological_sort(stories, &deps).unwrap();
        assert_eq!(sorted.len(), 1);
    }

    #[test]
    fn test_dependencies_satisfied_counts_in_flight_prereqs() {
        let deps = vec![edge(2, 1)];
        let mut all = HashMap::new();
        all.insert(1, story(1, StoryStatus::Planned));
        all.insert(2, story(2, StoryStatus::Planned));
        assert!(!dependencies_satisfied(2, &deps, &all));

        all.insert(1, story(1, StoryStatus::InProgress));
        assert!(dependencies_satisfied(2, &deps, &all));

        all.insert(1, story(1, StoryStatus::Merged));
        assert!(dependencies_satisfied(2, &deps, &all));
    }

    #[test]
    fn test_unknown_prerequisite_is_unsatisfied() {
        let deps = vec![edge(2, 42)];
        let all = HashMap::from([(2, story(2, StoryStatus::Planned))]);
        assert!(!dependencies_satisfied(2, &deps, &all));
    }
}
