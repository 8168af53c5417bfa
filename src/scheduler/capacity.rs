//! Refactor-capacity selection.
//!
//! Refactor stories (title `refactor: ...`) are throttled to a percentage
//! of the feature work in the same batch so maintenance never starves
//! delivery. Feature stories always pass through untouched.

use std::sync::LazyLock;

use regex::Regex;

use crate::config::RefactorConfig;
use crate::db::models::Story;

static REFACTOR_TITLE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^\s*refactor\s*:").unwrap());

pub fn is_refactor_story(title: &str) -> bool {
    REFACTOR_TITLE.is_match(title)
}

/// Points a story occupies in the capacity budget: story points, else
/// complexity, else one. Zero counts as unset so every story consumes at
/// least one point of budget.
pub fn capacity_points(story: &Story) -> i64 {
    story
        .story_points
        .filter(|p| *p > 0)
        .or(story.complexity_score.filter(|p| *p > 0))
        .unwrap_or(1)
}

/// Filter a batch down to the stories the scheduler may assign this pass.
///
/// With the policy disabled, refactor stories are excluded outright. With it
/// enabled, the refactor budget is `floor(feature_points * percent / 100)`,
/// floored at one point whenever any feature work exists and the percentage
/// is positive. Stories keep their input order, and a refactor too large for
/// the remaining budget does not block later, smaller ones.
pub fn select_stories_for_capacity(stories: Vec<Story>, policy: &RefactorConfig) -> Vec<Story> {
    if !policy.enabled {
        return stories
            .into_iter()
            .filter(|s| !is_refactor_story(&s.title))
            .collect();
    }

    let feature_points: i64 = stories
        .iter()
        .filter(|s| !is_refactor_story(&s.title))
        .map(capacity_points)
        .sum();

    if feature_points == 0 {
        return if policy.allow_without_feature_work {
            stories
        } else {
            stories
                .into_iter()
                .filter(|s| !is_refactor_story(&s.title))
                .collect()
        };
    }

    let mut budget = feature_points * policy.capacity_percent.max(0) / 100;
    if budget == 0 && policy.capacity_percent > 0 {
        // Minimum one point: a positive percentage always admits at least
        // the smallest refactor.
        budget = 1;
    }

    let mut used = 0;
    stories
        .into_iter()
        .filter(|story| {
            if !is_refactor_story(&story.title) {
                return true;
            }
            let points = capacity_points(story);
            if used + points <= budget {
                used += points;
                true
            } else {
                false
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::StoryStatus;

    fn story(id: i64, title: &str, points: i64) -> Story {
        Story {
            id,
            requirement_id: None,
            team_id: Some(1),
            title: title.to_string(),
            description: String::new(),
            acceptance_criteria: Vec::new(),
            complexity_score: None,
            story_points: Some(points),
            status: StoryStatus::Planned,
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

    fn policy(enabled: bool, percent: i64, allow_without: bool) -> RefactorConfig {
        RefactorConfig {
            enabled,
            capacity_percent: percent,
            allow_without_feature_work: allow_without,
        }
    }

    #[test]
    fn test_refactor_title_detection() {
        assert!(is_refactor_story("refactor: extract service"));
        assert!(is_refactor_story("  Refactor : tidy module"));
        assert!(!is_refactor_story("fix: refactor-adjacent bug"));
        assert!(!is_refactor_story("implement refactor command"));
    }

    #[test]
    fn test_disabled_policy_excludes_refactors() {
        let stories = vec![
            story(1, "feature work", 5),
            story(2, "refactor: cleanup", 2),
        ];
        let selected = select_stories_for_capacity(stories, &policy(false, 50, false));
        let ids: Vec<i64> = selected.iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![1]);
    }

    #[test]
    fn test_budget_limits_refactor_points() {
        // Feature points = 10, 30% → budget 3.
        let stories = vec![
            story(1, "feature a", 4),
            story(2, "refactor: big", 5),
            story(3, "feature b", 6),
            story(4, "refactor: small", 2),
            story(5, "refactor: tiny", 1),
        ];
        let selected = select_stories_for_capacity(stories, &policy(true, 30, false));
        let ids: Vec<i64> = selected.iter().map(|s| s.id).collect();
        // Big refactor (5 > 3) is skipped, but the smaller ones still fit.
        assert_eq!(ids, vec![1, 3, 4, 5]);
    }

    #[test]
    fn test_minimum_one_point_budget() {
        // Feature points = 2, 10% → floor is 0, bumped to 1.
        let stories = vec![
            story(1, "feature", 2),
            story(2, "refactor: one-pointer", 1),
        ];
        let selected = select_stories_for_capacity(stories, &policy(true, 10, false));
        assert_eq!(selected.len(), 2);
    }

    #[test]
    fn test_zero_percent_admits_no_refactors() {
        let stories = vec![story(1, "feature", 5), story(2, "refactor: x", 1)];
        let selected = select_stories_for_capacity(stories, &policy(true, 0, false));
        let ids: Vec<i64> = selected.iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![1]);
    }

    #[test]
    fn test_no_feature_work_gated_by_flag() {
        let stories = vec![story(1, "refactor: a", 2), story(2, "refactor: b", 3)];

        let none = select_stories_for_capacity(stories.clone(), &policy(true, 50, false));
        assert!(none.is_empty());

        let all = select_stories_for_capacity(stories, &policy(true, 50, true));
        assert_eq!(all.len(), 2);
    }

    #[test]
    fn test_input_order_is_preserved_and_features_never_dropped() {
        let stories = vec![
            story(9, "refactor: first", 1),
            story(1, "feature a", 3),
            story(5, "refactor: second", 1),
            story(2, "feature b", 3),
        ];
        let selected = select_stories_for_capacity(stories, &policy(true, 100, false));
        let ids: Vec<i64> = selected.iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![9, 1, 5, 2]);
    }

    #[test]
    fn test_zero_points_coerced_to_one() {
        let mut s = story(1, "feature", 0);
        s.story_points = Some(0);
        assert_eq!(capacity_points(&s), 1);

        // Zero story points fall through to complexity.
        s.complexity_score = Some(8);
        assert_eq!(capacity_points(&s), 8);

        s.story_points = None;
        s.complexity_score = None;
        assert_eq!(capacity_points(&s), 1);
    }
}
