//! Pane-buffer classifier: map captured terminal text to an agent state.
//!
//! Pure function of the buffer string and the pattern table below; no I/O.
//! Rules apply in priority order and the first match wins:
//!
//! 1. Active-work markers → `Thinking`
//! 2. Human-input patterns → `NeedsHumanInput`
//! 3. Permission prompt → `PermissionRequired`
//! 4. Plan/safe-mode indicators → `PlanApproval`
//! 5. Uncommitted input at the prompt → `IdleAtPrompt`
//! 6. Completion phrases → `IdleAtPrompt`
//! 7. Otherwise → `ActivelyWorking`

use std::sync::LazyLock;

use regex::Regex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AgentState {
    Thinking,
    IdleAtPrompt,
    PermissionRequired,
    PlanApproval,
    NeedsHumanInput,
    ActivelyWorking,
}

impl AgentState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Thinking => "thinking",
            Self::IdleAtPrompt => "idle_at_prompt",
            Self::PermissionRequired => "permission_required",
            Self::PlanApproval => "plan_approval",
            Self::NeedsHumanInput => "needs_human_input",
            Self::ActivelyWorking => "actively_working",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classification {
    pub state: AgentState,
    pub is_waiting: bool,
    pub needs_human: bool,
}

impl Classification {
    fn new(state: AgentState, is_waiting: bool, needs_human: bool) -> Self {
        Self {
            state,
            is_waiting,
            needs_human,
        }
    }
}

/// The CLI prints an interrupt hint next to its rotating thinking verb for
/// as long as it is processing; either half identifies active work.
const ACTIVE_WORK_MARKERS: &[&str] = &[
    "esc to interrupt",
    "ctrl+b to run in background",
    "✻",
    "✽",
    "✶",
];

/// Substrings that only show up when the agent is asking a person something.
const NEEDS_HUMAN_MARKERS: &[&str] = &[
    "user declined to answer",
    "waiting for your answer",
    "could you clarify",
    "please clarify",
    "which option would you prefer",
];

/// A numbered option menu with a navigation hint, e.g. an interactive
/// multiple-choice question.
static OPTION_MENU: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?ms)^\s*(❯\s*)?1\.\s.+^.*(↑/↓|arrow keys|enter to confirm)").unwrap()
});

/// Plan-mode approval question, which also needs a person to decide.
static PLAN_QUESTION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)would you like to proceed( with this plan)?\?").unwrap());

static PERMISSION_PROMPT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(permission.{0,40}required|do you want to (proceed|allow)|approve.{0,20}\[y/n\])")
        .unwrap()
});

const PLAN_MODE_MARKERS: &[&str] = &["plan mode on", "safe mode on", "accept edits off"];

const COMPLETION_PHRASES: &[&str] = &[
    "work is complete",
    "pr created",
    "is there anything else",
    "let me know if you need",
];

/// Classify a captured pane buffer. First matching rule wins.
pub fn classify(buffer: &str) -> Classification {
    let lower = buffer.to_lowercase();

    if ACTIVE_WORK_MARKERS.iter().any(|m| lower.contains(&m.to_lowercase())) {
        return Classification::new(AgentState::Thinking, false, false);
    }

    if NEEDS_HUMAN_MARKERS.iter().any(|m| lower.contains(m))
        || OPTION_MENU.is_match(buffer)
        || PLAN_QUESTION.is_match(buffer)
    {
        return Classification::new(AgentState::NeedsHumanInput, true, true);
    }

    if PERMISSION_PROMPT.is_match(buffer) {
        return Classification::new(AgentState::PermissionRequired, true, false);
    }

    if PLAN_MODE_MARKERS.iter().any(|m| lower.contains(m)) {
        return Classification::new(AgentState::PlanApproval, true, false);
    }

    if has_uncommitted_input(buffer) {
        return Classification::new(AgentState::IdleAtPrompt, true, false);
    }

    if COMPLETION_PHRASES.iter().any(|m| lower.contains(m)) {
        return Classification::new(AgentState::IdleAtPrompt, true, false);
    }

    Classification::new(AgentState::ActivelyWorking, false, false)
}

/// The prompt line carries typed-but-unsubmitted text: the last non-empty
/// line is a `>` prompt with content after it.
fn has_uncommitted_input(buffer: &str) -> bool {
    let Some(line) = buffer.lines().rev().find(|l| !l.trim().is_empty()) else {
        return false;
    };
    let trimmed = line.trim_start().trim_start_matches('│').trim_start();
    match trimmed.strip_prefix('>') {
        Some(rest) => !rest.trim().trim_end_matches('│').trim().is_empty(),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interrupt_hint_wins_over_everything() {
        let buffer = "✻ Pondering… (esc to interrupt)\n> do you want to proceed?";
        let c = classify(buffer);
        assert_eq!(c.state, AgentState::Thinking);
        assert!(!c.is_waiting);
        assert!(!c.needs_human);
    }

    #[test]
    fn test_option_menu_needs_human() {
        let buffer = "Which database should we use?\n❯ 1. Postgres\n  2. SQLite\n  ↑/↓ to navigate";
        let c = classify(buffer);
        assert_eq!(c.state, AgentState::NeedsHumanInput);
        assert!(c.is_waiting);
        assert!(c.needs_human);
    }

    #[test]
    fn test_declined_answer_needs_human() {
        let c = classify("User declined to answer the question.");
        assert_eq!(c.state, AgentState::NeedsHumanInput);
        assert!(c.needs_human);
    }

    #[test]
    fn test_plan_proceed_question_needs_human() {
        let c = classify("Here is my plan.\nWould you like to proceed with this plan?");
        assert_eq!(c.state, AgentState::NeedsHumanInput);
    }

    #[test]
    fn test_permission_prompt() {
        let c = classify("Bash command requires approval\nDo you want to proceed? [y/n]");
        assert_eq!(c.state, AgentState::PermissionRequired);
        assert!(c.is_waiting);
        assert!(!c.needs_human);
    }

    #[test]
    fn test_plan_mode_indicator() {
        let c = classify("⏸ plan mode on (shift+tab to cycle)");
        assert_eq!(c.state, AgentState::PlanApproval);
        assert!(c.is_waiting);
    }

    #[test]
    fn test_uncommitted_prompt_input_is_idle() {
        let c = classify("some output\n> fix the failing test");
        assert_eq!(c.state, AgentState::IdleAtPrompt);
        assert!(c.is_waiting);
    }

    #[test]
    fn test_boxed_prompt_with_input_is_idle() {
        let c = classify("│ > continue with the next story │");
        assert_eq!(c.state, AgentState::IdleAtPrompt);
    }

    #[test]
    fn test_empty_prompt_is_actively_working() {
        let c = classify("tool output scrolling by\n> ");
        assert_eq!(c.state, AgentState::ActivelyWorking);
        assert!(!c.is_waiting);
    }

    #[test]
    fn test_completion_phrase_is_idle() {
        let c = classify("All tests pass. PR created: https://example.com/pull/7\n");
        assert_eq!(c.state, AgentState::IdleAtPrompt);
        assert!(c.is_waiting);
        assert!(!c.needs_human);
    }

    #[test]
    fn test_plain_output_is_actively_working() {
        let c = classify("$ cargo test\nrunning 12 tests\n...........\n");
        assert_eq!(c.state, AgentState::ActivelyWorking);
        assert!(!c.is_waiting);
    }

    #[test]
    fn test_empty_buffer_is_actively_working() {
        assert_eq!(classify("").state, AgentState::ActivelyWorking);
    }
}
