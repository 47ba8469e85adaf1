//! Default system prompts bundled at compile time, one per agent role.

use super::invoker::AgentRole;

/// Triage - decides whether a query needs clarification
pub const TRIAGE: &str = include_str!("defaults/triage.md");

/// Clarifier - writes 2-3 follow-up questions
pub const CLARIFIER: &str = include_str!("defaults/clarifier.md");

/// Instruction - folds query and answers into a first-person research brief
pub const INSTRUCTION: &str = include_str!("defaults/instruction.md");

/// Planner - produces the search plan
pub const PLANNER: &str = include_str!("defaults/planner.md");

/// Searcher - summarizes web hits for one plan item
pub const SEARCHER: &str = include_str!("defaults/searcher.md");

/// Writer - synthesizes the report
pub const WRITER: &str = include_str!("defaults/writer.md");

/// Image captioner - describes the hero image
pub const IMAGEGEN: &str = include_str!("defaults/imagegen.md");

/// System prompt for a role
pub fn for_role(role: AgentRole) -> &'static str {
    match role {
        AgentRole::Triage => TRIAGE,
        AgentRole::Clarifier => CLARIFIER,
        AgentRole::Instruction => INSTRUCTION,
        AgentRole::Planner => PLANNER,
        AgentRole::Searcher => SEARCHER,
        AgentRole::Writer => WRITER,
        AgentRole::ImageGen => IMAGEGEN,
    }
}

/// All default prompts with their role ids
pub fn all_defaults() -> Vec<(&'static str, &'static str)> {
    AgentRole::all()
        .into_iter()
        .map(|role| (role.id(), for_role(role)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_prompts_non_empty() {
        for (slug, content) in all_defaults() {
            assert!(!content.is_empty(), "Prompt '{}' should not be empty", slug);
            assert!(content.len() > 50, "Prompt '{}' seems too short", slug);
        }
    }

    #[test]
    fn test_prompt_count() {
        assert_eq!(all_defaults().len(), 7, "Should have one prompt per role");
    }

    #[test]
    fn test_searcher_prompt_bounds_summary() {
        assert!(SEARCHER.contains("200 words"));
    }
}
