use crate::types::AgentProfile;

/// Built-in agent roster used when the configuration defines no agents.
pub fn default_profiles() -> Vec<AgentProfile> {
    vec![
        research_profile(),
        code_profile(),
        data_profile(),
        content_profile(),
        general_profile(),
    ]
}

fn profile(
    id: &str,
    description: &str,
    capabilities: &[&str],
    keywords: &[&str],
    default_priority: i32,
    base_cost: f64,
) -> AgentProfile {
    AgentProfile {
        id: id.to_string(),
        description: description.to_string(),
        capabilities: capabilities.iter().map(|s| (*s).to_string()).collect(),
        keywords: keywords.iter().map(|s| (*s).to_string()).collect(),
        default_priority,
        base_cost,
        sandbox_id: None,
        language: "python".to_string(),
    }
}

fn research_profile() -> AgentProfile {
    profile(
        "research",
        "Finds and summarizes information from external sources.",
        &["web_search", "summarization", "citation"],
        &["research", "search", "find", "look up", "sources", "summarize"],
        6,
        4.0,
    )
}

fn code_profile() -> AgentProfile {
    profile(
        "code",
        "Writes, reviews, and debugs code.",
        &["code_generation", "code_review", "debugging"],
        &["code", "function", "bug", "implement", "refactor", "script"],
        7,
        6.0,
    )
}

fn data_profile() -> AgentProfile {
    profile(
        "data",
        "Analyzes tabular data and produces statistics and charts.",
        &["data_analysis", "visualization", "statistics"],
        &["data", "csv", "chart", "plot", "analyze", "spreadsheet"],
        6,
        5.0,
    )
}

fn content_profile() -> AgentProfile {
    profile(
        "content",
        "Drafts and edits prose.",
        &["writing", "editing", "translation"],
        &["write", "draft", "email", "blog", "translate", "rewrite"],
        5,
        3.0,
    )
}

fn general_profile() -> AgentProfile {
    profile(
        "general",
        "Fallback assistant for requests no specialist claims.",
        &["conversation"],
        &[],
        4,
        1.0,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_default_profiles_unique_ids() {
        let profiles = default_profiles();
        let ids: HashSet<_> = profiles.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids.len(), profiles.len());
        assert!(ids.contains("general"));
    }

    #[test]
    fn test_specialists_have_routing_terms() {
        for p in default_profiles().iter().filter(|p| p.id != "general") {
            assert!(!p.keywords.is_empty(), "{} has no keywords", p.id);
            assert!(!p.capabilities.is_empty(), "{} has no capabilities", p.id);
            assert!(p.base_cost > 0.0);
        }
    }
}
