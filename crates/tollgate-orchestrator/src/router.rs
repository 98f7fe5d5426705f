use crate::types::{AgentId, AgentProfile};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tollgate_core::{TollgateError, TollgateResult};

/// One agent the router chose for a request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DelegationDecision {
    /// Chosen agent.
    pub agent_id: AgentId,
    /// Why it was chosen.
    pub reason: String,
    /// Share of the agent's routing terms found in the request (0.0 to 1.0).
    pub confidence: f64,
    /// Capabilities the agent offers.
    pub capabilities: Vec<String>,
    /// Estimated cost of running the delegation.
    pub estimated_cost: f64,
}

struct Matcher {
    term: String,
    pattern: Regex,
}

/// Maps request text to agents by whole-word, case-insensitive matching of
/// each profile's keywords and capability names.
pub struct CapabilityRouter {
    profiles: Vec<AgentProfile>,
    matchers: Vec<Vec<Matcher>>,
    default_agent: AgentId,
    default_cost: f64,
}

impl CapabilityRouter {
    /// Build a router over `profiles`. Requests nothing matches go to
    /// `default_agent` at `default_cost`.
    pub fn new(
        profiles: Vec<AgentProfile>,
        default_agent: impl Into<AgentId>,
        default_cost: f64,
    ) -> TollgateResult<Self> {
        let matchers = profiles
            .iter()
            .map(compile_terms)
            .collect::<TollgateResult<Vec<_>>>()?;
        Ok(Self {
            profiles,
            matchers,
            default_agent: default_agent.into(),
            default_cost,
        })
    }

    /// All known profiles.
    pub fn profiles(&self) -> &[AgentProfile] {
        &self.profiles
    }

    /// Profile for an agent id.
    pub fn profile(&self, agent_id: &str) -> Option<&AgentProfile> {
        self.profiles.iter().find(|p| p.id == agent_id)
    }

    /// The fallback agent.
    pub fn default_agent(&self) -> &str {
        &self.default_agent
    }

    /// Every agent whose terms appear in `content`, best match first.
    pub fn route(&self, content: &str) -> Vec<DelegationDecision> {
        let mut decisions: Vec<DelegationDecision> = self
            .profiles
            .iter()
            .zip(&self.matchers)
            .filter_map(|(profile, matchers)| {
                let matched: Vec<&str> = matchers
                    .iter()
                    .filter(|m| m.pattern.is_match(content))
                    .map(|m| m.term.as_str())
                    .collect();
                if matched.is_empty() {
                    return None;
                }
                let confidence = (matched.len() as f64 / matchers.len() as f64).min(1.0);
                Some(DelegationDecision {
                    agent_id: profile.id.clone(),
                    reason: format!("matched {}", matched.join(", ")),
                    confidence,
                    capabilities: profile.capabilities.clone(),
                    estimated_cost: profile.base_cost,
                })
            })
            .collect();
        decisions.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
        decisions
    }

    /// The single best agent for `content`, or the default agent.
    pub fn route_primary(&self, content: &str) -> AgentId {
        self.route(content)
            .into_iter()
            .next()
            .map_or_else(|| self.default_agent.clone(), |d| d.agent_id)
    }

    /// The decision used when nothing matched.
    pub fn default_decision(&self) -> DelegationDecision {
        DelegationDecision {
            agent_id: self.default_agent.clone(),
            reason: "no capability matched; default agent".to_string(),
            confidence: 0.0,
            capabilities: self
                .profile(&self.default_agent)
                .map(|p| p.capabilities.clone())
                .unwrap_or_default(),
            estimated_cost: self.default_cost,
        }
    }
}

fn compile_terms(profile: &AgentProfile) -> TollgateResult<Vec<Matcher>> {
    let mut terms: Vec<String> = Vec::new();
    for term in profile.keywords.iter().chain(&profile.capabilities) {
        let term = term.trim().to_lowercase();
        if !term.is_empty() && !terms.contains(&term) {
            terms.push(term);
        }
    }
    terms
        .into_iter()
        .map(|term| {
            // `web_search` also matches "web search" and "web-search".
            let words: Vec<String> = term
                .split(|c: char| c == '_' || c == '-' || c.is_whitespace())
                .filter(|w| !w.is_empty())
                .map(regex::escape)
                .collect();
            let pattern = format!(r"(?i)\b{}\b", words.join(r"[\s_-]+"));
            let pattern = Regex::new(&pattern).map_err(|e| {
                TollgateError::Config(format!("agent {}: bad routing term {term:?}: {e}", profile.id))
            })?;
            Ok(Matcher { term, pattern })
        })
        .collect()
}
