//! Next-step selection. Pure functions over the flow graph; nothing here
//! sends, persists or calls out.

use serde::Serialize;

use crate::types::{FlowConfig, FlowStep, KeywordRule};

/// How a next step was chosen.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    Keyword { rule_id: String, target: String },
    SingleTransition(String),
    Ai(String),
    /// Stay on (or end at) the current step.
    Stay,
}

impl Route {
    pub fn target(&self) -> Option<&str> {
        match self {
            Self::Keyword { target, .. } | Self::SingleTransition(target) | Self::Ai(target) => {
                Some(target)
            }
            Self::Stay => None,
        }
    }
}

fn normalise(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Whole-phrase, case-insensitive containment: `"seguro auto"` matches
/// `"Quero SEGURO  auto!"` but `"auto"` does not match `"automóvel"`.
pub fn phrase_matches(keyword: &str, text: &str) -> bool {
    let needle = normalise(keyword);
    if needle.is_empty() {
        return false;
    }
    let haystack = normalise(text);
    let mut start = 0;
    while let Some(found) = haystack[start..].find(&needle) {
        let begin = start + found;
        let end = begin + needle.len();
        let before_ok = haystack[..begin]
            .chars()
            .next_back()
            .map_or(true, |c| !c.is_alphanumeric());
        let after_ok = haystack[end..]
            .chars()
            .next()
            .map_or(true, |c| !c.is_alphanumeric());
        if before_ok && after_ok {
            return true;
        }
        start = begin + haystack[begin..].chars().next().map_or(1, char::len_utf8);
    }
    false
}

/// First matching rule for `step_id`: rules scoped to the step first, then
/// unscoped rules, each in declaration order. Rules whose target is missing
/// from the graph are skipped.
pub fn match_keyword<'a>(flow: &'a FlowConfig, step_id: &str, text: &str) -> Option<&'a KeywordRule> {
    let scoped = flow
        .keywords
        .iter()
        .filter(|rule| rule.step_id.as_deref() == Some(step_id));
    let unscoped = flow.keywords.iter().filter(|rule| rule.step_id.is_none());
    scoped.chain(unscoped).find(|rule| {
        if !phrase_matches(&rule.keyword, text) {
            return false;
        }
        if !flow.has_step(&rule.target_step_id) {
            tracing::warn!(
                rule_id = %rule.id,
                target = %rule.target_step_id,
                "keyword rule points at a missing step; ignored"
            );
            return false;
        }
        true
    })
}

/// Targets of the step's transitions that exist in the graph, in order.
pub fn transitionable_ids(flow: &FlowConfig, step: &FlowStep) -> Vec<String> {
    let mut ids = Vec::new();
    for transition in &step.transitions {
        if flow.has_step(&transition.target_step_id) && !ids.contains(&transition.target_step_id) {
            ids.push(transition.target_step_id.clone());
        }
    }
    ids
}

/// Fixed steps: keyword rule first, else the step's only transition.
pub fn select_fixed_next(flow: &FlowConfig, step: &FlowStep, text: &str) -> Route {
    if let Some(rule) = match_keyword(flow, &step.id, text) {
        return Route::Keyword {
            rule_id: rule.id.clone(),
            target: rule.target_step_id.clone(),
        };
    }
    match step.transitions.as_slice() {
        [only] if flow.has_step(&only.target_step_id) => {
            Route::SingleTransition(only.target_step_id.clone())
        }
        [only] => {
            tracing::warn!(
                step_id = %step.id,
                target = %only.target_step_id,
                "dangling transition not followed"
            );
            Route::Stay
        }
        _ => Route::Stay,
    }
}

/// Accepts an AI-proposed step only if it is one of the step's live transitions.
pub fn validate_candidate(flow: &FlowConfig, step: &FlowStep, candidate: Option<&str>) -> Option<String> {
    let candidate = candidate.map(str::trim).filter(|id| !id.is_empty())?;
    let valid = transitionable_ids(flow, step);
    if valid.iter().any(|id| id == candidate) {
        Some(candidate.to_string())
    } else {
        tracing::warn!(
            step_id = %step.id,
            candidate,
            "ai proposed a step outside the live transitions; staying"
        );
        None
    }
}

/// AI steps: a keyword rule overrides whatever the model proposed.
pub fn select_ai_next(flow: &FlowConfig, step: &FlowStep, text: &str, candidate: Option<&str>) -> Route {
    if let Some(rule) = match_keyword(flow, &step.id, text) {
        return Route::Keyword {
            rule_id: rule.id.clone(),
            target: rule.target_step_id.clone(),
        };
    }
    match validate_candidate(flow, step, candidate) {
        Some(target) => Route::Ai(target),
        None => Route::Stay,
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DanglingReference {
    pub kind: &'static str,
    pub from: String,
    pub target_step_id: String,
}

/// Every transition or keyword rule whose target is not in the graph.
pub fn dangling_references(flow: &FlowConfig) -> Vec<DanglingReference> {
    let mut found = Vec::new();
    for step in &flow.steps {
        for transition in &step.transitions {
            if !flow.has_step(&transition.target_step_id) {
                found.push(DanglingReference {
                    kind: "transition",
                    from: step.id.clone(),
                    target_step_id: transition.target_step_id.clone(),
                });
            }
        }
    }
    for rule in &flow.keywords {
        if !flow.has_step(&rule.target_step_id) {
            found.push(DanglingReference {
                kind: "keyword",
                from: rule.id.clone(),
                target_step_id: rule.target_step_id.clone(),
            });
        }
    }
    found
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CanvasPosition, StepBody, TagChange, Transition};
    use chrono::Utc;

    fn step(id: &str, targets: &[&str]) -> FlowStep {
        FlowStep {
            id: id.into(),
            name: id.into(),
            objective: String::new(),
            body: StepBody::Ai(String::new()),
            routing_instructions: String::new(),
            transitions: targets
                .iter()
                .map(|target| Transition {
                    label: format!("to {target}"),
                    target_step_id: target.to_string(),
                })
                .collect(),
            buffer_seconds: None,
            change_status_to: TagChange::Unset,
            change_priority_to: TagChange::Unset,
            position: CanvasPosition::default(),
        }
    }

    fn flow(steps: Vec<FlowStep>, keywords: Vec<KeywordRule>) -> FlowConfig {
        FlowConfig {
            id: "f1".into(),
            name: "Vendas".into(),
            version: 1,
            global_prompt: String::new(),
            active: true,
            steps,
            keywords,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn rule(id: &str, step_id: Option<&str>, keyword: &str, target: &str) -> KeywordRule {
        KeywordRule {
            id: id.into(),
            step_id: step_id.map(str::to_string),
            keyword: keyword.into(),
            target_step_id: target.into(),
        }
    }

    #[test]
    fn phrase_matching_respects_word_boundaries() {
        assert!(phrase_matches("seguro auto", "Quero SEGURO   auto!"));
        assert!(phrase_matches("Atendente", "falar com atendente"));
        assert!(!phrase_matches("auto", "automóvel"));
        assert!(!phrase_matches("", "qualquer"));
    }

    #[test]
    fn ai_candidate_outside_transitions_means_stay() {
        let graph = flow(
            vec![step("a", &["b", "c"]), step("b", &[]), step("c", &[]), step("d", &[])],
            vec![],
        );
        let current = graph.step("a").unwrap();
        assert_eq!(select_ai_next(&graph, current, "x", Some("d")), Route::Stay);
        assert_eq!(select_ai_next(&graph, current, "x", Some("zzz")), Route::Stay);
        assert_eq!(select_ai_next(&graph, current, "x", None), Route::Stay);
        assert_eq!(
            select_ai_next(&graph, current, "x", Some(" c ")),
            Route::Ai("c".into())
        );
    }

    #[test]
    fn dangling_transition_is_never_followed() {
        let graph = flow(vec![step("a", &["ghost"])], vec![]);
        let current = graph.step("a").unwrap();
        assert_eq!(select_fixed_next(&graph, current, "oi"), Route::Stay);
        assert_eq!(validate_candidate(&graph, current, Some("ghost")), None);
        assert_eq!(dangling_references(&graph).len(), 1);
    }

    #[test]
    fn fixed_step_defaults_to_single_transition() {
        let graph = flow(vec![step("a", &["b"]), step("b", &[])], vec![]);
        assert_eq!(
            select_fixed_next(&graph, graph.step("a").unwrap(), "qualquer coisa"),
            Route::SingleTransition("b".into())
        );
        let branching = flow(vec![step("a", &["b", "c"]), step("b", &[]), step("c", &[])], vec![]);
        assert_eq!(
            select_fixed_next(&branching, branching.step("a").unwrap(), "oi"),
            Route::Stay
        );
    }

    #[test]
    fn scoped_rules_win_over_unscoped_and_override_ai() {
        let graph = flow(
            vec![step("a", &["b"]), step("b", &[]), step("human", &[])],
            vec![
                rule("global", None, "atendente", "human"),
                rule("local", Some("a"), "atendente", "b"),
                rule("broken", Some("a"), "ajuda", "ghost"),
            ],
        );
        let current = graph.step("a").unwrap();
        assert_eq!(
            select_fixed_next(&graph, current, "quero um atendente"),
            Route::Keyword { rule_id: "local".into(), target: "b".into() }
        );
        assert_eq!(
            select_ai_next(&graph, graph.step("b").unwrap(), "atendente por favor", None),
            Route::Keyword { rule_id: "global".into(), target: "human".into() }
        );
        // dangling keyword target falls through to the default transition
        assert_eq!(
            select_fixed_next(&graph, current, "ajuda"),
            Route::SingleTransition("b".into())
        );
    }
}
