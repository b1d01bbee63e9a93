// State filtering — which nodes take part in a build
//
// A node with include rules is kept iff at least one include rule matches
// the state. A node without include rules is kept iff no exclude rule
// matches. Declaring both kinds on one node is rejected.

use marmot_core::{Error, Result};

use crate::spec::{NetState, NodeSpec, StateRule};

impl StateRule {
    /// Whether this rule matches `state`.
    pub fn matches(&self, state: &NetState) -> bool {
        if let Some(phase) = self.phase {
            if phase != state.phase {
                return false;
            }
        }
        if let Some(min) = self.min_level {
            if state.level < min {
                return false;
            }
        }
        if let Some(max) = self.max_level {
            if state.level > max {
                return false;
            }
        }
        if !self.stages.iter().all(|s| state.stages.contains(s)) {
            return false;
        }
        !self.not_stages.iter().any(|s| state.stages.contains(s))
    }
}

/// Whether `node` takes part in a graph built for `state`.
pub fn state_meets_rules(node: &NodeSpec, state: &NetState) -> Result<bool> {
    if !node.include.is_empty() && !node.exclude.is_empty() {
        return Err(Error::config(format!(
            "node '{}' specifies both include and exclude rules",
            node.name
        )));
    }
    if !node.include.is_empty() {
        return Ok(node.include.iter().any(|r| r.matches(state)));
    }
    Ok(!node.exclude.iter().any(|r| r.matches(state)))
}

/// The nodes of `nodes` that take part in `state`, in declared order.
pub fn filter_nodes<'a>(nodes: &'a [NodeSpec], state: &NetState) -> Result<Vec<&'a NodeSpec>> {
    let mut kept = Vec::with_capacity(nodes.len());
    for node in nodes {
        if state_meets_rules(node, state)? {
            kept.push(node);
        } else {
            tracing::debug!(node = %node.name, "node excluded by state rules");
        }
    }
    Ok(kept)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spec::Phase;

    fn state(phase: Phase, level: i32, stages: &[&str]) -> NetState {
        NetState {
            phase,
            level,
            stages: stages.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn test_rule_fields_all_must_match() {
        let rule = StateRule::phase(Phase::Train)
            .with_min_level(1)
            .with_max_level(3)
            .with_not_stage("deploy");
        assert!(rule.matches(&state(Phase::Train, 2, &[])));
        assert!(!rule.matches(&state(Phase::Test, 2, &[])));
        assert!(!rule.matches(&state(Phase::Train, 0, &[])));
        assert!(!rule.matches(&state(Phase::Train, 4, &[])));
        assert!(!rule.matches(&state(Phase::Train, 2, &["deploy"])));
    }

    #[test]
    fn test_required_stages() {
        let mut rule = StateRule::stage("a");
        rule.stages.push("b".into());
        assert!(!rule.matches(&state(Phase::Train, 0, &["a"])));
        assert!(rule.matches(&state(Phase::Train, 0, &["b", "a", "c"])));
    }

    #[test]
    fn test_include_and_exclude() {
        let train_only = NodeSpec::new("n", "Identity").include(StateRule::phase(Phase::Train));
        let not_test = NodeSpec::new("m", "Identity").exclude(StateRule::phase(Phase::Test));
        let plain = NodeSpec::new("p", "Identity");
        let nodes = vec![train_only, not_test, plain];

        let kept = filter_nodes(&nodes, &state(Phase::Test, 0, &[])).unwrap();
        assert_eq!(kept.iter().map(|n| n.name.as_str()).collect::<Vec<_>>(), vec!["p"]);

        let kept = filter_nodes(&nodes, &state(Phase::Train, 0, &[])).unwrap();
        assert_eq!(kept.len(), 3);
    }

    #[test]
    fn test_both_rule_kinds_rejected() {
        let node = NodeSpec::new("n", "Identity")
            .include(StateRule::phase(Phase::Train))
            .exclude(StateRule::stage("x"));
        assert!(matches!(
            state_meets_rules(&node, &NetState::default()),
            Err(Error::Config(_))
        ));
    }
}
