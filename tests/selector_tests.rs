//! Tests for runtime selection.

use unirun::error::{Error, ErrorKind};
use unirun::selector::{RuleMatcher, RuleTable, RuntimeKind, SelectorRule, select};

fn defaults() -> RuleTable {
    RuleTable::default()
}

// =============================================================================
// Default Rules
// =============================================================================

#[test]
fn test_default_rules() {
    let rules = defaults();
    assert_eq!(select("lxc/debian-12", None, &rules).unwrap(), RuntimeKind::ManagedContainer);
    assert_eq!(select("db-postgres", None, &rules).unwrap(), RuntimeKind::ManagedContainer);
    assert_eq!(select("vm-ubuntu-24.04", None, &rules).unwrap(), RuntimeKind::VirtualMachine);
    assert_eq!(select("docker.io/library/nginx:1.27", None, &rules).unwrap(), RuntimeKind::Native);
}

#[test]
fn test_prefix_must_lead() {
    // "vm-" inside a path segment is not a prefix match.
    assert_eq!(select("registry.local/vm-tools", None, &defaults()).unwrap(), RuntimeKind::Native);
}

#[test]
fn test_selection_is_deterministic() {
    let rules = defaults();
    let first = select("db-redis", None, &rules).unwrap();
    for _ in 0..100 {
        assert_eq!(select("db-redis", None, &rules).unwrap(), first);
    }
}

// =============================================================================
// Rule Ordering
// =============================================================================

#[test]
fn test_first_matching_rule_wins() {
    let rules = RuleTable::new(&[
        SelectorRule::prefix("vm-win", RuntimeKind::Native),
        SelectorRule::prefix("vm-", RuntimeKind::VirtualMachine),
    ])
    .unwrap();
    assert_eq!(select("vm-win2022", None, &rules).unwrap(), RuntimeKind::Native);
    assert_eq!(select("vm-debian", None, &rules).unwrap(), RuntimeKind::VirtualMachine);
}

#[test]
fn test_suffix_exact_and_pattern_rules() {
    let rules = RuleTable::new(&[
        SelectorRule {
            matcher: RuleMatcher::Exact("legacy-app".to_string()),
            runtime: RuntimeKind::VirtualMachine,
        },
        SelectorRule {
            matcher: RuleMatcher::Suffix(":lxc".to_string()),
            runtime: RuntimeKind::ManagedContainer,
        },
        SelectorRule::pattern(r"win-\d{4}", RuntimeKind::VirtualMachine),
    ])
    .unwrap();

    assert_eq!(select("legacy-app", None, &rules).unwrap(), RuntimeKind::VirtualMachine);
    assert_eq!(select("legacy-app2", None, &rules).unwrap(), RuntimeKind::Native);
    assert_eq!(select("debian:lxc", None, &rules).unwrap(), RuntimeKind::ManagedContainer);
    assert_eq!(select("win-2022", None, &rules).unwrap(), RuntimeKind::VirtualMachine);
}

#[test]
fn test_empty_table_selects_native() {
    let rules = RuleTable::new(&[]).unwrap();
    assert!(rules.is_empty());
    assert_eq!(select("lxc/debian-12", None, &rules).unwrap(), RuntimeKind::Native);
}

#[test]
fn test_invalid_pattern_rejected_at_compile_time() {
    let err = RuleTable::new(&[SelectorRule::pattern("win-(", RuntimeKind::VirtualMachine)])
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidInput);
}

#[test]
fn test_rules_deserialize() {
    let rules: Vec<SelectorRule> = serde_json::from_str(
        r#"[{"match": {"prefix": "ct-"}, "runtime": "managed-container"},
            {"match": {"pattern": "win-.*"}, "runtime": "virtual-machine"}]"#,
    )
    .unwrap();
    assert_eq!(rules[0], SelectorRule::prefix("ct-", RuntimeKind::ManagedContainer));
    assert_eq!(rules[1], SelectorRule::pattern("win-.*", RuntimeKind::VirtualMachine));
}

// =============================================================================
// Overrides and Validation
// =============================================================================

#[test]
fn test_override_beats_rules() {
    let rules = defaults();
    assert_eq!(select("lxc/debian-12", Some("native"), &rules).unwrap(), RuntimeKind::Native);
    assert_eq!(select("alpine", Some("vm"), &rules).unwrap(), RuntimeKind::VirtualMachine);
    assert_eq!(select("alpine", Some("LXC"), &rules).unwrap(), RuntimeKind::ManagedContainer);
}

#[test]
fn test_unknown_override_rejected() {
    let err = select("alpine", Some("hyperv"), &defaults()).unwrap_err();
    assert!(matches!(err, Error::UnsupportedRuntime(_)));
    assert_eq!(err.kind(), ErrorKind::InvalidInput);
}

#[test]
fn test_invalid_references_rejected() {
    let rules = defaults();
    for reference in ["", "alpine latest", "lxc/$(reboot)"] {
        let err = select(reference, None, &rules).unwrap_err();
        assert!(matches!(err, Error::InvalidImageReference { .. }), "{reference:?}");
    }
}

#[test]
fn test_runtime_kind_names() {
    for kind in RuntimeKind::ALL {
        assert_eq!(kind.as_str().parse::<RuntimeKind>().unwrap(), kind);
    }
    assert!(RuntimeKind::compiled_in().contains(&RuntimeKind::Native));
}
