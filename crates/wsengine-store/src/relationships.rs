//! Resource-to-resource relationships defined by relationship rules.

use std::collections::BTreeMap;

use serde_json::Value;

use wsengine_core::{
    EngineError, EngineResult, PropertyMatcher, PropertyOperator, RelationshipRule, Resource,
    SelectorEngine, SelectorEntity,
};

/// Walk a property path through an entity's JSON form.
pub fn property_value<'a>(doc: &'a Value, path: &[String]) -> Option<&'a Value> {
    path.iter().try_fold(doc, |current, segment| match current {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

fn as_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Both sides must resolve for a matcher to hold.
pub fn property_matches(matcher: &PropertyMatcher, from: &Value, to: &Value) -> bool {
    let (Some(left), Some(right)) = (
        property_value(from, &matcher.from_property),
        property_value(to, &matcher.to_property),
    ) else {
        return false;
    };
    let (left, right) = (as_text(left), as_text(right));
    match matcher.operator {
        PropertyOperator::Equals => left == right,
        PropertyOperator::NotEquals => left != right,
        PropertyOperator::Contains => left.contains(&right),
        PropertyOperator::StartsWith => left.starts_with(&right),
        PropertyOperator::EndsWith => left.ends_with(&right),
    }
}

fn to_doc(resource: &Resource) -> EngineResult<Value> {
    serde_json::to_value(resource)
        .map_err(|e| EngineError::Evaluator(format!("resource {}: {e}", resource.id)))
}

/// Resources related to `from`, keyed by rule reference. When several
/// candidates satisfy one rule the lowest id wins.
pub fn related_resources(
    rules: &[RelationshipRule],
    from: &Resource,
    candidates: &[Resource],
    selectors: &dyn SelectorEngine,
) -> EngineResult<BTreeMap<String, Resource>> {
    let mut related = BTreeMap::new();
    if from.is_deleted() {
        return Ok(related);
    }

    let mut rules: Vec<&RelationshipRule> = rules.iter().collect();
    rules.sort_by(|a, b| a.id.cmp(&b.id));
    let mut candidates: Vec<&Resource> = candidates
        .iter()
        .filter(|r| r.id != from.id && !r.is_deleted())
        .collect();
    candidates.sort_by(|a, b| a.id.cmp(&b.id));

    let from_doc = to_doc(from)?;
    for rule in rules {
        if related.contains_key(&rule.reference) {
            continue;
        }
        if !selectors.matches_opt(rule.from_selector.as_ref(), &SelectorEntity::Resource(from))? {
            continue;
        }
        for candidate in &candidates {
            if !selectors
                .matches_opt(rule.to_selector.as_ref(), &SelectorEntity::Resource(candidate))?
            {
                continue;
            }
            let to_doc = to_doc(candidate)?;
            if rule
                .property_matchers
                .iter()
                .all(|m| property_matches(m, &from_doc, &to_doc))
            {
                related.insert(rule.reference.clone(), (*candidate).clone());
                break;
            }
        }
    }
    Ok(related)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;
    use wsengine_core::{ConditionSelectorEngine, Selector};

    fn resource(id: &str, kind: &str, region: &str) -> Resource {
        Resource {
            id: id.into(),
            workspace_id: "ws".into(),
            name: id.into(),
            kind: kind.into(),
            version: "v1".into(),
            identifier: id.into(),
            config: json!({}),
            metadata: [("region".to_string(), region.to_string())].into(),
            created_at: Utc::now(),
            updated_at: None,
            deleted_at: None,
        }
    }

    fn vpc_rule() -> RelationshipRule {
        RelationshipRule {
            id: "rule-1".into(),
            workspace_id: "ws".into(),
            name: "cluster in vpc".into(),
            reference: "vpc".into(),
            relationship_type: "depends-on".into(),
            from_selector: Some(Selector::field("kind", "equals", "Cluster")),
            to_selector: Some(Selector::field("kind", "equals", "VPC")),
            property_matchers: vec![PropertyMatcher {
                from_property: vec!["metadata".into(), "region".into()],
                to_property: vec!["metadata".into(), "region".into()],
                operator: PropertyOperator::Equals,
            }],
        }
    }

    #[test]
    fn relates_by_selector_and_property() {
        let engine = ConditionSelectorEngine::new();
        let cluster = resource("c1", "Cluster", "us-east-1");
        let candidates = vec![
            cluster.clone(),
            resource("vpc-west", "VPC", "us-west-2"),
            resource("vpc-east", "VPC", "us-east-1"),
        ];
        let related = related_resources(&[vpc_rule()], &cluster, &candidates, &engine).unwrap();
        assert_eq!(related["vpc"].id, "vpc-east");

        let vpc = resource("vpc-east", "VPC", "us-east-1");
        let related = related_resources(&[vpc_rule()], &vpc, &candidates, &engine).unwrap();
        assert!(related.is_empty());
    }

    #[test]
    fn property_paths() {
        let doc = json!({"config": {"ports": [80, 443]}, "name": "api"});
        let path = |p: &[&str]| p.iter().map(|s| s.to_string()).collect::<Vec<_>>();
        assert_eq!(property_value(&doc, &path(&["config", "ports", "1"])), Some(&json!(443)));
        assert_eq!(property_value(&doc, &path(&["missing"])), None);

        let matcher = PropertyMatcher {
            from_property: path(&["name"]),
            to_property: path(&["name"]),
            operator: PropertyOperator::StartsWith,
        };
        assert!(property_matches(&matcher, &json!({"name": "api-gateway"}), &doc));
        assert!(!property_matches(&matcher, &json!({}), &doc));
    }
}
