/// Instance search over variables
///
/// Query syntax: comma-separated `attribute:value` terms. Either side may be
/// empty (`:value` matches any attribute); a term with more than one `:` is
/// rejected. Matching is a case-insensitive
/// substring match on variable names and on string values; terms are ANDed.

use crate::error::{EngineError, EngineResult};
use crate::runtime::instance::InstanceSnapshot;
use serde_json::Value;
use std::collections::BTreeSet;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchTerm {
    pub attribute: String,
    pub value: String,
}

impl SearchTerm {
    fn matches(&self, snapshot: &InstanceSnapshot) -> bool {
        snapshot.variables.iter().any(|(name, value)| {
            let Value::String(text) = value else {
                return false;
            };
            name.to_lowercase().contains(&self.attribute) && text.to_lowercase().contains(&self.value)
        })
    }
}

/// Split a query string into normalized terms
pub fn parse_query(query: &str) -> EngineResult<Vec<SearchTerm>> {
    if query.trim().is_empty() {
        return Err(EngineError::InvalidQuery("empty query".to_string()));
    }

    query
        .split(',')
        .map(|raw| {
            let term = raw.trim();
            if term.is_empty() {
                return Err(EngineError::InvalidQuery(format!("empty term in '{}'", query)));
            }
            if term.matches(':').count() > 1 {
                return Err(EngineError::InvalidQuery(format!("term '{}' has more than one ':'", term)));
            }
            let (attribute, value) = term.split_once(':').unwrap_or(("", term));
            Ok(SearchTerm {
                attribute: attribute.trim().to_lowercase(),
                value: value.trim().to_lowercase(),
            })
        })
        .collect()
}

/// Ids of the instances matching every term, sorted
pub fn matching_ids<'a>(
    terms: &[SearchTerm],
    snapshots: impl IntoIterator<Item = &'a InstanceSnapshot>,
) -> Vec<String> {
    let snapshots: Vec<&InstanceSnapshot> = snapshots.into_iter().collect();

    let mut result: Option<BTreeSet<String>> = None;
    for term in terms {
        let hits: BTreeSet<String> = snapshots
            .iter()
            .filter(|s| term.matches(s))
            .map(|s| s.id.clone())
            .collect();
        result = Some(match result {
            Some(acc) => acc.intersection(&hits).cloned().collect(),
            None => hits,
        });
    }

    result.unwrap_or_default().into_iter().collect()
}
