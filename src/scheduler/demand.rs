use std::collections::HashMap;

use regex::Regex;

use crate::scheduler::job::{Demand, DemandOperator};

/// True when every demand holds against `capabilities`. Total: missing keys
/// and malformed patterns evaluate to a non-match instead of failing.
pub fn satisfies(capabilities: &HashMap<String, String>, demands: &[Demand]) -> bool {
    demands
        .iter()
        .all(|demand| matches_one(capabilities.get(&demand.key).map(String::as_str), demand))
}

fn matches_one(capability: Option<&str>, demand: &Demand) -> bool {
    match (demand.operator, capability) {
        (DemandOperator::Exists, value) => value.is_some(),
        (DemandOperator::NotExists, value) => value.is_none(),
        (DemandOperator::NotEquals, None) => true,
        (DemandOperator::NotEquals, Some(value)) => value != demand.value,
        (_, None) => false,
        (DemandOperator::Equals, Some(value)) => value == demand.value,
        (DemandOperator::Match, Some(value)) => match Regex::new(&format!("^(?:{})$", demand.value)) {
            Ok(re) => re.is_match(value),
            Err(e) => {
                tracing::debug!(pattern = %demand.value, error = %e, "Invalid demand pattern");
                false
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caps(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn empty_demands_match_everyone() {
        assert!(satisfies(&HashMap::new(), &[]));
        assert!(satisfies(&caps(&[("Type", "Publisher")]), &[]));
    }

    #[test]
    fn equals_requires_key_and_value() {
        let demands = [Demand::equals("Type", "Publisher")];
        assert!(satisfies(&caps(&[("Type", "Publisher")]), &demands));
        assert!(!satisfies(&caps(&[("Type", "Twin")]), &demands));
        assert!(!satisfies(&HashMap::new(), &demands));
    }

    #[test]
    fn not_equals_accepts_missing_key() {
        let demands = [Demand::with_operator("Site", DemandOperator::NotEquals, "lab")];
        assert!(satisfies(&HashMap::new(), &demands));
        assert!(satisfies(&caps(&[("Site", "plant-a")]), &demands));
        assert!(!satisfies(&caps(&[("Site", "lab")]), &demands));
    }

    #[test]
    fn exists_and_not_exists() {
        let exists = [Demand::with_operator("Gpu", DemandOperator::Exists, "")];
        let absent = [Demand::with_operator("Gpu", DemandOperator::NotExists, "")];
        let with_gpu = caps(&[("Gpu", "")]);
        assert!(satisfies(&with_gpu, &exists));
        assert!(!satisfies(&with_gpu, &absent));
        assert!(!satisfies(&HashMap::new(), &exists));
        assert!(satisfies(&HashMap::new(), &absent));
    }

    #[test]
    fn match_is_anchored() {
        let demands = [Demand::with_operator("Site", DemandOperator::Match, "plant-[ab]")];
        assert!(satisfies(&caps(&[("Site", "plant-a")]), &demands));
        assert!(!satisfies(&caps(&[("Site", "plant-a2")]), &demands));
        assert!(!satisfies(&HashMap::new(), &demands));
    }

    #[test]
    fn invalid_pattern_never_matches() {
        let demands = [Demand::with_operator("Site", DemandOperator::Match, "([")];
        assert!(!satisfies(&caps(&[("Site", "([")]), &demands));
    }

    #[test]
    fn demands_are_anded() {
        let demands = [
            Demand::equals("Type", "Publisher"),
            Demand::equals("Site", "plant-a"),
        ];
        assert!(satisfies(
            &caps(&[("Type", "Publisher"), ("Site", "plant-a")]),
            &demands
        ));
        assert!(!satisfies(&caps(&[("Type", "Publisher")]), &demands));
    }
}
