//! Relevance routing.
//!
//! Decides whether an extracted request continues to planning or goes to the
//! fixed redirect answer. The decision looks only at whether any target
//! entity was extracted; the user's wording plays no part.

use crate::models::QueryStructure;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Continue,
    Irrelevant,
}

pub fn route(structure: &QueryStructure) -> Route {
    if structure.targets.is_empty() {
        Route::Irrelevant
    } else {
        Route::Continue
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::CoreEntity;

    fn structure(targets: Vec<CoreEntity>) -> QueryStructure {
        QueryStructure {
            targets,
            calculations: vec![],
            relations: vec![],
            ultimate_goal: "goal".into(),
        }
    }

    #[test]
    fn test_empty_targets_is_irrelevant() {
        assert_eq!(route(&structure(vec![])), Route::Irrelevant);
    }

    #[test]
    fn test_unresolved_target_still_continues() {
        let qs = structure(vec![CoreEntity {
            entity_name: None,
            filters: vec![],
        }]);
        assert_eq!(route(&qs), Route::Continue);
    }
}
