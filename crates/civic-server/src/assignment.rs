//! Automatic assignment of new tickets.

use std::collections::BTreeMap;

use civic_identity::Identity;
use rand::seq::SliceRandom;

/// Chooses who handles a new ticket.
pub trait AssignmentPolicy: Send + Sync {
    /// Picks one id from `candidates`, or `None` to leave the ticket
    /// unassigned. Candidates are the staff accounts known at call time and
    /// may include unverified ones.
    fn select_assignee(&self, category: &str, candidates: &[Identity]) -> Option<String>;
}

/// Uniform random choice among verified staff.
///
/// When `routes` names staff for the ticket's category, the choice is
/// narrowed to those of them that are verified staff. If none are, every
/// verified staff member is eligible again.
#[derive(Debug, Clone, Default)]
pub struct RandomAssignment {
    routes: BTreeMap<String, Vec<String>>,
}

impl RandomAssignment {
    pub fn new(routes: BTreeMap<String, Vec<String>>) -> Self {
        Self { routes }
    }
}

impl AssignmentPolicy for RandomAssignment {
    fn select_assignee(&self, category: &str, candidates: &[Identity]) -> Option<String> {
        let eligible: Vec<&Identity> = candidates
            .iter()
            .filter(|c| c.is_assignable_staff())
            .collect();

        let routed: Vec<&Identity> = match self.routes.get(category) {
            Some(ids) => eligible
                .iter()
                .copied()
                .filter(|c| ids.contains(&c.id))
                .collect(),
            None => Vec::new(),
        };
        let pool = if routed.is_empty() { &eligible } else { &routed };

        let chosen = pool.choose(&mut rand::thread_rng()).map(|c| c.id.clone());
        tracing::debug!(
            category,
            eligible = eligible.len(),
            routed = routed.len(),
            assignee = chosen.as_deref().unwrap_or("<none>"),
            "selected assignee"
        );
        chosen
    }
}

/// Never assigns. New tickets wait for an explicit `assign`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ManualAssignment;

impl AssignmentPolicy for ManualAssignment {
    fn select_assignee(&self, _category: &str, _candidates: &[Identity]) -> Option<String> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use civic_types::Role;

    fn staff(id: &str, verified: bool) -> Identity {
        Identity::new(id, Role::Staff, verified)
    }

    #[test]
    fn no_verified_staff_means_unassigned() {
        let policy = RandomAssignment::default();
        assert_eq!(policy.select_assignee("roads", &[]), None);
        assert_eq!(
            policy.select_assignee("roads", &[staff("s-1", false)]),
            None
        );
    }

    #[test]
    fn only_verified_staff_are_chosen() {
        let policy = RandomAssignment::default();
        let candidates = [
            staff("s-1", false),
            staff("s-2", true),
            Identity::new("a-1", Role::Admin, true),
        ];
        for _ in 0..50 {
            assert_eq!(
                policy.select_assignee("parks", &candidates).as_deref(),
                Some("s-2")
            );
        }
    }

    #[test]
    fn routes_narrow_the_pool() {
        let routes = BTreeMap::from([("roads".to_string(), vec!["s-3".to_string()])]);
        let policy = RandomAssignment::new(routes);
        let candidates = [staff("s-1", true), staff("s-2", true), staff("s-3", true)];
        for _ in 0..50 {
            assert_eq!(
                policy.select_assignee("roads", &candidates).as_deref(),
                Some("s-3")
            );
        }
    }

    #[test]
    fn unusable_route_falls_back_to_everyone() {
        let routes = BTreeMap::from([("roads".to_string(), vec!["gone".to_string()])]);
        let policy = RandomAssignment::new(routes);
        let candidates = [staff("s-1", true)];
        assert_eq!(
            policy.select_assignee("roads", &candidates).as_deref(),
            Some("s-1")
        );
    }

    #[test]
    fn manual_policy_never_assigns() {
        assert_eq!(
            ManualAssignment.select_assignee("roads", &[staff("s-1", true)]),
            None
        );
    }
}
