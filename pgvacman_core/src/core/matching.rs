use crate::{configuration::Matchgroup, core::catalog::CandidateRelation};

/// A relation together with the index of the matchgroup that claimed it.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchedRelation {
    pub matchgroup: usize,
    pub relation: CandidateRelation,
}

/// Assigns each relation to the first matchgroup, in configuration order,
/// whose patterns all match. Relations matching nothing are dropped.
///
/// Output is grouped by matchgroup, then in input order.
pub fn resolve_matches(
    matchgroups: &[Matchgroup],
    relations: Vec<CandidateRelation>,
) -> Vec<MatchedRelation> {
    let mut unassigned: Vec<Option<CandidateRelation>> = relations.into_iter().map(Some).collect();
    let mut matched = Vec::new();

    for (index, group) in matchgroups.iter().enumerate() {
        for slot in unassigned.iter_mut() {
            let claimed = slot
                .as_ref()
                .is_some_and(|r| group.matches(&r.schema, &r.name, &r.owner));

            if claimed {
                if let Some(relation) = slot.take() {
                    matched.push(MatchedRelation {
                        matchgroup: index,
                        relation,
                    });
                }
            }
        }
    }

    matched
}
