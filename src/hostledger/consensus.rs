//! Mode-of-opinions consensus.
//!
//! A tick acts only on the unique statistical mode across maven opinions;
//! with no unique mode the tick is skipped and the next one re-attempts.
//! The gateway never acts on a minority opinion.

use std::collections::HashMap;
use std::hash::Hash;

/// The unique most-frequent value, or `None` on an empty slice or a tie.
pub fn statistical_mode<T: Eq + Hash + Clone>(items: &[T]) -> Option<T> {
    let mut counts: HashMap<&T, usize> = HashMap::new();
    for item in items {
        *counts.entry(item).or_insert(0) += 1;
    }
    let best = counts.values().copied().max()?;
    let mut leaders = counts.iter().filter(|(_, &count)| count == best);
    let (leader, _) = leaders.next()?;
    if leaders.next().is_some() {
        return None;
    }
    Some((*leader).clone())
}
