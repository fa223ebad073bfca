// Adaptive threshold selection: relax the cutoff tier by tier until
// something qualifies, then rank what survived.

/// Cutoffs tried in order; a score must be strictly above the cutoff.
pub const SIMILARITY_TIERS: [f64; 6] = [50.0, 40.0, 30.0, 20.0, 10.0, 0.0];
pub const DEFAULT_MAX_CANDIDATES: usize = 50;

#[derive(Debug, Clone, PartialEq)]
pub struct Ranked<T> {
    pub item: T,
    pub score: f64,
    /// 1-based, dense.
    pub rank: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Shortlist<T> {
    pub ranked: Vec<Ranked<T>>,
    /// Tier that admitted the candidates, `None` when the best one was forced in.
    pub tier: Option<f64>,
}

impl<T> Shortlist<T> {
    pub fn is_forced(&self) -> bool {
        self.tier.is_none() && !self.ranked.is_empty()
    }
}

/// Rank `scored` (in discovery order) and keep the candidates of the
/// strictest tier that admits at least one, capped at `max_candidates`.
///
/// Returns an empty selection only for empty input.
pub fn select_candidates<T>(mut scored: Vec<(T, f64)>, max_candidates: usize) -> Shortlist<T> {
    // sort_by is stable, so equal scores keep discovery order
    scored.sort_by(|a, b| b.1.total_cmp(&a.1));

    let cap = max_candidates.max(1);
    let tier = SIMILARITY_TIERS
        .iter()
        .copied()
        .find(|&cutoff| scored.first().is_some_and(|(_, best)| *best > cutoff));

    let keep = match tier {
        Some(cutoff) => scored
            .iter()
            .take_while(|(_, score)| *score > cutoff)
            .count()
            .min(cap),
        None => scored.len().min(1),
    };

    scored.truncate(keep);
    let ranked = scored
        .into_iter()
        .enumerate()
        .map(|(index, (item, score))| Ranked {
            item,
            score,
            rank: index + 1,
        })
        .collect();

    Shortlist { ranked, tier }
}
