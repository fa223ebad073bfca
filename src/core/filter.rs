use crate::database::models::ImageRecord;

/// Relative tolerances tried from narrowest to widest.
pub const DIMENSION_TOLERANCES: [f64; 4] = [0.10, 0.15, 0.20, 0.30];

/// Narrows the targets a source is scored against.
pub trait CandidateFilter: Send + Sync {
    fn name(&self) -> &'static str;

    /// Targets worth scoring, in input order.
    fn filter<'a>(&self, source: &ImageRecord, targets: &'a [ImageRecord]) -> Vec<&'a ImageRecord>;
}

/// Scores every target.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllTargets;

impl CandidateFilter for AllTargets {
    fn name(&self) -> &'static str {
        "all"
    }

    fn filter<'a>(&self, _source: &ImageRecord, targets: &'a [ImageRecord]) -> Vec<&'a ImageRecord> {
        targets.iter().collect()
    }
}

/// Keeps targets whose file size, width and height are all within a
/// tolerance of the source, widening the tolerance until something matches.
/// Falls back to every target when even the widest tolerance matches none.
#[derive(Debug, Clone)]
pub struct DimensionFilter {
    tolerances: Vec<f64>,
}

impl DimensionFilter {
    pub fn new() -> Self {
        Self {
            tolerances: DIMENSION_TOLERANCES.to_vec(),
        }
    }

    /// Narrowest tolerance that yields a match, with the matching targets.
    pub fn narrowest<'a>(
        &self,
        source: &ImageRecord,
        targets: &'a [ImageRecord],
    ) -> Option<(f64, Vec<&'a ImageRecord>)> {
        self.tolerances.iter().find_map(|&tolerance| {
            let matched: Vec<_> = targets
                .iter()
                .filter(|target| matches_dimensions(source, target, tolerance))
                .collect();
            (!matched.is_empty()).then_some((tolerance, matched))
        })
    }
}

impl Default for DimensionFilter {
    fn default() -> Self {
        Self::new()
    }
}

impl CandidateFilter for DimensionFilter {
    fn name(&self) -> &'static str {
        "dimension"
    }

    fn filter<'a>(&self, source: &ImageRecord, targets: &'a [ImageRecord]) -> Vec<&'a ImageRecord> {
        match self.narrowest(source, targets) {
            Some((tolerance, matched)) => {
                log::debug!(
                    "{}: {} of {} targets within {:.0}%",
                    source.relative_path,
                    matched.len(),
                    targets.len(),
                    tolerance * 100.0
                );
                matched
            }
            None => targets.iter().collect(),
        }
    }
}

fn matches_dimensions(source: &ImageRecord, target: &ImageRecord, tolerance: f64) -> bool {
    within(source.size_bytes as f64, target.size_bytes as f64, tolerance)
        && within(f64::from(source.width), f64::from(target.width), tolerance)
        && within(f64::from(source.height), f64::from(target.height), tolerance)
}

fn within(a: f64, b: f64, tolerance: f64) -> bool {
    if a == 0.0 || b == 0.0 {
        return false;
    }
    let ratio = a / b;
    ratio >= 1.0 - tolerance && ratio <= 1.0 + tolerance
}
