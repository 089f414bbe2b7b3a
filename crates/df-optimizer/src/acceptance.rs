//! Acceptance policy: a candidate replaces the original only when it scores
//! at least `margin` higher on the sample.

/// Whether `candidate` beats `original` by at least `margin`.
pub fn beats(original: f64, candidate: f64, margin: f64) -> bool {
    candidate.is_finite() && candidate > original && candidate - original >= margin
}

/// Index of the winning candidate, if any beats the original. The earliest of
/// equally scored candidates wins.
pub fn pick_winner(original: f64, candidates: &[Option<f64>], margin: f64) -> Option<usize> {
    let mut best: Option<(usize, f64)> = None;
    for (i, score) in candidates.iter().enumerate() {
        let Some(score) = *score else { continue };
        if !beats(original, score, margin) {
            continue;
        }
        if best.map_or(true, |(_, b)| score > b) {
            best = Some((i, score));
        }
    }
    best.map(|(i, _)| i)
}
