//! Greedy token selection

/// Index of the highest score.
///
/// Linear scan that only moves on a strictly greater score, so the earliest
/// index wins ties. Returns `None` for an empty slice.
pub fn greedy_argmax(scores: &[f32]) -> Option<usize> {
    let (first, rest) = scores.split_first()?;

    let mut best = 0;
    let mut best_score = *first;
    for (i, &score) in rest.iter().enumerate() {
        if score > best_score {
            best = i + 1;
            best_score = score;
        }
    }

    Some(best)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_picks_maximum() {
        assert_eq!(greedy_argmax(&[1.0, 10.0, 2.0, 0.5]), Some(1));
        assert_eq!(greedy_argmax(&[-3.0, -1.0, -2.0]), Some(1));
        assert_eq!(greedy_argmax(&[0.0, 0.0, 0.0, 4.0]), Some(3));
    }

    #[test]
    fn test_earliest_index_wins_ties() {
        assert_eq!(greedy_argmax(&[0.5, 3.0, 1.0, 3.0, 3.0]), Some(1));
        assert_eq!(greedy_argmax(&[2.0, 2.0]), Some(0));
    }

    #[test]
    fn test_deterministic() {
        let scores: Vec<f32> = (0..32_000).map(|i| ((i * 7919) % 1000) as f32).collect();
        let first = greedy_argmax(&scores);
        for _ in 0..10 {
            assert_eq!(greedy_argmax(&scores), first);
        }
    }

    #[test]
    fn test_empty_scores() {
        assert_eq!(greedy_argmax(&[]), None);
    }

    #[test]
    fn test_nan_never_wins() {
        assert_eq!(greedy_argmax(&[1.0, f32::NAN, 2.0]), Some(2));
    }
}
