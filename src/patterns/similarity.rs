//! Bounded token edit distance between normalised messages

/// Tokens compared per message; longer messages are truncated
pub const MAX_TOKENS: usize = 64;

/// Split a normalised message into at most `MAX_TOKENS` whitespace tokens
pub fn tokenize(message: &str) -> Vec<String> {
    message
        .split_whitespace()
        .take(MAX_TOKENS)
        .map(str::to_string)
        .collect()
}

/// Levenshtein distance over tokens, two-row dynamic programming
pub fn token_distance(a: &[String], b: &[String]) -> usize {
    if a.is_empty() {
        return b.len();
    }
    if b.is_empty() {
        return a.len();
    }

    let mut previous: Vec<usize> = (0..=b.len()).collect();
    let mut current = vec![0usize; b.len() + 1];

    for (i, token_a) in a.iter().enumerate() {
        current[0] = i + 1;
        for (j, token_b) in b.iter().enumerate() {
            let substitution = previous[j] + usize::from(token_a != token_b);
            current[j + 1] = substitution.min(previous[j + 1] + 1).min(current[j] + 1);
        }
        std::mem::swap(&mut previous, &mut current);
    }

    previous[b.len()]
}

/// `1 - distance / max(len)`, in [0, 1]; two empty messages are identical
pub fn similarity(a: &[String], b: &[String]) -> f64 {
    let longest = a.len().max(b.len());
    if longest == 0 {
        return 1.0;
    }
    1.0 - token_distance(a, b) as f64 / longest as f64
}

/// Whether two token counts can possibly reach `threshold`
///
/// Distance is at least the length difference, so similarity is bounded
/// above by `min / max`.
pub fn length_compatible(a: usize, b: usize, threshold: f64) -> bool {
    let longest = a.max(b);
    if longest == 0 {
        return true;
    }
    a.min(b) as f64 / longest as f64 >= threshold
}


#[cfg(test)]
mod property_tests {
    use super::*;
    use quickcheck_macros::quickcheck;

    fn words(raw: Vec<u8>) -> Vec<String> {
        raw.into_iter()
            .take(MAX_TOKENS)
            .map(|b| format!("w{}", b % 8))
            .collect()
    }

    #[quickcheck]
    fn prop_distance_is_symmetric(a: Vec<u8>, b: Vec<u8>) -> bool {
        let (a, b) = (words(a), words(b));
        token_distance(&a, &b) == token_distance(&b, &a)
    }

    #[quickcheck]
    fn prop_prefilter_never_rejects_a_match(a: Vec<u8>, b: Vec<u8>) -> bool {
        let (a, b) = (words(a), words(b));
        let sim = similarity(&a, &b);
        sim < 0.85 || length_compatible(a.len(), b.len(), 0.85)
    }
}
