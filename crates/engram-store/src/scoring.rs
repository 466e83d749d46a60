//! Raw relevance scoring shared by the storage backends.
//!
//! Backends produce raw scores; normalization and blending happen in the
//! retrieval engine, so both backends only need to agree on the raw scale.

/// Cosine similarity of two vectors. Zero for mismatched or empty inputs.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.is_empty() || a.len() != b.len() {
        return 0.0;
    }
    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += (*x as f64) * (*y as f64);
        norm_a += (*x as f64) * (*x as f64);
        norm_b += (*y as f64) * (*y as f64);
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

/// Keyword overlap scorer: fraction of query words found in the text.
/// Lexical fallback when embeddings are unavailable.
pub fn keyword_overlap(query: &str, text: &str) -> f64 {
    let words: Vec<&str> = query.split_whitespace().collect();
    if words.is_empty() {
        return 0.0;
    }
    let haystack = text.to_lowercase();
    let matched = words
        .iter()
        .filter(|w| haystack.contains(&w.to_lowercase()))
        .count();
    matched as f64 / words.len() as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cosine_identical_vectors() {
        let v = vec![0.5, 0.5, 0.1];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_cosine_orthogonal_vectors() {
        let a = vec![1.0, 0.0];
        let b = vec![0.0, 1.0];
        assert_eq!(cosine_similarity(&a, &b), 0.0);
    }

    #[test]
    fn test_cosine_mismatched_lengths() {
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 0.0]), 0.0);
    }

    #[test]
    fn test_keyword_overlap_partial_match() {
        let score = keyword_overlap("prefer email contact", "I prefer email");
        assert!((score - 2.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_keyword_overlap_empty_query() {
        assert_eq!(keyword_overlap("", "anything"), 0.0);
    }
}
