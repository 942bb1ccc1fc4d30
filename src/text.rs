//! Small text helpers shared by attribution and compression: sentence
//! splitting, CJK-aware token estimation, word sets, cosine similarity.

use ndarray::Array1;
use std::collections::HashSet;

/// Split text into sentences on CJK and latin sentence endings. Newlines
/// also terminate a sentence.
pub fn split_sentences(text: &str) -> Vec<String> {
    let mut sentences = Vec::new();
    let mut current = String::new();
    for c in text.chars() {
        if c == '\n' {
            if !current.trim().is_empty() {
                sentences.push(current.trim().to_string());
            }
            current.clear();
            continue;
        }
        current.push(c);
        if matches!(c, '。' | '！' | '？' | '.' | '!' | '?') {
            if !current.trim().is_empty() {
                sentences.push(current.trim().to_string());
            }
            current.clear();
        }
    }
    if !current.trim().is_empty() {
        sentences.push(current.trim().to_string());
    }
    sentences
}

/// Estimate token count: CJK characters weigh ~1.5 chars per token, other
/// characters ~4 chars per token.
pub fn estimate_tokens(text: &str) -> usize {
    let mut cjk = 0usize;
    let mut other = 0usize;
    for c in text.chars() {
        if ('\u{4e00}'..='\u{9fff}').contains(&c) {
            cjk += 1;
        } else {
            other += 1;
        }
    }
    (cjk as f64 / 1.5 + other as f64 / 4.0) as usize
}

/// Lowercased word set (CJK chars count individually) for overlap scoring.
pub fn word_set(text: &str) -> HashSet<String> {
    let mut words = HashSet::new();
    let mut current = String::new();
    for c in text.chars() {
        if ('\u{4e00}'..='\u{9fff}').contains(&c) {
            if !current.is_empty() {
                words.insert(std::mem::take(&mut current));
            }
            words.insert(c.to_string());
        } else if c.is_alphanumeric() {
            current.extend(c.to_lowercase());
        } else if !current.is_empty() {
            words.insert(std::mem::take(&mut current));
        }
    }
    if !current.is_empty() {
        words.insert(current);
    }
    words
}

/// Jaccard similarity of the two texts' word sets.
pub fn jaccard_similarity(a: &str, b: &str) -> f64 {
    let set_a = word_set(a);
    let set_b = word_set(b);
    if set_a.is_empty() || set_b.is_empty() {
        return 0.0;
    }
    let intersection = set_a.intersection(&set_b).count();
    let union = set_a.union(&set_b).count();
    intersection as f64 / union as f64
}

/// Fraction of `a`'s words also present in `b`.
pub fn overlap_ratio(a: &str, b: &str) -> f64 {
    let set_a = word_set(a);
    if set_a.is_empty() {
        return 0.0;
    }
    let set_b = word_set(b);
    set_a.intersection(&set_b).count() as f64 / set_a.len() as f64
}

/// Cosine similarity of two embedding vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let va = Array1::from_vec(a.to_vec());
    let vb = Array1::from_vec(b.to_vec());
    let dot = va.dot(&vb) as f64;
    let norm_a = (va.dot(&va) as f64).sqrt();
    let norm_b = (vb.dot(&vb) as f64).sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}
