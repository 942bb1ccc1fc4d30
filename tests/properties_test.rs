//! Property-based invariants for fusion, retry, the tokenizer, and the
//! persisted index format.

use kb_core::bm25::{store, tokenizer, Bm25Doc, Bm25Index, Bm25Params};
use kb_core::config::ResilienceConfig;
use kb_core::resilience::RetryPolicy;
use kb_core::retrieval::fusion::{fuse, Candidate};
use kb_core::models::FusionStrategy;
use proptest::prelude::*;

fn candidate(i: usize, dense: Option<f64>, sparse: Option<f64>) -> Candidate {
    Candidate {
        chunk_id: format!("c{i}"),
        doc_id: format!("d{i}"),
        kb_id: "kb".to_string(),
        chunk_index: i as i32,
        content: String::new(),
        page: None,
        section_title: None,
        dense,
        sparse,
    }
}

fn score_pairs() -> impl Strategy<Value = Vec<(Option<f64>, Option<f64>)>> {
    prop::collection::vec(
        (
            prop::option::of(0.0f64..1.0),
            prop::option::of(0.0f64..20.0),
        ),
        1..12,
    )
}

proptest! {
    /// Fused scores stay in [0, 1] for any inputs and any alpha.
    #[test]
    fn fused_scores_bounded(pairs in score_pairs(), alpha in 0.0f64..=1.0) {
        let candidates: Vec<Candidate> = pairs
            .iter()
            .enumerate()
            .map(|(i, (d, s))| candidate(i, *d, *s))
            .collect();
        for hit in fuse(candidates, alpha, FusionStrategy::Weighted) {
            prop_assert!((0.0..=1.0).contains(&hit.fused_score));
            prop_assert!(hit.raw_score >= 0.0);
        }
    }

    /// alpha = 1 ranks identically to dense-only scoring; alpha = 0 to
    /// sparse-only, up to tie-breaking.
    #[test]
    fn fusion_endpoints_match_single_modality(pairs in score_pairs()) {
        let both: Vec<Candidate> = pairs
            .iter()
            .enumerate()
            .map(|(i, (d, s))| candidate(i, *d, *s))
            .collect();
        let dense_only: Vec<Candidate> = pairs
            .iter()
            .enumerate()
            .map(|(i, (d, _))| candidate(i, *d, None))
            .collect();
        let sparse_only: Vec<Candidate> = pairs
            .iter()
            .enumerate()
            .map(|(i, (_, s))| candidate(i, None, *s))
            .collect();

        let ids = |hits: Vec<kb_core::SearchHit>| {
            hits.into_iter().map(|h| h.chunk_id).collect::<Vec<_>>()
        };
        prop_assert_eq!(
            ids(fuse(both.clone(), 1.0, FusionStrategy::Weighted)),
            ids(fuse(dense_only, 1.0, FusionStrategy::Weighted))
        );
        prop_assert_eq!(
            ids(fuse(both, 0.0, FusionStrategy::Weighted)),
            ids(fuse(sparse_only, 0.0, FusionStrategy::Weighted))
        );
    }

    /// Jittered retry delays always land in the configured band and never
    /// exceed the cap.
    #[test]
    fn retry_delay_band(retry_index in 0u32..6, jitter in 0.0f64..=1.0) {
        let policy = RetryPolicy::new(&ResilienceConfig {
            max_retries: Some(6),
            base_delay_s: Some(1.0),
            max_delay_s: Some(30.0),
            backoff_base: Some(2.0),
            jitter: Some(jitter),
            ..Default::default()
        });
        let nominal = policy.backoff_delay(retry_index).as_secs_f64();
        prop_assert!(nominal <= 30.0 + 1e-9);
        let jittered = policy.jittered_delay(retry_index).as_secs_f64();
        prop_assert!(jittered >= nominal * (1.0 - jitter) - 1e-9);
        prop_assert!(jittered <= nominal * (1.0 + jitter) + 1e-9);
    }

    /// Tokenization is deterministic and never yields empty tokens.
    #[test]
    fn tokenizer_tokens_nonempty(text in ".{0,200}") {
        let first = tokenizer::tokenize(&text);
        let second = tokenizer::tokenize(&text);
        prop_assert_eq!(&first, &second);
        prop_assert!(first.iter().all(|t| !t.is_empty()));
    }

    /// Any index survives an encode/decode round trip with identical
    /// search behavior.
    #[test]
    fn index_round_trip(contents in prop::collection::vec("[a-z]{2,8}( [a-z]{2,8}){0,6}", 1..10)) {
        let mut index = Bm25Index::new(Bm25Params::default());
        let docs: Vec<Bm25Doc> = contents
            .iter()
            .enumerate()
            .map(|(i, content)| Bm25Doc {
                chunk_id: format!("c{i}"),
                doc_id: format!("d{}", i / 2),
                chunk_index: i as i32,
                content: content.clone(),
                page: None,
                section_title: None,
            })
            .collect();
        index.upsert(&docs);

        let decoded = store::decode(&store::encode(&index)).unwrap();
        prop_assert_eq!(decoded.len(), index.len());
        for content in &contents {
            if let Some(word) = content.split(' ').next() {
                prop_assert_eq!(index.search(word, 5), decoded.search(word, 5));
            }
        }
    }
}
