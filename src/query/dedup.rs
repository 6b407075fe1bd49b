//! Hit deduplication and ranking.
//!
//! Two hits describe the same document when they share `source + doc_id`,
//! when their URLs are equal after normalization, or when their snippet
//! embeddings are nearly parallel. Within a duplicate group only the hit
//! with the highest weighted score survives.

use url::Url;

use crate::{
    embedding::cosine,
    sources::{Hit, RankedHit, SourceId},
};

/// Snippet-embedding cosine at or above which two hits are duplicates.
const SNIPPET_DUP_COSINE: f64 = 0.97;

/// Canonical URL form: lowercased scheme and host, default port dropped,
/// fragment dropped, trailing slash trimmed. Unparseable URLs fall back to
/// their trimmed raw text.
pub fn normalize_url(raw: &str) -> String {
    match Url::parse(raw.trim()) {
        Ok(mut url) => {
            url.set_fragment(None);
            let mut normalized = url.to_string();
            while normalized.ends_with('/') {
                normalized.pop();
            }
            normalized
        }
        Err(_) => raw.trim().to_string(),
    }
}

fn same_document(a: &Hit, b: &Hit) -> bool {
    if a.source == b.source && a.doc_id == b.doc_id {
        return true;
    }
    if normalize_url(&a.payload.url) == normalize_url(&b.payload.url) {
        return true;
    }
    if let (Some(va), Some(vb)) = (&a.vector, &b.vector)
        && cosine(va, vb) >= SNIPPET_DUP_COSINE
    {
        return true;
    }
    false
}

/// Deduplicate, weight, rank, and truncate.
///
/// `weight_of` supplies the per-source ranking weight. The sort is stable,
/// so equal-scoring hits keep their arrival order.
pub fn dedup_and_rank(
    hits: Vec<Hit>,
    weight_of: impl Fn(&SourceId) -> f64,
    top_k: usize,
) -> Vec<RankedHit> {
    // Group representatives, one slot per distinct document.
    let mut groups: Vec<RankedHit> = Vec::new();

    for hit in hits {
        if !hit.payload.is_valid() {
            continue;
        }
        let final_score = hit.score * weight_of(&hit.source);

        match groups
            .iter_mut()
            .find(|ranked| same_document(&ranked.hit, &hit))
        {
            Some(ranked) => {
                if final_score > ranked.final_score {
                    ranked.hit = hit;
                    ranked.final_score = final_score;
                }
            }
            None => {
                let dedup_group = groups.len();
                groups.push(RankedHit {
                    hit,
                    final_score,
                    dedup_group,
                });
            }
        }
    }

    groups.sort_by(|a, b| b.final_score.total_cmp(&a.final_score));
    groups.truncate(top_k);
    groups
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sources::HitPayload;

    fn hit(source: &str, doc_id: &str, score: f64, url: &str) -> Hit {
        Hit {
            source: SourceId::from(source),
            doc_id: doc_id.to_string(),
            score,
            payload: HitPayload {
                title: format!("doc {doc_id}"),
                url: url.to_string(),
                snippet: "relevant text".to_string(),
                updated_at: None,
            },
            vector: None,
        }
    }

    #[test]
    fn url_normalization_folds_equivalent_forms() {
        assert_eq!(
            normalize_url("HTTPS://Wiki.Example.com:443/page/"),
            normalize_url("https://wiki.example.com/page")
        );
        assert_eq!(
            normalize_url("https://wiki.example.com/page#section"),
            normalize_url("https://wiki.example.com/page")
        );
        assert_ne!(
            normalize_url("https://wiki.example.com/page?v=2"),
            normalize_url("https://wiki.example.com/page")
        );
    }

    #[test]
    fn same_doc_id_collapses_to_best_score() {
        let hits = vec![
            hit("JIRA", "T-1", 0.80, "https://jira/t-1"),
            hit("JIRA", "T-1", 0.90, "https://jira/t-1"),
        ];
        let ranked = dedup_and_rank(hits, |_| 1.0, 8);
        assert_eq!(ranked.len(), 1);
        assert!((ranked[0].final_score - 0.90).abs() < 1e-12);
    }

    #[test]
    fn equal_urls_across_sources_collapse() {
        let hits = vec![
            hit("JIRA", "T-1", 0.85, "https://kb.example.com/reset/"),
            hit("CONFLUENCE", "C-9", 0.70, "HTTPS://kb.example.com/reset"),
        ];
        let ranked = dedup_and_rank(hits, |_| 1.0, 8);
        assert_eq!(ranked.len(), 1);
        assert_eq!(ranked[0].hit.doc_id, "T-1");
    }

    #[test]
    fn near_parallel_snippet_vectors_collapse() {
        let mut a = hit("JIRA", "T-1", 0.80, "https://jira/t-1");
        a.vector = Some(vec![1.0, 0.0]);
        let mut b = hit("ZENDESK", "Z-2", 0.90, "https://zendesk/z-2");
        // cos = 0.995.
        b.vector = Some(vec![0.995, 0.0998749]);

        let ranked = dedup_and_rank(vec![a, b], |_| 1.0, 8);
        assert_eq!(ranked.len(), 1);
        assert_eq!(ranked[0].hit.doc_id, "Z-2");
    }

    #[test]
    fn distinct_documents_survive() {
        let hits = vec![
            hit("JIRA", "T-1", 0.80, "https://jira/t-1"),
            hit("JIRA", "T-2", 0.70, "https://jira/t-2"),
        ];
        let ranked = dedup_and_rank(hits, |_| 1.0, 8);
        assert_eq!(ranked.len(), 2);
        assert_eq!(ranked[0].dedup_group, 0);
        assert_eq!(ranked[1].dedup_group, 1);
    }

    #[test]
    fn source_weights_reorder_results() {
        let hits = vec![
            hit("JIRA", "T-1", 0.80, "https://jira/t-1"),
            hit("SAP", "S-1", 0.75, "https://sap/s-1"),
        ];
        let ranked = dedup_and_rank(
            hits,
            |source| if source.as_str() == "SAP" { 1.5 } else { 1.0 },
            8,
        );
        assert_eq!(ranked[0].hit.doc_id, "S-1");
        assert!((ranked[0].final_score - 1.125).abs() < 1e-12);
    }

    #[test]
    fn invalid_payloads_are_dropped() {
        let mut bad = hit("JIRA", "T-1", 0.99, "https://jira/t-1");
        bad.payload.snippet = String::new();
        let ranked = dedup_and_rank(
            vec![bad, hit("JIRA", "T-2", 0.5, "https://jira/t-2")],
            |_| 1.0,
            8,
        );
        assert_eq!(ranked.len(), 1);
        assert_eq!(ranked[0].hit.doc_id, "T-2");
    }

    #[test]
    fn results_truncate_to_top_k() {
        let hits = (0..20)
            .map(|i| {
                hit(
                    "JIRA",
                    &format!("T-{i}"),
                    0.5 + i as f64 * 0.01,
                    &format!("https://jira/t-{i}"),
                )
            })
            .collect();
        let ranked = dedup_and_rank(hits, |_| 1.0, 8);
        assert_eq!(ranked.len(), 8);
        assert_eq!(ranked[0].hit.doc_id, "T-19");
    }
}
