use crate::models::{Chunk, ScoredChunk};

/// Cosine similarity in `[-1, 1]`.
///
/// Vectors of different length, empty vectors and zero vectors score `0.0`,
/// so malformed rows rank last instead of failing the search.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0f64;
    let mut norm_a = 0f64;
    let mut norm_b = 0f64;
    for (x, y) in a.iter().zip(b) {
        let (x, y) = (f64::from(*x), f64::from(*y));
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    let similarity = dot / (norm_a.sqrt() * norm_b.sqrt());
    if similarity.is_finite() {
        similarity as f32
    } else {
        0.0
    }
}

/// Scores every chunk against `query` and keeps the best `limit`, highest first.
pub fn rank_chunks<I>(chunks: I, query: &[f32], limit: usize) -> Vec<ScoredChunk>
where
    I: IntoIterator<Item = Chunk>,
{
    let mut scored = chunks
        .into_iter()
        .map(|chunk| ScoredChunk {
            similarity: cosine_similarity(query, &chunk.embedding),
            chunk,
        })
        .collect::<Vec<_>>();

    scored.sort_by(|left, right| right.similarity.total_cmp(&left.similarity));
    scored.truncate(limit);
    scored
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ChunkMetadata;

    fn chunk(id: &str, embedding: Vec<f32>) -> Chunk {
        Chunk {
            id: id.to_string(),
            document_id: "doc".to_string(),
            content: format!("content of {id}"),
            embedding,
            metadata: ChunkMetadata::default(),
        }
    }

    #[test]
    fn similarity_is_symmetric() {
        let a = [0.3, -1.2, 4.0, 0.01];
        let b = [1.5, 0.2, -0.7, 2.0];
        assert_eq!(cosine_similarity(&a, &b), cosine_similarity(&b, &a));
    }

    #[test]
    fn self_similarity_is_one() {
        let a = [0.3, -1.2, 4.0, 0.01];
        assert!((cosine_similarity(&a, &a) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn mismatched_or_zero_vectors_score_zero() {
        assert_eq!(cosine_similarity(&[1.0, 2.0], &[1.0, 2.0, 3.0]), 0.0);
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 2.0]), 0.0);
    }

    #[test]
    fn ranking_sorts_descending_and_truncates() {
        let query = [1.0, 0.0];
        let chunks = vec![
            chunk("orthogonal", vec![0.0, 1.0]),
            chunk("exact", vec![2.0, 0.0]),
            chunk("legacy", vec![1.0, 0.0, 0.0]),
            chunk("close", vec![1.0, 0.2]),
        ];

        let ranked = rank_chunks(chunks, &query, 3);

        let ids = ranked.iter().map(|hit| hit.chunk.id.as_str()).collect::<Vec<_>>();
        assert_eq!(ids[0], "exact");
        assert_eq!(ids[1], "close");
        assert_eq!(ranked.len(), 3);
        assert!(ranked[2].similarity <= ranked[1].similarity);
    }
}
