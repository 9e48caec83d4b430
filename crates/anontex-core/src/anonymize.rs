//! Detection, substitution and mapping persistence for outbound text

use crate::config::Span;
use crate::detection::Detector;
use crate::error::Result;
use crate::faker::FakerEngine;
use crate::mapping::{FakeMapping, MappingStore};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct Anonymized {
    pub text: String,
    pub request_id: String,
    pub replaced: usize,
}

pub struct AnonymizationEngine {
    detector: Arc<dyn Detector>,
    faker: Arc<FakerEngine>,
    store: MappingStore,
    ttl_seconds: u64,
    max_collision_retries: u32,
}

impl AnonymizationEngine {
    pub fn new(
        detector: Arc<dyn Detector>,
        faker: Arc<FakerEngine>,
        store: MappingStore,
        ttl_seconds: u64,
        max_collision_retries: u32,
    ) -> Self {
        Self {
            detector,
            faker,
            store,
            ttl_seconds,
            max_collision_retries,
        }
    }

    /// Replaces detected PII with synthetic values and stores the reverse
    /// mapping under a fresh request id. Nothing is returned unless the
    /// mapping write succeeded.
    pub async fn anonymize(
        &self,
        text: &str,
        language: &str,
        entities: &[String],
    ) -> Result<Anonymized> {
        let detector = Arc::clone(&self.detector);
        let (owned_text, owned_language, owned_entities) =
            (text.to_string(), language.to_string(), entities.to_vec());
        let spans = tokio::task::spawn_blocking(move || {
            detector.detect(&owned_text, &owned_language, &owned_entities)
        })
        .await??;

        let (rewritten, mapping) = self.rewrite(text, spans);
        let request_id = Uuid::new_v4().to_string();

        self.store.put(&request_id, &mapping, self.ttl_seconds).await?;

        info!("Anonymized request '{}': {} synthetic values", request_id, mapping.len());
        Ok(Anonymized {
            text: rewritten,
            request_id,
            replaced: mapping.len(),
        })
    }

    /// Splices synthetic values into `text`, right to left so the offsets of
    /// spans still waiting to be processed stay valid.
    pub fn rewrite(&self, text: &str, mut spans: Vec<Span>) -> (String, FakeMapping) {
        spans.sort_by(|a, b| b.start.cmp(&a.start).then_with(|| b.end.cmp(&a.end)));

        let mut result = text.to_string();
        let mut mapping = FakeMapping::new();
        let mut fakes_by_original: HashMap<String, String> = HashMap::new();
        // Everything at or right of this offset has already been rewritten.
        let mut frontier = text.len();

        for span in spans {
            let end = span.end.min(frontier);
            if span.end > text.len()
                || span.start >= end
                || !text.is_char_boundary(span.start)
                || !text.is_char_boundary(end)
            {
                debug!("Skipping span {}..{} ({})", span.start, span.end, span.entity_type);
                continue;
            }
            if end < span.end {
                debug!(
                    "Span {}..{} overlaps a replaced span, clipped to {}",
                    span.start, span.end, end
                );
            }

            let original = result[span.start..end].to_string();
            let fake = match fakes_by_original.get(&original) {
                Some(existing) => existing.clone(),
                None => {
                    let fake = self.pick_fake(&span.entity_type, &original, text, &mapping);
                    fakes_by_original.insert(original.clone(), fake.clone());
                    fake
                }
            };

            result.replace_range(span.start..end, &fake);
            mapping.insert(fake, original);
            frontier = span.start;
        }

        (result, mapping)
    }

    fn pick_fake(
        &self,
        entity_type: &str,
        original: &str,
        text: &str,
        mapping: &FakeMapping,
    ) -> String {
        let mut candidate = self.faker.generate(entity_type);
        for _ in 0..self.max_collision_retries {
            let collides = candidate == original
                || mapping.contains_fake(&candidate)
                || text.contains(&candidate);
            if !collides {
                return candidate;
            }
            candidate = self.faker.generate(entity_type);
        }

        if mapping.contains_fake(&candidate) {
            warn!(
                "Synthetic value collision for entity type '{}' after {} retries, last write wins",
                entity_type, self.max_collision_retries
            );
        }
        candidate
    }
}
