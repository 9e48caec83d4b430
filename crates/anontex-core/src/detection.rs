//! PII detection using regex recognizers and term lists
//!
//! The proxy treats detection as a collaborator behind the [`Detector`] trait.
//! [`RuleDetector`] is the bundled implementation: built-in patterns for
//! structured identifiers plus configurable patterns and gazetteers for
//! names, organizations and places.

use crate::config::{DetectionConfig, Span};
use crate::error::{AnontexError, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use tracing::{debug, warn};

/// Locates PII in text. Implementations may be slow and are always called
/// from a blocking worker thread.
pub trait Detector: Send + Sync {
    fn detect(&self, text: &str, language: &str, entities: &[String]) -> Result<Vec<Span>>;
}

const EMAIL_PATTERN: &str = r"\b[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}\b";
const PHONE_PATTERN: &str = r"(?:\+\d{1,3}[-.\s]?)?(?:\(\d{3}\)\s?|\b\d{3}[-.\s])\d{3}[-.\s]\d{4}\b";
const CREDIT_CARD_PATTERN: &str = r"\b(?:\d[ -]?){12,18}\d\b";

/// Contents of the detector configuration file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RecognizerSet {
    /// Languages this detector accepts. Empty means "en" only.
    pub languages: Vec<String>,
    /// Extra entity type -> regex recognizers.
    pub patterns: HashMap<String, String>,
    /// Entity type -> literal terms matched on word boundaries.
    pub terms: HashMap<String, Vec<String>>,
}

impl RecognizerSet {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let display = path.as_ref().display();
        let contents = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            AnontexError::Config(format!("Cannot read recognizers {}: {}", display, e))
        })?;
        toml::from_str(&contents).map_err(|e| {
            AnontexError::Config(format!("Invalid recognizers file {}: {}", display, e))
        })
    }
}

struct Recognizer {
    entity_type: String,
    regex: Regex,
    validator: Option<fn(&str) -> bool>,
}

pub struct RuleDetector {
    languages: Vec<String>,
    recognizers: Vec<Recognizer>,
}

impl RuleDetector {
    pub fn new(config: &DetectionConfig) -> Result<Self> {
        let recognizers = match config.recognizers_path.as_ref() {
            Some(path) => RecognizerSet::from_file(path)?,
            None => RecognizerSet::default(),
        };
        Self::with_recognizers(config, recognizers)
    }

    pub fn with_recognizers(config: &DetectionConfig, set: RecognizerSet) -> Result<Self> {
        let mut recognizers = vec![
            Self::compile("EMAIL_ADDRESS", EMAIL_PATTERN, None)?,
            Self::compile("PHONE_NUMBER", PHONE_PATTERN, None)?,
            Self::compile("CREDIT_CARD", CREDIT_CARD_PATTERN, Some(passes_luhn))?,
        ];

        for (entity_type, pattern) in config.patterns.iter().chain(set.patterns.iter()) {
            recognizers.push(Self::compile(entity_type, pattern, None)?);
            debug!("Loaded regex recognizer for '{}'", entity_type);
        }

        for (entity_type, terms) in &set.terms {
            let mut terms: Vec<&String> = terms.iter().filter(|t| !t.trim().is_empty()).collect();
            if terms.is_empty() {
                continue;
            }
            // Leftmost-first alternation: longer terms must come first.
            terms.sort_by(|a, b| b.len().cmp(&a.len()));
            let alternation = terms
                .iter()
                .map(|t| whole_word_pattern(t))
                .collect::<Vec<_>>()
                .join("|");
            recognizers.push(Self::compile(entity_type, &alternation, None)?);
            debug!("Loaded {} terms for '{}'", terms.len(), entity_type);
        }

        let languages = if set.languages.is_empty() {
            vec![config.language.clone()]
        } else {
            set.languages
        };

        Ok(Self { languages, recognizers })
    }

    fn compile(
        entity_type: &str,
        pattern: &str,
        validator: Option<fn(&str) -> bool>,
    ) -> Result<Recognizer> {
        let regex = Regex::new(pattern).map_err(|e| {
            warn!("Invalid regex pattern for '{}': {}", entity_type, e);
            AnontexError::Config(format!("Invalid regex pattern for '{}': {}", entity_type, e))
        })?;
        Ok(Recognizer {
            entity_type: entity_type.to_string(),
            regex,
            validator,
        })
    }

    pub fn supports_language(&self, language: &str) -> bool {
        self.languages.iter().any(|l| l.eq_ignore_ascii_case(language))
    }
}

impl Detector for RuleDetector {
    fn detect(&self, text: &str, language: &str, entities: &[String]) -> Result<Vec<Span>> {
        if !self.supports_language(language) {
            return Err(AnontexError::Detector(format!(
                "No recognizers configured for language '{}'",
                language
            )));
        }

        let mut spans = Vec::new();
        for recognizer in &self.recognizers {
            if !entities.iter().any(|e| e == &recognizer.entity_type) {
                continue;
            }
            for mat in recognizer.regex.find_iter(text) {
                if let Some(validate) = recognizer.validator {
                    if !validate(mat.as_str()) {
                        continue;
                    }
                }
                spans.push(Span::new(mat.start(), mat.end(), recognizer.entity_type.as_str()));
            }
        }

        debug!("Detected {} spans in {} bytes", spans.len(), text.len());
        Ok(spans)
    }
}

/// Regex source matching `needle` literally, bounded by word boundaries on
/// whichever ends start or finish with a word character.
pub fn whole_word_pattern(needle: &str) -> String {
    let is_word = |c: char| c.is_alphanumeric() || c == '_';
    let mut pattern = String::with_capacity(needle.len() + 8);
    if needle.chars().next().is_some_and(is_word) {
        pattern.push_str(r"\b");
    }
    pattern.push_str(&regex::escape(needle));
    if needle.chars().last().is_some_and(is_word) {
        pattern.push_str(r"\b");
    }
    pattern
}

pub fn whole_word_regex(needle: &str) -> Result<Regex> {
    Regex::new(&whole_word_pattern(needle))
        .map_err(|e| AnontexError::Internal(format!("Cannot build matcher: {}", e)))
}

fn passes_luhn(candidate: &str) -> bool {
    let digits: Vec<u32> = candidate.chars().filter_map(|c| c.to_digit(10)).collect();
    if !(13..=19).contains(&digits.len()) {
        return false;
    }
    let sum: u32 = digits
        .iter()
        .rev()
        .enumerate()
        .map(|(i, &d)| {
            if i % 2 == 1 {
                let doubled = d * 2;
                if doubled > 9 { doubled - 9 } else { doubled }
            } else {
                d
            }
        })
        .sum();
    sum % 10 == 0
}
