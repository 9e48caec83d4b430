//! Synthetic value generation for PII anonymization

use crate::config::FakerConfig;
use fake::faker::address::en::CityName;
use fake::faker::company::en::CompanyName;
use fake::faker::internet::en::SafeEmail;
use fake::faker::name::en::{FirstName, LastName};
use fake::Fake;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::{debug, warn};

type Generator = fn(&mut StdRng) -> String;

struct FakerState {
    rng: StdRng,
    fallback_counter: u64,
}

/// Produces synthetic replacements keyed by entity type. Shared by every
/// in-flight request, so the RNG lives behind a mutex.
pub struct FakerEngine {
    state: Mutex<FakerState>,
    generators: HashMap<String, Generator>,
    locale: String,
}

impl FakerEngine {
    pub fn new(config: &FakerConfig) -> Self {
        let rng = if let Some(seed) = config.seed {
            StdRng::seed_from_u64(seed)
        } else {
            StdRng::from_entropy()
        };

        let mut generators: HashMap<String, Generator> = HashMap::new();
        generators.insert("PERSON".to_string(), generate_fake_name);
        generators.insert("ORGANIZATION".to_string(), generate_fake_organization);
        generators.insert("EMAIL_ADDRESS".to_string(), generate_fake_email);
        generators.insert("PHONE_NUMBER".to_string(), generate_fake_phone);
        generators.insert("LOCATION".to_string(), generate_fake_location);
        generators.insert("CREDIT_CARD".to_string(), generate_fake_credit_card);

        Self {
            state: Mutex::new(FakerState {
                rng,
                fallback_counter: 0,
            }),
            generators,
            locale: config.locale.clone(),
        }
    }

    pub fn is_known_type(&self, entity_type: &str) -> bool {
        self.generators.contains_key(entity_type)
    }

    pub fn locale(&self) -> &str {
        &self.locale
    }

    pub fn generate(&self, entity_type: &str) -> String {
        let mut state = match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        match self.generators.get(entity_type) {
            Some(generator) => {
                let value = generator(&mut state.rng);
                debug!("Generated synthetic value for entity type '{}'", entity_type);
                value
            }
            None => {
                warn!("Unknown entity type '{}', using generic replacement", entity_type);
                state.fallback_counter += 1;
                format!("REDACTED_{}_{}", entity_type.to_uppercase(), state.fallback_counter)
            }
        }
    }
}

fn generate_fake_name(rng: &mut StdRng) -> String {
    let first: String = FirstName().fake_with_rng(rng);
    let last: String = LastName().fake_with_rng(rng);
    format!("{} {}", first, last)
}

fn generate_fake_organization(rng: &mut StdRng) -> String {
    CompanyName().fake_with_rng(rng)
}

fn generate_fake_email(rng: &mut StdRng) -> String {
    SafeEmail().fake_with_rng(rng)
}

fn generate_fake_location(rng: &mut StdRng) -> String {
    CityName().fake_with_rng(rng)
}

fn generate_fake_phone(rng: &mut StdRng) -> String {
    format!(
        "555-{:03}-{:04}",
        rng.gen_range(100..999),
        rng.gen_range(1000..9999)
    )
}

// Visa test range with a valid check digit, dash-separated so it stays a
// single word.
fn generate_fake_credit_card(rng: &mut StdRng) -> String {
    let mut digits: Vec<u32> = vec![4];
    digits.extend((0..14).map(|_| rng.gen_range(0..10)));

    let sum: u32 = digits
        .iter()
        .rev()
        .enumerate()
        .map(|(i, &d)| {
            if i % 2 == 0 {
                let doubled = d * 2;
                if doubled > 9 { doubled - 9 } else { doubled }
            } else {
                d
            }
        })
        .sum();
    digits.push((10 - sum % 10) % 10);

    digits
        .chunks(4)
        .map(|chunk| chunk.iter().map(|d| d.to_string()).collect::<String>())
        .collect::<Vec<_>>()
        .join("-")
}
