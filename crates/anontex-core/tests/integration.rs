use anontex_core::{
    AnonymizationEngine, AnontexError, Config, DeanonymizationEngine, Detector, FakeMapping,
    FakerEngine, MappingStore, RuleDetector,
};
use std::sync::Arc;

fn write_recognizers(dir: &tempfile::TempDir) -> std::path::PathBuf {
    let path = dir.path().join("recognizers.toml");
    std::fs::write(
        &path,
        r#"
languages = ["en"]

[terms]
PERSON = ["Jane", "Jane Doe"]
ORGANIZATION = ["Acme Corp"]
LOCATION = ["Springfield"]
"#,
    )
    .unwrap();
    path
}

fn test_config(dir: &tempfile::TempDir) -> Config {
    let mut config = Config::default();
    config.detection.recognizers_path = Some(write_recognizers(dir));
    config.mapping.database_path = dir.path().join("mappings.db");
    config.faker.seed = Some(2024);
    config
}

fn create_engines(
    config: &Config,
    store: &MappingStore,
) -> (AnonymizationEngine, DeanonymizationEngine) {
    let detector: Arc<dyn Detector> = Arc::new(RuleDetector::new(&config.detection).unwrap());
    let faker = Arc::new(FakerEngine::new(&config.faker));
    (
        AnonymizationEngine::new(detector, faker, store.clone(), 60, 8),
        DeanonymizationEngine::new(store.clone()),
    )
}

fn fake_for(mapping: &FakeMapping, original: &str) -> String {
    mapping
        .iter()
        .find(|(_, o)| *o == original)
        .map(|(fake, _)| fake.to_string())
        .unwrap_or_else(|| panic!("no synthetic value for {}", original))
}

#[test]
fn test_module_exports() {
    let dir = tempfile::TempDir::new().unwrap();
    let config = test_config(&dir);

    assert!(config.validate().is_ok());
    assert!(RuleDetector::new(&config.detection).is_ok());
    assert!(MappingStore::new(config.mapping.clone()).is_ok());

    let faker = FakerEngine::new(&config.faker);
    assert!(faker.is_known_type("PERSON"));
}

#[test]
fn test_recognizers_file_drives_detection() {
    let dir = tempfile::TempDir::new().unwrap();
    let config = test_config(&dir);
    let detector = RuleDetector::new(&config.detection).unwrap();

    let text = "Jane Doe joined Acme Corp; Jane's email is jane@example.com";
    let spans = detector.detect(text, "en", &config.detection.entities).unwrap();

    let found: Vec<(&str, &str)> = spans
        .iter()
        .map(|s| (&text[s.start..s.end], s.entity_type.as_str()))
        .collect();
    assert!(found.contains(&("Jane Doe", "PERSON")));
    assert!(found.contains(&("Acme Corp", "ORGANIZATION")));
    assert!(found.contains(&("Jane", "PERSON")));
    assert!(found.contains(&("jane@example.com", "EMAIL_ADDRESS")));

    assert!(matches!(
        detector.detect(text, "de", &config.detection.entities),
        Err(AnontexError::Detector(_))
    ));
}

#[tokio::test]
async fn test_round_trip_with_partial_echo() {
    let dir = tempfile::TempDir::new().unwrap();
    let config = test_config(&dir);

    let store = MappingStore::new(config.mapping.clone()).unwrap();
    let (anonymizer, deanonymizer) = create_engines(&config, &store);

    let prompt = "Jane Doe from Acme Corp asked for a reply at jane@example.com";
    let anonymized = anonymizer
        .anonymize(prompt, "en", &config.detection.entities)
        .await
        .unwrap();

    assert_eq!(anonymized.replaced, 3);
    assert!(!anonymized.text.contains("Jane Doe"));
    assert!(!anonymized.text.contains("Acme Corp"));
    assert!(!anonymized.text.contains("jane@example.com"));

    let mapping = store.get(&anonymized.request_id).await.unwrap();
    let fake_person = fake_for(&mapping, "Jane Doe");
    let fake_org = fake_for(&mapping, "Acme Corp");
    let fake_email = fake_for(&mapping, "jane@example.com");
    let first_name = fake_person.split_whitespace().next().unwrap().to_string();

    // A reply that only uses the synthetic first name.
    let reply = format!(
        "Thanks {}! I will write to {} about {}.",
        first_name, fake_email, fake_org
    );
    let restored = deanonymizer
        .deanonymize(&reply, &anonymized.request_id)
        .await
        .unwrap();

    assert_eq!(
        restored,
        "Thanks Jane Doe! I will write to jane@example.com about Acme Corp."
    );

    // The mapping was spent by the first restore.
    let again = deanonymizer.deanonymize(&reply, &anonymized.request_id).await;
    assert!(matches!(again, Err(AnontexError::NotFound(_))));
}

#[tokio::test]
async fn test_round_trip_every_entity_type() {
    let prompt = "Jane Doe of Acme Corp in Springfield: call 212-555-0100, \
                  mail jane@example.com, card 4111 1111 1111 1111.";
    let originals = [
        "Jane Doe",
        "Acme Corp",
        "Springfield",
        "212-555-0100",
        "jane@example.com",
        "4111 1111 1111 1111",
    ];

    for seed in 0..25 {
        let dir = tempfile::TempDir::new().unwrap();
        let mut config = test_config(&dir);
        config.faker.seed = Some(seed);
        let store = MappingStore::new(config.mapping.clone()).unwrap();
        let (anonymizer, deanonymizer) = create_engines(&config, &store);

        let anonymized = anonymizer
            .anonymize(prompt, "en", &config.detection.entities)
            .await
            .unwrap();

        assert_eq!(anonymized.replaced, originals.len(), "seed {}", seed);
        for original in originals {
            assert!(
                !anonymized.text.contains(original),
                "seed {}: {} leaked",
                seed,
                original
            );
        }

        // The reply echoes the rewritten prompt unchanged.
        let restored = deanonymizer
            .deanonymize(&anonymized.text, &anonymized.request_id)
            .await
            .unwrap();
        assert_eq!(restored, prompt, "seed {}", seed);
    }
}

#[tokio::test]
async fn test_mapping_survives_store_reopen() {
    let dir = tempfile::TempDir::new().unwrap();
    let config = test_config(&dir);

    let mut mapping = FakeMapping::new();
    mapping.insert("Ivy Park", "Jane Doe");
    {
        let store = MappingStore::new(config.mapping.clone()).unwrap();
        store.put("req-1", &mapping, 60).await.unwrap();
    }

    let reopened = MappingStore::new(config.mapping.clone()).unwrap();
    let restored = reopened.consume("req-1").await.unwrap();
    assert_eq!(restored.original_for("Ivy Park"), Some("Jane Doe"));
}
