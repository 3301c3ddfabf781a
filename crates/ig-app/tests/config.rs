use std::path::PathBuf;
use std::sync::Arc;

use ig_app::Generator;
use ig_app::generator::backend::MockBackend;
use ig_core::config::GeneratorConfig;
use ig_core::element::ElementCategory;
use ig_core::random::SecureRandom;

fn shipped_config() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../../config/generator.yaml")
}

#[test]
fn test_shipped_config_loads() {
    let config = GeneratorConfig::load(shipped_config()).unwrap();
    assert_eq!(config.prompts.genres.len(), 3);
    assert_eq!(config.daily.genres, vec!["normal", "gyal", "seiso"]);
    assert_eq!(
        config.history_file.as_deref(),
        Some(std::path::Path::new("state/element_history.json"))
    );

    let generator = Generator::new(config, Arc::new(MockBackend::new()), Arc::new(SecureRandom::new())).unwrap();
    assert_eq!(generator.pools().remaining(ElementCategory::Outfit), Some(5));
    assert!(!generator.pools().has_pool(ElementCategory::Reference));
}
