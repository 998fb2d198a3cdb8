use std::path::Path;

use mqlab_config::{load_infra, load_test_plan};
use mqlab_domain::{MessageSize, VariantKind};

fn fixture(name: &str) -> std::path::PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures").join(name)
}

#[test]
fn load_valid_infra_fixture() {
    let infra = load_infra(&fixture("infra.yml")).expect("should load without error");
    assert_eq!(infra.cluster_name, "perf-lab");
    assert_eq!(infra.roles.storage.count, 3);
    assert_eq!(infra.roles.worker.instance_type, "c5.2xlarge");
    assert_eq!(infra.storage.volume_type, "gp3", "volume_type should default");
    assert!(infra.module_dir.ends_with("infra/pulsar"));
    assert_eq!(infra.tags.get("Team").map(String::as_str), Some("messaging-perf"));
}

#[test]
fn load_valid_plan_fixture() {
    let matrix = load_test_plan(&fixture("plan.yml")).expect("should load without error");
    assert_eq!(matrix.name, "throughput-sweep");
    assert_eq!(matrix.variants.len(), 3);
    assert_eq!(matrix.variants[0].kind, VariantKind::FixedRate);
    assert_eq!(matrix.variants[2].kind, VariantKind::MaxRate);
    assert_eq!(matrix.base.topics, 4);

    // The base distribution is normalised at load time.
    let MessageSize::Distribution(buckets) = &matrix.base.message_size else {
        panic!("expected a distribution")
    };
    assert!((buckets.values().sum::<f64>() - 1.0).abs() < 1e-9);

    let plateau = matrix.plateau.expect("plateau policy present");
    assert_eq!(plateau.consecutive_fails_allowed, 2);
}

#[test]
fn missing_file_returns_error() {
    assert!(load_infra(Path::new("/nonexistent/infra.yml")).is_err());
    assert!(load_test_plan(Path::new("/nonexistent/plan.yml")).is_err());
}
