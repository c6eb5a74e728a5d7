//! Property-based tests for dense key allocation
//!
//! Random interleavings of creations must always leave every collection
//! numbered `1..=n` in creation order.

use machine_vault::core::validation::{MachineName, SequenceName};
use machine_vault::Repository;
use proptest::prelude::*;

#[derive(Debug, Clone)]
enum Step {
    Instance,
    Snapshot(usize),
    Version,
}

fn step() -> impl Strategy<Value = Step> {
    prop_oneof![
        3 => Just(Step::Instance),
        5 => (0usize..16).prop_map(Step::Snapshot),
        1 => Just(Step::Version),
    ]
}

fn numbered(prefix: &str, n: usize) -> Vec<String> {
    (1..=n).map(|i| format!("{}{}", prefix, i)).collect()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn prop_keys_stay_dense(steps in prop::collection::vec(step(), 1..60)) {
        let repo = Repository::in_memory().unwrap();
        repo.create_machine("m").unwrap();
        repo.seal_version("m", "version1").unwrap();

        let mut versions = 1usize;
        let mut instances: Vec<usize> = Vec::new();

        for step in steps {
            match step {
                Step::Instance => {
                    let key = repo.create_instance("m", "version1").unwrap();
                    prop_assert_eq!(key, format!("instance{}", instances.len() + 1));
                    instances.push(0);
                }
                Step::Snapshot(pick) if !instances.is_empty() => {
                    let idx = pick % instances.len();
                    let instance = format!("instance{}", idx + 1);
                    let key = repo.create_snapshot("m", "version1", &instance, b"{}").unwrap();
                    instances[idx] += 1;
                    prop_assert_eq!(key, format!("snapshot{}", instances[idx]));
                }
                Step::Snapshot(_) => {}
                Step::Version => {
                    let key = repo.create_version("m").unwrap();
                    repo.seal_version("m", &key).unwrap();
                    versions += 1;
                    prop_assert_eq!(key, format!("version{}", versions));
                }
            }
        }

        prop_assert_eq!(repo.version_keys("m").unwrap(), numbered("version", versions));
        prop_assert_eq!(
            repo.instance_keys("m", "version1").unwrap(),
            numbered("instance", instances.len())
        );
        for (idx, count) in instances.iter().enumerate() {
            let instance = format!("instance{}", idx + 1);
            prop_assert_eq!(
                repo.snapshot_keys("m", "version1", &instance).unwrap(),
                numbered("snapshot", *count)
            );
        }

        let counters = repo.manifest().unwrap().counters;
        prop_assert_eq!(counters.version_count, versions as u64);
        prop_assert_eq!(counters.instance_count, instances.len() as u64);
        prop_assert_eq!(counters.snapshot_count, instances.iter().sum::<usize>() as u64);
    }

    #[test]
    fn prop_sequence_names_parse_back(n in 1u64..u64::MAX) {
        let name = SequenceName::new("snapshot", n);
        let parsed = SequenceName::parse("snapshot", &name.to_string());
        prop_assert_eq!(parsed.map(|p| p.number()), Some(n));
        prop_assert!(SequenceName::parse("version", &name.to_string()).is_none());
    }

    #[test]
    fn prop_machine_names_without_separators(name in "[A-Za-z0-9_][A-Za-z0-9_.-]{0,40}") {
        prop_assert!(MachineName::new(name.as_str()).is_ok());

        let nested = format!("{}/{}", name, name);
        prop_assert!(MachineName::new(nested).is_err());
    }
}
