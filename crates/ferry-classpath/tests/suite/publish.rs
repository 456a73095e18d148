use std::sync::Arc;
use std::thread;
use std::time::Duration;

use ferry_classpath::{
    discover_factories, discover_factories_with_config, discover_factory,
    discover_factory_with_config, publish_factory, ClasspathError, ResourceLoader,
};
use ferry_config::RegistryConfig;
use ferry_registry::{MemoryRegistry, Registry};

use super::support::{write_tree, Harness};

const DIR: &str = "/ferry/classpaths";

#[test]
fn published_factories_can_be_discovered_and_imported() {
    let harness = Harness::new();
    let classes = harness.path("classes");
    write_tree(&classes, &[("com/acme/Foo.class", b"foo")]);
    let factory = harness.exporter.export(&[classes.into()]).unwrap();

    let registry = Arc::new(MemoryRegistry::default());
    let publisher = registry.clone();
    let published = factory.clone();
    let handle = thread::spawn(move || {
        thread::sleep(Duration::from_millis(20));
        publish_factory(&*publisher, DIR, "worker-1", &published).unwrap()
    });

    let found = discover_factory(registry.clone(), DIR, "worker-1", Duration::from_secs(5)).unwrap();
    assert_eq!(handle.join().unwrap(), format!("{DIR}/worker-1"));
    assert_eq!(found, factory);

    let loader = harness
        .importer
        .create_class_loader(&found, &harness.cache_dir(), None)
        .unwrap();
    assert_eq!(loader.load_class("com.acme.Foo").unwrap().bytes, b"foo".to_vec());
}

#[test]
fn discovering_several_factories_waits_for_all_of_them() {
    let harness = Harness::new();
    let registry = Arc::new(MemoryRegistry::default());
    let factory = harness.exporter.export(&[]).unwrap();
    for name in ["a", "b", "c"] {
        publish_factory(&*registry, DIR, name, &factory).unwrap();
    }

    let found = discover_factories(registry.clone(), DIR, 3, Duration::from_secs(5)).unwrap();
    assert_eq!(
        found.keys().cloned().collect::<Vec<_>>(),
        vec!["a".to_string(), "b".to_string(), "c".to_string()]
    );
    assert!(found.values().all(|found| *found == factory));
}

#[test]
fn garbage_under_the_directory_is_a_registry_error() {
    let registry = Arc::new(MemoryRegistry::default());
    registry
        .add_data(&format!("{DIR}/broken"), false, b"not json")
        .unwrap();

    let err = discover_factory(registry, DIR, "broken", Duration::from_secs(1)).unwrap_err();
    assert!(matches!(err, ClasspathError::Registry(_)));
}

#[test]
fn discovery_times_out() {
    let registry = Arc::new(MemoryRegistry::default());
    let err = discover_factory(registry, DIR, "never", Duration::from_millis(50)).unwrap_err();
    match err {
        ClasspathError::Registry(inner) => assert!(inner.is_timeout()),
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn configured_wait_timeout_bounds_discovery() {
    let harness = Harness::new();
    let registry = Arc::new(MemoryRegistry::default());
    let factory = harness.exporter.export(&[]).unwrap();
    publish_factory(&*registry, DIR, "a", &factory).unwrap();

    let config = RegistryConfig {
        wait_timeout_ms: 50,
        ..RegistryConfig::default()
    };
    assert_eq!(
        discover_factory_with_config(registry.clone(), DIR, "a", &config).unwrap(),
        factory
    );

    let started = std::time::Instant::now();
    let err = discover_factories_with_config(registry, DIR, 2, &config).unwrap_err();
    assert!(matches!(err, ClasspathError::Registry(ref inner) if inner.is_timeout()));
    assert!(started.elapsed() >= Duration::from_millis(50));
}
