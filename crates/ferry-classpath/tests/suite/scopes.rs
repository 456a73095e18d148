use std::sync::atomic::Ordering;
use std::sync::Arc;

use ferry_cache::Fingerprint;
use ferry_classpath::{ClasspathError, ClasspathScope, ClasspathServer, RemoteClasspath, ResourceLoader};
use ferry_config::ClasspathConfig;

use super::support::{Harness, MapLoader};

/// Writes `<name>.jar` with distinct contents and returns the fingerprint of those contents.
fn raw_jar(harness: &Harness, name: &str) -> (std::path::PathBuf, Fingerprint) {
    let path = harness.path(&format!("{name}.jar"));
    let bytes = format!("contents of {name}").into_bytes();
    std::fs::write(&path, &bytes).unwrap();
    (path, Fingerprint::from_bytes(&bytes))
}

fn fingerprints(harness: &Harness, classpath_id: u64) -> Vec<Fingerprint> {
    harness
        .elements(classpath_id)
        .into_iter()
        .map(|element| element.fingerprint.unwrap())
        .collect()
}

#[test]
fn exporting_a_scope_twice_returns_the_same_factory() {
    let harness = Harness::new();
    let (jar, _) = raw_jar(&harness, "app");
    let scope = harness
        .exporter
        .register_scope(ClasspathScope::flat(vec![jar.into()]));

    let first = harness.exporter.export_scope(scope).unwrap();
    let second = harness.exporter.export_scope(scope).unwrap();
    assert_eq!(first, second);
    assert_eq!(harness.store.classpath_count(), 1);
}

#[test]
fn ancestors_are_flattened_up_to_the_configured_depth() {
    let harness = Harness::new();
    assert_eq!(ClasspathConfig::default().max_export_depth, 2);
    let (root_jar, _) = raw_jar(&harness, "root");
    let (grand_jar, grand_fp) = raw_jar(&harness, "grand");
    let (parent_jar, parent_fp) = raw_jar(&harness, "parent");
    let (child_jar, child_fp) = raw_jar(&harness, "child");

    let exporter = &harness.exporter;
    let root = exporter.register_scope(ClasspathScope::flat(vec![root_jar.into()]));
    let grand = exporter.register_scope(ClasspathScope::Flat {
        entries: vec![grand_jar.into()],
        parent: Some(root),
    });
    let parent = exporter.register_scope(ClasspathScope::Flat {
        entries: vec![parent_jar.into()],
        parent: Some(grand),
    });
    let child = exporter.register_scope(ClasspathScope::Flat {
        entries: vec![child_jar.into()],
        parent: Some(parent),
    });

    let factory = exporter.export_scope(child).unwrap();
    assert_eq!(
        fingerprints(&harness, factory.classpath_id),
        vec![grand_fp, parent_fp, child_fp]
    );
}

#[test]
fn an_opaque_ancestor_ends_the_walk() {
    let harness = Harness::new();
    let (parent_jar, _) = raw_jar(&harness, "parent");
    let (child_jar, child_fp) = raw_jar(&harness, "child");

    let exporter = &harness.exporter;
    let grand = exporter.register_scope(ClasspathScope::flat(vec![parent_jar.into()]));
    let opaque = exporter.register_scope(ClasspathScope::Opaque {
        loader: Arc::new(MapLoader::default()),
        parent: Some(grand),
    });
    let child = exporter.register_scope(ClasspathScope::Flat {
        entries: vec![child_jar.into()],
        parent: Some(opaque),
    });

    let factory = exporter.export_scope(child).unwrap();
    assert_eq!(fingerprints(&harness, factory.classpath_id), vec![child_fp]);
}

#[test]
fn opaque_scopes_import_as_dynamic_loaders() {
    let harness = Harness::new();
    let remote = Arc::new(
        MapLoader::default()
            .with("com/acme/Dyn.class", b"dynamic")
            .with("shared.txt", b"remote"),
    );
    let scope = harness.exporter.register_scope(ClasspathScope::Opaque {
        loader: remote.clone(),
        parent: None,
    });
    let factory = harness.exporter.export_scope(scope).unwrap();
    assert_eq!(
        harness.store.path_elements(factory.classpath_id).unwrap(),
        RemoteClasspath::Dynamic
    );

    let parent: Arc<dyn ResourceLoader> =
        Arc::new(MapLoader::default().with("shared.txt", b"parent"));
    let loader = harness
        .importer
        .create_class_loader(&factory, &harness.cache_dir(), Some(parent))
        .unwrap();
    assert!(loader.is_dynamic());

    assert_eq!(
        loader.load_class("com.acme.Dyn").unwrap().bytes,
        b"dynamic".to_vec()
    );
    // The parent answers first.
    assert_eq!(
        loader.find_resource("shared.txt").unwrap(),
        Some(b"parent".to_vec())
    );
    assert!(matches!(
        loader.load_class("com.acme.Missing"),
        Err(ClasspathError::ClassNotFound { .. })
    ));

    // Repeated lookups are answered locally.
    let before = remote.lookups.load(Ordering::SeqCst);
    loader.load_class("com.acme.Dyn").unwrap();
    loader.load_class("com.acme.Missing").unwrap_err();
    assert_eq!(remote.lookups.load(Ordering::SeqCst), before);
    assert_eq!(harness.server.downloads(), 0);
}

#[test]
fn released_scopes_are_unexported_and_stale() {
    let harness = Harness::new();
    let (jar, _) = raw_jar(&harness, "app");
    let scope = harness
        .exporter
        .register_scope(ClasspathScope::flat(vec![jar.into()]));
    let factory = harness.exporter.export_scope(scope).unwrap();

    harness.exporter.release_scope(scope).unwrap();
    assert!(harness
        .store
        .path_elements(factory.classpath_id)
        .unwrap_err()
        .is_not_found());
    assert!(matches!(
        harness.exporter.export_scope(scope),
        Err(ClasspathError::UnknownScope { .. })
    ));
    assert!(matches!(
        harness.exporter.release_scope(scope),
        Err(ClasspathError::UnknownScope { .. })
    ));

    // A new scope may reuse the slot but never the handle.
    let (other, _) = raw_jar(&harness, "other");
    let reused = harness
        .exporter
        .register_scope(ClasspathScope::flat(vec![other.into()]));
    assert_ne!(reused, scope);
}

#[test]
fn unexporting_a_scope_classpath_allows_a_fresh_export() {
    let harness = Harness::new();
    let (jar, _) = raw_jar(&harness, "app");
    let scope = harness
        .exporter
        .register_scope(ClasspathScope::flat(vec![jar.into()]));
    let first = harness.exporter.export_scope(scope).unwrap();

    assert!(harness.exporter.unexport(first.classpath_id));
    let second = harness.exporter.export_scope(scope).unwrap();
    assert_ne!(first.classpath_id, second.classpath_id);
    assert!(harness.store.contains_classpath(second.classpath_id));
}
