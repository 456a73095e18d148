use std::sync::{Arc, Barrier};
use std::thread;

use ferry_cache::ArchiveCache;
use ferry_classpath::{
    ClassDefinition, ClasspathEntry, ClasspathError, ClasspathFactory, ClasspathSource, Envelope,
    ResourceLoader,
};
use ferry_config::ClasspathConfig;

use super::support::{write_jar, write_tree, Harness, MapLoader, TruncatingServer};

fn two_entry_classpath(harness: &Harness) -> ClasspathFactory {
    let classes = harness.path("classes");
    write_tree(
        &classes,
        &[
            ("com/acme/Foo.class", b"foo from classes"),
            ("app.properties", b"classes"),
        ],
    );
    let jar = harness.path("lib/acme.jar");
    write_jar(
        &jar,
        &[
            ("com/acme/Bar.class", b"bar from jar"),
            ("app.properties", b"jar"),
        ],
    );
    harness
        .exporter
        .export(&[classes.into(), jar.into()])
        .unwrap()
}

#[test]
fn round_trip_resolves_everything_in_precedence_order() {
    let harness = Harness::new();
    let factory = two_entry_classpath(&harness);

    let loader = harness
        .importer
        .create_class_loader(&factory, &harness.cache_dir(), None)
        .unwrap();
    assert!(!loader.is_dynamic());

    assert_eq!(
        loader.load_class("com.acme.Foo").unwrap(),
        ClassDefinition {
            binary_name: "com.acme.Foo".to_string(),
            bytes: b"foo from classes".to_vec(),
        }
    );
    assert_eq!(
        loader.load_class("com.acme.Bar").unwrap().bytes,
        b"bar from jar".to_vec()
    );
    assert_eq!(
        loader.find_resource("app.properties").unwrap(),
        Some(b"classes".to_vec())
    );
    assert!(matches!(
        loader.load_class("com.acme.Missing"),
        Err(ClasspathError::ClassNotFound { .. })
    ));

    // Sources are cache entries, in export order.
    let cache = ArchiveCache::open(harness.cache_dir()).unwrap();
    let expected: Vec<_> = harness
        .elements(factory.classpath_id)
        .iter()
        .map(|element| cache.entry_path(element.fingerprint.as_ref().unwrap()))
        .collect();
    let actual: Vec<_> = loader
        .as_local()
        .unwrap()
        .sources()
        .iter()
        .map(|source| source.local_path().unwrap().to_path_buf())
        .collect();
    assert_eq!(actual, expected);
}

#[test]
fn parent_resolves_what_the_import_lacks() {
    let harness = Harness::new();
    let factory = two_entry_classpath(&harness);
    let parent: Arc<dyn ResourceLoader> =
        Arc::new(MapLoader::default().with("java/lang/Object.class", b"object"));

    let loader = harness
        .importer
        .create_class_loader(&factory, &harness.cache_dir(), Some(parent))
        .unwrap();
    assert_eq!(
        loader.load_class("java.lang.Object").unwrap().bytes,
        b"object".to_vec()
    );
}

#[test]
fn second_import_is_a_pure_cache_hit() {
    let harness = Harness::new();
    let factory = two_entry_classpath(&harness);

    harness
        .importer
        .create_class_loader(&factory, &harness.cache_dir(), None)
        .unwrap();
    assert_eq!(harness.server.fetches(), 2);
    let downloads = harness.server.downloads();

    let again = harness
        .importer
        .create_class_loader(&factory, &harness.cache_dir(), None)
        .unwrap();
    assert_eq!(harness.server.fetches(), 2);
    assert_eq!(harness.server.downloads(), downloads);
    assert!(again.find_resource("app.properties").unwrap().is_some());
}

#[test]
fn identical_archives_are_fetched_once_per_fingerprint() {
    let harness = Harness::with_config(ClasspathConfig {
        parallel_downloads: false,
        ..ClasspathConfig::default()
    });
    let first = harness.path("one/lib.jar");
    let second = harness.path("two/lib.jar");
    std::fs::create_dir_all(first.parent().unwrap()).unwrap();
    std::fs::create_dir_all(second.parent().unwrap()).unwrap();
    std::fs::write(&first, b"same bytes").unwrap();
    std::fs::write(&second, b"same bytes").unwrap();

    let factory = harness
        .exporter
        .export(&[first.into(), second.into()])
        .unwrap();
    let loader = harness
        .importer
        .create_class_loader(&factory, &harness.cache_dir(), None)
        .unwrap();
    assert_eq!(loader.as_local().unwrap().sources().len(), 2);
    assert_eq!(harness.server.fetches(), 1);
}

#[test]
fn corrupted_cache_entry_is_an_integrity_error() {
    let harness = Harness::new();
    let factory = two_entry_classpath(&harness);
    harness
        .importer
        .create_class_loader(&factory, &harness.cache_dir(), None)
        .unwrap();

    let cache = ArchiveCache::open(harness.cache_dir()).unwrap();
    let element = harness.elements(factory.classpath_id)[0].clone();
    let entry = cache
        .lookup(element.fingerprint.as_ref().unwrap())
        .unwrap();
    let mut bytes = std::fs::read(&entry).unwrap();
    bytes[0] ^= 0xff;
    std::fs::write(&entry, &bytes).unwrap();

    let err = harness
        .importer
        .create_class_loader(&factory, &harness.cache_dir(), None)
        .unwrap_err();
    assert!(err.is_integrity(), "unexpected error: {err}");
    assert!(!err.is_not_found());
    // The corrupt entry is left for the caller to deal with.
    assert!(entry.exists());
}

#[test]
fn short_downloads_are_never_published_to_the_cache() {
    let harness = Harness::new();
    let factory = two_entry_classpath(&harness);
    let flaky = harness
        .connector
        .register("flaky", Arc::new(TruncatingServer::new(harness.store.clone())))
        .unwrap();
    let flaky_factory = ClasspathFactory {
        server: flaky,
        ..factory.clone()
    };

    let err = harness
        .importer
        .create_class_loader(&flaky_factory, &harness.cache_dir(), None)
        .unwrap_err();
    assert!(err.is_integrity(), "unexpected error: {err}");

    let cache = ArchiveCache::open(harness.cache_dir()).unwrap();
    for element in harness.elements(factory.classpath_id) {
        assert!(cache.lookup(element.fingerprint.as_ref().unwrap()).is_none());
    }
    assert!(cache.stale_part_files().unwrap().is_empty());

    // A healthy server can still populate the same cache directory.
    let loader = harness
        .importer
        .create_class_loader(&factory, &harness.cache_dir(), None)
        .unwrap();
    assert_eq!(
        loader.load_class("com.acme.Bar").unwrap().bytes,
        b"bar from jar".to_vec()
    );
}

#[test]
fn unknown_classpath_is_not_found() {
    let harness = Harness::new();
    let factory = two_entry_classpath(&harness);
    let bogus = ClasspathFactory {
        classpath_id: factory.classpath_id + 1000,
        ..factory.clone()
    };

    let err = harness
        .importer
        .create_class_loader(&bogus, &harness.cache_dir(), None)
        .unwrap_err();
    assert!(err.is_not_found(), "unexpected error: {err}");

    harness.exporter.unexport(factory.classpath_id);
    let err = harness
        .importer
        .create_class_loader(&factory, &harness.cache_dir(), None)
        .unwrap_err();
    assert!(err.is_not_found(), "unexpected error: {err}");
}

#[test]
fn unregistered_server_fails_the_import() {
    let harness = Harness::new();
    let factory = two_entry_classpath(&harness);
    assert!(harness.connector.unregister("exporter"));

    let err = harness
        .importer
        .create_class_loader(&factory, &harness.cache_dir(), None)
        .unwrap_err();
    assert!(matches!(err, ClasspathError::Remote { .. }));
}

#[test]
fn passthrough_elements_become_url_sources() {
    let harness = Harness::new();
    let factory = harness
        .exporter
        .export(&[ClasspathEntry::parse(
            "https://repo.example/classes/",
        )])
        .unwrap();

    let loader = harness
        .importer
        .create_class_loader(&factory, &harness.cache_dir(), None)
        .unwrap();
    let sources = loader.as_local().unwrap().sources();
    assert_eq!(sources.len(), 1);
    assert!(matches!(sources[0], ClasspathSource::RemoteDirectory { .. }));
    assert_eq!(harness.server.downloads(), 0);
}

#[test]
fn passthrough_urls_with_foreign_schemes_still_import() {
    let harness = Harness::new();
    let classes = harness.path("classes");
    write_tree(&classes, &[("com/acme/Foo.class", b"foo")]);
    let factory = harness
        .exporter
        .export(&[
            ClasspathEntry::parse("jar:file:/opt/app.jar!/"),
            classes.into(),
            ClasspathEntry::parse("ftp://repo.example/lib.jar"),
        ])
        .unwrap();
    assert_eq!(harness.elements(factory.classpath_id).len(), 3);

    let loader = harness
        .importer
        .create_class_loader(&factory, &harness.cache_dir(), None)
        .unwrap();
    let sources = loader.as_local().unwrap().sources();
    assert!(matches!(sources[0], ClasspathSource::Unresolvable(_)));
    assert!(sources[1].local_path().is_some());
    assert!(matches!(sources[2], ClasspathSource::Unresolvable(_)));
    assert_eq!(loader.load_class("com.acme.Foo").unwrap().bytes, b"foo".to_vec());
    assert_eq!(loader.find_resource("com/acme/Missing.class").unwrap(), None);
}

#[test]
fn default_cache_comes_from_the_config() {
    let cache_root = tempfile::TempDir::new().unwrap();
    let harness = Harness::with_config(ClasspathConfig {
        cache_dir: Some(cache_root.path().join("configured")),
        ..ClasspathConfig::default()
    });
    let factory = two_entry_classpath(&harness);

    let loader = harness
        .importer
        .create_class_loader_in_default_cache(&factory, None)
        .unwrap();
    for source in loader.as_local().unwrap().sources() {
        assert!(source
            .local_path()
            .unwrap()
            .starts_with(cache_root.path().join("configured")));
    }
    assert_eq!(
        loader.load_class("com.acme.Bar").unwrap().bytes,
        b"bar from jar".to_vec()
    );
}

#[test]
fn concurrent_imports_share_one_cache() {
    let harness = Arc::new(Harness::new());
    let factory = two_entry_classpath(&harness);

    let threads = 8;
    let barrier = Arc::new(Barrier::new(threads));
    let handles: Vec<_> = (0..threads)
        .map(|_| {
            let harness = harness.clone();
            let factory = factory.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                let loader = harness
                    .importer
                    .create_class_loader(&factory, &harness.cache_dir(), None)
                    .unwrap();
                loader.load_class("com.acme.Bar").unwrap().bytes
            })
        })
        .collect();

    for handle in handles {
        assert_eq!(handle.join().unwrap(), b"bar from jar".to_vec());
    }
    let cache = ArchiveCache::open(harness.cache_dir()).unwrap();
    assert!(cache.stale_part_files().unwrap().is_empty());
}

#[test]
fn envelopes_decode_against_their_classpath() {
    let harness = Harness::new();
    let factory = two_entry_classpath(&harness);
    let envelope = Envelope::new("acme/bar-v1", b"payload".to_vec(), factory);

    let (_loader, decoded) = envelope
        .decode(
            &harness.importer,
            &harness.cache_dir(),
            None,
            |loader, schema, payload| {
                assert_eq!(schema, "acme/bar-v1");
                let class = loader.load_class("com.acme.Bar")?;
                Ok((class.bytes, payload.to_vec()))
            },
        )
        .unwrap();
    assert_eq!(decoded.0, b"bar from jar".to_vec());
    assert_eq!(decoded.1, b"payload".to_vec());

    let json = serde_json::to_vec(&envelope).unwrap();
    let back: Envelope = serde_json::from_slice(&json).unwrap();
    assert_eq!(back, envelope);
}
