use ferry_archive::Archive;
use ferry_cache::ContentFingerprint;
use ferry_classpath::{ClasspathEntry, ClasspathServer};
use url::Url;

use super::support::{write_jar, write_tree, Harness};

#[test]
fn directory_with_an_empty_subdirectory_exports_one_archive() {
    let harness = Harness::new();
    let dir = harness.path("classes");
    write_tree(&dir, &[("a.txt", b"hello")]);
    std::fs::create_dir_all(dir.join("empty")).unwrap();

    let factory = harness.exporter.export(&[dir.clone().into()]).unwrap();
    let elements = harness.elements(factory.classpath_id);
    assert_eq!(elements.len(), 1);

    let element = &elements[0];
    assert!(!element.is_passthrough());
    let served = harness.store.served_path(element.id).unwrap();
    let measured = ContentFingerprint::from_file(&served).unwrap();
    assert!(measured.matches(element.fingerprint.as_ref().unwrap(), element.length));

    let archive = Archive::new(&served);
    assert_eq!(archive.entry_names().unwrap(), vec!["a.txt".to_string()]);
    assert_eq!(archive.read("a.txt").unwrap().unwrap(), b"hello".to_vec());
}

#[test]
fn empty_directory_alone_exports_nothing() {
    let harness = Harness::new();
    let empty = harness.path("classes/empty");
    std::fs::create_dir_all(&empty).unwrap();

    let factory = harness.exporter.export(&[empty.into()]).unwrap();
    assert!(harness.elements(factory.classpath_id).is_empty());
}

#[test]
fn missing_duplicate_and_non_archive_entries_are_dropped() {
    let harness = Harness::new();
    let jar = harness.path("lib/util.jar");
    write_jar(&jar, &[("util/A.class", b"A")]);
    let readme = harness.path("lib/README.txt");
    std::fs::write(&readme, b"not an archive").unwrap();
    let dotted = harness.path("lib/./util.jar");

    let factory = harness
        .exporter
        .export(&[
            harness.path("lib/missing.jar").into(),
            jar.clone().into(),
            readme.into(),
            dotted.into(),
        ])
        .unwrap();

    let elements = harness.elements(factory.classpath_id);
    assert_eq!(elements.len(), 1);
    assert_eq!(elements[0].length, std::fs::metadata(&jar).unwrap().len());
}

#[test]
fn urls_pass_through_and_file_urls_are_local() {
    let harness = Harness::new();
    let jar = harness.path("lib/util.jar");
    write_jar(&jar, &[("util/A.class", b"A")]);
    let remote = Url::parse("https://repo.example/libs/").unwrap();

    let factory = harness
        .exporter
        .export(&[
            ClasspathEntry::Url(remote.clone()),
            ClasspathEntry::Url(Url::from_file_path(&jar).unwrap()),
        ])
        .unwrap();

    let elements = harness.elements(factory.classpath_id);
    assert_eq!(elements.len(), 2);
    assert_eq!(elements[0].url.as_ref(), Some(&remote));
    assert_eq!(elements[0].fingerprint, None);
    assert_eq!(elements[0].length, 0);
    assert!(elements[1].fingerprint.is_some());
    assert!(elements[1].url.is_none());
}

#[test]
fn ids_are_unique_and_increasing() {
    let harness = Harness::new();
    let first = harness.path("a.jar");
    let second = harness.path("b.jar");
    write_jar(&first, &[("a", b"a")]);
    write_jar(&second, &[("b", b"b")]);

    let one = harness
        .exporter
        .export(&[first.clone().into(), second.clone().into()])
        .unwrap();
    let two = harness.exporter.export(&[first.into()]).unwrap();
    assert_ne!(one.classpath_id, two.classpath_id);

    let mut ids: Vec<u64> = harness
        .elements(one.classpath_id)
        .iter()
        .chain(harness.elements(two.classpath_id).iter())
        .map(|element| element.id)
        .collect();
    let sorted = {
        let mut sorted = ids.clone();
        sorted.sort_unstable();
        sorted
    };
    assert_eq!(ids, sorted);
    ids.dedup();
    assert_eq!(ids.len(), 3);
}

#[test]
fn unexport_deletes_packed_archives() {
    let harness = Harness::new();
    let dir = harness.path("classes");
    write_tree(&dir, &[("com/acme/Foo.class", b"foo")]);

    let factory = harness.exporter.export(&[dir.into()]).unwrap();
    let element = harness.elements(factory.classpath_id)[0].clone();
    let served = harness.store.served_path(element.id).unwrap();
    assert!(served.exists());

    assert!(harness.exporter.unexport(factory.classpath_id));
    assert!(!harness.exporter.unexport(factory.classpath_id));
    assert!(!served.exists());
    assert!(harness
        .store
        .path_elements(factory.classpath_id)
        .unwrap_err()
        .is_not_found());
}

#[test]
fn server_side_lookup_follows_classpath_order() {
    let harness = Harness::new();
    let first = harness.path("first");
    write_tree(&first, &[("app.properties", b"first")]);
    let second = harness.path("second.jar");
    write_jar(&second, &[("app.properties", b"second"), ("only/second.txt", b"2")]);

    let factory = harness
        .exporter
        .export(&[first.into(), second.into()])
        .unwrap();
    let store = &harness.store;
    assert_eq!(
        store
            .find_resource(factory.classpath_id, "app.properties")
            .unwrap(),
        Some(b"first".to_vec())
    );
    assert_eq!(
        store
            .find_resource(factory.classpath_id, "only/second.txt")
            .unwrap(),
        Some(b"2".to_vec())
    );
    assert_eq!(
        store.find_resource(factory.classpath_id, "nope").unwrap(),
        None
    );
}
