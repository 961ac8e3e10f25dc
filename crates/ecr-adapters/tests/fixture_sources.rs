use std::path::{Path, PathBuf};

use ecr_adapters::{
    adapter_for_source, Adapted, AdapterContext, AuthorVocabulary, RawRecord, SkipReason,
    WithholdList, DOCUMENTS_DIR,
};

fn fixture_dir(source_id: &str) -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../../fixtures")
        .join(source_id)
}

fn raw_files(dir: &Path, extension: &str) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = std::fs::read_dir(dir.join(DOCUMENTS_DIR))
        .expect("fixture documents")
        .map(|entry| entry.expect("entry").path())
        .filter(|path| path.extension().is_some_and(|ext| ext == extension))
        .collect();
    files.sort();
    files
}

async fn adapt_all(source_id: &str, raw_dir: &Path) -> Vec<Adapted> {
    let adapter = adapter_for_source(source_id).expect("registered adapter");
    let ctx = AdapterContext::new(raw_dir, WithholdList::default());
    let mut out = Vec::new();
    for path in raw_files(raw_dir, adapter.raw_extension()) {
        let raw = RawRecord::read(&path).await.expect("read raw");
        out.push(adapter.adapt(&raw, &ctx).await.expect("adapt fixture"));
    }
    out
}

#[tokio::test]
async fn everycrsreport_fixtures_adapt() {
    let adapted = adapt_all("everycrsreport", &fixture_dir("everycrsreport")).await;
    assert_eq!(adapted.len(), 2);

    let Adapted::Version(report) = &adapted[0] else {
        panic!("R41360 should be published");
    };
    assert_eq!(report.number.as_str(), "R41360");
    assert_eq!(report.version.source, "EveryCRSReport.com");
    assert!(report.version.formats[0].images.is_some());
    assert!(matches!(&adapted[1], Adapted::Skip(SkipReason::ExcludedType(code)) if code == "BLOG"));

    let mut vocabulary = AuthorVocabulary::default();
    vocabulary.extend(&report.authors);
    let names = vocabulary.finalize();
    assert!(names.contains(&"John Researcher".to_string()));
    assert!(names.contains(&"Jane Q. Analyst".to_string()));
}

#[tokio::test]
async fn congress_fixtures_adapt() {
    let adapted = adapt_all("crsreports-congress-gov", &fixture_dir("crsreports-congress-gov")).await;
    assert_eq!(adapted.len(), 2);
    assert!(matches!(&adapted[0], Adapted::Skip(SkipReason::ExcludedType(_))));
    let Adapted::Version(v) = &adapted[1] else {
        panic!("R41360 should be published");
    };
    assert_eq!(v.version.date.to_string(), "2020-01-01");
    assert_eq!(v.version.type_id, "REPORTS");
}

#[tokio::test]
async fn unt_fixtures_ingest_pdf_into_content_addressed_store() {
    let temp = tempfile::tempdir().expect("tempdir");
    let docs = temp.path().join(DOCUMENTS_DIR);
    std::fs::create_dir_all(&docs).unwrap();
    for entry in std::fs::read_dir(fixture_dir("unt").join(DOCUMENTS_DIR)).unwrap() {
        let path = entry.unwrap().path();
        std::fs::copy(&path, docs.join(path.file_name().unwrap())).unwrap();
    }

    let adapted = adapt_all("unt", temp.path()).await;
    assert_eq!(adapted.len(), 2);
    let Adapted::Version(v) = &adapted[0] else {
        panic!("RL30240 should be published");
    };
    assert_eq!(v.number.as_str(), "RL30240");
    assert_eq!(v.version.id, "ark:/67531/metadc820961");
    assert_eq!(v.version.date.to_string(), "2002-02-01");
    assert_eq!(v.authors, vec!["Jane Q. Analyst"]);

    let format = &v.version.formats[0];
    let sha = format.sha256.as_deref().expect("sha256");
    assert_eq!(format.filename, format!("files/{sha}.pdf"));
    assert!(temp.path().join(&format.filename).exists());
    assert!(matches!(&adapted[1], Adapted::Skip(SkipReason::ExcludedType(_))));
}

#[tokio::test]
async fn withheld_unt_records_write_nothing() {
    let temp = tempfile::tempdir().expect("tempdir");
    let docs = temp.path().join(DOCUMENTS_DIR);
    std::fs::create_dir_all(&docs).unwrap();
    for name in ["metadc820961.xml", "metadc820961.pdf"] {
        std::fs::copy(fixture_dir("unt").join(DOCUMENTS_DIR).join(name), docs.join(name)).unwrap();
    }

    let adapter = adapter_for_source("unt").unwrap();
    let ctx = AdapterContext::new(temp.path(), WithholdList::parse("RL30240\n"));
    let raw = RawRecord::read(&docs.join("metadc820961.xml")).await.unwrap();
    let adapted = adapter.adapt(&raw, &ctx).await.unwrap();

    assert!(matches!(adapted, Adapted::Skip(SkipReason::Withheld)));
    assert!(!temp.path().join("files").exists());
}
