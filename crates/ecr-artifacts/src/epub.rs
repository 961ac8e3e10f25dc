//! Single-document EPUB 3 packages for offline reading.

use std::collections::BTreeMap;
use std::io::{Cursor, Write};

use chrono::NaiveDate;
use ecr_redact::markup::{escape_text, parse_fragment, render_xhtml, Element, Node};
use tracing::warn;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

use crate::ArtifactError;

pub const EPUBS_DIR: &str = "epubs";
pub const CREATOR: &str = "Congressional Research Service";
pub const PUBLISHER: &str = "EveryCRSReport.com";
pub const RIGHTS: &str = "Public Domain";

const CONTAINER_XML: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<container version="1.0" xmlns="urn:oasis:names:tc:opendocument:xmlns:container">
  <rootfiles>
    <rootfile full-path="OEBPS/content.opf" media-type="application/oebps-package+xml"/>
  </rootfiles>
</container>
"#;

pub fn epub_filename(number: &str) -> String {
    format!("{EPUBS_DIR}/{number}.epub")
}

/// Everything a package needs; the body is a sanitized HTML fragment.
#[derive(Debug, Clone)]
pub struct EpubInput<'a> {
    pub number: &'a str,
    pub title: &'a str,
    pub date: NaiveDate,
    pub body_html: &'a str,
    pub cover_png: Option<&'a [u8]>,
}

impl EpubInput<'_> {
    pub fn full_title(&self) -> String {
        format!("{} ({}, {})", self.title, self.number, self.date.format("%B %-d, %Y"))
    }
}

fn media_type(path: &str) -> Option<&'static str> {
    let ext = path.rsplit('.').next()?.to_ascii_lowercase();
    match ext.as_str() {
        "png" => Some("image/png"),
        "jpg" | "jpeg" => Some("image/jpeg"),
        "gif" => Some("image/gif"),
        "svg" => Some("image/svg+xml"),
        _ => None,
    }
}

fn xml_text(value: &str) -> String {
    let mut out = String::new();
    escape_text(value, &mut out);
    out
}

/// Point stored images (`/files/...`) at their packaged copies, dropping any we
/// cannot load. Returns packaged name -> bytes.
fn embed_images(
    nodes: &mut Vec<Node>,
    load: &mut dyn FnMut(&str) -> Option<Vec<u8>>,
    images: &mut BTreeMap<String, Vec<u8>>,
) {
    nodes.retain_mut(|node| {
        let Node::Element(el) = node else {
            return true;
        };
        if el.name == "img" {
            return embed_image(el, load, images);
        }
        embed_images(&mut el.children, load, images);
        true
    });
}

fn embed_image(
    el: &mut Element,
    load: &mut dyn FnMut(&str) -> Option<Vec<u8>>,
    images: &mut BTreeMap<String, Vec<u8>>,
) -> bool {
    let Some(stored) = el.attr("src").and_then(|src| src.strip_prefix('/')).map(str::to_string) else {
        return false;
    };
    if media_type(&stored).is_none() {
        return false;
    }
    let packaged = format!("images/{}", stored.rsplit('/').next().unwrap_or(&stored));
    if !images.contains_key(&packaged) {
        match load(&stored) {
            Some(bytes) => {
                images.insert(packaged.clone(), bytes);
            }
            None => {
                warn!(image = %stored, "image missing; dropped from ePub");
                return false;
            }
        }
    }
    el.set_attr("src", packaged);
    if el.attr("alt").is_none() {
        el.set_attr("alt", "");
    }
    true
}

fn content_document(input: &EpubInput<'_>, body: &[Node]) -> String {
    format!(
        concat!(
            "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n",
            "<!DOCTYPE html>\n",
            "<html xmlns=\"http://www.w3.org/1999/xhtml\" xml:lang=\"en\" lang=\"en\">\n",
            "<head><meta charset=\"UTF-8\" /><title>{title}</title></head>\n",
            "<body><h1>{heading}</h1>{body}</body>\n",
            "</html>\n"
        ),
        title = xml_text(&input.full_title()),
        heading = xml_text(input.title),
        body = render_xhtml(body),
    )
}

fn nav_document(input: &EpubInput<'_>) -> String {
    format!(
        concat!(
            "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n",
            "<!DOCTYPE html>\n",
            "<html xmlns=\"http://www.w3.org/1999/xhtml\" xmlns:epub=\"http://www.idpf.org/2007/ops\">\n",
            "<head><title>{title}</title></head>\n",
            "<body><nav epub:type=\"toc\"><ol><li><a href=\"report.xhtml\">{title}</a></li></ol></nav></body>\n",
            "</html>\n"
        ),
        title = xml_text(input.title),
    )
}

fn package_document(input: &EpubInput<'_>, images: &BTreeMap<String, Vec<u8>>, has_cover: bool) -> String {
    let mut manifest = String::from(
        "    <item id=\"nav\" href=\"nav.xhtml\" media-type=\"application/xhtml+xml\" properties=\"nav\"/>\n\
         \x20   <item id=\"report\" href=\"report.xhtml\" media-type=\"application/xhtml+xml\"/>\n",
    );
    if has_cover {
        manifest.push_str("    <item id=\"cover\" href=\"cover.png\" media-type=\"image/png\" properties=\"cover-image\"/>\n");
    }
    for (index, name) in images.keys().enumerate() {
        let media = media_type(name).unwrap_or("application/octet-stream");
        manifest.push_str(&format!(
            "    <item id=\"img{index}\" href=\"{}\" media-type=\"{media}\"/>\n",
            xml_text(name)
        ));
    }

    format!(
        concat!(
            "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n",
            "<package xmlns=\"http://www.idpf.org/2007/opf\" version=\"3.0\" unique-identifier=\"id\">\n",
            "  <metadata xmlns:dc=\"http://purl.org/dc/elements/1.1/\">\n",
            "    <dc:identifier id=\"id\">https://www.everycrsreport.com/reports/{number}.html</dc:identifier>\n",
            "    <dc:title>{title}</dc:title>\n",
            "    <dc:date>{date}</dc:date>\n",
            "    <dc:creator>{creator}</dc:creator>\n",
            "    <dc:language>en</dc:language>\n",
            "    <dc:rights>{rights}</dc:rights>\n",
            "    <dc:publisher>{publisher}</dc:publisher>\n",
            "    <meta property=\"dcterms:modified\">{date}T00:00:00Z</meta>\n",
            "  </metadata>\n",
            "  <manifest>\n{manifest}  </manifest>\n",
            "  <spine>\n    <itemref idref=\"report\"/>\n  </spine>\n",
            "</package>\n"
        ),
        number = xml_text(input.number),
        title = xml_text(&input.full_title()),
        date = input.date.format("%Y-%m-%d"),
        creator = CREATOR,
        rights = RIGHTS,
        publisher = PUBLISHER,
        manifest = manifest,
    )
}

fn entry_options(method: CompressionMethod) -> SimpleFileOptions {
    SimpleFileOptions::default()
        .compression_method(method)
        .last_modified_time(zip::DateTime::default())
}

/// Build the package. `load_image` resolves a stored path such as `files/abc.png`.
/// Entries carry a fixed timestamp so unchanged inputs give identical bytes.
pub fn build_epub(
    input: &EpubInput<'_>,
    mut load_image: impl FnMut(&str) -> Option<Vec<u8>>,
) -> Result<Vec<u8>, ArtifactError> {
    let mut body = parse_fragment(input.body_html);
    let mut images = BTreeMap::new();
    embed_images(&mut body, &mut load_image, &mut images);

    let stored = || entry_options(CompressionMethod::Stored);
    let deflated = || entry_options(CompressionMethod::Deflated);

    let mut buffer = Vec::new();
    let mut zip = ZipWriter::new(Cursor::new(&mut buffer));
    // The mimetype entry must come first and be uncompressed.
    zip.start_file("mimetype", stored())?;
    zip.write_all(b"application/epub+zip")?;
    zip.start_file("META-INF/container.xml", deflated())?;
    zip.write_all(CONTAINER_XML.as_bytes())?;
    zip.start_file("OEBPS/content.opf", deflated())?;
    zip.write_all(package_document(input, &images, input.cover_png.is_some()).as_bytes())?;
    zip.start_file("OEBPS/nav.xhtml", deflated())?;
    zip.write_all(nav_document(input).as_bytes())?;
    zip.start_file("OEBPS/report.xhtml", deflated())?;
    zip.write_all(content_document(input, &body).as_bytes())?;
    if let Some(cover) = input.cover_png {
        zip.start_file("OEBPS/cover.png", stored())?;
        zip.write_all(cover)?;
    }
    for (name, bytes) in &images {
        zip.start_file(format!("OEBPS/{name}"), stored())?;
        zip.write_all(bytes)?;
    }
    zip.finish()?;
    Ok(buffer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    fn input<'a>(body: &'a str, cover: Option<&'a [u8]>) -> EpubInput<'a> {
        EpubInput {
            number: "R41360",
            title: "Farm Bill & Nutrition",
            date: NaiveDate::from_ymd_opt(2020, 1, 2).unwrap(),
            body_html: body,
            cover_png: cover,
        }
    }

    fn entry(bytes: &[u8], name: &str) -> String {
        let mut archive = zip::ZipArchive::new(Cursor::new(bytes)).unwrap();
        let mut file = archive.by_name(name).unwrap();
        let mut out = String::new();
        file.read_to_string(&mut out).unwrap();
        out
    }

    #[test]
    fn packages_metadata_body_and_cover() {
        let bytes = build_epub(&input("<p>Body<br>text</p>", Some(b"PNG")), |_| None).unwrap();
        let mut archive = zip::ZipArchive::new(Cursor::new(&bytes[..])).unwrap();
        let first = archive.by_index(0).unwrap();
        assert_eq!(first.name(), "mimetype");
        assert_eq!(first.compression(), CompressionMethod::Stored);
        drop(first);
        assert!(archive.by_name("OEBPS/cover.png").is_ok());

        let opf = entry(&bytes, "OEBPS/content.opf");
        assert!(opf.contains("<dc:title>Farm Bill &amp; Nutrition (R41360, January 2, 2020)</dc:title>"));
        assert!(opf.contains("<dc:creator>Congressional Research Service</dc:creator>"));
        assert!(opf.contains("<dc:rights>Public Domain</dc:rights>"));
        assert!(opf.contains("properties=\"cover-image\""));

        let report = entry(&bytes, "OEBPS/report.xhtml");
        assert!(report.contains("<p>Body<br />text</p>"));
    }

    #[test]
    fn embeds_stored_images_and_drops_missing_ones() {
        let body = r#"<p><img src="/files/abc.png"><img src="/files/gone.png"></p>"#;
        let bytes = build_epub(&input(body, None), |path| (path == "files/abc.png").then(|| b"img".to_vec())).unwrap();
        let report = entry(&bytes, "OEBPS/report.xhtml");
        assert!(report.contains(r#"<img src="images/abc.png" alt="" />"#));
        assert!(!report.contains("gone.png"));
        assert_eq!(entry(&bytes, "OEBPS/images/abc.png"), "img");
        assert!(entry(&bytes, "OEBPS/content.opf").contains("href=\"images/abc.png\" media-type=\"image/png\""));
    }

    #[test]
    fn output_is_deterministic() {
        let a = build_epub(&input("<p>x</p>", None), |_| None).unwrap();
        let b = build_epub(&input("<p>x</p>", None), |_| None).unwrap();
        assert_eq!(a, b);
        assert_eq!(epub_filename("R41360"), "epubs/R41360.epub");
    }
}
