//! Built-in markdown extraction for binary formats (PDF, OOXML).
//!
//! The output is deliberately plain: paragraphs separated by blank lines,
//! Word headings (`Heading1`..`Heading6` paragraph styles) rendered as ATX
//! headings, one `##` section per slide or sheet, and spreadsheet rows as
//! `a | b | c` lines. Good enough for the chunker to find structure without
//! an external converter.
//!
//! ZIP entries are read with a size cap (zip-bomb protection) and at most
//! [`XLSX_MAX_SHEETS`] sheets of [`XLSX_MAX_CELLS_PER_SHEET`] cells each are
//! processed.

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use std::io::{Cursor, Read};
use thiserror::Error;

/// Extensions [`extract_markdown`] understands.
pub const EXTRACT_EXTENSIONS: &[&str] = &[".pdf", ".docx", ".pptx", ".xlsx"];

pub const XLSX_MAX_SHEETS: usize = 100;
pub const XLSX_MAX_CELLS_PER_SHEET: usize = 100_000;
/// Maximum decompressed bytes read from a single ZIP entry.
const MAX_XML_ENTRY_BYTES: u64 = 50 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("no built-in extractor for '{0}'")]
    Unsupported(String),
    #[error("PDF extraction failed: {0}")]
    Pdf(String),
    #[error("OOXML extraction failed: {0}")]
    Ooxml(String),
    #[error("ZIP entry {entry} exceeds size limit ({limit} bytes)")]
    TooLarge { entry: String, limit: u64 },
}

fn ooxml<E: std::fmt::Display>(e: E) -> ExtractError {
    ExtractError::Ooxml(e.to_string())
}

/// Converts `bytes` of a file with `extension` (leading dot, any case) to
/// markdown.
pub fn extract_markdown(bytes: &[u8], extension: &str) -> Result<String, ExtractError> {
    match extension.to_ascii_lowercase().as_str() {
        ".pdf" => extract_pdf(bytes),
        ".docx" => extract_docx(bytes),
        ".pptx" => extract_pptx(bytes),
        ".xlsx" => extract_xlsx(bytes),
        other => Err(ExtractError::Unsupported(other.to_string())),
    }
}

// ============ PDF ============

fn extract_pdf(bytes: &[u8]) -> Result<String, ExtractError> {
    let text =
        pdf_extract::extract_text_from_mem(bytes).map_err(|e| ExtractError::Pdf(e.to_string()))?;
    // pdf-extract separates pages with form feeds and keeps hard line
    // breaks; collapse runs of blank lines into paragraph breaks.
    let mut out = String::new();
    for block in text
        .split(|c| c == '\u{c}')
        .flat_map(|page| page.split("\n\n"))
        .map(str::trim)
        .filter(|b| !b.is_empty())
    {
        out.push_str(block);
        out.push_str("\n\n");
    }
    Ok(out)
}

// ============ ZIP helpers ============

type Archive<'a> = zip::ZipArchive<Cursor<&'a [u8]>>;

fn open_archive(bytes: &[u8]) -> Result<Archive<'_>, ExtractError> {
    zip::ZipArchive::new(Cursor::new(bytes)).map_err(ooxml)
}

fn read_entry(archive: &mut Archive<'_>, name: &str) -> Result<Vec<u8>, ExtractError> {
    let entry = archive.by_name(name).map_err(ooxml)?;
    let mut out = Vec::new();
    entry
        .take(MAX_XML_ENTRY_BYTES)
        .read_to_end(&mut out)
        .map_err(ooxml)?;
    if out.len() as u64 >= MAX_XML_ENTRY_BYTES {
        return Err(ExtractError::TooLarge {
            entry: name.to_string(),
            limit: MAX_XML_ENTRY_BYTES,
        });
    }
    Ok(out)
}

/// Entry names `{prefix}N.xml`, ordered by `N`.
fn numbered_entries(archive: &Archive<'_>, prefix: &str) -> Vec<String> {
    let mut names: Vec<String> = archive
        .file_names()
        .filter(|n| n.starts_with(prefix) && n.ends_with(".xml"))
        .map(String::from)
        .collect();
    names.sort_by_key(|name| {
        name.trim_start_matches(prefix)
            .trim_end_matches(".xml")
            .parse::<u32>()
            .unwrap_or(u32::MAX)
    });
    names
}

fn attribute(e: &BytesStart<'_>, local: &[u8]) -> Option<String> {
    e.attributes()
        .flatten()
        .find(|a| a.key.local_name().as_ref() == local)
        .and_then(|a| a.unescape_value().ok().map(|v| v.into_owned()))
}

// ============ Paragraph text (docx, pptx) ============

struct Paragraph {
    text: String,
    heading: Option<usize>,
}

/// Walks WordprocessingML or DrawingML: `p` elements are paragraphs, text
/// lives in `t` runs. `pStyle` values `HeadingN` mark headings.
fn paragraphs(xml: &[u8]) -> Result<Vec<Paragraph>, ExtractError> {
    let mut reader = Reader::from_reader(xml);
    let mut buf = Vec::new();
    let mut out = Vec::new();
    let mut current = Paragraph {
        text: String::new(),
        heading: None,
    };
    let mut in_text = false;
    loop {
        match reader.read_event_into(&mut buf).map_err(ooxml)? {
            Event::Start(e) => match e.local_name().as_ref() {
                b"t" => in_text = true,
                b"pStyle" => current.heading = heading_level(&e),
                _ => {}
            },
            Event::Empty(e) => match e.local_name().as_ref() {
                b"pStyle" => current.heading = heading_level(&e),
                b"tab" => current.text.push(' '),
                b"br" => current.text.push(' '),
                _ => {}
            },
            Event::Text(te) if in_text => {
                current.text.push_str(&te.unescape().map_err(ooxml)?);
            }
            Event::End(e) => match e.local_name().as_ref() {
                b"t" => in_text = false,
                b"p" => {
                    let finished = std::mem::replace(
                        &mut current,
                        Paragraph {
                            text: String::new(),
                            heading: None,
                        },
                    );
                    if !finished.text.trim().is_empty() {
                        out.push(finished);
                    }
                }
                _ => {}
            },
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }
    Ok(out)
}

fn heading_level(e: &BytesStart<'_>) -> Option<usize> {
    let style = attribute(e, b"val")?;
    let level: usize = style.strip_prefix("Heading")?.trim().parse().ok()?;
    (1..=6).contains(&level).then_some(level)
}

fn render_paragraphs(out: &mut String, paragraphs: &[Paragraph]) {
    for p in paragraphs {
        if let Some(level) = p.heading {
            out.push_str(&"#".repeat(level));
            out.push(' ');
        }
        out.push_str(p.text.trim());
        out.push_str("\n\n");
    }
}

fn extract_docx(bytes: &[u8]) -> Result<String, ExtractError> {
    let mut archive = open_archive(bytes)?;
    let xml = read_entry(&mut archive, "word/document.xml")?;
    let mut out = String::new();
    render_paragraphs(&mut out, &paragraphs(&xml)?);
    Ok(out)
}

fn extract_pptx(bytes: &[u8]) -> Result<String, ExtractError> {
    let mut archive = open_archive(bytes)?;
    let mut out = String::new();
    for (i, name) in numbered_entries(&archive, "ppt/slides/slide")
        .iter()
        .enumerate()
    {
        let xml = read_entry(&mut archive, name)?;
        let paragraphs = paragraphs(&xml)?;
        if paragraphs.is_empty() {
            continue;
        }
        out.push_str(&format!("## Slide {}\n\n", i + 1));
        render_paragraphs(&mut out, &paragraphs);
    }
    Ok(out)
}

// ============ Spreadsheets ============

fn extract_xlsx(bytes: &[u8]) -> Result<String, ExtractError> {
    let mut archive = open_archive(bytes)?;
    let shared = match archive.index_for_name("xl/sharedStrings.xml") {
        Some(_) => shared_strings(&read_entry(&mut archive, "xl/sharedStrings.xml")?)?,
        None => Vec::new(),
    };
    let mut out = String::new();
    for (i, name) in numbered_entries(&archive, "xl/worksheets/sheet")
        .iter()
        .take(XLSX_MAX_SHEETS)
        .enumerate()
    {
        let xml = read_entry(&mut archive, name)?;
        let rows = sheet_rows(&xml, &shared)?;
        if rows.is_empty() {
            continue;
        }
        out.push_str(&format!("## Sheet {}\n\n", i + 1));
        for row in rows {
            out.push_str(&row.join(" | "));
            out.push('\n');
        }
        out.push('\n');
    }
    Ok(out)
}

/// Every `si` entry, concatenating rich-text runs.
fn shared_strings(xml: &[u8]) -> Result<Vec<String>, ExtractError> {
    let mut reader = Reader::from_reader(xml);
    let mut buf = Vec::new();
    let mut strings = Vec::new();
    let mut current: Option<String> = None;
    let mut in_text = false;
    loop {
        match reader.read_event_into(&mut buf).map_err(ooxml)? {
            Event::Start(e) => match e.local_name().as_ref() {
                b"si" => current = Some(String::new()),
                b"t" => in_text = true,
                _ => {}
            },
            Event::Text(te) if in_text => {
                if let Some(s) = current.as_mut() {
                    s.push_str(&te.unescape().map_err(ooxml)?);
                }
            }
            Event::End(e) => match e.local_name().as_ref() {
                b"t" => in_text = false,
                b"si" => strings.extend(current.take()),
                _ => {}
            },
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }
    Ok(strings)
}

fn sheet_rows(xml: &[u8], shared: &[String]) -> Result<Vec<Vec<String>>, ExtractError> {
    let mut reader = Reader::from_reader(xml);
    let mut buf = Vec::new();
    let mut rows = Vec::new();
    let mut row: Vec<String> = Vec::new();
    let mut cell_type: Option<String> = None;
    let mut in_value = false;
    let mut cells = 0usize;
    loop {
        if cells >= XLSX_MAX_CELLS_PER_SHEET {
            break;
        }
        match reader.read_event_into(&mut buf).map_err(ooxml)? {
            Event::Start(e) => match e.local_name().as_ref() {
                b"c" => cell_type = attribute(&e, b"t"),
                b"v" | b"t" => in_value = true,
                _ => {}
            },
            Event::Text(te) if in_value => {
                let raw = te.unescape().map_err(ooxml)?;
                let raw = raw.trim();
                let value = match cell_type.as_deref() {
                    Some("s") => raw
                        .parse::<usize>()
                        .ok()
                        .and_then(|i| shared.get(i).cloned()),
                    _ => Some(raw.to_string()),
                };
                if let Some(value) = value.filter(|v| !v.is_empty()) {
                    row.push(value);
                    cells += 1;
                }
            }
            Event::End(e) => match e.local_name().as_ref() {
                b"v" | b"t" => in_value = false,
                b"c" => cell_type = None,
                b"row" => {
                    if !row.is_empty() {
                        rows.push(std::mem::take(&mut row));
                    }
                }
                _ => {}
            },
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }
    if !row.is_empty() {
        rows.push(row);
    }
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use zip::write::SimpleFileOptions;

    fn zip_of(entries: &[(&str, &str)]) -> Vec<u8> {
        let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
        for (name, body) in entries {
            writer
                .start_file(*name, SimpleFileOptions::default())
                .unwrap();
            writer.write_all(body.as_bytes()).unwrap();
        }
        writer.finish().unwrap().into_inner()
    }

    #[test]
    fn unsupported_extension_returns_error() {
        let err = extract_markdown(b"foo", ".bin").unwrap_err();
        assert!(matches!(err, ExtractError::Unsupported(_)));
    }

    #[test]
    fn invalid_inputs_return_errors() {
        assert!(matches!(
            extract_markdown(b"not a pdf", ".pdf").unwrap_err(),
            ExtractError::Pdf(_)
        ));
        assert!(matches!(
            extract_markdown(b"not a zip", ".DOCX").unwrap_err(),
            ExtractError::Ooxml(_)
        ));
    }

    #[test]
    fn docx_headings_and_paragraphs() {
        let document = r#"<w:document xmlns:w="w"><w:body>
            <w:p><w:pPr><w:pStyle w:val="Heading1"/></w:pPr><w:r><w:t>Runbook</w:t></w:r></w:p>
            <w:p><w:r><w:t xml:space="preserve">Restart the </w:t></w:r><w:r><w:t>service.</w:t></w:r></w:p>
            <w:p><w:pPr><w:pStyle w:val="Heading2"/></w:pPr><w:r><w:t>Rollback</w:t></w:r></w:p>
        </w:body></w:document>"#;
        let bytes = zip_of(&[("word/document.xml", document)]);
        let md = extract_markdown(&bytes, ".docx").unwrap();
        assert_eq!(md, "# Runbook\n\nRestart the service.\n\n## Rollback\n\n");
    }

    #[test]
    fn pptx_slides_in_numeric_order() {
        let slide = |text: &str| {
            format!(
                r#"<p:sld xmlns:a="a" xmlns:p="p"><a:p><a:r><a:t>{}</a:t></a:r></a:p></p:sld>"#,
                text
            )
        };
        let (s1, s2, s10) = (slide("first"), slide("second"), slide("tenth"));
        let bytes = zip_of(&[
            ("ppt/slides/slide10.xml", s10.as_str()),
            ("ppt/slides/slide2.xml", s2.as_str()),
            ("ppt/slides/slide1.xml", s1.as_str()),
        ]);
        let md = extract_markdown(&bytes, ".pptx").unwrap();
        let first = md.find("first").unwrap();
        let second = md.find("second").unwrap();
        let tenth = md.find("tenth").unwrap();
        assert!(first < second && second < tenth);
        assert!(md.starts_with("## Slide 1\n\nfirst"));
    }

    #[test]
    fn xlsx_rows_resolve_shared_strings() {
        let shared = r#"<sst><si><t>name</t></si><si><r><t>ali</t></r><r><t>ce</t></r></si></sst>"#;
        let sheet = r#"<worksheet><sheetData>
            <row><c t="s"><v>0</v></c><c><v>42</v></c></row>
            <row><c t="s"><v>1</v></c><c t="inlineStr"><is><t>note</t></is></c></row>
        </sheetData></worksheet>"#;
        let bytes = zip_of(&[
            ("xl/sharedStrings.xml", shared),
            ("xl/worksheets/sheet1.xml", sheet),
        ]);
        let md = extract_markdown(&bytes, ".xlsx").unwrap();
        assert_eq!(md, "## Sheet 1\n\nname | 42\nalice | note\n\n");
    }
}
