//! Local XML save/load for spreadsheet documents.
//!
//! The document format is shared with the server's JOIN payload:
//!
//! ```xml
//! <spreadsheet version="V">
//!   <cell><name>C</name><contents>S</contents></cell>
//! </spreadsheet>
//! ```
//!
//! `S` is the authored form of the cell (text verbatim, a number's string
//! rendering, or `=` plus the formula), so re-applying each `<cell>` through
//! `set_contents` reproduces the saved sheet exactly.

use std::fmt;
use std::fs;
use std::path::Path;

use quick_xml::escape::escape;
use quick_xml::events::Event;
use quick_xml::Reader;

use gridlink_engine::sheet::Spreadsheet;

/// A local save or load that could not complete: file I/O failure, malformed
/// XML, or a document missing its required fields.
#[derive(Debug, Clone)]
pub struct ReadWriteError {
    pub message: String,
}

impl ReadWriteError {
    pub fn new(message: impl Into<String>) -> ReadWriteError {
        ReadWriteError {
            message: message.into(),
        }
    }
}

impl fmt::Display for ReadWriteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for ReadWriteError {}

/// A parsed spreadsheet document: the saved version string and the cells in
/// document order.
#[derive(Debug, Clone, PartialEq)]
pub struct SheetDocument {
    pub version: String,
    pub cells: Vec<(String, String)>,
}

/// Render a spreadsheet to its XML document form.
pub fn to_xml(sheet: &Spreadsheet, version: &str) -> String {
    // Sorted output keeps saves diffable and deterministic.
    let mut names: Vec<&str> = sheet.nonempty_names().collect();
    names.sort_unstable();

    let mut out = String::new();
    out.push_str(&format!("<spreadsheet version=\"{}\">\n", escape(version)));
    for name in names {
        let contents = match sheet.contents(name) {
            Ok(contents) => contents.to_string(),
            // Names from the store always revalidate; nothing to write if not.
            Err(_) => continue,
        };
        out.push_str(&format!(
            "  <cell><name>{}</name><contents>{}</contents></cell>\n",
            escape(name),
            escape(&contents)
        ));
    }
    out.push_str("</spreadsheet>\n");
    out
}

/// Write a spreadsheet to `path`.
pub fn save_spreadsheet(
    sheet: &Spreadsheet,
    version: &str,
    path: &Path,
) -> Result<(), ReadWriteError> {
    let xml = to_xml(sheet, version);
    fs::write(path, xml)
        .map_err(|e| ReadWriteError::new(format!("cannot write {}: {}", path.display(), e)))
}

/// Parse a spreadsheet document from XML text.
///
/// Used for both local files and the JOIN payload. Cells come back in
/// document order; applying them in order through `set_contents` rebuilds
/// the sheet. A formula may briefly reference a cell that arrives later;
/// it is recomputed when that cell lands.
pub fn read_cells(xml: &str) -> Result<SheetDocument, ReadWriteError> {
    #[derive(Clone, Copy)]
    enum Field {
        Name,
        Contents,
    }

    // Text nodes are significant here: cell contents may carry leading or
    // trailing whitespace. Indentation between elements lands outside any
    // <name>/<contents> field and is ignored below.
    let mut reader = Reader::from_str(xml);

    let mut version: Option<String> = None;
    let mut cells: Vec<(String, String)> = Vec::new();
    let mut cur_name: Option<String> = None;
    let mut cur_contents: Option<String> = None;
    let mut field: Option<Field> = None;

    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(ref e)) | Ok(Event::Empty(ref e)) => match e.name().as_ref() {
                b"spreadsheet" => {
                    for attr in e.attributes().flatten() {
                        if attr.key.as_ref() == b"version" {
                            let raw = attr
                                .unescape_value()
                                .map_err(|e| ReadWriteError::new(format!("bad version attribute: {}", e)))?;
                            version = Some(raw.into_owned());
                        }
                    }
                }
                b"cell" => {
                    cur_name = None;
                    cur_contents = None;
                }
                b"name" => field = Some(Field::Name),
                b"contents" => {
                    field = Some(Field::Contents);
                    // <contents/> (or an all-whitespace body trimmed away
                    // below) means empty contents.
                    cur_contents = Some(String::new());
                }
                other => {
                    return Err(ReadWriteError::new(format!(
                        "unexpected element <{}>",
                        String::from_utf8_lossy(other)
                    )));
                }
            },
            Ok(Event::Text(ref t)) => {
                let text = t
                    .unescape()
                    .map_err(|e| ReadWriteError::new(format!("bad text node: {}", e)))?
                    .into_owned();
                match field {
                    Some(Field::Name) => cur_name = Some(text),
                    Some(Field::Contents) => cur_contents = Some(text),
                    None => {}
                }
            }
            Ok(Event::End(ref e)) => match e.name().as_ref() {
                b"name" | b"contents" => field = None,
                b"cell" => {
                    let name = cur_name
                        .take()
                        .ok_or_else(|| ReadWriteError::new("cell without a <name>"))?;
                    let contents = cur_contents.take().unwrap_or_default();
                    cells.push((name, contents));
                }
                _ => {}
            },
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => return Err(ReadWriteError::new(format!("malformed XML: {}", e))),
        }
        buf.clear();
    }

    let version = version.ok_or_else(|| {
        ReadWriteError::new("document has no <spreadsheet version=...> root")
    })?;

    Ok(SheetDocument { version, cells })
}

/// Read a saved document from `path`.
pub fn load_spreadsheet(path: &Path) -> Result<SheetDocument, ReadWriteError> {
    let xml = fs::read_to_string(path)
        .map_err(|e| ReadWriteError::new(format!("cannot read {}: {}", path.display(), e)))?;
    read_cells(&xml)
}

/// Read only the `version` attribute of a saved document, without loading
/// its cells.
pub fn saved_version(path: &Path) -> Result<String, ReadWriteError> {
    let xml = fs::read_to_string(path)
        .map_err(|e| ReadWriteError::new(format!("cannot read {}: {}", path.display(), e)))?;

    let mut reader = Reader::from_str(&xml);
    reader.config_mut().trim_text(true);
    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(ref e)) | Ok(Event::Empty(ref e))
                if e.name().as_ref() == b"spreadsheet" =>
            {
                for attr in e.attributes().flatten() {
                    if attr.key.as_ref() == b"version" {
                        let raw = attr.unescape_value().map_err(|e| {
                            ReadWriteError::new(format!("bad version attribute: {}", e))
                        })?;
                        return Ok(raw.into_owned());
                    }
                }
                return Err(ReadWriteError::new("spreadsheet element has no version"));
            }
            Ok(Event::Eof) => {
                return Err(ReadWriteError::new("no spreadsheet element found"));
            }
            Ok(_) => {}
            Err(e) => return Err(ReadWriteError::new(format!("malformed XML: {}", e))),
        }
        buf.clear();
    }
}
