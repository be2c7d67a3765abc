//! Generic XML tree reading and writing on top of quick-xml.

use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};

use passvault_common::{Error, Result};
use passvault_model::XmlElement;

fn malformed(msg: impl Into<String>) -> Error {
    Error::MalformedPayload(msg.into())
}

fn start_element(e: &BytesStart<'_>) -> Result<XmlElement> {
    let mut el = XmlElement::new(String::from_utf8_lossy(e.name().as_ref()).into_owned());
    for attr in e.attributes() {
        let attr = attr.map_err(|e| malformed(format!("Bad attribute: {}", e)))?;
        let value = attr
            .unescape_value()
            .map_err(|e| malformed(format!("Bad attribute value: {}", e)))?;
        el.attributes.push((
            String::from_utf8_lossy(attr.key.as_ref()).into_owned(),
            value.into_owned(),
        ));
    }
    Ok(el)
}

/// Close an element: indentation between children is not content.
fn finish(mut el: XmlElement) -> XmlElement {
    if !el.children.is_empty() && el.text.trim().is_empty() {
        el.text.clear();
    }
    el
}

/// Parse a whole document into its root element.
///
/// Text is kept verbatim (no trimming) for leaf elements, so values with
/// leading or trailing whitespace survive.
///
/// # Errors
/// - `MalformedPayload` for invalid UTF-8, syntax errors, mismatched or
///   unclosed tags, or a missing root element
pub fn parse_document(xml: &[u8]) -> Result<XmlElement> {
    let text = std::str::from_utf8(xml).map_err(|_| malformed("Payload is not UTF-8"))?;
    let text = text.trim_start_matches('\u{feff}');
    let mut reader = Reader::from_str(text);

    let mut stack: Vec<XmlElement> = Vec::new();
    let mut root: Option<XmlElement> = None;

    loop {
        let event = reader
            .read_event()
            .map_err(|e| malformed(format!("XML error at {}: {}", reader.buffer_position(), e)))?;
        match event {
            Event::Start(e) => stack.push(start_element(&e)?),
            Event::Empty(e) => {
                let el = start_element(&e)?;
                attach(&mut stack, &mut root, el)?;
            }
            Event::End(_) => {
                let el = stack.pop().ok_or_else(|| malformed("Unbalanced end tag"))?;
                attach(&mut stack, &mut root, finish(el))?;
            }
            Event::Text(t) => {
                let value = t
                    .unescape()
                    .map_err(|e| malformed(format!("Bad text: {}", e)))?;
                if let Some(current) = stack.last_mut() {
                    current.text.push_str(&value);
                }
            }
            Event::CData(c) => {
                if let Some(current) = stack.last_mut() {
                    current
                        .text
                        .push_str(&String::from_utf8_lossy(&c.into_inner()));
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }

    if !stack.is_empty() {
        return Err(malformed("Unclosed element at end of document"));
    }
    root.ok_or_else(|| malformed("Document has no root element"))
}

fn attach(
    stack: &mut [XmlElement],
    root: &mut Option<XmlElement>,
    el: XmlElement,
) -> Result<()> {
    match stack.last_mut() {
        Some(parent) => parent.children.push(el),
        None if root.is_none() => *root = Some(el),
        None => return Err(malformed("Document has more than one root element")),
    }
    Ok(())
}

/// Serialize a tree as an indented UTF-8 document with declaration.
pub fn write_document(root: &XmlElement) -> Result<Vec<u8>> {
    let mut writer = Writer::new_with_indent(Vec::new(), b'\t', 1);
    writer
        .write_event(Event::Decl(BytesDecl::new("1.0", Some("utf-8"), Some("yes"))))
        .map_err(|e| malformed(e.to_string()))?;
    write_element(&mut writer, root)?;
    let mut out = writer.into_inner();
    out.push(b'\n');
    Ok(out)
}

fn write_element(writer: &mut Writer<Vec<u8>>, el: &XmlElement) -> Result<()> {
    let mut start = BytesStart::new(el.name.as_str());
    for (key, value) in &el.attributes {
        start.push_attribute((key.as_str(), value.as_str()));
    }
    let map = |e: quick_xml::Error| malformed(e.to_string());

    writer.write_event(Event::Start(start)).map_err(map)?;
    if el.children.is_empty() {
        // Always emit the text event so the closing tag stays on this line.
        writer
            .write_event(Event::Text(BytesText::new(&el.text)))
            .map_err(map)?;
    } else {
        for child in &el.children {
            write_element(writer, child)?;
        }
    }
    writer
        .write_event(Event::End(BytesEnd::new(el.name.as_str())))
        .map_err(map)?;
    Ok(())
}
