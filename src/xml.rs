use indexmap::IndexMap;
use quick_xml::Reader;
use quick_xml::events::Event;

/// The XML shape this crate deals in: BBB responses and our own envelopes
/// are trees of elements whose leaves are text. Repeated sibling tags fold
/// into a `List` under the shared tag name, so a single `<meeting>` and a
/// run of them read the same way after normalization.
#[derive(Debug, Clone, PartialEq)]
pub enum XmlValue {
    Text(String),
    Node(IndexMap<String, XmlValue>),
    List(Vec<XmlValue>),
    /// Emitted verbatim, without escaping. Used to inline an already-XML
    /// body (the player service response) into an envelope.
    Raw(String),
}

#[derive(Debug)]
pub struct XmlError(pub String);

impl std::fmt::Display for XmlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "XMLSyntaxError: {}", self.0)
    }
}

fn syntax<E: std::fmt::Display>(e: E) -> XmlError {
    XmlError(e.to_string())
}

impl XmlValue {
    pub fn text(s: impl Into<String>) -> XmlValue {
        XmlValue::Text(s.into())
    }

    pub fn node<I>(entries: I) -> XmlValue
    where
        I: IntoIterator<Item = (&'static str, XmlValue)>,
    {
        XmlValue::Node(
            entries
                .into_iter()
                .map(|(k, v)| (k.to_string(), v))
                .collect(),
        )
    }

    pub fn get(&self, key: &str) -> Option<&XmlValue> {
        match self {
            XmlValue::Node(map) => map.get(key),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            XmlValue::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Text content of a direct child, if it has one.
    pub fn str_of(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(|v| v.as_str())
    }

    /// Normalize the "single element vs list" ambiguity: a `List` yields its
    /// items, anything else yields itself.
    pub fn items(&self) -> Vec<&XmlValue> {
        match self {
            XmlValue::List(items) => items.iter().collect(),
            other => vec![other],
        }
    }
}

/// Parse an XML document into a `Node` mapping the root tag(s) to their
/// content. Attributes are ignored; BBB's wire format never uses them.
pub fn parse(input: &str) -> Result<XmlValue, XmlError> {
    struct Frame {
        tag: String,
        children: IndexMap<String, XmlValue>,
        text: String,
    }

    fn insert_child(frame: &mut Frame, tag: String, value: XmlValue) {
        match frame.children.get_mut(&tag) {
            Some(XmlValue::List(items)) => items.push(value),
            Some(existing) => {
                let prev = std::mem::replace(existing, XmlValue::List(Vec::new()));
                if let XmlValue::List(items) = existing {
                    items.push(prev);
                    items.push(value);
                }
            }
            None => {
                frame.children.insert(tag, value);
            }
        }
    }

    let mut reader = Reader::from_str(input);
    reader.config_mut().trim_text(true);

    let mut stack: Vec<Frame> = vec![Frame {
        tag: String::new(),
        children: IndexMap::new(),
        text: String::new(),
    }];

    loop {
        match reader.read_event().map_err(syntax)? {
            Event::Start(e) => {
                let tag = String::from_utf8_lossy(e.name().as_ref()).into_owned();
                stack.push(Frame {
                    tag,
                    children: IndexMap::new(),
                    text: String::new(),
                });
            }
            Event::Empty(e) => {
                let tag = String::from_utf8_lossy(e.name().as_ref()).into_owned();
                let frame = stack.last_mut().unwrap();
                insert_child(frame, tag, XmlValue::Text(String::new()));
            }
            Event::Text(t) => {
                let text = t.unescape().map_err(syntax)?;
                stack.last_mut().unwrap().text.push_str(&text);
            }
            Event::CData(t) => {
                let text = String::from_utf8_lossy(&t.into_inner()).into_owned();
                stack.last_mut().unwrap().text.push_str(&text);
            }
            Event::End(_) => {
                let frame = stack.pop().ok_or_else(|| syntax("unbalanced end tag"))?;
                if stack.is_empty() {
                    return Err(syntax("unbalanced end tag"));
                }
                let value = if frame.children.is_empty() {
                    XmlValue::Text(frame.text)
                } else {
                    XmlValue::Node(frame.children)
                };
                insert_child(stack.last_mut().unwrap(), frame.tag, value);
            }
            Event::Eof => break,
            _ => {}
        }
    }

    if stack.len() != 1 {
        return Err(syntax("truncated document"));
    }
    Ok(XmlValue::Node(stack.pop().unwrap().children))
}

/// Parse a BBB response body and return the content of its single
/// top-level `<response>` element.
pub fn parse_response(input: &str) -> Result<XmlValue, XmlError> {
    parse(input)?
        .get("response")
        .cloned()
        .ok_or_else(|| syntax("missing <response> root"))
}

/// Serialize a document. The top-level value must be a `Node`; each entry
/// becomes a root element.
pub fn emit(root: &XmlValue) -> String {
    let mut out = String::from("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n");
    if let XmlValue::Node(map) = root {
        for (tag, value) in map {
            emit_element(&mut out, tag, value);
        }
    }
    out
}

fn emit_element(out: &mut String, tag: &str, value: &XmlValue) {
    match value {
        XmlValue::Text(s) => {
            out.push('<');
            out.push_str(tag);
            out.push('>');
            out.push_str(&quick_xml::escape::escape(s.as_str()));
            out.push_str("</");
            out.push_str(tag);
            out.push('>');
        }
        XmlValue::Raw(s) => {
            out.push('<');
            out.push_str(tag);
            out.push('>');
            out.push_str(s);
            out.push_str("</");
            out.push_str(tag);
            out.push('>');
        }
        XmlValue::Node(map) => {
            out.push('<');
            out.push_str(tag);
            out.push('>');
            for (child_tag, child) in map {
                emit_element(out, child_tag, child);
            }
            out.push_str("</");
            out.push_str(tag);
            out.push('>');
        }
        // A list repeats the enclosing tag for each item
        XmlValue::List(items) => {
            for item in items {
                emit_element(out, tag, item);
            }
        }
    }
}
