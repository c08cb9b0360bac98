//! In-memory XML configuration document.
//!
//! The document is kept as a tree of raw `quick-xml` events so that
//! everything not explicitly patched (whitespace, comments, attribute
//! quoting, the declaration) is written back unchanged. `Parameter`
//! entries are indexed by their `name` attribute once per parse; all
//! lookups and insertions go through that index.

use quick_xml::events::{BytesDecl, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};
use std::collections::HashMap;

use crate::types::ParameterPatch;

const PARAMETER: &[u8] = b"Parameter";
const PARAMETERS: &[u8] = b"Parameters";
const NAME_ATTR: &[u8] = b"name";
const UTF8_BOM: &str = "\u{feff}";

#[derive(Debug, thiserror::Error)]
pub enum DocumentError {
    #[error("malformed XML: {0}")]
    Xml(#[from] quick_xml::Error),

    #[error("not valid UTF-8: {0}")]
    Encoding(#[from] std::str::Utf8Error),

    #[error("{0}")]
    Structure(&'static str),

    #[error("serialization failed: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone)]
enum Node {
    Element(Element),
    /// Text, comments, CDATA, processing instructions.
    Leaf(Event<'static>),
}

#[derive(Debug, Clone)]
struct Element {
    start: BytesStart<'static>,
    children: Vec<Node>,
    self_closing: bool,
}

impl Element {
    fn new(start: BytesStart<'static>, self_closing: bool) -> Self {
        Self {
            start,
            children: Vec::new(),
            self_closing,
        }
    }

    fn is(&self, name: &[u8]) -> bool {
        self.start.name().as_ref() == name
    }

    fn name_attr(&self) -> Option<String> {
        self.start
            .attributes()
            .flatten()
            .find(|a| a.key.as_ref() == NAME_ATTR)
            .and_then(|a| a.unescape_value().ok().map(|v| v.into_owned()))
    }

    fn set_text(&mut self, value: &str) {
        self.children = vec![Node::Leaf(Event::Text(BytesText::new(value).into_owned()))];
        self.self_closing = false;
    }

    #[cfg(test)]
    fn text(&self) -> String {
        self.children
            .iter()
            .filter_map(|c| match c {
                Node::Leaf(Event::Text(t)) => t.unescape().ok().map(|v| v.into_owned()),
                Node::Leaf(Event::CData(c)) => Some(String::from_utf8_lossy(c).into_owned()),
                _ => None,
            })
            .collect()
    }
}

fn descend<'a>(el: &'a mut Element, path: &[usize]) -> Option<&'a mut Element> {
    match path.split_first() {
        None => Some(el),
        Some((&i, rest)) => match el.children.get_mut(i)? {
            Node::Element(child) => descend(child, rest),
            Node::Leaf(_) => None,
        },
    }
}

#[cfg(test)]
fn descend_ref<'a>(el: &'a Element, path: &[usize]) -> Option<&'a Element> {
    match path.split_first() {
        None => Some(el),
        Some((&i, rest)) => match el.children.get(i)? {
            Node::Element(child) => descend_ref(child, rest),
            Node::Leaf(_) => None,
        },
    }
}

/// Counts from applying one [`ParameterPatch`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PatchSummary {
    pub updated: usize,
    pub created: usize,
}

/// Parsed configuration with a `name -> Parameter paths` index.
#[derive(Debug, Clone)]
pub struct ConfigDocument {
    bom: bool,
    decl: Option<BytesDecl<'static>>,
    prolog: Vec<Event<'static>>,
    root: Element,
    epilog: Vec<Event<'static>>,
    /// Child-index paths from the root, in document order.
    index: HashMap<String, Vec<Vec<usize>>>,
    /// Path of the first `Parameters` element below the root; empty = root.
    container: Vec<usize>,
}

impl ConfigDocument {
    /// Parse raw file content; a leading UTF-8 byte order mark is kept.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, DocumentError> {
        Self::parse(std::str::from_utf8(bytes)?)
    }

    pub fn parse(text: &str) -> Result<Self, DocumentError> {
        let (bom, text) = match text.strip_prefix(UTF8_BOM) {
            Some(rest) => (true, rest),
            None => (false, text),
        };
        let mut reader = Reader::from_str(text);
        let mut decl = None;
        let mut prolog = Vec::new();
        let mut epilog = Vec::new();
        let mut root: Option<Element> = None;
        let mut stack: Vec<Element> = Vec::new();

        loop {
            let finished = match reader.read_event()? {
                Event::Eof => None,
                Event::Decl(d) if root.is_none() && stack.is_empty() && decl.is_none() => {
                    decl = Some(d.into_owned());
                    continue;
                }
                Event::Start(s) => {
                    stack.push(Element::new(s.into_owned(), false));
                    continue;
                }
                Event::Empty(s) => Some(Element::new(s.into_owned(), true)),
                Event::End(_) => Some(
                    stack
                        .pop()
                        .ok_or(DocumentError::Structure("unexpected closing tag"))?,
                ),
                other => {
                    let other = other.into_owned();
                    if let Some(parent) = stack.last_mut() {
                        parent.children.push(Node::Leaf(other));
                    } else if root.is_none() {
                        prolog.push(other);
                    } else {
                        epilog.push(other);
                    }
                    continue;
                }
            };

            let Some(element) = finished else { break };
            if let Some(parent) = stack.last_mut() {
                parent.children.push(Node::Element(element));
            } else if root.is_none() {
                root = Some(element);
            } else {
                return Err(DocumentError::Structure("more than one root element"));
            }
        }

        if !stack.is_empty() {
            return Err(DocumentError::Structure("unclosed element at end of document"));
        }
        let root = root.ok_or(DocumentError::Structure("document has no root element"))?;

        let mut doc = Self {
            bom,
            decl,
            prolog,
            root,
            epilog,
            index: HashMap::new(),
            container: Vec::new(),
        };
        doc.build_index();
        Ok(doc)
    }

    fn build_index(&mut self) {
        fn walk(
            el: &Element,
            path: &mut Vec<usize>,
            index: &mut HashMap<String, Vec<Vec<usize>>>,
            container: &mut Option<Vec<usize>>,
        ) {
            for (i, child) in el.children.iter().enumerate() {
                let Node::Element(child) = child else { continue };
                path.push(i);
                if child.is(PARAMETER) {
                    if let Some(name) = child.name_attr() {
                        index.entry(name).or_default().push(path.clone());
                    }
                }
                if container.is_none() && child.is(PARAMETERS) {
                    *container = Some(path.clone());
                }
                walk(child, path, index, container);
                path.pop();
            }
        }

        let mut index = HashMap::new();
        let mut container = None;
        walk(&self.root, &mut Vec::new(), &mut index, &mut container);
        self.index = index;
        self.container = container.unwrap_or_default();
    }

    /// Set every entry named in `patch`; create the missing ones under the
    /// parameter container.
    pub fn apply(&mut self, patch: &ParameterPatch) -> PatchSummary {
        let mut summary = PatchSummary::default();
        for name in &patch.names {
            let paths = self.index.get(name).cloned().unwrap_or_default();
            if paths.is_empty() {
                self.create_parameter(name, &patch.value);
                summary.created += 1;
                continue;
            }
            for path in &paths {
                if let Some(el) = descend(&mut self.root, path) {
                    el.set_text(&patch.value);
                    summary.updated += 1;
                }
            }
        }
        summary
    }

    fn create_parameter(&mut self, name: &str, value: &str) {
        let mut start = BytesStart::new("Parameter");
        start.push_attribute(("name", name));
        let mut entry = Element::new(start, false);
        entry.set_text(value);

        let mut path = self.container.clone();
        let Some(container) = descend(&mut self.root, &path) else {
            return;
        };
        container.self_closing = false;
        container.children.push(Node::Element(entry));
        path.push(container.children.len() - 1);
        self.index.entry(name.to_string()).or_default().push(path);
    }

    /// Text values of every entry called `name`, in document order.
    #[cfg(test)]
    pub fn parameter_values(&self, name: &str) -> Vec<String> {
        self.index
            .get(name)
            .into_iter()
            .flatten()
            .filter_map(|path| descend_ref(&self.root, path))
            .map(Element::text)
            .collect()
    }

    #[cfg(test)]
    pub fn has_declaration(&self) -> bool {
        self.decl.is_some()
    }

    /// Serialize, keeping the original declaration or writing a UTF-8 one.
    pub fn to_bytes(&self) -> Result<Vec<u8>, DocumentError> {
        let mut writer = Writer::new(Vec::new());
        if self.bom {
            writer.get_mut().extend_from_slice(UTF8_BOM.as_bytes());
        }
        match &self.decl {
            Some(decl) => writer.write_event(Event::Decl(decl.clone()))?,
            None => {
                writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("utf-8"), None)))?;
                writer.get_mut().push(b'\n');
            }
        }
        for event in &self.prolog {
            writer.write_event(event.borrow())?;
        }
        write_element(&mut writer, &self.root)?;
        for event in &self.epilog {
            writer.write_event(event.borrow())?;
        }
        Ok(writer.into_inner())
    }
}

fn write_element(writer: &mut Writer<Vec<u8>>, el: &Element) -> Result<(), DocumentError> {
    if el.self_closing && el.children.is_empty() {
        writer.write_event(Event::Empty(el.start.borrow()))?;
        return Ok(());
    }
    writer.write_event(Event::Start(el.start.borrow()))?;
    for child in &el.children {
        match child {
            Node::Element(child) => write_element(writer, child)?,
            Node::Leaf(event) => writer.write_event(event.borrow())?,
        }
    }
    writer.write_event(Event::End(el.start.to_end()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const VRE_XML: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<!-- SA-CVA run -->
<ORE>
  <Setup>
    <Parameter name="asofDate">2016-02-05</Parameter>
    <Parameter name="pricingEnginesFile">cg/pricingengine_gpu.xml</Parameter>
  </Setup>
  <Analytics>
    <Analytic type="xvaSensitivity">
      <Parameter name="active">Y</Parameter>
      <Parameter name="xvaCgExternalComputeDevice">OpenCL/Apple/Apple M1</Parameter>
      <Parameter name="xvaCgUseExternalComputeDevice"/>
    </Analytic>
  </Analytics>
</ORE>
"#;

    const ENGINE_XML: &str = r#"<?xml version="1.0"?>
<PricingEngines>
  <GlobalParameters>
    <Parameters>
      <Parameter name="Calibrate">true</Parameter>
    </Parameters>
  </GlobalParameters>
  <Product type="ScriptedTrade">
    <EngineParameters>
      <Parameter name="ExternalComputeDevice">CUDA/NVIDIA/V100</Parameter>
    </EngineParameters>
  </Product>
  <Product type="Swap">
    <EngineParameters>
      <Parameter name="ExternalComputeDevice">CUDA/NVIDIA/V100</Parameter>
    </EngineParameters>
  </Product>
</PricingEngines>"#;

    fn patch(names: &[&str], value: &str) -> ParameterPatch {
        ParameterPatch::new(names.iter().copied(), value)
    }

    fn render(doc: &ConfigDocument) -> String {
        String::from_utf8(doc.to_bytes().unwrap()).unwrap()
    }

    #[test]
    fn test_untouched_document_round_trips() {
        let doc = ConfigDocument::parse(VRE_XML).unwrap();
        assert_eq!(render(&doc), VRE_XML);
        assert!(doc.has_declaration());
    }

    #[test]
    fn test_nested_entry_updated() {
        let mut doc = ConfigDocument::parse(VRE_XML).unwrap();
        let summary = doc.apply(&patch(&["xvaCgExternalComputeDevice"], "CUDA/NVIDIA/A100"));
        assert_eq!(summary, PatchSummary { updated: 1, created: 0 });

        let out = render(&doc);
        assert!(out.contains(
            r#"<Parameter name="xvaCgExternalComputeDevice">CUDA/NVIDIA/A100</Parameter>"#
        ));
        assert!(!out.contains("Apple M1"));
        assert!(out.starts_with(r#"<?xml version="1.0" encoding="UTF-8"?>"#));
        assert!(out.contains("<!-- SA-CVA run -->"));
    }

    #[test]
    fn test_self_closing_entry_gets_text() {
        let mut doc = ConfigDocument::parse(VRE_XML).unwrap();
        doc.apply(&patch(&["xvaCgUseExternalComputeDevice"], "true"));
        assert!(render(&doc).contains(
            r#"<Parameter name="xvaCgUseExternalComputeDevice">true</Parameter>"#
        ));
        assert_eq!(doc.parameter_values("xvaCgUseExternalComputeDevice"), vec!["true"]);
    }

    #[test]
    fn test_every_match_updated() {
        let mut doc = ConfigDocument::parse(ENGINE_XML).unwrap();
        let summary = doc.apply(&patch(&["ExternalComputeDevice"], "Metal/Apple/Apple M4 Max"));
        assert_eq!(summary.updated, 2);
        assert_eq!(
            doc.parameter_values("ExternalComputeDevice"),
            vec!["Metal/Apple/Apple M4 Max", "Metal/Apple/Apple M4 Max"]
        );
    }

    #[test]
    fn test_missing_entry_created_under_parameters() {
        let mut doc = ConfigDocument::parse(ENGINE_XML).unwrap();
        let summary = doc.apply(&patch(
            &["ExternalComputeDevice", "xvaCgExternalComputeDevice"],
            "CUDA/NVIDIA/A100",
        ));
        assert_eq!(summary, PatchSummary { updated: 2, created: 1 });

        let out = render(&doc);
        let created =
            r#"<Parameter name="xvaCgExternalComputeDevice">CUDA/NVIDIA/A100</Parameter>"#;
        let pos = out.find(created).unwrap();
        assert!(pos > out.find("<Parameters>").unwrap());
        assert!(pos < out.find("</Parameters>").unwrap());

        // Re-parsing finds the created entry.
        let reparsed = ConfigDocument::parse(&out).unwrap();
        assert_eq!(
            reparsed.parameter_values("xvaCgExternalComputeDevice"),
            vec!["CUDA/NVIDIA/A100"]
        );
    }

    #[test]
    fn test_missing_entry_created_under_root_without_container() {
        let mut doc = ConfigDocument::parse(VRE_XML).unwrap();
        doc.apply(&patch(&["UseExternalComputeDevice"], "true"));
        let out = render(&doc);
        assert!(out.contains(
            "<Parameter name=\"UseExternalComputeDevice\">true</Parameter></ORE>"
        ));
    }

    #[test]
    fn test_second_apply_updates_created_entry() {
        let mut doc = ConfigDocument::parse(VRE_XML).unwrap();
        doc.apply(&patch(&["ExternalComputeDevice"], "A"));
        let summary = doc.apply(&patch(&["ExternalComputeDevice"], "B"));
        assert_eq!(summary, PatchSummary { updated: 1, created: 0 });
        assert_eq!(doc.parameter_values("ExternalComputeDevice"), vec!["B"]);
    }

    #[test]
    fn test_value_is_escaped() {
        let mut doc = ConfigDocument::parse(ENGINE_XML).unwrap();
        doc.apply(&patch(&["ExternalComputeDevice"], "OpenCL/AMD/R&D <gpu>"));
        let out = render(&doc);
        assert!(out.contains("OpenCL/AMD/R&amp;D &lt;gpu&gt;"));
        let reparsed = ConfigDocument::parse(&out).unwrap();
        assert_eq!(
            reparsed.parameter_values("ExternalComputeDevice")[0],
            "OpenCL/AMD/R&D <gpu>"
        );
    }

    #[test]
    fn test_declaration_added_when_missing() {
        let mut doc = ConfigDocument::parse("<Parameters><Parameter name=\"x\">1</Parameter></Parameters>").unwrap();
        assert!(!doc.has_declaration());
        doc.apply(&patch(&["x"], "2"));
        assert_eq!(
            render(&doc),
            "<?xml version=\"1.0\" encoding=\"utf-8\"?>\n<Parameters><Parameter name=\"x\">2</Parameter></Parameters>"
        );
    }

    #[test]
    fn test_self_closing_container_expanded() {
        let mut doc = ConfigDocument::parse("<Root><Parameters/></Root>").unwrap();
        doc.apply(&patch(&["ExternalComputeDevice"], "CUDA/NVIDIA/A100"));
        assert!(render(&doc).ends_with(
            "<Root><Parameters><Parameter name=\"ExternalComputeDevice\">CUDA/NVIDIA/A100</Parameter></Parameters></Root>"
        ));
    }

    #[test]
    fn test_byte_order_mark_kept() {
        let source = format!("{UTF8_BOM}{ENGINE_XML}");
        let mut doc = ConfigDocument::from_bytes(source.as_bytes()).unwrap();
        doc.apply(&patch(&["ExternalComputeDevice"], "CUDA/NVIDIA/A100"));
        let out = doc.to_bytes().unwrap();
        assert!(out.starts_with(b"\xEF\xBB\xBF<?xml version=\"1.0\"?>"));
        assert_eq!(
            ConfigDocument::from_bytes(&out).unwrap().parameter_values("ExternalComputeDevice"),
            vec!["CUDA/NVIDIA/A100", "CUDA/NVIDIA/A100"]
        );
    }

    #[test]
    fn test_invalid_utf8_rejected() {
        let err = ConfigDocument::from_bytes(b"<ORE>\xff\xfe</ORE>").unwrap_err();
        assert!(matches!(err, DocumentError::Encoding(_)));
    }

    #[test]
    fn test_malformed_documents_rejected() {
        assert!(ConfigDocument::parse("<ORE><Setup></ORE>").is_err());
        assert!(ConfigDocument::parse("<ORE>").is_err());
        assert!(ConfigDocument::parse("").is_err());
        assert!(ConfigDocument::parse("<a/><b/>").is_err());
    }
}
