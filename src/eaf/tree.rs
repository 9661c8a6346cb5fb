//! Lossless XML element tree over `quick-xml` events.
//!
//! Start tags, text, comments and declarations keep the exact bytes they were
//! read with, so writing an untouched tree reproduces the input. Only
//! elements whose attributes are rewritten through [`Element::set_attr`] are
//! re-encoded.

use quick_xml::events::{BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};

use crate::error::{CorpusError, Result};

/// A node inside an element.
#[derive(Debug, Clone)]
pub enum Node {
    Element(Element),
    Text(BytesText<'static>),
    /// Comments, CDATA, processing instructions, declarations, doctype.
    Other(Event<'static>),
}

impl Node {
    fn is_whitespace(&self) -> bool {
        matches!(self, Node::Text(text) if text.iter().all(u8::is_ascii_whitespace))
    }
}

/// An XML element with its original start tag.
#[derive(Debug, Clone)]
pub struct Element {
    start: BytesStart<'static>,
    children: Vec<Node>,
    self_closing: bool,
}

impl Element {
    /// Create an empty element with no attributes.
    #[must_use]
    pub fn new(name: &str) -> Self {
        Self {
            start: BytesStart::new(name.to_owned()),
            children: Vec::new(),
            self_closing: true,
        }
    }

    /// Builder form of [`Element::set_attr`].
    #[must_use]
    pub fn with_attr(mut self, key: &str, value: &str) -> Self {
        self.start.push_attribute((key, value));
        self
    }

    /// Builder form of [`Element::push_child`].
    #[must_use]
    pub fn with_child(mut self, child: Element) -> Self {
        self.push_child(child);
        self
    }

    /// Builder form of [`Element::set_text`].
    #[must_use]
    pub fn with_text(mut self, text: &str) -> Self {
        self.set_text(text);
        self
    }

    #[must_use]
    pub fn name(&self) -> &str {
        std::str::from_utf8(self.start.name().into_inner()).unwrap_or_default()
    }

    /// Unescaped value of an attribute.
    #[must_use]
    pub fn attr(&self, key: &str) -> Option<String> {
        self.start
            .attributes()
            .flatten()
            .find(|a| a.key.as_ref() == key.as_bytes())
            .and_then(|a| a.unescape_value().ok().map(std::borrow::Cow::into_owned))
    }

    /// All attributes in declaration order, unescaped.
    #[must_use]
    pub fn attrs(&self) -> Vec<(String, String)> {
        self.start
            .attributes()
            .flatten()
            .filter_map(|a| {
                let key = std::str::from_utf8(a.key.as_ref()).ok()?.to_owned();
                let value = a.unescape_value().ok()?.into_owned();
                Some((key, value))
            })
            .collect()
    }

    /// Set or replace an attribute, keeping the position of existing ones.
    pub fn set_attr(&mut self, key: &str, value: &str) {
        if self.attr(key).as_deref() == Some(value) {
            return;
        }
        let mut attrs = self.attrs();
        match attrs.iter_mut().find(|(k, _)| k == key) {
            Some(slot) => slot.1 = value.to_owned(),
            None => attrs.push((key.to_owned(), value.to_owned())),
        }

        let mut start = BytesStart::new(self.name().to_owned());
        for (k, v) in &attrs {
            start.push_attribute((k.as_str(), v.as_str()));
        }
        self.start = start;
    }

    /// Concatenated character data of the direct children.
    #[must_use]
    pub fn text(&self) -> String {
        let mut out = String::new();
        for node in &self.children {
            match node {
                Node::Text(text) => match text.unescape() {
                    Ok(s) => out.push_str(&s),
                    Err(_) => out.push_str(&String::from_utf8_lossy(text)),
                },
                Node::Other(Event::CData(data)) => out.push_str(&String::from_utf8_lossy(data)),
                _ => {}
            }
        }
        out
    }

    /// Replace all children with a single text node.
    pub fn set_text(&mut self, text: &str) {
        self.children.clear();
        if !text.is_empty() {
            self.children
                .push(Node::Text(BytesText::new(text).into_owned()));
        }
        self.self_closing = false;
    }

    pub fn children(&self) -> impl Iterator<Item = &Element> {
        self.children.iter().filter_map(|node| match node {
            Node::Element(el) => Some(el),
            _ => None,
        })
    }

    pub fn children_mut(&mut self) -> impl Iterator<Item = &mut Element> {
        self.children.iter_mut().filter_map(|node| match node {
            Node::Element(el) => Some(el),
            _ => None,
        })
    }

    #[must_use]
    pub fn child(&self, name: &str) -> Option<&Element> {
        self.children().find(|el| el.name() == name)
    }

    pub fn child_mut(&mut self, name: &str) -> Option<&mut Element> {
        self.children_mut().find(|el| el.name() == name)
    }

    /// Append a child, reusing the indentation of the existing siblings.
    pub fn push_child(&mut self, child: Element) {
        self.self_closing = false;

        let last_element = self
            .children
            .iter()
            .rposition(|node| matches!(node, Node::Element(_)));
        let indent = last_element
            .and_then(|i| i.checked_sub(1))
            .map(|i| &self.children[i])
            .filter(|node| node.is_whitespace())
            .cloned();

        let insert_at = match last_element {
            // keep the whitespace that sits before the closing tag at the end
            Some(i) => i + 1,
            None => self.children.len(),
        };

        match indent {
            Some(indent) => {
                self.children.insert(insert_at, Node::Element(child));
                self.children.insert(insert_at, indent);
            }
            None => self.children.insert(insert_at, Node::Element(child)),
        }
    }

    /// Remove the first child element matching `pred`, together with the
    /// indentation in front of it.
    pub fn remove_child_where(&mut self, pred: impl Fn(&Element) -> bool) -> Option<Element> {
        let index = self
            .children
            .iter()
            .position(|node| matches!(node, Node::Element(el) if pred(el)))?;
        let removed = self.children.remove(index);
        if index > 0 && self.children[index - 1].is_whitespace() {
            self.children.remove(index - 1);
        }
        match removed {
            Node::Element(el) => Some(el),
            _ => None,
        }
    }

    fn write(&self, writer: &mut Writer<Vec<u8>>) -> Result<()> {
        if self.self_closing && self.children.is_empty() {
            return write_event(writer, Event::Empty(self.start.clone()));
        }
        write_event(writer, Event::Start(self.start.clone()))?;
        for node in &self.children {
            write_node(writer, node)?;
        }
        write_event(writer, Event::End(BytesEnd::new(self.name().to_owned())))
    }
}

/// A parsed document: prolog nodes, the root element, trailing nodes.
#[derive(Debug, Clone)]
pub struct XmlTree {
    prolog: Vec<Node>,
    root: Element,
    epilog: Vec<Node>,
}

impl XmlTree {
    pub fn parse(xml: &str) -> Result<Self> {
        let mut reader = Reader::from_str(xml);
        let mut builder = TreeBuilder::default();

        loop {
            let position = reader.buffer_position();
            let event = reader
                .read_event()
                .map_err(|e| CorpusError::parse(format!("malformed XML near byte {position}: {e}")))?;

            match event {
                Event::Start(start) => builder.open(Element {
                    start: start.into_owned(),
                    children: Vec::new(),
                    self_closing: false,
                }),
                Event::End(_) => builder.close()?,
                Event::Empty(start) => builder.attach(Node::Element(Element {
                    start: start.into_owned(),
                    children: Vec::new(),
                    self_closing: true,
                })),
                Event::Text(text) => builder.attach(Node::Text(text.into_owned())),
                Event::Eof => break,
                other => builder.attach(Node::Other(other.into_owned())),
            }
        }

        builder.finish()
    }

    #[must_use]
    pub fn root(&self) -> &Element {
        &self.root
    }

    pub fn root_mut(&mut self) -> &mut Element {
        &mut self.root
    }

    pub fn to_xml_string(&self) -> Result<String> {
        let mut writer = Writer::new(Vec::new());
        for node in &self.prolog {
            write_node(&mut writer, node)?;
        }
        self.root.write(&mut writer)?;
        for node in &self.epilog {
            write_node(&mut writer, node)?;
        }
        String::from_utf8(writer.into_inner()).map_err(|e| CorpusError::Xml(e.to_string()))
    }
}

#[derive(Default)]
struct TreeBuilder {
    stack: Vec<Element>,
    prolog: Vec<Node>,
    root: Option<Element>,
    epilog: Vec<Node>,
}

impl TreeBuilder {
    fn open(&mut self, element: Element) {
        self.stack.push(element);
    }

    fn close(&mut self) -> Result<()> {
        let element = self
            .stack
            .pop()
            .ok_or_else(|| CorpusError::parse("closing tag without matching start tag"))?;
        self.attach(Node::Element(element));
        Ok(())
    }

    fn attach(&mut self, node: Node) {
        if let Some(parent) = self.stack.last_mut() {
            parent.children.push(node);
            return;
        }
        match (node, self.root.is_some()) {
            (Node::Element(el), false) => self.root = Some(el),
            (node, false) => self.prolog.push(node),
            (node, true) => self.epilog.push(node),
        }
    }

    fn finish(self) -> Result<XmlTree> {
        if let Some(open) = self.stack.last() {
            return Err(CorpusError::parse(format!(
                "unexpected end of document inside <{}>",
                open.name()
            )));
        }
        let root = self
            .root
            .ok_or_else(|| CorpusError::parse("document has no root element"))?;
        Ok(XmlTree {
            prolog: self.prolog,
            root,
            epilog: self.epilog,
        })
    }
}

fn write_node(writer: &mut Writer<Vec<u8>>, node: &Node) -> Result<()> {
    match node {
        Node::Element(el) => el.write(writer),
        Node::Text(text) => write_event(writer, Event::Text(text.clone())),
        Node::Other(event) => write_event(writer, event.clone()),
    }
}

fn write_event(writer: &mut Writer<Vec<u8>>, event: Event<'_>) -> Result<()> {
    writer
        .write_event(event)
        .map_err(|e| CorpusError::Xml(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<!-- corpus export -->
<ROOT a="1"  b='two'>
    <LIST>
        <ITEM ID="x1">first &amp; only</ITEM>
        <EMPTY/>
    </LIST>
</ROOT>
"#;

    #[test]
    fn test_untouched_tree_is_byte_identical() {
        let tree = XmlTree::parse(SAMPLE).unwrap();
        assert_eq!(tree.to_xml_string().unwrap(), SAMPLE);
    }

    #[test]
    fn test_attribute_and_text_access() {
        let tree = XmlTree::parse(SAMPLE).unwrap();
        let root = tree.root();
        assert_eq!(root.name(), "ROOT");
        assert_eq!(root.attr("b").as_deref(), Some("two"));
        let item = root.child("LIST").unwrap().child("ITEM").unwrap();
        assert_eq!(item.text(), "first & only");
        assert_eq!(item.attr("missing"), None);
    }

    #[test]
    fn test_set_attr_rewrites_only_that_tag() {
        let mut tree = XmlTree::parse(SAMPLE).unwrap();
        tree.root_mut()
            .child_mut("LIST")
            .unwrap()
            .child_mut("ITEM")
            .unwrap()
            .set_attr("ID", "x2");
        let out = tree.to_xml_string().unwrap();
        assert!(out.contains(r#"<ITEM ID="x2">first &amp; only</ITEM>"#));
        assert!(out.contains(r#"<ROOT a="1"  b='two'>"#));
    }

    #[test]
    fn test_push_and_remove_child_restore_layout() {
        let mut tree = XmlTree::parse(SAMPLE).unwrap();
        let list = tree.root_mut().child_mut("LIST").unwrap();
        list.push_child(Element::new("ITEM").with_attr("ID", "x9").with_text("new"));
        let added = tree.to_xml_string().unwrap();
        assert!(added.contains("<EMPTY/>\n        <ITEM ID=\"x9\">new</ITEM>\n    </LIST>"));

        let list = tree.root_mut().child_mut("LIST").unwrap();
        let removed = list.remove_child_where(|el| el.attr("ID").as_deref() == Some("x9"));
        assert!(removed.is_some());
        assert_eq!(tree.to_xml_string().unwrap(), SAMPLE);
    }

    #[test]
    fn test_malformed_documents_are_rejected() {
        assert!(matches!(
            XmlTree::parse("<ROOT><A></ROOT>"),
            Err(CorpusError::Parse(_))
        ));
        assert!(matches!(XmlTree::parse("<ROOT>"), Err(CorpusError::Parse(_))));
        assert!(matches!(XmlTree::parse("   "), Err(CorpusError::Parse(_))));
    }
}
