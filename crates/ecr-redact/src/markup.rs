//! Owned HTML tree produced by the rewrite pass, and its serializers.

use scraper::{ElementRef, Html, Node as DomNode};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    Element(Element),
    Text(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Element {
    pub name: String,
    pub attrs: Vec<(String, String)>,
    pub children: Vec<Node>,
}

impl Element {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            attrs: Vec::new(),
            children: Vec::new(),
        }
    }

    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    pub fn set_attr(&mut self, name: &str, value: impl Into<String>) {
        let value = value.into();
        match self.attrs.iter_mut().find(|(key, _)| key == name) {
            Some(slot) => slot.1 = value,
            None => self.attrs.push((name.to_string(), value)),
        }
    }

    pub fn remove_attr(&mut self, name: &str) {
        self.attrs.retain(|(key, _)| key != name);
    }

    pub fn text(&self) -> String {
        let mut out = String::new();
        collect_text(&self.children, &mut out);
        out
    }
}

fn collect_text(nodes: &[Node], out: &mut String) {
    for node in nodes {
        match node {
            Node::Text(text) => out.push_str(text),
            Node::Element(el) => collect_text(&el.children, out),
        }
    }
}

const VOID: &[&str] = &["br", "hr", "img", "meta", "link", "input", "col", "area", "base", "wbr"];

pub fn escape_text(text: &str, out: &mut String) {
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '\u{a0}' => out.push_str("&#160;"),
            _ => out.push(c),
        }
    }
}

fn escape_attr(value: &str, out: &mut String) {
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(c),
        }
    }
}

fn render(nodes: &[Node], xhtml: bool, out: &mut String) {
    for node in nodes {
        match node {
            Node::Text(text) => escape_text(text, out),
            Node::Element(el) => {
                out.push('<');
                out.push_str(&el.name);
                for (key, value) in &el.attrs {
                    out.push(' ');
                    out.push_str(key);
                    out.push_str("=\"");
                    escape_attr(value, out);
                    out.push('"');
                }
                if VOID.contains(&el.name.as_str()) {
                    out.push_str(if xhtml { " />" } else { ">" });
                    continue;
                }
                out.push('>');
                render(&el.children, xhtml, out);
                out.push_str("</");
                out.push_str(&el.name);
                out.push('>');
            }
        }
    }
}

pub fn render_html(nodes: &[Node]) -> String {
    let mut out = String::new();
    render(nodes, false, &mut out);
    out
}

/// Same tree, serialized as well-formed XML for ePub content documents.
pub fn render_xhtml(nodes: &[Node]) -> String {
    let mut out = String::new();
    render(nodes, true, &mut out);
    out
}

/// Copy a parsed element and its subtree verbatim. Comments and doctypes are dropped.
pub fn from_element(element: ElementRef<'_>) -> Element {
    let mut out = Element::new(element.value().name());
    out.attrs = element
        .value()
        .attrs()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    for child in element.children() {
        match child.value() {
            DomNode::Text(text) => out.children.push(Node::Text(String::from(&**text))),
            DomNode::Element(_) => {
                if let Some(el) = ElementRef::wrap(child) {
                    out.children.push(Node::Element(from_element(el)));
                }
            }
            _ => {}
        }
    }
    out
}

/// Parse an HTML fragment (e.g. a redacted report body) into owned nodes.
pub fn parse_fragment(html: &str) -> Vec<Node> {
    let fragment = Html::parse_fragment(html);
    let root = fragment.root_element();
    from_element(root).children
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializers_escape_and_close_void_elements() {
        let mut p = Element::new("p");
        p.set_attr("title", "a \"q\" & b");
        p.children.push(Node::Text("1 < 2 & 3".into()));
        p.children.push(Node::Element(Element::new("br")));
        let nodes = vec![Node::Element(p)];

        assert_eq!(
            render_html(&nodes),
            "<p title=\"a &quot;q&quot; &amp; b\">1 &lt; 2 &amp; 3<br></p>"
        );
        assert_eq!(
            render_xhtml(&nodes),
            "<p title=\"a &quot;q&quot; &amp; b\">1 &lt; 2 &amp; 3<br /></p>"
        );
    }

    #[test]
    fn fragments_round_trip_through_the_owned_tree() {
        let nodes = parse_fragment("<p>One <b>two</b><!-- gone --></p><hr>");
        assert_eq!(render_html(&nodes), "<p>One <b>two</b></p><hr>");
    }
}
