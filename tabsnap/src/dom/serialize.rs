use super::node::{NodeData, NodeRef};

const VOID_ELEMENTS: &[&str] = &[
    "area", "base", "br", "col", "embed", "hr", "img", "input", "link", "meta", "source", "track",
    "wbr",
];

const RAW_TEXT_ELEMENTS: &[&str] = &[
    "script", "style", "xmp", "iframe", "noembed", "noframes", "plaintext",
];

enum Step {
    /// A node to write, and whether its parent is a raw text element.
    Open(NodeRef, bool),
    Close(String),
}

impl NodeRef {
    /// HTML serialization of this node and its subtree.
    pub fn outer_html(&self) -> String {
        let mut out = String::new();
        let raw = self.parent().is_some_and(|p| is_raw_text(&p));
        serialize_into(&mut out, vec![Step::Open(self.clone(), raw)]);
        out
    }

    /// HTML serialization of the children only.
    pub fn inner_html(&self) -> String {
        let mut out = String::new();
        let raw = is_raw_text(self);
        let steps = self
            .children()
            .into_iter()
            .rev()
            .map(|child| Step::Open(child, raw))
            .collect();
        serialize_into(&mut out, steps);
        out
    }
}

fn serialize_into(out: &mut String, mut stack: Vec<Step>) {
    while let Some(step) = stack.pop() {
        let (node, raw) = match step {
            Step::Close(tag) => {
                out.push_str("</");
                out.push_str(&tag);
                out.push('>');
                continue;
            }
            Step::Open(node, raw) => (node, raw),
        };

        let inner = node.read();
        match &inner.data {
            NodeData::Text(text) => {
                if raw {
                    out.push_str(text);
                } else {
                    escape_text(out, text);
                }
            }
            NodeData::Comment(text) => {
                out.push_str("<!--");
                out.push_str(text);
                out.push_str("-->");
            }
            NodeData::Element(el) => {
                out.push('<');
                out.push_str(&el.tag);
                for (name, value) in &el.attributes {
                    out.push(' ');
                    out.push_str(name);
                    out.push_str("=\"");
                    escape_attribute(out, value);
                    out.push('"');
                }
                out.push('>');
                if VOID_ELEMENTS.contains(&el.tag.as_str()) {
                    continue;
                }
                stack.push(Step::Close(el.tag.clone()));
                let raw_children = RAW_TEXT_ELEMENTS.contains(&el.tag.as_str());
                for child in inner.children.iter().rev() {
                    stack.push(Step::Open(child.clone(), raw_children));
                }
            }
        }
    }
}

fn is_raw_text(node: &NodeRef) -> bool {
    node.tag_name()
        .is_some_and(|t| RAW_TEXT_ELEMENTS.contains(&t.as_str()))
}

fn escape_text(out: &mut String, text: &str) {
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '\u{a0}' => out.push_str("&nbsp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            c => out.push(c),
        }
    }
}

fn escape_attribute(out: &mut String, value: &str) {
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '\u{a0}' => out.push_str("&nbsp;"),
            '"' => out.push_str("&quot;"),
            c => out.push(c),
        }
    }
}
