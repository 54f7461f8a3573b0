//! A small, forgiving XML-like markup reader.
//!
//! Rule files and templates are XML in spirit but frequently hand-written,
//! so the lenient reader never fails: stray closing tags become text and
//! unclosed elements are closed at the end of the input. The strict reader
//! reports the first structural problem instead.

use crate::error::EngineError;

/// A node of the generic markup tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Markup {
    Text(String),
    Element(Element),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Element {
    /// Lowercased tag name.
    pub name: String,
    pub attrs: Vec<(String, String)>,
    pub children: Vec<Markup>,
}

impl Element {
    fn new(name: String, attrs: Vec<(String, String)>) -> Self {
        Self {
            name,
            attrs,
            children: Vec::new(),
        }
    }

    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    /// Direct child elements with the given name.
    pub fn child_elements<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Element> + 'a {
        self.children.iter().filter_map(move |c| match c {
            Markup::Element(e) if e.name == name => Some(e),
            _ => None,
        })
    }

    /// Concatenated text of all descendants, tags dropped.
    pub fn text(&self) -> String {
        let mut out = String::new();
        collect_text(&self.children, &mut out);
        out
    }

    /// The element's children serialized back to markup.
    pub fn inner_markup(&self) -> String {
        to_markup(&self.children)
    }
}

fn collect_text(nodes: &[Markup], out: &mut String) {
    for node in nodes {
        match node {
            Markup::Text(t) => out.push_str(t),
            Markup::Element(e) => collect_text(&e.children, out),
        }
    }
}

/// Tags that never have content, with or without a trailing `/`.
fn is_void(name: &str) -> bool {
    matches!(name, "star" | "thatstar" | "topicstar" | "br" | "sr")
        || name
            .strip_prefix("wild")
            .is_some_and(|n| !n.is_empty() && n.chars().all(|c| c.is_ascii_digit()))
}

/// Parse leniently. Never fails.
pub fn parse(src: &str) -> Vec<Markup> {
    match Reader::new(src, false).run() {
        Ok(nodes) => nodes,
        Err(_) => vec![Markup::Text(src.to_string())],
    }
}

/// Parse strictly, reporting the first structural error.
pub fn parse_strict(src: &str) -> Result<Vec<Markup>, EngineError> {
    Reader::new(src, true).run()
}

struct Reader<'a> {
    src: &'a str,
    pos: usize,
    strict: bool,
    stack: Vec<Element>,
    root: Vec<Markup>,
    text: String,
}

impl<'a> Reader<'a> {
    fn new(src: &'a str, strict: bool) -> Self {
        Self {
            src,
            pos: 0,
            strict,
            stack: Vec::new(),
            root: Vec::new(),
            text: String::new(),
        }
    }

    fn run(mut self) -> Result<Vec<Markup>, EngineError> {
        let src = self.src;
        while self.pos < src.len() {
            let rest = &src[self.pos..];
            if let Some(after) = rest.strip_prefix("<!--") {
                let skip = after.find("-->").map(|i| i + 3).unwrap_or(after.len());
                self.pos += 4 + skip;
            } else if let Some(after) = rest.strip_prefix("<![CDATA[") {
                let end = after.find("]]>").unwrap_or(after.len());
                self.text.push_str(&after[..end]);
                self.pos += 9 + (end + 3).min(after.len());
            } else if rest.starts_with("<?") || rest.starts_with("<!") {
                let skip = rest.find('>').map(|i| i + 1).unwrap_or(rest.len());
                self.pos += skip;
            } else if rest.starts_with("</") {
                self.close_tag(rest)?;
            } else if rest.starts_with('<') {
                self.open_tag(rest)?;
            } else {
                let end = rest.find('<').unwrap_or(rest.len());
                self.text.push_str(&decode_entities(&rest[..end]));
                self.pos += end;
            }
        }

        self.flush_text();
        if let Some(open) = self.stack.last() {
            if self.strict {
                return Err(self.error(format!("unclosed <{}>", open.name)));
            }
        }
        while let Some(element) = self.stack.pop() {
            self.push_node(Markup::Element(element));
        }
        Ok(self.root)
    }

    fn open_tag(&mut self, rest: &str) -> Result<(), EngineError> {
        let Some((name, attrs, self_closing, len)) = parse_open_tag(rest) else {
            if self.strict {
                return Err(self.error("malformed tag".into()));
            }
            self.text.push('<');
            self.pos += 1;
            return Ok(());
        };
        self.flush_text();
        self.pos += len;
        let element = Element::new(name, attrs);
        if self_closing || is_void(&element.name) {
            self.push_node(Markup::Element(element));
        } else {
            self.stack.push(element);
        }
        Ok(())
    }

    fn close_tag(&mut self, rest: &str) -> Result<(), EngineError> {
        let end = rest.find('>');
        let name = end
            .map(|e| rest[2..e].trim().to_ascii_lowercase())
            .filter(|n| !n.is_empty() && n.chars().all(is_name_char));
        let (Some(end), Some(name)) = (end, name) else {
            if self.strict {
                return Err(self.error("malformed closing tag".into()));
            }
            self.text.push('<');
            self.pos += 1;
            return Ok(());
        };

        if is_void(&name) {
            self.pos += end + 1;
            return Ok(());
        }

        let Some(index) = self.stack.iter().rposition(|e| e.name == name) else {
            if self.strict {
                return Err(self.error(format!("unexpected </{name}>")));
            }
            self.text.push_str(&rest[..=end]);
            self.pos += end + 1;
            return Ok(());
        };
        if self.strict && index + 1 != self.stack.len() {
            let open = &self.stack[self.stack.len() - 1].name;
            return Err(self.error(format!("</{name}> closes unclosed <{open}>")));
        }

        self.flush_text();
        self.pos += end + 1;
        while self.stack.len() > index {
            if let Some(element) = self.stack.pop() {
                self.push_node(Markup::Element(element));
            }
        }
        Ok(())
    }

    fn flush_text(&mut self) {
        if !self.text.is_empty() {
            let text = std::mem::take(&mut self.text);
            self.push_node(Markup::Text(text));
        }
    }

    fn push_node(&mut self, node: Markup) {
        match self.stack.last_mut() {
            Some(parent) => parent.children.push(node),
            None => self.root.push(node),
        }
    }

    fn error(&self, reason: String) -> EngineError {
        let line = self.src[..self.pos.min(self.src.len())].matches('\n').count() + 1;
        EngineError::InvalidMarkup { line, reason }
    }
}

fn is_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | ':' | '.')
}

/// Parse `<name attr="v" ...>` at the start of `s`. Returns the lowercased
/// name, attributes, whether it was self-closing and the consumed length.
fn parse_open_tag(s: &str) -> Option<(String, Vec<(String, String)>, bool, usize)> {
    let bytes = s.as_bytes();
    let mut i = 1;
    let name_start = i;
    if !bytes.get(i).is_some_and(|b| b.is_ascii_alphabetic()) {
        return None;
    }
    while i < bytes.len() && is_name_char(bytes[i] as char) {
        i += 1;
    }
    let name = s[name_start..i].to_ascii_lowercase();
    let mut attrs = Vec::new();

    loop {
        while i < bytes.len() && bytes[i].is_ascii_whitespace() {
            i += 1;
        }
        match *bytes.get(i)? {
            b'>' => return Some((name, attrs, false, i + 1)),
            b'/' => {
                return (bytes.get(i + 1) == Some(&b'>')).then_some((name, attrs, true, i + 2));
            }
            _ => {}
        }

        let key_start = i;
        while i < bytes.len() && is_name_char(bytes[i] as char) {
            i += 1;
        }
        if key_start == i {
            return None;
        }
        let key = s[key_start..i].to_ascii_lowercase();
        while i < bytes.len() && bytes[i].is_ascii_whitespace() {
            i += 1;
        }
        if bytes.get(i) != Some(&b'=') {
            return None;
        }
        i += 1;
        while i < bytes.len() && bytes[i].is_ascii_whitespace() {
            i += 1;
        }
        let quote = *bytes.get(i)?;
        if quote != b'"' && quote != b'\'' {
            return None;
        }
        i += 1;
        let value_start = i;
        while i < bytes.len() && bytes[i] != quote {
            i += 1;
        }
        if i >= bytes.len() {
            return None;
        }
        attrs.push((key, decode_entities(&s[value_start..i])));
        i += 1;
    }
}

/// Decode the XML predefined entities and numeric character references.
pub fn decode_entities(s: &str) -> String {
    if !s.contains('&') {
        return s.to_string();
    }
    let mut out = String::with_capacity(s.len());
    let mut rest = s;
    while let Some(amp) = rest.find('&') {
        out.push_str(&rest[..amp]);
        let after = &rest[amp..];
        let decoded = after.find(';').filter(|&semi| semi <= 10).and_then(|semi| {
            let entity = &after[1..semi];
            let c = match entity {
                "lt" => Some('<'),
                "gt" => Some('>'),
                "amp" => Some('&'),
                "quot" => Some('"'),
                "apos" => Some('\''),
                _ => entity
                    .strip_prefix("#x")
                    .or_else(|| entity.strip_prefix("#X"))
                    .and_then(|hex| u32::from_str_radix(hex, 16).ok())
                    .or_else(|| entity.strip_prefix('#').and_then(|d| d.parse().ok()))
                    .and_then(char::from_u32),
            };
            c.map(|c| (c, semi + 1))
        });
        match decoded {
            Some((c, len)) => {
                out.push(c);
                rest = &after[len..];
            }
            None => {
                out.push('&');
                rest = &after[1..];
            }
        }
    }
    out.push_str(rest);
    out
}

pub fn escape_text(s: &str) -> String {
    s.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;")
}

fn escape_attr(s: &str) -> String {
    escape_text(s).replace('"', "&quot;")
}

/// Serialize nodes back to markup.
pub fn to_markup(nodes: &[Markup]) -> String {
    let mut out = String::new();
    for node in nodes {
        write_node(node, &mut out);
    }
    out
}

fn write_node(node: &Markup, out: &mut String) {
    match node {
        Markup::Text(t) => out.push_str(&escape_text(t)),
        Markup::Element(e) => {
            out.push('<');
            out.push_str(&e.name);
            for (k, v) in &e.attrs {
                out.push_str(&format!(" {k}=\"{}\"", escape_attr(v)));
            }
            if e.children.is_empty() {
                out.push_str("/>");
            } else {
                out.push('>');
                for child in &e.children {
                    write_node(child, out);
                }
                out.push_str(&format!("</{}>", e.name));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn element(nodes: &[Markup], i: usize) -> &Element {
        match &nodes[i] {
            Markup::Element(e) => e,
            other => panic!("expected element, got {other:?}"),
        }
    }

    #[test]
    fn parses_nested_elements_and_attributes() {
        let nodes = parse(r#"Hi <get name="user"/>, <think><set var='x'>1</set></think>"#);
        assert_eq!(nodes.len(), 4);
        let get = element(&nodes, 1);
        assert_eq!(get.name, "get");
        assert_eq!(get.attr("name"), Some("user"));
        let think = element(&nodes, 3);
        assert_eq!(element(&think.children, 0).attr("var"), Some("x"));
    }

    #[test]
    fn wild_tags_are_void_without_slash() {
        let nodes = parse("<wild1> likes <wild2>.");
        assert_eq!(nodes.len(), 4);
        assert_eq!(element(&nodes, 0).name, "wild1");
        assert_eq!(nodes[3], Markup::Text(".".into()));
    }

    #[test]
    fn lenient_reader_recovers_from_bad_markup() {
        let nodes = parse("a </b> c <d>e");
        assert_eq!(nodes[0], Markup::Text("a </b> c ".into()));
        assert_eq!(element(&nodes, 1).text(), "e");
    }

    #[test]
    fn strict_reader_reports_line() {
        let err = parse_strict("<category>\n<pattern>X</template>").unwrap_err();
        assert!(matches!(err, EngineError::InvalidMarkup { line: 2, .. }));
    }

    #[test]
    fn entities_round_trip() {
        assert_eq!(decode_entities("a &lt;b&gt; &amp; &#65;&#x42;"), "a <b> & AB");
        let nodes = parse("x &lt; y");
        assert_eq!(to_markup(&nodes), "x &lt; y");
    }
}
