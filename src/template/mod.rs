//! Rule templates: a tag tree compiled once from markup and evaluated per
//! match by [`Evaluator`].

pub mod eval;
pub mod markup;

use tracing::debug;

use crate::session::HistoryKind;
use crate::types::StarKind;
use markup::{Element, Markup};

pub use eval::Evaluator;

/// A compiled template.
#[derive(Debug, Clone, Default)]
pub struct Template {
    nodes: Vec<Node>,
}

impl Template {
    /// Compile template markup. Never fails; see [`markup::parse`].
    pub fn parse(src: &str) -> Self {
        Self {
            nodes: compile(&markup::parse(src)),
        }
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

#[derive(Debug, Clone)]
pub enum Node {
    Text(String),
    Tag(Box<Tag>),
}

#[derive(Debug, Clone)]
pub struct Tag {
    pub kind: TagKind,
    pub children: Vec<Node>,
}

/// Where a variable lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VarScope {
    /// Scratch variable for the current evaluation call (`var="..."`).
    Local,
    /// Session variable (`name="..."`).
    Session,
    /// Rule-store global (`global="..."`).
    Global,
}

/// An attribute value, given literally or as a child element evaluated at
/// run time (`<get><name>x</name></get>`).
#[derive(Debug, Clone)]
pub enum Attr {
    Literal(String),
    Nodes(Vec<Node>),
    Missing,
}

#[derive(Debug, Clone)]
pub struct VarRef {
    pub scope: VarScope,
    pub name: Attr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaseTransform {
    Upper,
    Lower,
    Formal,
    Sentence,
}

/// One evaluation rule per tag kind.
#[derive(Debug, Clone)]
pub enum TagKind {
    Star { kind: StarKind, index: usize },
    Sr,
    Srai,
    Get(VarRef),
    Set(VarRef),
    Bot { name: Attr },
    Think,
    Condition { var: Option<VarRef>, branches: Vec<Branch> },
    Random { branches: Vec<Vec<Node>> },
    Learn { durable: bool, categories: Vec<LearnCategory> },
    Unlearn { durable: bool, categories: Vec<LearnCategory> },
    Eval,
    Case(CaseTransform),
    Substitute { table: &'static str },
    Map { name: Attr },
    Array { name: Attr, index: Attr },
    List { name: Attr },
    First,
    Rest,
    History { kind: HistoryKind, index: Attr },
    Topic,
    Id,
    Size,
    Vocabulary,
    Program,
    Date { format: Option<String> },
    Sraix { service: Attr, default: Option<String> },
    Br,
    Unknown(String),
}

#[derive(Debug, Clone)]
pub struct Branch {
    /// Per-branch variable, overriding the condition's.
    pub var: Option<VarRef>,
    pub test: BranchTest,
    pub body: Vec<Node>,
}

#[derive(Debug, Clone)]
pub enum BranchTest {
    /// Case-insensitive equality; `*` accepts any non-empty value.
    Value(Attr),
    /// Membership in a named word-set.
    Set(Attr),
    Default,
}

/// A rule described inside `<learn>`/`<unlearn>`. Everything is kept as raw
/// markup except `<eval>` blocks, which run at learn time.
#[derive(Debug, Clone)]
pub struct LearnCategory {
    pub pattern: Vec<LearnPart>,
    pub that: Option<Vec<LearnPart>>,
    pub that_index: Option<usize>,
    pub topic: Option<Vec<LearnPart>>,
    pub template: Vec<LearnPart>,
}

#[derive(Debug, Clone)]
pub enum LearnPart {
    Raw(String),
    Eval(Vec<Node>),
}

pub(crate) fn compile(nodes: &[Markup]) -> Vec<Node> {
    nodes
        .iter()
        .filter_map(|node| match node {
            Markup::Text(t) => {
                let collapsed = collapse_whitespace(t);
                (!collapsed.is_empty()).then_some(Node::Text(collapsed))
            }
            Markup::Element(e) => Some(compile_element(e)),
        })
        .collect()
}

fn collapse_whitespace(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut in_space = false;
    for c in text.chars() {
        if c.is_whitespace() {
            if !in_space {
                out.push(' ');
            }
            in_space = true;
        } else {
            out.push(c);
            in_space = false;
        }
    }
    out
}

fn tag(kind: TagKind, children: Vec<Node>) -> Node {
    Node::Tag(Box::new(Tag { kind, children }))
}

fn star(kind: StarKind, index: usize) -> Node {
    tag(TagKind::Star { kind, index }, Vec::new())
}

fn compile_element(e: &Element) -> Node {
    let mut rest = e.children.clone();

    let kind = match e.name.as_str() {
        "star" => TagKind::Star {
            kind: StarKind::Input,
            index: index_attr(e),
        },
        "thatstar" => TagKind::Star {
            kind: StarKind::That,
            index: index_attr(e),
        },
        "topicstar" => TagKind::Star {
            kind: StarKind::Topic,
            index: index_attr(e),
        },
        "sr" => TagKind::Sr,
        "srai" => TagKind::Srai,
        "get" => match var_ref(e, &mut rest) {
            Some(var) => TagKind::Get(var),
            None => TagKind::Unknown("get".into()),
        },
        "set" => match var_ref(e, &mut rest) {
            Some(var) => TagKind::Set(var),
            None => TagKind::Unknown("set".into()),
        },
        "bot" => TagKind::Bot {
            name: take_attr(e, &mut rest, "name"),
        },
        "think" => TagKind::Think,
        "condition" => compile_condition(e, &mut rest),
        "random" => TagKind::Random {
            branches: e.child_elements("li").map(|li| compile(&li.children)).collect(),
        },
        "learn" | "learnf" => TagKind::Learn {
            durable: e.name == "learnf",
            categories: learn_categories(e),
        },
        "unlearn" | "unlearnf" => TagKind::Unlearn {
            durable: e.name == "unlearnf",
            categories: learn_categories(e),
        },
        "eval" => TagKind::Eval,
        "uppercase" => TagKind::Case(CaseTransform::Upper),
        "lowercase" => TagKind::Case(CaseTransform::Lower),
        "formal" => TagKind::Case(CaseTransform::Formal),
        "sentence" => TagKind::Case(CaseTransform::Sentence),
        "person" | "person2" | "gender" | "normalize" | "denormalize" => {
            let table = match e.name.as_str() {
                "person" => "person",
                "person2" => "person2",
                "gender" => "gender",
                "normalize" => "normal",
                _ => "denormal",
            };
            if rest.is_empty() {
                return tag(TagKind::Substitute { table }, vec![star(StarKind::Input, 1)]);
            }
            TagKind::Substitute { table }
        }
        "map" => TagKind::Map {
            name: take_attr(e, &mut rest, "name"),
        },
        "array" => TagKind::Array {
            name: take_attr(e, &mut rest, "name"),
            index: take_attr(e, &mut rest, "index"),
        },
        "list" => TagKind::List {
            name: take_attr(e, &mut rest, "name"),
        },
        "first" => TagKind::First,
        "rest" => TagKind::Rest,
        "input" | "that" | "request" | "response" => TagKind::History {
            kind: match e.name.as_str() {
                "input" => HistoryKind::Input,
                "that" => HistoryKind::That,
                "request" => HistoryKind::Request,
                _ => HistoryKind::Response,
            },
            index: take_attr(e, &mut rest, "index"),
        },
        "topic" => TagKind::Topic,
        "id" => TagKind::Id,
        "size" => TagKind::Size,
        "vocabulary" => TagKind::Vocabulary,
        "program" => TagKind::Program,
        "date" => TagKind::Date {
            format: e.attr("format").map(String::from),
        },
        "sraix" => TagKind::Sraix {
            service: take_attr(e, &mut rest, "service"),
            default: e.attr("default").map(String::from),
        },
        "br" => TagKind::Br,
        wild if is_wild_shorthand(wild) => TagKind::Star {
            kind: StarKind::Input,
            index: index_attr(e),
        },
        other => {
            debug!(tag = other, "unknown tag, evaluating children only");
            TagKind::Unknown(other.to_string())
        }
    };

    // Learn bodies are held in `categories`; evaluating them as children
    // would run their templates immediately.
    let children = match kind {
        TagKind::Learn { .. }
        | TagKind::Unlearn { .. }
        | TagKind::Condition { .. }
        | TagKind::Random { .. } => Vec::new(),
        _ => compile(&rest),
    };
    tag(kind, children)
}

/// `<wild1/>`, `<wild2/>`, ... are shorthand for `<star index="N"/>`.
fn is_wild_shorthand(name: &str) -> bool {
    name.strip_prefix("wild").is_some_and(|n| !n.is_empty() && n.bytes().all(|b| b.is_ascii_digit()))
}

fn index_attr(e: &Element) -> usize {
    match e.attr("index") {
        Some(v) => parse_index(v).unwrap_or(0),
        None => e
            .name
            .strip_prefix("wild")
            .and_then(|n| n.parse().ok())
            .unwrap_or(1),
    }
}

/// Parse a 1-based index. `"2,1"` style pairs use their first number.
pub(crate) fn parse_index(value: &str) -> Option<usize> {
    value.split(',').next()?.trim().parse().ok()
}

/// Take an attribute from the start tag or, failing that, from a child
/// element of the same name (removing it from `rest`).
fn take_attr(e: &Element, rest: &mut Vec<Markup>, name: &str) -> Attr {
    if let Some(value) = e.attr(name) {
        return Attr::Literal(value.to_string());
    }
    let pos = rest
        .iter()
        .position(|c| matches!(c, Markup::Element(child) if child.name == name));
    match pos.map(|p| rest.remove(p)) {
        Some(Markup::Element(child)) => Attr::Nodes(compile(&child.children)),
        _ => Attr::Missing,
    }
}

fn var_ref(e: &Element, rest: &mut Vec<Markup>) -> Option<VarRef> {
    for (attr, scope) in [
        ("var", VarScope::Local),
        ("name", VarScope::Session),
        ("global", VarScope::Global),
    ] {
        match take_attr(e, rest, attr) {
            Attr::Missing => continue,
            name => return Some(VarRef { scope, name }),
        }
    }
    None
}

fn compile_condition(e: &Element, rest: &mut Vec<Markup>) -> TagKind {
    let var = var_ref(e, rest);

    let single = match take_attr(e, rest, "value") {
        Attr::Missing => match e.attr("set") {
            Some(set) => Some(BranchTest::Set(Attr::Literal(set.to_string()))),
            None => None,
        },
        value => Some(BranchTest::Value(value)),
    };
    if let Some(test) = single {
        return TagKind::Condition {
            var,
            branches: vec![Branch {
                var: None,
                test,
                body: compile(rest),
            }],
        };
    }

    let branches = e
        .child_elements("li")
        .map(|li| {
            let mut body = li.children.clone();
            let var = var_ref(li, &mut body);
            let test = match take_attr(li, &mut body, "value") {
                Attr::Missing => match li.attr("set") {
                    Some(set) => BranchTest::Set(Attr::Literal(set.to_string())),
                    None => BranchTest::Default,
                },
                value => BranchTest::Value(value),
            };
            Branch {
                var,
                test,
                body: compile(&body),
            }
        })
        .collect();
    TagKind::Condition { var, branches }
}

fn learn_categories(e: &Element) -> Vec<LearnCategory> {
    e.child_elements("category")
        .filter_map(|category| {
            let part = |name: &str| {
                category
                    .child_elements(name)
                    .next()
                    .map(|el| learn_parts(&el.children))
            };
            let (Some(pattern), Some(template)) = (part("pattern"), part("template")) else {
                debug!("learn category without pattern or template skipped");
                return None;
            };
            let that_index = category
                .child_elements("that")
                .next()
                .and_then(|el| el.attr("index"))
                .and_then(parse_index);
            Some(LearnCategory {
                pattern,
                that: part("that"),
                that_index,
                topic: part("topic"),
                template,
            })
        })
        .collect()
}

fn learn_parts(nodes: &[Markup]) -> Vec<LearnPart> {
    let mut parts = Vec::new();
    collect_learn_parts(nodes, &mut parts);
    parts
}

fn collect_learn_parts(nodes: &[Markup], parts: &mut Vec<LearnPart>) {
    for node in nodes {
        match node {
            Markup::Text(t) => push_raw(parts, &markup::escape_text(t)),
            Markup::Element(e) if e.name == "eval" => {
                parts.push(LearnPart::Eval(compile(&e.children)));
            }
            Markup::Element(e) => {
                let mut open = format!("<{}", e.name);
                for (k, v) in &e.attrs {
                    open.push_str(&format!(" {k}=\"{}\"", markup::escape_text(v).replace('"', "&quot;")));
                }
                if e.children.is_empty() {
                    open.push_str("/>");
                    push_raw(parts, &open);
                } else {
                    open.push('>');
                    push_raw(parts, &open);
                    collect_learn_parts(&e.children, parts);
                    push_raw(parts, &format!("</{}>", e.name));
                }
            }
        }
    }
}

fn push_raw(parts: &mut Vec<LearnPart>, text: &str) {
    if let Some(LearnPart::Raw(last)) = parts.last_mut() {
        last.push_str(text);
    } else {
        parts.push(LearnPart::Raw(text.to_string()));
    }
}
