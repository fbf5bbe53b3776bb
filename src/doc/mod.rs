//! Markdown codec: parse raw markdown into an outline [`Tree`] and serialize
//! it back.
//!
//! Only three constructs are recognised: a leading `---` frontmatter block,
//! ATX headings (`#` to `######`), and everything else as body text. Body text
//! is kept verbatim apart from trimming, so anything the codec does not
//! understand survives a round trip untouched.

use crate::tree::{NodeId, NodeKind, SectionNode, Tree, TreeError};

/// Longest run of `#` that still counts as a heading.
pub const MAX_HEADING_DEPTH: usize = 6;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodecConfig {
    /// Markdown depth of a level-1 section. With `2`, `## A` is a top-level
    /// section and `#` headings are clamped to level 1.
    pub heading_start_level: u32,
    pub max_sections: usize,
}

impl CodecConfig {
    pub fn with_heading_start_level(heading_start_level: u32) -> Self {
        Self {
            heading_start_level,
            ..Self::default()
        }
    }
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self {
            heading_start_level: 1,
            max_sections: 10_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    #[error("document has more than {limit} sections")]
    TooManySections { limit: usize },
    #[error("tree construction failed: {0}")]
    Tree(#[from] TreeError),
}

/// Result of a parse. The tree is always usable; `fallback` is set when the
/// structure could not be built and the tree holds the raw text in its root.
#[derive(Debug, Clone)]
pub struct Parsed {
    pub tree: Tree,
    pub fallback: Option<CodecError>,
}

impl Parsed {
    pub fn is_fallback(&self) -> bool {
        self.fallback.is_some()
    }

    pub fn into_tree(self) -> Tree {
        self.tree
    }
}

pub struct Parser;

impl Parser {
    pub fn parse(text: &str, name: &str) -> Parsed {
        Self::parse_with_config(text, name, &CodecConfig::default())
    }

    pub fn parse_with_config(text: &str, name: &str, config: &CodecConfig) -> Parsed {
        match build_tree(text, name, config) {
            Ok(tree) => Parsed {
                tree,
                fallback: None,
            },
            Err(err) => {
                tracing::warn!(document = name, error = %err, "markdown parse fell back to raw content");
                let mut tree = Tree::new(name);
                tree.set_content_unchecked(NodeId::ROOT, text.to_string());
                Parsed {
                    tree,
                    fallback: Some(err),
                }
            }
        }
    }
}

fn build_tree(text: &str, name: &str, config: &CodecConfig) -> Result<Tree, CodecError> {
    let lines: Vec<&str> = text.lines().collect();
    let mut tree = Tree::new(name);
    let mut start_index = 0;

    if lines.first().is_some_and(|line| *line == "---") {
        let mut index = 1;
        while index < lines.len() {
            if lines[index] == "---" {
                tree.set_frontmatter(Some(lines[1..index].join("\n")));
                start_index = index + 1;
                break;
            }
            index += 1;
        }
    }

    // Open ancestors as (id, level); the root sits at the bottom and is never popped.
    let mut stack: Vec<(NodeId, u32)> = vec![(NodeId::ROOT, 0)];
    let mut current = NodeId::ROOT;
    let mut buffer: Vec<&str> = Vec::new();
    let mut sections = 0usize;

    for line in lines[start_index..].iter().copied() {
        let Some((depth, title)) = parse_heading(line) else {
            buffer.push(line);
            continue;
        };

        sections += 1;
        if sections > config.max_sections {
            return Err(CodecError::TooManySections {
                limit: config.max_sections,
            });
        }

        tree.update_content(current, buffer.join("\n").trim())?;
        buffer.clear();

        let level = section_level(depth, config.heading_start_level);
        while stack.len() > 1 && stack.last().is_some_and(|(_, open)| *open >= level) {
            stack.pop();
        }
        let parent = stack.last().map(|(id, _)| *id).unwrap_or(NodeId::ROOT);
        current = tree.attach(parent, title.to_string(), level, String::new())?;
        stack.push((current, level));
    }

    tree.update_content(current, buffer.join("\n").trim())?;
    Ok(tree)
}

/// Returns the hash count and title of an ATX heading line.
fn parse_heading(line: &str) -> Option<(usize, &str)> {
    let depth = line.bytes().take_while(|byte| *byte == b'#').count();
    if depth == 0 || depth > MAX_HEADING_DEPTH {
        return None;
    }
    let rest = &line[depth..];
    if !rest.starts_with(char::is_whitespace) {
        return None;
    }
    let title = rest.trim_start();
    if title.trim().is_empty() {
        return None;
    }
    Some((depth, title))
}

fn section_level(depth: usize, heading_start_level: u32) -> u32 {
    let level = depth as i64 - i64::from(heading_start_level) + 1;
    level.max(1) as u32
}

fn heading_depth(level: u32, heading_start_level: u32) -> usize {
    (level + heading_start_level.max(1) - 1) as usize
}

pub fn serialize(tree: &Tree, config: &CodecConfig) -> String {
    let mut output = String::new();
    serialize_node(tree, tree.root(), config, &mut output);
    output
}

fn serialize_node(tree: &Tree, node: &SectionNode, config: &CodecConfig, output: &mut String) {
    match node.kind() {
        NodeKind::Frontmatter => {
            output.push_str("---\n");
            output.push_str(node.content());
            output.push_str("\n---\n\n");
            return;
        }
        NodeKind::Section => {
            output.push_str(&"#".repeat(heading_depth(node.level(), config.heading_start_level)));
            output.push(' ');
            output.push_str(node.title());
            output.push_str("\n\n");
            output.push_str(node.content());
            output.push_str("\n\n");
        }
        NodeKind::Root => {}
    }

    // Frontmatter is emitted ahead of the root's own text.
    let (frontmatter, sections): (Vec<_>, Vec<_>) = node
        .children()
        .iter()
        .filter_map(|id| tree.get(*id))
        .partition(|child| child.kind() == NodeKind::Frontmatter);
    for child in frontmatter {
        serialize_node(tree, child, config, output);
    }
    if node.kind() == NodeKind::Root && !node.content().is_empty() {
        output.push_str(node.content());
        output.push_str("\n\n");
    }

    for child in sections {
        serialize_node(tree, child, config, output);
    }
}

impl Tree {
    pub fn serialize(&self, config: &CodecConfig) -> String {
        serialize(self, config)
    }
}
