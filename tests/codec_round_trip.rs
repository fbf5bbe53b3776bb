use md_outline::{CodecConfig, NewSection, NodeId, Parser, Tree};
use proptest::collection::vec;
use proptest::prelude::*;
mod proptest_config;

#[derive(Clone, Debug)]
struct SectionSpec {
    parent: prop::sample::Index,
    title: String,
    content: String,
}

#[derive(Clone, Debug)]
struct TreeSpec {
    start_level: u32,
    frontmatter: Option<String>,
    preamble: String,
    sections: Vec<SectionSpec>,
}

fn body() -> impl Strategy<Value = String> {
    vec("[a-z][a-z .,!]{0,16}|", 0..4).prop_map(|lines| lines.join("\n").trim().to_string())
}

fn tree_spec() -> impl Strategy<Value = TreeSpec> {
    (
        1u32..4,
        prop::option::of(vec("[a-z]{1,6}: [a-z0-9]{0,6}", 0..3).prop_map(|lines| lines.join("\n"))),
        body(),
        vec(
            (any::<prop::sample::Index>(), "[A-Za-z][A-Za-z0-9 ]{0,12}", body()).prop_map(
                |(parent, title, content)| SectionSpec {
                    parent,
                    title,
                    content,
                },
            ),
            0..24,
        ),
    )
        .prop_map(|(start_level, frontmatter, preamble, sections)| TreeSpec {
            start_level,
            frontmatter,
            preamble,
            sections,
        })
}

/// Builds a tree through the mutation API, keeping every heading within the
/// six levels markdown can express.
fn build(spec: &TreeSpec) -> (Tree, CodecConfig) {
    let config = CodecConfig::with_heading_start_level(spec.start_level);
    let max_level = 6 - spec.start_level + 1;

    let mut tree = Tree::new("generated");
    tree.set_frontmatter(spec.frontmatter.clone());
    tree.update_content(NodeId::ROOT, spec.preamble.clone()).unwrap();

    let mut parents = vec![NodeId::ROOT];
    for section in &spec.sections {
        let parent = *section.parent.get(&parents);
        let id = tree
            .add_child(
                parent,
                NewSection::new(section.title.clone()).with_content(section.content.clone()),
            )
            .unwrap();
        if tree.get(id).unwrap().level() < max_level {
            parents.push(id);
        }
    }
    (tree, config)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(proptest_config::cases()))]
    #[test]
    fn prop_parse_inverts_serialize(spec in tree_spec()) {
        let (tree, config) = build(&spec);
        let markdown = tree.serialize(&config);
        let parsed = Parser::parse_with_config(&markdown, "generated", &config);

        prop_assert!(parsed.fallback.is_none());
        prop_assert_eq!(parsed.tree.outline(), tree.outline());
        prop_assert!(parsed.tree.is_level_consistent());
    }

    #[test]
    fn prop_serialize_is_a_fixed_point(spec in tree_spec()) {
        let (tree, config) = build(&spec);
        let once = tree.serialize(&config);
        let twice = Parser::parse_with_config(&once, "generated", &config)
            .into_tree()
            .serialize(&config);
        prop_assert_eq!(once, twice);
    }

    #[test]
    fn prop_frontmatter_survives_round_trip(
        lines in vec("[a-z]{1,8}: [ -~]{0,12}", 0..5),
        rest in body(),
    ) {
        let frontmatter = lines.join("\n");
        let input = format!("---\n{frontmatter}\n---\n{rest}");

        let tree = Parser::parse(&input, "doc").into_tree();
        prop_assert_eq!(tree.frontmatter().map(|node| node.content().to_string()), Some(frontmatter.clone()));

        let again = Parser::parse(&tree.serialize(&CodecConfig::default()), "doc").into_tree();
        prop_assert_eq!(again.frontmatter().map(|node| node.content().to_string()), Some(frontmatter));
    }

    #[test]
    fn prop_arbitrary_text_never_fails(text in "(#{0,7}[ \t]?[a-zA-Z -]{0,10}\n?){0,30}") {
        let parsed = Parser::parse(&text, "doc");
        prop_assert!(parsed.fallback.is_none());
        for node in parsed.tree.iter().filter(|node| node.is_section()) {
            prop_assert!((1..=6).contains(&node.level()));
            prop_assert!(!node.title().trim().is_empty());
        }
    }
}

#[test]
fn heading_levels_below_the_offset_clamp_to_one() {
    let config = CodecConfig::with_heading_start_level(3);
    let tree = Parser::parse_with_config("# Top\n### Also top\n#### Child\n", "doc", &config).into_tree();
    let levels: Vec<_> = tree
        .iter()
        .filter(|node| node.is_section())
        .map(|node| (node.title().to_string(), node.level()))
        .collect();
    assert_eq!(
        levels,
        vec![
            ("Top".to_string(), 1),
            ("Also top".to_string(), 1),
            ("Child".to_string(), 2),
        ]
    );
    assert_eq!(
        tree.serialize(&config),
        "### Top\n\n\n\n### Also top\n\n\n\n#### Child\n\n\n\n"
    );
}
