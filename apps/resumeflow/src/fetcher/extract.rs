use std::sync::OnceLock;

use scraper::{Html, Selector};

struct Selectors {
    description: Selector,
    criteria: Selector,
}

static SELECTORS: OnceLock<Selectors> = OnceLock::new();

fn selectors() -> &'static Selectors {
    SELECTORS.get_or_init(|| Selectors {
        description: Selector::parse(
            r#"section.show-more-less-html div[class*="show-more-less-html__markup"]"#,
        )
        .expect("static selector"),
        criteria: Selector::parse("ul.description__job-criteria-list").expect("static selector"),
    })
}

/// Pulls the job description and criteria list out of a posting page. Falls back
/// to all visible document text when neither region is present. Output is capped
/// at `max_chars` characters.
pub fn extract_relevant_text(markup: &str, max_chars: usize) -> String {
    let document = Html::parse_document(markup);

    let regions: Vec<String> = [&selectors().description, &selectors().criteria]
        .into_iter()
        .filter_map(|selector| document.select(selector).next())
        .map(|element| join_lines(element.text()))
        .filter(|text| !text.is_empty())
        .collect();

    let text = if regions.is_empty() {
        join_lines(visible_text(&document))
    } else {
        regions.join("\n")
    };
    truncate_chars(&text, max_chars)
}

fn visible_text(document: &Html) -> impl Iterator<Item = &str> {
    document.tree.root().descendants().filter_map(|node| {
        let text = node.value().as_text()?;
        let hidden = node
            .parent()
            .and_then(|parent| parent.value().as_element().map(|el| el.name()))
            .is_some_and(|name| matches!(name, "script" | "style" | "noscript" | "template"));
        (!hidden).then_some(&**text)
    })
}

fn join_lines<'a>(pieces: impl Iterator<Item = &'a str>) -> String {
    pieces
        .map(str::trim)
        .filter(|piece| !piece.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

fn truncate_chars(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((cut, _)) => text[..cut].to_string(),
        None => text.to_string(),
    }
}
