//! Grant categorization against a fixed vocabulary
//!
//! The LLM is asked to pick from this closed set; anything outside it is
//! filtered out, an empty result collapses to `Other`, and at most five
//! categories survive.

/// The closed category vocabulary
pub const CATEGORY_VOCABULARY: [&str; 11] = [
    "Biomedical",
    "Computer Science",
    "Engineering",
    "Physical Sciences",
    "Life Sciences",
    "Social Sciences",
    "Environmental Science",
    "Education",
    "Arts & Humanities",
    "Economic Development",
    "Other",
];

/// Maximum categories retained per grant
pub const MAX_CATEGORIES: usize = 5;

/// Keep only vocabulary members (case-insensitive, canonical casing),
/// dedup, cap at five, and default to `Other` when nothing survives.
pub fn filter_categories(raw: Vec<String>) -> Vec<String> {
    let mut filtered: Vec<String> = Vec::new();

    for candidate in raw {
        let canonical = CATEGORY_VOCABULARY
            .iter()
            .find(|member| member.eq_ignore_ascii_case(candidate.trim()));

        if let Some(member) = canonical {
            if !filtered.iter().any(|existing| existing == member) {
                filtered.push(member.to_string());
            }
        }

        if filtered.len() == MAX_CATEGORIES {
            break;
        }
    }

    if filtered.is_empty() {
        filtered.push("Other".to_string());
    }

    filtered
}

/// Prompt for the LLM categorization call
pub fn categorization_prompt(title: &str, description: Option<&str>) -> String {
    format!(
        "Categorize this grant into one or more of exactly these categories: {}.\n\n\
         Title: {}\nDescription: {}\n\n\
         Return ONLY a JSON array of category names from the list above, \
         most relevant first, at most {} entries.",
        CATEGORY_VOCABULARY.join(", "),
        title,
        description.unwrap_or("(none)"),
        MAX_CATEGORIES,
    )
}

/// Matching keywords derived from the category set and title
pub fn derive_keywords(title: &str, categories: &[String]) -> Vec<String> {
    let mut keywords: Vec<String> = categories.iter().map(|c| c.to_lowercase()).collect();

    for token in title.split_whitespace() {
        let cleaned: String = token
            .chars()
            .filter(|c| c.is_alphanumeric() || *c == '-')
            .collect::<String>()
            .to_lowercase();
        if cleaned.len() > 4 && !keywords.contains(&cleaned) {
            keywords.push(cleaned);
        }
        if keywords.len() >= 10 {
            break;
        }
    }

    keywords
}
