//! Shelf mark derivation from MARC main-entry subfields.
//!
//! The shelf mark is the first three Latin letters or digits of the main
//! entry heading, capitalised. Headings in other scripts are romanized
//! first. Headings are tried in a fixed priority of (tag, first indicator)
//! and the first matching subfield decides; titles (245) skip the number of
//! non-filing characters given by the second indicator.

use regex::Regex;
use serde::Deserialize;
use std::sync::OnceLock;

/// Returned when no rule yields any usable character.
pub const UNKNOWN_SHELFMARK: &str = "***";

#[derive(Debug, Clone, Deserialize)]
struct Subfield {
    marc_tag: Option<String>,
    marc_ind1: Option<String>,
    marc_ind2: Option<String>,
    tag: Option<String>,
    content: Option<String>,
}

/// (tag, first indicator) in priority order. `None` matches any indicator.
const HEADING_RULES: &[(&str, Option<&str>)] = &[
    ("100", Some("1")),
    ("110", Some("2")),
    ("100", Some("0")),
    ("100", Some("2")),
    ("110", Some("1")),
    ("110", Some("0")),
    ("100", Some("3")),
    ("111", Some("0")),
    ("111", Some("1")),
    ("111", Some("2")),
    ("245", Some("0")),
    ("245", Some("1")),
    ("245", None),
];

fn non_latin() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[^\p{Latin}0-9]").expect("static regex"))
}

/// Derives a shelf mark from the `main_entry_json` column.
pub fn derive(main_entry_json: Option<&str>) -> String {
    let subfields: Vec<Subfield> = match main_entry_json {
        Some(json) if !json.trim().is_empty() => match serde_json::from_str(json) {
            Ok(fields) => fields,
            Err(e) => {
                tracing::debug!(error = %e, "unparseable main entry json");
                return UNKNOWN_SHELFMARK.to_string();
            }
        },
        _ => return UNKNOWN_SHELFMARK.to_string(),
    };

    for (tag, ind1) in HEADING_RULES {
        let matching = subfields.iter().find(|field| {
            field.marc_tag.as_deref() == Some(*tag)
                && field.tag.as_deref() == Some("a")
                && ind1.map_or(true, |ind1| {
                    field.marc_ind1.as_deref().map(str::trim) == Some(ind1)
                })
        });
        if let Some(field) = matching {
            let skip = if *tag == "245" {
                field
                    .marc_ind2
                    .as_deref()
                    .and_then(|v| v.trim().parse::<usize>().ok())
                    .unwrap_or(0)
            } else {
                0
            };
            return field
                .content
                .as_deref()
                .and_then(|c| signum(c, skip))
                .unwrap_or_else(|| UNKNOWN_SHELFMARK.to_string());
        }
    }

    UNKNOWN_SHELFMARK.to_string()
}

/// First three Latin letters or digits of `content` after `skip` characters,
/// first letter upper case and the rest lower case.
fn signum(content: &str, skip: usize) -> Option<String> {
    let rest: String = content.chars().skip(skip).collect();
    let mut cleaned = non_latin().replace_all(&rest, "").into_owned();
    if cleaned.is_empty() {
        cleaned = non_latin()
            .replace_all(&deunicode::deunicode(&rest), "")
            .into_owned();
    }
    let mut chars = cleaned.chars();
    let first = chars.next()?;
    let mut mark: String = first.to_uppercase().collect();
    for c in chars.take(2) {
        mark.extend(c.to_lowercase());
    }
    Some(mark)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn field(tag: &str, ind1: &str, ind2: &str, content: &str) -> String {
        format!(
            r#"{{"marc_tag":"{}","marc_ind1":"{}","marc_ind2":"{}","field_type_code":"a","tag":"a","content":"{}"}}"#,
            tag, ind1, ind2, content
        )
    }

    #[test]
    fn test_personal_author_wins() {
        let json = format!(
            "[{},{}]",
            field("245", "1", "0", "Seitsemän veljestä"),
            field("100", "1", " ", "Kivi, Aleksis")
        );
        assert_eq!(derive(Some(&json)), "Kiv");
    }

    #[test]
    fn test_title_skips_non_filing_characters() {
        let json = format!("[{}]", field("245", "0", "4", "The hobbit"));
        assert_eq!(derive(Some(&json)), "Hob");
    }

    #[test]
    fn test_corporate_author_priority() {
        let json = format!(
            "[{},{}]",
            field("100", "0", " ", "madonna"),
            field("110", "2", " ", "Yleisradio")
        );
        assert_eq!(derive(Some(&json)), "Yle");
    }

    #[test]
    fn test_strips_punctuation_and_keeps_latin_diacritics() {
        let json = format!("[{}]", field("100", "1", " ", "Ö'Brien, Åke"));
        assert_eq!(derive(Some(&json)), "Öbr");
    }

    #[test]
    fn test_cyrillic_author_is_romanized() {
        let json = format!(
            "[{},{}]",
            field("245", "1", "0", "Война и мир"),
            field("100", "1", " ", "Толстой, Лев")
        );
        assert_eq!(derive(Some(&json)), "Tol");
    }

    #[test]
    fn test_romanized_title_skips_non_filing_characters() {
        let json = format!("[{}]", field("245", "1", "2", "Η Οδύσσεια"));
        assert!(derive(Some(&json)).starts_with("Od"));
    }

    #[test]
    fn test_first_matching_heading_decides() {
        let json = format!(
            "[{},{}]",
            field("100", "1", " ", "?!"),
            field("245", "1", "0", "War and peace")
        );
        assert_eq!(derive(Some(&json)), UNKNOWN_SHELFMARK);
    }

    #[test]
    fn test_missing_or_invalid_json() {
        assert_eq!(derive(None), UNKNOWN_SHELFMARK);
        assert_eq!(derive(Some("")), UNKNOWN_SHELFMARK);
        assert_eq!(derive(Some("not json")), UNKNOWN_SHELFMARK);
        assert_eq!(derive(Some("[]")), UNKNOWN_SHELFMARK);
    }

    #[test]
    fn test_short_heading() {
        let json = format!("[{}]", field("100", "1", " ", "Oz"));
        assert_eq!(derive(Some(&json)), "Oz");
    }
}
