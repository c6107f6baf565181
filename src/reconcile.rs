use geojson::JsonObject;
use serde_json::Value;
use std::collections::HashSet;

/// One candidate hit: the property field that produced it and the known key
/// it matched. The first element of the match list is the resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyMatch {
    pub field: String,
    pub key: String,
}

fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        // null, bool, arrays and objects never carry a ward identifier
        _ => None,
    }
}

fn as_integer_string(text: &str) -> Option<String> {
    text.parse::<f64>().ok().map(|n| (n.trunc() as i64).to_string())
}

/// Normalization variants of one property value, in generation order,
/// deduplicated, with empty strings dropped.
///
/// Ward identifiers arrive inconsistently typed and padded across the three
/// source datasets ("7", "007", 7, 7.0, "w7a"), so a single exact form would
/// drop most joins. The variants cover the representations actually seen:
/// raw, integer-restated, zero-stripped, digits-only, upper-cased.
pub fn variants(value: &Value) -> Vec<String> {
    let text = match scalar_text(value) {
        Some(t) => t,
        None => return Vec::new(),
    };

    let mut out: Vec<String> = Vec::new();
    let mut push = |s: String| {
        if !s.is_empty() && !out.contains(&s) {
            out.push(s);
        }
    };

    push(text.clone());
    if let Some(restated) = as_integer_string(&text) {
        push(restated);
    }
    let stripped = text.trim_start_matches('0');
    if stripped.is_empty() {
        // stripping "000" would leave nothing usable; keep the original
        push(text.clone());
    } else {
        push(stripped.to_string());
    }
    let digits: String = text.chars().filter(|c| c.is_ascii_digit()).collect();
    if !digits.is_empty() {
        if let Ok(n) = digits.parse::<i64>() {
            push(n.to_string());
        }
    }
    push(text.to_uppercase());

    out
}

/// Every direct hit against the known-key set, scanning property fields in
/// document order. Within one field the first matching variant wins; across
/// fields all hits are reported so callers can spot ambiguous features
/// (two fields resolving to different keys) instead of silently taking the
/// first. Field order here is an artifact of the source document, not a
/// semantic precedence.
pub fn matches(properties: &JsonObject, known_keys: &HashSet<String>) -> Vec<KeyMatch> {
    let mut hits = Vec::new();
    for (field, value) in properties {
        for variant in variants(value) {
            if known_keys.contains(&variant) {
                hits.push(KeyMatch {
                    field: field.clone(),
                    key: variant,
                });
                break;
            }
        }
    }
    hits
}

/// Resolve a boundary feature's raw properties to a canonical ward key.
///
/// Pure function over its inputs; `None` is a tolerated miss, not an error.
/// The fallback pass restates every variant as an integer, recovering keys
/// the variant set itself did not happen to contain.
pub fn resolve_ward_key(properties: &JsonObject, known_keys: &HashSet<String>) -> Option<String> {
    if let Some(hit) = matches(properties, known_keys).into_iter().next() {
        return Some(hit.key);
    }

    for value in properties.values() {
        for variant in variants(value) {
            if let Some(restated) = as_integer_string(&variant) {
                if known_keys.contains(&restated) {
                    return Some(restated);
                }
            }
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn known(keys: &[&str]) -> HashSet<String> {
        keys.iter().map(|k| k.to_string()).collect()
    }

    fn props(raw: &str) -> JsonObject {
        serde_json::from_str(raw).unwrap()
    }

    #[test]
    fn test_exact_string_match() {
        let p = props(r#"{"ward_id": "198"}"#);
        assert_eq!(
            resolve_ward_key(&p, &known(&["198", "12"])),
            Some("198".to_string())
        );
    }

    #[test]
    fn test_zero_padded_resolves_to_known_key() {
        let p = props(r#"{"ward_id": "007"}"#);
        assert_eq!(resolve_ward_key(&p, &known(&["7"])), Some("7".to_string()));
    }

    #[test]
    fn test_numeric_value_resolves_to_string_key() {
        let p = props(r#"{"WARD_NO": 7}"#);
        assert_eq!(resolve_ward_key(&p, &known(&["7"])), Some("7".to_string()));

        let p = props(r#"{"WARD_NO": 7.0}"#);
        assert_eq!(resolve_ward_key(&p, &known(&["7"])), Some("7".to_string()));
    }

    #[test]
    fn test_case_insensitive_via_uppercase_variant() {
        let p = props(r#"{"code": "w7a"}"#);
        assert_eq!(
            resolve_ward_key(&p, &known(&["W7A"])),
            Some("W7A".to_string())
        );
    }

    #[test]
    fn test_digits_extraction() {
        let p = props(r#"{"label": "Ward 007"}"#);
        assert_eq!(resolve_ward_key(&p, &known(&["7"])), Some("7".to_string()));
    }

    #[test]
    fn test_no_match_is_none() {
        let p = props(r#"{"name": "Shantinagar", "zone": "East"}"#);
        assert_eq!(resolve_ward_key(&p, &known(&["7", "198"])), None);
    }

    #[test]
    fn test_ignores_non_scalar_values() {
        let p = props(r#"{"tags": ["7"], "meta": {"id": "7"}, "flag": true, "gone": null}"#);
        assert_eq!(resolve_ward_key(&p, &known(&["7"])), None);
    }

    #[test]
    fn test_first_field_in_document_order_wins() {
        // Both fields match a known key; the first field of the document
        // decides, not the "better" match.
        let p = props(r#"{"KGISWardID": "7", "ward_id": "007"}"#);
        let keys = known(&["7", "007"]);
        assert_eq!(resolve_ward_key(&p, &keys), Some("7".to_string()));

        let reversed = props(r#"{"ward_id": "007", "KGISWardID": "7"}"#);
        assert_eq!(resolve_ward_key(&reversed, &keys), Some("007".to_string()));
    }

    #[test]
    fn test_variant_generation_order_within_field() {
        // "007": raw form first, then the integer restatement
        let vs = variants(&json!("007"));
        assert_eq!(vs, vec!["007".to_string(), "7".to_string()]);
    }

    #[test]
    fn test_variants_dedup_and_never_empty() {
        let vs = variants(&json!("7"));
        assert_eq!(vs, vec!["7".to_string()]);

        // all-zero string: stripping would empty it, original is kept
        let vs = variants(&json!("000"));
        assert!(vs.contains(&"000".to_string()));
        assert!(vs.contains(&"0".to_string())); // integer restatement
        assert!(!vs.contains(&"".to_string()));

        assert!(variants(&json!("   ")).is_empty());
    }

    #[test]
    fn test_match_list_reports_ambiguity() {
        let p = props(r#"{"KGISWardID": "7", "ward_id": "007"}"#);
        let hits = matches(&p, &known(&["7", "007"]));
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].field, "KGISWardID");
        assert_eq!(hits[0].key, "7");
        assert_eq!(hits[1].field, "ward_id");
        assert_eq!(hits[1].key, "007");
    }

    #[test]
    fn test_resolution_is_idempotent() {
        let p = props(r#"{"KGISWardNo": "042", "name": "Hebbal"}"#);
        let keys = known(&["42"]);
        let first = resolve_ward_key(&p, &keys);
        let second = resolve_ward_key(&p, &keys);
        assert_eq!(first, Some("42".to_string()));
        assert_eq!(first, second);
    }
}
