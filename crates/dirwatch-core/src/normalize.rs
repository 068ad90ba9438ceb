//! Raw upstream record -> canonical company.

use serde_json::Value as JsonValue;
use thiserror::Error;

use crate::{CompanyAttributes, NormalizedCompany, RawCompany, DEFAULT_STAGE};

const UNKNOWN_NAME: &str = "Unknown";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NormalizeError {
    #[error("record has no upstream identity (name: {name})")]
    MissingIdentity { name: String },
}

fn text_or_none(value: &str) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// String-ish field: strings are trimmed, numbers rendered, anything else ignored.
fn text_field(raw: &RawCompany, key: &str) -> Option<String> {
    match raw.get(key)? {
        JsonValue::String(s) => text_or_none(s),
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn first_text_field(raw: &RawCompany, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|key| text_field(raw, key))
}

/// Upstream identity key of a raw hit: `id`, falling back to `objectID`.
pub fn upstream_identity(raw: &RawCompany) -> Option<String> {
    first_text_field(raw, &["id", "objectID"])
}

/// Hostname of a website field: scheme, userinfo, port, path, query,
/// fragment and a leading `www.` are dropped and the result is lowercased.
pub fn extract_domain(website: &str) -> Option<String> {
    let trimmed = website.trim();
    let without_scheme = match trimmed.find("://") {
        Some(idx) => &trimmed[idx + 3..],
        None => trimmed.strip_prefix("//").unwrap_or(trimmed),
    };
    let authority = without_scheme
        .split(['/', '?', '#'])
        .next()
        .unwrap_or_default();
    let host_and_port = authority.rsplit('@').next().unwrap_or(authority);
    let host = if let Some(bracketed) = host_and_port.strip_prefix('[') {
        bracketed.split(']').next().unwrap_or_default()
    } else {
        host_and_port.split(':').next().unwrap_or_default()
    };
    let host = host.trim_end_matches('.').to_ascii_lowercase();
    let host = host.strip_prefix("www.").unwrap_or(&host);
    if host.is_empty() || host.chars().any(char::is_whitespace) {
        None
    } else {
        Some(host.to_string())
    }
}

/// Lowercase ASCII slug: runs of non-alphanumerics collapse into one `-`.
pub fn slugify(input: &str) -> String {
    input
        .to_ascii_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join("-")
}

fn tags(raw: &RawCompany) -> Vec<String> {
    let candidates: Vec<&str> = match raw.get("tags") {
        Some(JsonValue::Array(items)) => items.iter().filter_map(JsonValue::as_str).collect(),
        Some(JsonValue::String(single)) => vec![single.as_str()],
        _ => Vec::new(),
    };
    let mut out: Vec<String> = Vec::with_capacity(candidates.len());
    for tag in candidates.into_iter().filter_map(text_or_none) {
        if !out.contains(&tag) {
            out.push(tag);
        }
    }
    out
}

fn headcount_bucket(count: i64) -> Option<&'static str> {
    match count {
        i64::MIN..=0 => None,
        1..=10 => Some("1-10"),
        11..=50 => Some("11-50"),
        51..=200 => Some("51-200"),
        201..=500 => Some("201-500"),
        501..=1000 => Some("501-1000"),
        _ => Some("1001+"),
    }
}

fn team_size(raw: &RawCompany) -> Option<i64> {
    match raw.get("team_size")? {
        JsonValue::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        JsonValue::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn employee_range(raw: &RawCompany) -> Option<String> {
    if let Some(range) = first_text_field(raw, &["employee_range", "employee_size"]) {
        return Some(range);
    }
    team_size(raw)
        .and_then(headcount_bucket)
        .map(ToString::to_string)
}

/// Normalize one upstream hit. Missing optional fields take their defaults;
/// only a missing identity is rejected.
pub fn normalize_record(raw: &RawCompany) -> Result<NormalizedCompany, NormalizeError> {
    let name = text_field(raw, "name").unwrap_or_else(|| UNKNOWN_NAME.to_string());
    let Some(upstream_id) = upstream_identity(raw) else {
        return Err(NormalizeError::MissingIdentity { name });
    };

    let slug = text_field(raw, "slug")
        .or_else(|| Some(slugify(&name)).filter(|s| !s.is_empty()));
    let domain = text_field(raw, "website").and_then(|w| extract_domain(&w));

    let attributes = CompanyAttributes {
        batch: text_field(raw, "batch"),
        stage: text_field(raw, "stage").unwrap_or_else(|| DEFAULT_STAGE.to_string()),
        description: first_text_field(raw, &["one_liner", "short_description", "long_description"]),
        location: first_text_field(raw, &["location", "all_locations"]),
        tags: tags(raw),
        employee_range: employee_range(raw),
    };

    Ok(NormalizedCompany {
        upstream_id,
        name,
        domain,
        slug,
        attributes,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn raw(value: JsonValue) -> RawCompany {
        RawCompany::from_value(value).unwrap()
    }

    #[test]
    fn scheme_and_trailing_slash_normalize_to_same_domain() {
        for input in ["https://Example.com/", "http://example.com", "example.com/"] {
            assert_eq!(extract_domain(input).as_deref(), Some("example.com"), "{input}");
        }
    }

    #[test]
    fn domain_drops_path_query_port_and_userinfo() {
        assert_eq!(extract_domain("https://acme.io/about?x=1").as_deref(), Some("acme.io"));
        assert_eq!(extract_domain("acme.io:8080/jobs").as_deref(), Some("acme.io"));
        assert_eq!(extract_domain("https://user:pw@Acme.io#top").as_deref(), Some("acme.io"));
        assert_eq!(extract_domain("//www.acme.io.").as_deref(), Some("acme.io"));
        assert_eq!(extract_domain("https://WWW.Acme.io/").as_deref(), Some("acme.io"));
        assert_eq!(extract_domain("www2.acme.io").as_deref(), Some("www2.acme.io"));
        assert_eq!(extract_domain("http://[::1]:3000/").as_deref(), Some("::1"));
    }

    #[test]
    fn blank_or_malformed_websites_have_no_domain() {
        assert_eq!(extract_domain(""), None);
        assert_eq!(extract_domain("   "), None);
        assert_eq!(extract_domain("https://"), None);
        assert_eq!(extract_domain("not a domain"), None);
    }

    #[test]
    fn missing_fields_take_explicit_defaults() {
        let company = normalize_record(&raw(json!({"id": "abc"}))).unwrap();
        assert_eq!(company.upstream_id, "abc");
        assert_eq!(company.name, "Unknown");
        assert_eq!(company.domain, None);
        assert_eq!(company.slug.as_deref(), Some("unknown"));
        assert_eq!(company.attributes, CompanyAttributes::default());
        assert_eq!(company.attributes.stage, DEFAULT_STAGE);
    }

    #[test]
    fn numeric_identity_and_object_id_fallback() {
        let numeric = normalize_record(&raw(json!({"id": 271, "name": "Acme"}))).unwrap();
        assert_eq!(numeric.upstream_id, "271");
        let object_id = normalize_record(&raw(json!({"objectID": "x9", "name": "Acme"}))).unwrap();
        assert_eq!(object_id.upstream_id, "x9");
    }

    #[test]
    fn missing_identity_is_rejected() {
        let err = normalize_record(&raw(json!({"name": "Ghost"}))).unwrap_err();
        assert_eq!(err, NormalizeError::MissingIdentity { name: "Ghost".into() });
        assert!(normalize_record(&raw(json!({"id": "  "}))).is_err());
    }

    #[test]
    fn full_record_normalizes_every_field() {
        let company = normalize_record(&raw(json!({
            "id": "abc",
            "name": "  Acme Rockets ",
            "slug": "acme",
            "website": "https://acme.io/",
            "batch": "W21",
            "stage": "",
            "one_liner": "Rockets and anvils",
            "all_locations": "Phoenix, AZ",
            "tags": ["B2B", " Hardware ", "B2B", 7, ""],
            "team_size": 42
        })))
        .unwrap();
        assert_eq!(company.name, "Acme Rockets");
        assert_eq!(company.slug.as_deref(), Some("acme"));
        assert_eq!(company.domain.as_deref(), Some("acme.io"));
        assert_eq!(company.attributes.batch.as_deref(), Some("W21"));
        assert_eq!(company.attributes.stage, "Active");
        assert_eq!(company.attributes.description.as_deref(), Some("Rockets and anvils"));
        assert_eq!(company.attributes.location.as_deref(), Some("Phoenix, AZ"));
        assert_eq!(company.attributes.tags, vec!["B2B", "Hardware"]);
        assert_eq!(company.attributes.employee_range.as_deref(), Some("11-50"));
    }

    #[test]
    fn tags_keep_first_occurrence_order() {
        let company = normalize_record(&raw(json!({
            "id": "t", "tags": ["Fintech", "AI", "Fintech", "B2B", "AI"]
        })))
        .unwrap();
        assert_eq!(company.attributes.tags, vec!["Fintech", "AI", "B2B"]);
    }

    #[test]
    fn explicit_employee_range_wins_over_team_size() {
        let company = normalize_record(&raw(json!({
            "id": "e", "employee_size": "201-500", "team_size": 3
        })))
        .unwrap();
        assert_eq!(company.attributes.employee_range.as_deref(), Some("201-500"));

        let bucketed = normalize_record(&raw(json!({"id": "e", "team_size": "1200"}))).unwrap();
        assert_eq!(bucketed.attributes.employee_range.as_deref(), Some("1001+"));

        let empty = normalize_record(&raw(json!({"id": "e", "team_size": 0}))).unwrap();
        assert_eq!(empty.attributes.employee_range, None);
    }

    #[test]
    fn slug_is_derived_from_name_when_absent() {
        assert_eq!(slugify("Acme, Inc. (YC W21)"), "acme-inc-yc-w21");
        let company = normalize_record(&raw(json!({"id": "s", "name": "Hello World!"}))).unwrap();
        assert_eq!(company.slug.as_deref(), Some("hello-world"));
    }
}
