//! Tera rendering for prompts and search queries.
//!
//! Queries in the config file are written with Go-style placeholders
//! (`{{ .Team }}`), so they are rewritten into Tera syntax before rendering.

use lazy_static::lazy_static;
use regex::Regex;
use serde_json::Value;
use tera::{Context, Tera};

use crate::{Error, Result};

lazy_static! {
    static ref FIELD_ACCESS: Regex = Regex::new(r"\{\{(-?)\s*\.").unwrap();
    static ref DEFAULT_FILTER: Regex =
        Regex::new(r#"\|\s*default\s+(?:"([^"]*)"|'([^']*)'|([^\s}]+))\s*\}\}"#).unwrap();
}

/// Rewrite Go template placeholders into Tera syntax.
///
/// - `{{ .Team }}` becomes `{{ Team }}`
/// - `{{ .x | default "y" }}` becomes `{{ x | default(value="y") }}`
pub fn convert_go_to_tera(template: &str) -> String {
    let converted = FIELD_ACCESS.replace_all(template, "{{$1 ");
    let converted = DEFAULT_FILTER.replace_all(&converted, |caps: &regex::Captures| {
        let value = caps
            .get(1)
            .or_else(|| caps.get(2))
            .or_else(|| caps.get(3))
            .map(|m| m.as_str())
            .unwrap_or_default();
        format!("| default(value=\"{}\") }}}}", value)
    });
    converted.into_owned()
}

fn context_from(value: &Value) -> Result<Context> {
    match value {
        Value::Object(_) => Context::from_value(value.clone())
            .map_err(|e| Error::Template(format!("invalid template context: {}", e))),
        other => {
            let mut context = Context::new();
            context.insert("data", other);
            Ok(context)
        }
    }
}

/// Render a Tera template. Object keys become top-level variables; any other
/// value is exposed as `data`.
pub fn render(template: &str, context: &Value) -> Result<String> {
    let mut tera = Tera::default();
    tera.add_raw_template("inline", template)
        .map_err(|e| Error::Template(format!("failed to parse template: {}", e)))?;
    tera.render("inline", &context_from(context)?)
        .map_err(|e| Error::Template(format!("failed to render template: {}", e)))
}

/// Render a template written with Go-style placeholders.
pub fn render_go_template(template: &str, context: &Value) -> Result<String> {
    render(&convert_go_to_tera(template), context)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_convert_go_to_tera() {
        let cases = [
            ("{{ .Team }}", "{{ Team }}"),
            ("{{.Team}}", "{{ Team}}"),
            ("{{ .alert.labels }}", "{{ alert.labels }}"),
            (
                r#"{{ .Team | default "sre" }}"#,
                r#"{{ Team | default(value="sre") }}"#,
            ),
            ("{{ .Limit | default 100 }}", r#"{{ Limit | default(value="100") }}"#),
        ];

        for (input, expected) in cases {
            assert_eq!(convert_go_to_tera(input), expected, "input: {}", input);
        }
    }

    #[test]
    fn test_render_opsgenie_query() {
        let query = r#"responders: "{{ .Team }}" AND status: open AND createdAt > {{ .Today }}"#;
        let rendered =
            render_go_template(query, &json!({"Team": "platform", "Today": "16-10-2026"})).unwrap();
        assert_eq!(
            rendered,
            r#"responders: "platform" AND status: open AND createdAt > 16-10-2026"#
        );
    }

    #[test]
    fn test_render_defaults_and_conditionals() {
        let template = "{% if handle %}Ping {{ handle }}.{% endif %} Team: {{ team | default(value=\"none\") }}";
        assert_eq!(
            render(template, &json!({"handle": "@oncall"})).unwrap(),
            "Ping @oncall. Team: none"
        );
        assert_eq!(render(template, &json!({"handle": ""})).unwrap(), " Team: none");
    }

    #[test]
    fn test_render_non_object_context() {
        assert_eq!(render("value={{ data }}", &json!(42)).unwrap(), "value=42");
    }

    #[test]
    fn test_render_reports_missing_variables() {
        let err = render("{{ missing }}", &json!({})).unwrap_err();
        assert!(matches!(err, Error::Template(_)));
    }
}
