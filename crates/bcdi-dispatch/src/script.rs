use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;

use crate::job::DispatchError;

/// Substitute `${name}` placeholders in a job script template.
///
/// Every placeholder must have a binding; an unresolved one fails instead of
/// silently submitting a broken script to the scheduler.
pub fn render_template(
    template: &str,
    vars: &BTreeMap<String, String>,
) -> Result<String, DispatchError> {
    let mut rendered = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find("${") {
        rendered.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let end = after.find('}').ok_or_else(|| {
            DispatchError::UnresolvedPlaceholder(after.chars().take(24).collect())
        })?;
        let name = &after[..end];
        match vars.get(name) {
            Some(value) => rendered.push_str(value),
            None => return Err(DispatchError::UnresolvedPlaceholder(name.to_string())),
        }
        rest = &after[end + 1..];
    }
    rendered.push_str(rest);
    Ok(rendered)
}

/// Write the `key = value` input file consumed by the external engine.
///
/// Entries are emitted in iteration order; callers pass the snapshot's
/// engine passthrough channel plus any paths (data, mask) the engine needs.
pub fn write_engine_input_file<'a, I>(path: &Path, params: I) -> std::io::Result<()>
where
    I: IntoIterator<Item = (&'a String, &'a Value)>,
{
    let mut lines = Vec::new();
    for (key, value) in params {
        lines.push(format!("{key} = {}", render_value(value)));
    }
    let mut body = lines.join("\n");
    body.push('\n');
    std::fs::write(path, body)
}

fn render_value(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::Bool(flag) => flag.to_string(),
        Value::Number(number) => number.to_string(),
        Value::String(text) => text.clone(),
        Value::Array(items) => items
            .iter()
            .map(render_value)
            .collect::<Vec<_>>()
            .join(","),
        Value::Object(_) => value.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn vars(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn template_substitutes_all_placeholders() {
        let template = "#SBATCH --partition=${partition}\ncd ${working_dir}\n";
        let rendered = render_template(
            template,
            &vars(&[("partition", "p9gpu"), ("working_dir", "/tmp/phasing")]),
        )
        .expect("render");
        assert_eq!(rendered, "#SBATCH --partition=p9gpu\ncd /tmp/phasing\n");
    }

    #[test]
    fn unresolved_placeholder_is_an_error() {
        let err = render_template("run ${engine}", &vars(&[]))
            .err()
            .expect("must fail");
        assert!(matches!(
            err,
            DispatchError::UnresolvedPlaceholder(name) if name == "engine"
        ));
    }

    #[test]
    fn engine_input_file_uses_key_equals_value_lines() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("engine_inputs.txt");

        let mut params = BTreeMap::new();
        params.insert("beta".to_string(), json!(0.9));
        params.insert("detwin".to_string(), json!(false));
        params.insert("rebin".to_string(), json!([1, 1, 2]));
        params.insert("support".to_string(), json!("auto"));

        write_engine_input_file(&path, &params).expect("write");
        let text = std::fs::read_to_string(&path).expect("read");
        assert!(text.contains("beta = 0.9"));
        assert!(text.contains("detwin = false"));
        assert!(text.contains("rebin = 1,1,2"));
        assert!(text.contains("support = auto"));
    }
}
