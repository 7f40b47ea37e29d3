//! Template rendering boundary.
//!
//! Operators template file content and operation parameters with the host's
//! effective variables. Undefined variables are hard errors: a typo in a
//! variable name must fail the operation, not silently render an empty
//! string.

use camino::Utf8Path;
use minijinja::{Environment, UndefinedBehavior, Value};
use thiserror::Error;

use crate::inventory::VarMap;

#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("cannot read template '{path}': {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("cannot render template: {0}")]
    Render(#[from] Box<minijinja::Error>),
}

fn environment() -> Environment<'static> {
    let mut env = Environment::new();
    env.set_undefined_behavior(UndefinedBehavior::Strict);
    env
}

/// Render an inline template string with the given variables.
///
/// # Errors
/// Returns an error on syntax errors or undefined variables.
pub fn render_str(source: &str, vars: &VarMap) -> Result<String, TemplateError> {
    let env = environment();
    Ok(env
        .render_str(source, Value::from_serialize(vars))
        .map_err(Box::new)?)
}

/// Render a template file with the given variables.
///
/// # Errors
/// Returns an error when the file is unreadable or rendering fails.
pub fn render_file(path: &Utf8Path, vars: &VarMap) -> Result<String, TemplateError> {
    let source = std::fs::read_to_string(path).map_err(|source| TemplateError::Io {
        path: path.to_string(),
        source,
    })?;
    render_str(&source, vars)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn vars() -> VarMap {
        let mut vars = VarMap::new();
        vars.insert("hostname".to_owned(), json!("chef"));
        vars.insert("is_desktop".to_owned(), json!(true));
        vars
    }

    #[test]
    fn renders_variables_and_filters() {
        let out = render_str("{{ hostname | upper }}", &vars()).unwrap();
        assert_eq!(out, "CHEF");
    }

    #[test]
    fn renders_conditionals() {
        let out = render_str(
            "{% if is_desktop %}desktop{% else %}server{% endif %}",
            &vars(),
        )
        .unwrap();
        assert_eq!(out, "desktop");
    }

    #[test]
    fn undefined_variables_are_errors() {
        let err = render_str("{{ no_such_var }}", &vars()).unwrap_err();
        assert!(matches!(err, TemplateError::Render(_)));
    }

    #[test]
    fn renders_template_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("motd.j2");
        std::fs::write(&path, "host {{ hostname }}\n").unwrap();
        let out = render_file(
            Utf8Path::new(path.to_str().unwrap()),
            &vars(),
        )
        .unwrap();
        assert_eq!(out, "host chef\n");
    }
}
