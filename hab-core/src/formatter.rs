// Value formatting for config and distro settings.
//
// Values in json documents may contain format markers that are expanded in
// two stages. `{relative_root}` and user defined `{variable}` markers are
// expanded while composing the environment. `{;}` and `{NAME!e}` depend on
// the shell the output is written for, so they are preserved until a script
// is rendered and a concrete `Shell` is known.

use std::collections::BTreeMap;

use crate::errors::{HabError, Result};
use crate::platform::Shell;

/// Variable names that can not be redefined by a config's `variables` map.
pub const RESERVED_VARIABLE_NAMES: [&str; 2] = ["relative_root", ";"];

/// Context for the compose-time expansion stage.
#[derive(Debug, Default, Clone)]
pub struct FormatContext {
    /// Directory of the json file the value came from, with forward slashes.
    pub relative_root: String,
    /// User defined variables collected from the reduced config.
    pub variables: BTreeMap<String, String>,
}

impl FormatContext {
    pub fn new(relative_root: impl Into<String>) -> Self {
        FormatContext {
            relative_root: relative_root.into(),
            variables: BTreeMap::new(),
        }
    }

    pub fn with_variables(mut self, variables: BTreeMap<String, String>) -> Self {
        self.variables = variables;
        self
    }
}

/// Reject user variables that shadow names owned by the formatter.
pub fn check_variable_names<'a>(names: impl Iterator<Item = &'a String>) -> Result<()> {
    for name in names {
        if RESERVED_VARIABLE_NAMES.contains(&name.as_str()) {
            return Err(HabError::ReservedVariableName(name.clone()));
        }
    }
    Ok(())
}

/// Expand format markers in a value.
///
/// When `shell` is `None` the shell specific markers `{;}` and `{NAME!e}`
/// are written back out unchanged so a later render pass can resolve them.
/// Unknown `{marker}` names are left untouched, the environment a script is
/// sourced in may give them meaning.
pub fn format_value(value: &str, ctx: &FormatContext, shell: Option<Shell>) -> String {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars().peekable();

    while let Some(ch) = chars.next() {
        match ch {
            '{' => {
                if chars.peek() == Some(&'{') {
                    chars.next();
                    out.push('{');
                    continue;
                }
                // Collect the marker body up to the closing brace
                let mut body = String::new();
                let mut closed = false;
                for c in chars.by_ref() {
                    if c == '}' {
                        closed = true;
                        break;
                    }
                    body.push(c);
                }
                if !closed {
                    // Unterminated marker, emit it literally
                    out.push('{');
                    out.push_str(&body);
                    continue;
                }
                expand_marker(&body, ctx, shell, &mut out);
            }
            '}' => {
                if chars.peek() == Some(&'}') {
                    chars.next();
                }
                out.push('}');
            }
            _ => out.push(ch),
        }
    }
    out
}

fn expand_marker(body: &str, ctx: &FormatContext, shell: Option<Shell>, out: &mut String) {
    if body == ";" {
        match shell {
            Some(shell) => out.push_str(shell.list_sep()),
            None => out.push_str("{;}"),
        }
        return;
    }

    if let Some(name) = body.strip_suffix("!e") {
        match shell {
            Some(shell) => out.push_str(&shell.env_ref(name)),
            None => {
                out.push('{');
                out.push_str(body);
                out.push('}');
            }
        }
        return;
    }

    if body == "relative_root" {
        out.push_str(&ctx.relative_root);
        return;
    }

    if let Some(value) = ctx.variables.get(body) {
        out.push_str(value);
        return;
    }

    // Not a marker hab owns, keep it as written
    out.push('{');
    out.push_str(body);
    out.push('}');
}

/// Convert a path into the forward slash form used for `{relative_root}`.
pub fn forward_slash(path: &std::path::Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}

/// Expand the shell markers of a composed value against the live process
/// environment, for launching a program directly instead of writing a
/// script. `{NAME!e}` becomes the current value of that variable and `{;}`
/// the platform separator.
pub fn expand_value(value: &str, platform: crate::platform::Platform) -> String {
    let mut out = String::with_capacity(value.len());
    let mut rest = value;
    while let Some(start) = rest.find('{') {
        out.push_str(&rest[..start]);
        let after = &rest[start + 1..];
        let Some(end) = after.find('}') else {
            out.push_str(&rest[start..]);
            return out;
        };
        let body = &after[..end];
        if body == ";" {
            out.push_str(platform.list_sep());
        } else if let Some(name) = body.strip_suffix("!e") {
            out.push_str(&std::env::var(name).unwrap_or_default());
        } else {
            out.push('{');
            out.push_str(body);
            out.push('}');
        }
        rest = &after[end + 1..];
    }
    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> FormatContext {
        let mut variables = BTreeMap::new();
        variables.insert("studio".to_string(), "/mnt/studio".to_string());
        FormatContext::new("/configs/project_a").with_variables(variables)
    }

    #[test]
    fn test_relative_root() {
        let ret = format_value("{relative_root}/maya/modules", &ctx(), None);
        assert_eq!(ret, "/configs/project_a/maya/modules");
    }

    #[test]
    fn test_user_variables() {
        let ret = format_value("{studio}/tools", &ctx(), None);
        assert_eq!(ret, "/mnt/studio/tools");
        // Unknown markers survive both stages untouched
        let ret = format_value("{unknown}/tools", &ctx(), Some(Shell::Sh));
        assert_eq!(ret, "{unknown}/tools");
    }

    #[test]
    fn test_deferred_markers_are_preserved() {
        let ret = format_value("a{;}b;c:{PATH!e}{;}d", &ctx(), None);
        assert_eq!(ret, "a{;}b;c:{PATH!e}{;}d");
    }

    #[test]
    fn test_shell_markers() {
        let value = "a{;}b;c:{PATH!e}{;}d";
        assert_eq!(
            format_value(value, &ctx(), Some(Shell::Sh)),
            "a:b;c:$PATH:d"
        );
        assert_eq!(
            format_value(value, &ctx(), Some(Shell::ShWin)),
            "a:b;c:$PATH:d"
        );
        assert_eq!(
            format_value(value, &ctx(), Some(Shell::Ps)),
            "a;b;c:$env:PATH;d"
        );
        assert_eq!(
            format_value(value, &ctx(), Some(Shell::Batch)),
            "a;b;c:%PATH%;d"
        );
    }

    #[test]
    fn test_escaped_braces() {
        assert_eq!(format_value("{{literal}}", &ctx(), None), "{literal}");
    }

    #[test]
    fn test_check_variable_names() {
        let ok = vec!["studio".to_string(), "show".to_string()];
        assert!(check_variable_names(ok.iter()).is_ok());

        let bad = vec!["relative_root".to_string()];
        assert!(matches!(
            check_variable_names(bad.iter()),
            Err(HabError::ReservedVariableName(name)) if name == "relative_root"
        ));
    }
}
