//! The debug-wrapper specification grammar.
//!
//! A debug wrapper is given as a single command-line string, e.g.
//! `"gdbserver :5555 %program% %arguments%"` or
//! `"WAYLAND_DEBUG=1 strace -f"`. Tokens are separated by unescaped
//! whitespace, `KEY=VALUE` tokens before the first command token define
//! environment variables, and the `%program%`/`%arguments%` placeholders
//! are substituted with the resolved command at start time (appended when
//! missing).

use std::collections::BTreeMap;

/// Parse a debug-wrapper specification into its command template and
/// environment variables.
///
/// Returns `None` for an empty (or whitespace-only) specification.
#[must_use]
pub fn parse_specification(spec: &str) -> Option<(Vec<String>, BTreeMap<String, String>)> {
    let tokens = tokenize(spec);
    if tokens.is_empty() {
        return None;
    }

    let mut env = BTreeMap::new();
    let mut command = Vec::new();

    for token in tokens {
        if command.is_empty() {
            if let Some((key, value)) = token.split_once('=') {
                env.insert(key.to_owned(), value.to_owned());
                continue;
            }
        }
        command.push(token);
    }

    // the placeholders have to be present as standalone tokens; append the
    // missing ones so the wrapped program is always part of the command
    if !command.iter().any(|t| t == "%program%") {
        command.push("%program%".to_owned());
    }
    if !command.iter().any(|t| t == "%arguments%") {
        command.push("%arguments%".to_owned());
    }

    Some((command, env))
}

/// Substitute the `%program%` and `%arguments%` placeholders in a parsed
/// command template.
///
/// A standalone `%arguments%` token expands into the individual arguments;
/// inside a larger token the argument list is joined with single spaces.
#[must_use]
pub fn substitute_command(command: &[String], program: &str, arguments: &[String]) -> Vec<String> {
    let mut result = Vec::with_capacity(command.len() + arguments.len());
    for token in command {
        if token == "%program%" {
            result.push(program.to_owned());
        } else if token == "%arguments%" {
            result.extend(arguments.iter().cloned());
        } else {
            let mut token = token.replace("%program%", program);
            if token.contains("%arguments%") {
                token = token.replace("%arguments%", &arguments.join(" "));
            }
            result.push(token);
        }
    }
    result
}

/// Split on unescaped whitespace; `\` preserves the following character
/// literally and `\n` becomes a newline.
fn tokenize(spec: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut chars = spec.chars();

    while let Some(c) = chars.next() {
        match c {
            '\\' => match chars.next() {
                Some('n') => current.push('\n'),
                Some(escaped) => current.push(escaped),
                None => {}
            },
            c if c.is_whitespace() => {
                if !current.is_empty() {
                    tokens.push(std::mem::take(&mut current));
                }
            }
            c => current.push(c),
        }
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    tokens
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect()
    }

    fn cmd(tokens: &[&str]) -> Vec<String> {
        tokens.iter().map(|t| (*t).to_owned()).collect()
    }

    #[test]
    fn specification_grammar() {
        #[allow(clippy::type_complexity)]
        let table: &[(&str, Option<(&[&str], &[(&str, &str)])>)] = &[
            // empty
            ("", None),
            (" ", None),
            // environment only
            ("foo=bar", Some((&["%program%", "%arguments%"], &[("foo", "bar")]))),
            ("foo=bar ", Some((&["%program%", "%arguments%"], &[("foo", "bar")]))),
            // plain commands
            ("foo", Some((&["foo", "%program%", "%arguments%"], &[]))),
            (" foo", Some((&["foo", "%program%", "%arguments%"], &[]))),
            ("foo ", Some((&["foo", "%program%", "%arguments%"], &[]))),
            ("foo bar", Some((&["foo", "bar", "%program%", "%arguments%"], &[]))),
            ("foo  bar", Some((&["foo", "bar", "%program%", "%arguments%"], &[]))),
            (
                "foo bar baz",
                Some((&["foo", "bar", "baz", "%program%", "%arguments%"], &[])),
            ),
            // escapes
            (
                "fo\\ o b\\nar b\\\\az",
                Some((&["fo o", "b\nar", "b\\az", "%program%", "%arguments%"], &[])),
            ),
            // environment plus command
            (
                "foo=bar baz",
                Some((&["baz", "%program%", "%arguments%"], &[("foo", "bar")])),
            ),
            (
                "foo=bar a= baz zab",
                Some((&["baz", "zab", "%program%", "%arguments%"], &[("foo", "bar"), ("a", "")])),
            ),
            (
                "foo=b\\ a=\\n baz z\\ ab",
                Some((&["baz", "z ab", "%program%", "%arguments%"], &[("foo", "b a=\n")])),
            ),
            // assignments after the first command token are arguments
            (
                "a=b c d=e",
                Some((&["c", "d=e", "%program%", "%arguments%"], &[("a", "b")])),
            ),
            // explicit placeholders
            (
                "a=b %program% c %arguments% d",
                Some((&["%program%", "c", "%arguments%", "d"], &[("a", "b")])),
            ),
            (
                "a=b %program% c d",
                Some((&["%program%", "c", "d", "%arguments%"], &[("a", "b")])),
            ),
            (
                "a=b %arguments%",
                Some((&["%arguments%", "%program%"], &[("a", "b")])),
            ),
            ("%program% %arguments%", Some((&["%program%", "%arguments%"], &[]))),
            (
                "%program% foo-%program% foo-%arguments%-bar %arguments%",
                Some((
                    &["%program%", "foo-%program%", "foo-%arguments%-bar", "%arguments%"],
                    &[],
                )),
            ),
        ];

        for (spec, expected) in table {
            let parsed = parse_specification(spec);
            match expected {
                None => assert!(parsed.is_none(), "spec {spec:?} should be invalid"),
                Some((exp_cmd, exp_env)) => {
                    let (got_cmd, got_env) = parsed.unwrap_or_else(|| panic!("spec {spec:?} should parse"));
                    assert_eq!(got_cmd, cmd(exp_cmd), "command for {spec:?}");
                    assert_eq!(got_env, env(exp_env), "env for {spec:?}");
                }
            }
        }
    }

    #[test]
    fn substitution() {
        #[allow(clippy::type_complexity)]
        let table: &[(&[&str], &str, &[&str], &[&str])] = &[
            (
                &["%program%", "%arguments%"],
                "prg",
                &["arg1", "arg2"],
                &["prg", "arg1", "arg2"],
            ),
            (&["%program%"], "prg", &["arg1", "arg2"], &["prg"]),
            (
                &["%program%", "\"x-%program%\"", "%arguments%", "x-%arguments%"],
                "prg",
                &["arg1", "arg2"],
                &["prg", "\"x-prg\"", "arg1", "arg2", "x-arg1 arg2"],
            ),
            (
                &["foo", "%arguments%", "bar", "%program%", "baz", "%arguments%", "foo2"],
                "prg",
                &["a1", "a2", "a3"],
                &["foo", "a1", "a2", "a3", "bar", "prg", "baz", "a1", "a2", "a3", "foo2"],
            ),
        ];

        for (template, program, arguments, expected) in table {
            let result = substitute_command(&cmd(template), program, &cmd(arguments));
            assert_eq!(result, cmd(expected), "template {template:?}");
        }
    }
}
