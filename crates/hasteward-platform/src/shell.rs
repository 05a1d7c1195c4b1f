// Copyright (c) Walrus Foundation
// SPDX-License-Identifier: Apache-2.0

//! Shell-safety helpers for commands executed inside containers.
//!
//! Credentials must never appear in process-argument listings, so any value
//! that has to reach a remote command is exported as an environment variable
//! inside an `sh -c` script, single-quoted with the standard escape.

/// Wraps a value in single quotes, escaping embedded single quotes as
/// `'\''` (end quote, escaped quote, reopen quote).
pub fn single_quoted(value: &str) -> String {
    let mut quoted = String::with_capacity(value.len() + 2);
    quoted.push('\'');
    for ch in value.chars() {
        if ch == '\'' {
            quoted.push_str("'\\''");
        } else {
            quoted.push(ch);
        }
    }
    quoted.push('\'');
    quoted
}

/// Builds an `sh -c` argv for the given script.
pub fn sh_command(script: impl Into<String>) -> Vec<String> {
    vec!["sh".to_owned(), "-c".to_owned(), script.into()]
}

/// Builds an `sh -c` argv that exports the given environment pairs before
/// running `command`.
pub fn sh_command_with_env(env: &[(&str, &str)], command: &str) -> Vec<String> {
    let mut script = String::new();
    for (key, value) in env {
        script.push_str("export ");
        script.push_str(key);
        script.push('=');
        script.push_str(&single_quoted(value));
        script.push_str("; ");
    }
    script.push_str(command);
    sh_command(script)
}

#[cfg(test)]
mod tests {
    use hasteward_test_utils::param_test;

    use super::*;

    param_test! {
        quoting: [
            plain: ("hunter2", "'hunter2'"),
            embedded_quote: ("it's", "'it'\\''s'"),
            only_quotes: ("''", "''\\'''\\'''"),
            empty: ("", "''"),
        ]
    }
    fn quoting(input: &str, expected: &str) {
        assert_eq!(single_quoted(input), expected);
    }

    #[test]
    fn env_exports_precede_command() {
        let argv = sh_command_with_env(&[("MYSQL_PWD", "s3cr'et")], "mysql -u root");
        assert_eq!(argv[0], "sh");
        assert_eq!(argv[1], "-c");
        assert_eq!(argv[2], "export MYSQL_PWD='s3cr'\\''et'; mysql -u root");
    }
}
