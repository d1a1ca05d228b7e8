//! Environment discovery built on the one-shot command runner.
//!
//! GUI-launched applications usually inherit a minimal environment. These
//! helpers ask the user's shell for the real `PATH` and variables so that
//! sessions start with what the user would see in a terminal.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::runner::CommandRunner;

/// Resolves `name` to an absolute executable path.
///
/// Names containing a `/` are checked directly. Bare names are looked up
/// with `which`, falling back to the shell's `command -v`.
pub async fn resolve_executable(
    runner: &CommandRunner,
    name: &str,
    timeout: Duration,
) -> Option<PathBuf> {
    if name.is_empty() {
        return None;
    }
    if name.contains('/') {
        let path = Path::new(name);
        return path.is_file().then(|| path.to_path_buf());
    }

    let found = match runner.run("/usr/bin/which", [name], timeout).await {
        Some(output) => Some(output),
        None => {
            runner
                .run("/bin/sh", ["-c", "command -v \"$1\"", "sh", name], timeout)
                .await
        }
    }?;

    let path = PathBuf::from(first_line(&found)?);
    if path.is_absolute() {
        tracing::debug!(name, path = %path.display(), "Resolved executable");
        Some(path)
    } else {
        None
    }
}

/// Captures the environment of a login shell.
///
/// Runs `shell -l -c env` and parses its output.
pub async fn login_environment(
    runner: &CommandRunner,
    shell: &Path,
    timeout: Duration,
) -> Option<HashMap<String, String>> {
    let output = runner.run(shell, ["-l", "-c", "env"], timeout).await?;
    let env = parse_environment(&output);
    tracing::debug!(shell = %shell.display(), vars = env.len(), "Captured login environment");
    Some(env)
}

/// Parses `KEY=VALUE` lines.
///
/// Lines without `=` or with an empty key are skipped. Values keep any
/// further `=` characters.
pub fn parse_environment(output: &str) -> HashMap<String, String> {
    output
        .lines()
        .filter_map(|line| {
            let (key, value) = line.split_once('=')?;
            if key.is_empty() || key.contains(char::is_whitespace) {
                return None;
            }
            Some((key.to_string(), value.to_string()))
        })
        .collect()
}

fn first_line(output: &str) -> Option<&str> {
    output.lines().map(str::trim).find(|line| !line.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    const TIMEOUT: Duration = Duration::from_secs(5);

    #[test]
    fn test_parse_environment() {
        let env = parse_environment("HOME=/home/me\nEQ=a=b\nEMPTY=\nnot a var\n=nokey\n");
        assert_eq!(env.get("HOME").map(String::as_str), Some("/home/me"));
        assert_eq!(env.get("EQ").map(String::as_str), Some("a=b"));
        assert_eq!(env.get("EMPTY").map(String::as_str), Some(""));
        assert_eq!(env.len(), 3);
    }

    #[test]
    fn test_first_line_skips_blanks() {
        assert_eq!(first_line("\n  \n/bin/sh\n/usr/bin/sh\n"), Some("/bin/sh"));
        assert_eq!(first_line("\n"), None);
    }

    #[tokio::test]
    async fn test_resolve_absolute_path() {
        let runner = CommandRunner::new();
        let path = resolve_executable(&runner, "/bin/sh", TIMEOUT).await;
        assert_eq!(path, Some(PathBuf::from("/bin/sh")));

        let missing = resolve_executable(&runner, "/nonexistent/binary", TIMEOUT).await;
        assert!(missing.is_none());
    }

    #[tokio::test]
    async fn test_resolve_bare_name() {
        let runner = CommandRunner::new();
        let path = resolve_executable(&runner, "sh", TIMEOUT).await.unwrap();
        assert!(path.is_absolute());
        assert!(path.ends_with("sh"));
    }

    #[tokio::test]
    async fn test_resolve_unknown_name() {
        let runner = CommandRunner::new();
        let path = resolve_executable(&runner, "ptyvisor-no-such-tool", TIMEOUT).await;
        assert!(path.is_none());
    }

    #[tokio::test]
    async fn test_login_environment_has_path() {
        let runner = CommandRunner::new();
        let env = login_environment(&runner, Path::new("/bin/sh"), TIMEOUT)
            .await
            .unwrap();
        assert!(env.contains_key("PATH"));
    }
}
