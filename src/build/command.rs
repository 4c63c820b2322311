//! Command rendering for display and audit.
//!
//! Neither function produces something that is executed: [`escape`] is a
//! human-readable display form, and [`render_run_command`] shows what an
//! equivalent `docker run` would have looked like.

use crate::runtime::CreateContainerSpec;
use std::borrow::Cow;

/// Join `argv` with single spaces, backslash-escaping whitespace, quotes and
/// backslashes inside each token.
pub fn escape<S: AsRef<str>>(argv: &[S]) -> String {
    argv.iter()
        .map(|arg| {
            let mut escaped = String::with_capacity(arg.as_ref().len());
            for c in arg.as_ref().chars() {
                if c.is_whitespace() || matches!(c, '"' | '\'' | '\\') {
                    escaped.push('\\');
                }
                escaped.push(c);
            }
            escaped
        })
        .collect::<Vec<_>>()
        .join(" ")
}

fn quote(value: &str) -> Cow<'_, str> {
    shell_escape::unix::escape(Cow::Borrowed(value))
}

/// Synthetic `docker run` equivalent of a container creation, for audit logs.
pub fn render_run_command(spec: &CreateContainerSpec) -> String {
    let mut parts: Vec<String> = vec!["docker".into(), "run".into(), "-d".into()];

    for (key, value) in &spec.labels {
        parts.push("--label".into());
        parts.push(quote(&format!("{}={}", key, value)).into_owned());
    }
    if let Some(network) = &spec.network {
        parts.push("--network".into());
        parts.push(quote(network).into_owned());
    }
    for alias in &spec.aliases {
        parts.push("--network-alias".into());
        parts.push(quote(alias).into_owned());
    }
    for mapping in &spec.port_bindings {
        parts.push("-p".into());
        parts.push(format!(
            "{}:{}:{}",
            mapping.host_ip, mapping.host_port, mapping.container_port
        ));
    }
    for env in &spec.env {
        parts.push("-e".into());
        parts.push(quote(env).into_owned());
    }
    parts.push(quote(&spec.image).into_owned());
    parts.join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::PortMapping;

    #[test]
    fn test_escape_plain_tokens() {
        assert_eq!(escape(&["bash", "build.sh"]), "bash build.sh");
        assert_eq!(escape::<&str>(&[]), "");
    }

    #[test]
    fn test_escape_special_characters() {
        assert_eq!(
            escape(&["echo", "hello world", "it's", "\"q\"", "a\\b", "tab\there"]),
            "echo hello\\ world it\\'s \\\"q\\\" a\\\\b tab\\\there"
        );
    }

    #[test]
    fn test_render_run_command() {
        let spec = CreateContainerSpec {
            image: "demo".to_string(),
            labels: vec![("app".to_string(), "demo".to_string())],
            env: vec!["JAVA_OPTS=-Da=1 -Db=2".to_string()],
            port_bindings: vec![PortMapping::any_interface(45000, 8080)],
            network: Some("net".to_string()),
            aliases: vec!["demo".to_string()],
            ..Default::default()
        };
        assert_eq!(
            render_run_command(&spec),
            "docker run -d --label app=demo --network net --network-alias demo \
             -p 0.0.0.0:45000:8080 -e 'JAVA_OPTS=-Da=1 -Db=2' demo"
        );
    }
}
