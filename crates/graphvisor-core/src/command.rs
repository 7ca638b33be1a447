use crate::error::SupervisorError;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// External command with placeholder-bearing arguments
///
/// Recognised placeholders: `{base_path}`, `{graph_dir}`, `{router}`,
/// `{osm_file}`, `{engine_jar}`, `{port}` (first allocated port) and
/// `{port.N}`. Any other brace group is passed through untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandTemplate {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

/// Values substituted into a [`CommandTemplate`]
#[derive(Debug, Clone, Copy)]
pub struct CommandContext<'a> {
    pub base_path: &'a Path,
    pub graph_dir: &'a Path,
    pub router: &'a str,
    pub osm_file: Option<&'a Path>,
    pub engine_jar: Option<&'a Path>,
    pub ports: &'a [u16],
}

impl CommandTemplate {
    pub fn new<S: ToString, I: IntoIterator<Item = S>>(program: impl Into<String>, args: I) -> Self {
        Self {
            program: program.into(),
            args: args.into_iter().map(|s| s.to_string()).collect(),
        }
    }

    pub fn expand(&self, ctx: &CommandContext<'_>) -> Result<Vec<String>, SupervisorError> {
        self.args.iter().map(|arg| expand_arg(arg, ctx)).collect()
    }

    /// Highest number of ports referenced by the arguments
    pub fn ports_referenced(&self) -> usize {
        let mut needed = 0;
        for arg in &self.args {
            for token in tokens(arg) {
                if token == "port" {
                    needed = needed.max(1);
                } else if let Some(index) = token.strip_prefix("port.").and_then(|n| n.parse::<usize>().ok()) {
                    needed = needed.max(index + 1);
                }
            }
        }
        needed
    }
}

fn tokens(arg: &str) -> impl Iterator<Item = &str> {
    arg.split('{')
        .skip(1)
        .filter_map(|rest| rest.split_once('}').map(|(token, _)| token))
}

fn expand_arg(arg: &str, ctx: &CommandContext<'_>) -> Result<String, SupervisorError> {
    let mut out = String::with_capacity(arg.len());
    let mut rest = arg;

    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        let Some(close) = after.find('}') else {
            out.push_str(&rest[open..]);
            return Ok(out);
        };

        let token = &after[..close];
        match resolve(token, ctx)? {
            Some(value) => out.push_str(&value),
            None => {
                out.push('{');
                out.push_str(token);
                out.push('}');
            }
        }
        rest = &after[close + 1..];
    }

    out.push_str(rest);
    Ok(out)
}

fn resolve(token: &str, ctx: &CommandContext<'_>) -> Result<Option<String>, SupervisorError> {
    let value = match token {
        "base_path" => ctx.base_path.display().to_string(),
        "graph_dir" => ctx.graph_dir.display().to_string(),
        "router" => ctx.router.to_string(),
        "osm_file" => match ctx.osm_file {
            Some(path) => path.display().to_string(),
            None => {
                return Err(SupervisorError::Configuration(
                    "command references {osm_file} but no map file was downloaded".to_string(),
                ));
            }
        },
        "engine_jar" => match ctx.engine_jar {
            Some(path) => path.display().to_string(),
            None => {
                return Err(SupervisorError::Configuration(
                    "command references {engine_jar} but the engine has no installed jar".to_string(),
                ));
            }
        },
        "port" => port_at(ctx, 0)?,
        other => match other.strip_prefix("port.").map(str::parse::<usize>) {
            Some(Ok(index)) => port_at(ctx, index)?,
            _ => return Ok(None),
        },
    };
    Ok(Some(value))
}

fn port_at(ctx: &CommandContext<'_>, index: usize) -> Result<String, SupervisorError> {
    ctx.ports
        .get(index)
        .map(u16::to_string)
        .ok_or_else(|| {
            SupervisorError::Configuration(format!(
                "command references port {index} but only {} ports were allocated",
                ctx.ports.len()
            ))
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx<'a>(ports: &'a [u16]) -> CommandContext<'a> {
        CommandContext {
            base_path: Path::new("."),
            graph_dir: Path::new("graphs/portland"),
            router: "portland",
            osm_file: None,
            engine_jar: None,
            ports,
        }
    }

    #[test]
    fn test_expand_server_args() {
        let template = CommandTemplate::new(
            "java",
            [
                "-jar",
                "otp.jar",
                "--basePath",
                "{base_path}",
                "--router",
                "{router}",
                "--port",
                "{port}",
                "--securePort",
                "{port.1}",
            ],
        );

        let args = template.expand(&ctx(&[8105, 8107])).unwrap();
        assert_eq!(
            args,
            vec![
                "-jar",
                "otp.jar",
                "--basePath",
                ".",
                "--router",
                "portland",
                "--port",
                "8105",
                "--securePort",
                "8107"
            ]
        );
        assert_eq!(template.ports_referenced(), 2);
    }

    #[test]
    fn test_embedded_placeholders() {
        let template = CommandTemplate::new("sh", ["-c", "echo serving {router} on {port}"]);
        let args = template.expand(&ctx(&[9000])).unwrap();
        assert_eq!(args[1], "echo serving portland on 9000");
    }

    #[test]
    fn test_unknown_braces_pass_through() {
        let template = CommandTemplate::new("sh", ["-c", "echo {unknown} {graph_dir} {"]);
        let args = template.expand(&ctx(&[])).unwrap();
        assert_eq!(args[1], "echo {unknown} graphs/portland {");
    }

    #[test]
    fn test_missing_port_is_an_error() {
        let template = CommandTemplate::new("java", ["--securePort", "{port.1}"]);
        assert!(template.expand(&ctx(&[8100])).is_err());
    }

    #[test]
    fn test_missing_osm_file_is_an_error() {
        let template = CommandTemplate::new("java", ["datareader.file={osm_file}"]);
        assert!(template.expand(&ctx(&[])).is_err());

        let osm = Path::new("graphs/portland/map.osm");
        let mut with_osm = ctx(&[]);
        with_osm.osm_file = Some(osm);
        assert_eq!(
            template.expand(&with_osm).unwrap(),
            vec!["datareader.file=graphs/portland/map.osm"]
        );
    }

    #[test]
    fn test_engine_jar_placeholder() {
        let template = CommandTemplate::new("java", ["-jar", "{engine_jar}", "--build", "{graph_dir}"]);
        assert!(template.expand(&ctx(&[])).is_err());

        let jar = Path::new("engines/otp-1.1.0-shaded.jar");
        let mut with_jar = ctx(&[]);
        with_jar.engine_jar = Some(jar);
        assert_eq!(
            template.expand(&with_jar).unwrap(),
            vec!["-jar", "engines/otp-1.1.0-shaded.jar", "--build", "graphs/portland"]
        );
    }
}
