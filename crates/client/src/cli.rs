use std::path::PathBuf;

use anyhow::Context;
use teleconsult_protocol::{AuthToken, Role};

pub(crate) const DEFAULT_CONFIG_PATH: &str = "teleconsult.toml";
pub(crate) const TOKEN_ENV: &str = "TELECONSULT_TOKEN";

pub(crate) struct Args {
    pub config_path: PathBuf,
    pub server_url: Option<String>,
    pub room: String,
    pub role: Role,
    pub participant: String,
    pub tls_cert_path: Option<String>,
    pub token: AuthToken,
}

pub(crate) enum Invocation {
    Run(Args),
    Help,
    Version,
}

pub(crate) fn print_help() {
    println!("teleconsult - Teleconsultation session client");
    println!();
    println!("USAGE:");
    println!("    teleconsult --room <CODE> --role <ROLE> [OPTIONS]");
    println!();
    println!("OPTIONS:");
    println!("    --config <PATH>              Config file [default: {DEFAULT_CONFIG_PATH}]");
    println!("    --server-url <URL>           Signaling server base URL (overrides config)");
    println!("    --room <CODE>                Conference code (required)");
    println!("    --role <ROLE>                initiator|medecin or joiner|patient (required)");
    println!("    --participant <NAME>         Local participant name [default: $USER]");
    println!("    --tls-cert <PATH>            TLS certificate to pin for server connection");
    println!("    --token <TOKEN>              Session token (prefer {TOKEN_ENV} env)");
    println!("    -V, --version                Print version and exit");
    println!("    -h, --help                   Print this help and exit");
}

pub(crate) fn parse_args(
    args: impl IntoIterator<Item = String>,
    env_token: Option<String>,
) -> anyhow::Result<Invocation> {
    let mut config_path = PathBuf::from(DEFAULT_CONFIG_PATH);
    let mut server_url = None;
    let mut room = None;
    let mut role = None;
    let mut participant = None;
    let mut tls_cert_path = None;
    let mut token = None;

    let mut args = args.into_iter();
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "-V" | "--version" => return Ok(Invocation::Version),
            "-h" | "--help" => return Ok(Invocation::Help),
            "--config" => {
                config_path = PathBuf::from(args.next().context("Missing --config value")?);
            }
            "--server-url" => {
                server_url = Some(args.next().context("Missing --server-url value")?);
            }
            "--room" => {
                room = Some(args.next().context("Missing --room value")?);
            }
            "--role" => {
                role = Some(
                    args.next()
                        .context("Missing --role value")?
                        .parse::<Role>()
                        .context("Invalid --role value")?,
                );
            }
            "--participant" => {
                participant = Some(args.next().context("Missing --participant value")?);
            }
            "--tls-cert" => {
                tls_cert_path = Some(args.next().context("Missing --tls-cert value")?);
            }
            "--token" => {
                // Visible in /proc; the env var is preferred
                token = Some(args.next().context("Missing --token value")?);
            }
            other => anyhow::bail!("Unknown argument: {other}"),
        }
    }

    let token = token
        .or(env_token)
        .filter(|t| !t.is_empty())
        .with_context(|| format!("A session token is required (--token or {TOKEN_ENV})"))?;
    let room = room.context("--room is required")?;
    if room.trim().is_empty() {
        anyhow::bail!("--room must not be empty");
    }

    Ok(Invocation::Run(Args {
        config_path,
        server_url,
        room,
        role: role.context("--role is required")?,
        participant: participant
            .or_else(|| std::env::var("USER").ok())
            .unwrap_or_else(|| "anonymous".to_string()),
        tls_cert_path,
        token: AuthToken::new(token),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str], env_token: Option<&str>) -> anyhow::Result<Invocation> {
        parse_args(
            args.iter().map(|a| a.to_string()),
            env_token.map(str::to_string),
        )
    }

    fn run(args: &[&str], env_token: Option<&str>) -> Args {
        match parse(args, env_token).unwrap() {
            Invocation::Run(args) => args,
            _ => panic!("Expected a run invocation"),
        }
    }

    #[test]
    fn minimal_invocation_uses_env_token() {
        let args = run(&["--room", "ABC123", "--role", "medecin"], Some("env-tok"));
        assert_eq!(args.room, "ABC123");
        assert_eq!(args.role, Role::Initiator);
        assert_eq!(args.token.expose(), "env-tok");
        assert_eq!(args.config_path, PathBuf::from(DEFAULT_CONFIG_PATH));
        assert!(args.server_url.is_none());
    }

    #[test]
    fn cli_token_wins_over_env() {
        let args = run(
            &[
                "--room",
                "R",
                "--role",
                "joiner",
                "--token",
                "cli-tok",
                "--participant",
                "alice",
                "--server-url",
                "https://consult.example.org",
            ],
            Some("env-tok"),
        );
        assert_eq!(args.token.expose(), "cli-tok");
        assert_eq!(args.participant, "alice");
        assert_eq!(args.role, Role::Joiner);
        assert_eq!(
            args.server_url.as_deref(),
            Some("https://consult.example.org")
        );
    }

    #[test]
    fn missing_required_values_are_errors() {
        assert!(parse(&["--room", "R", "--role", "joiner"], None).is_err());
        assert!(parse(&["--role", "joiner"], Some("t")).is_err());
        assert!(parse(&["--room", "R"], Some("t")).is_err());
        assert!(parse(&["--room", "R", "--role", "nurse"], Some("t")).is_err());
        assert!(parse(&["--room"], Some("t")).is_err());
        assert!(parse(&["--bogus"], Some("t")).is_err());
    }

    #[test]
    fn help_and_version_short_circuit() {
        assert!(matches!(parse(&["-h"], None), Ok(Invocation::Help)));
        assert!(matches!(
            parse(&["--version", "--bogus"], None),
            Ok(Invocation::Version)
        ));
    }
}
