use std::path::PathBuf;

use anyhow::anyhow;
use dotenvy::dotenv;
use tracing::error;

mod commands;
mod config;
mod db;
mod llm;
mod pipeline;
mod request;
mod utils;

use commands::{print_angles, run_photoshoot, show_credits, show_history, RunArgs};
use config::CONFIG;
use utils::logging::init_logging;

const DEFAULT_HISTORY_LIMIT: i64 = 10;

#[derive(Debug, Clone, PartialEq, Eq)]
enum CliCommand {
    Run(RunArgs),
    Credits { user_id: String, grant: Option<i64> },
    History { user_id: String, limit: i64 },
    Angles,
}

fn usage() -> &'static str {
    "Usage:\n  photoshoot_studio run --request <file.json> [--user <id>] [--guest-credits <n>]\n  photoshoot_studio credits --user <id> [--grant <n>]\n  photoshoot_studio history --user <id> [--limit <n>]\n  photoshoot_studio angles"
}

fn take_value<'a>(args: &'a [String], index: &mut usize, flag: &str) -> anyhow::Result<&'a str> {
    *index += 1;
    args.get(*index)
        .map(|value| value.as_str())
        .ok_or_else(|| anyhow!("Missing value for {flag}"))
}

fn parse_number<T: std::str::FromStr>(value: &str, flag: &str) -> anyhow::Result<T> {
    value
        .parse::<T>()
        .map_err(|_| anyhow!("Invalid {flag} value: {value}"))
}

fn parse_cli_args(args: &[String]) -> anyhow::Result<CliCommand> {
    let command = args.get(1).map(|value| value.as_str());
    let mut request_path: Option<PathBuf> = None;
    let mut user_id: Option<String> = None;
    let mut guest_credits: Option<i64> = None;
    let mut grant: Option<i64> = None;
    let mut limit = DEFAULT_HISTORY_LIMIT;

    let mut index = 2;
    while index < args.len() {
        match args[index].as_str() {
            "--request" => {
                request_path = Some(PathBuf::from(take_value(args, &mut index, "--request")?));
            }
            "--user" => {
                user_id = Some(take_value(args, &mut index, "--user")?.to_string());
            }
            "--guest-credits" => {
                let value = take_value(args, &mut index, "--guest-credits")?;
                guest_credits = Some(parse_number::<i64>(value, "--guest-credits")?.max(0));
            }
            "--grant" => {
                let value = take_value(args, &mut index, "--grant")?;
                grant = Some(parse_number::<i64>(value, "--grant")?);
            }
            "--limit" => {
                let value = take_value(args, &mut index, "--limit")?;
                limit = parse_number::<i64>(value, "--limit")?.max(1);
            }
            "--help" | "-h" => {
                return Err(anyhow!(usage()));
            }
            other => {
                return Err(anyhow!("Unknown argument: {other}\n{}", usage()));
            }
        }
        index += 1;
    }

    match command {
        Some("run") => {
            let request_path = request_path.ok_or_else(|| anyhow!("--request is required"))?;
            if user_id.is_some() && guest_credits.is_some() {
                return Err(anyhow!("--user and --guest-credits cannot be combined"));
            }
            Ok(CliCommand::Run(RunArgs {
                request_path,
                user_id,
                guest_credits,
            }))
        }
        Some("credits") => Ok(CliCommand::Credits {
            user_id: user_id.ok_or_else(|| anyhow!("--user is required"))?,
            grant,
        }),
        Some("history") => Ok(CliCommand::History {
            user_id: user_id.ok_or_else(|| anyhow!("--user is required"))?,
            limit,
        }),
        Some("angles") => Ok(CliCommand::Angles),
        Some(other) => Err(anyhow!("Unknown command: {other}\n{}", usage())),
        None => Err(anyhow!(usage())),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    let _guards = init_logging(&CONFIG.log_level);

    let args: Vec<String> = std::env::args().collect();
    let command = parse_cli_args(&args)?;

    let result = match command {
        CliCommand::Run(run_args) => run_photoshoot(run_args).await,
        CliCommand::Credits { user_id, grant } => show_credits(&user_id, grant).await,
        CliCommand::History { user_id, limit } => show_history(&user_id, limit).await,
        CliCommand::Angles => {
            print_angles();
            Ok(())
        }
    };

    if let Err(err) = &result {
        error!("{err:#}");
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(values: &[&str]) -> Vec<String> {
        std::iter::once("photoshoot_studio")
            .chain(values.iter().copied())
            .map(str::to_string)
            .collect()
    }

    #[test]
    fn parses_run_with_guest_credits() {
        let command =
            parse_cli_args(&args(&["run", "--request", "shoot.json", "--guest-credits", "4"]))
                .unwrap();
        assert_eq!(
            command,
            CliCommand::Run(RunArgs {
                request_path: PathBuf::from("shoot.json"),
                user_id: None,
                guest_credits: Some(4),
            })
        );
    }

    #[test]
    fn history_limit_defaults_and_requires_user() {
        assert_eq!(
            parse_cli_args(&args(&["history", "--user", "ann"])).unwrap(),
            CliCommand::History {
                user_id: "ann".to_string(),
                limit: DEFAULT_HISTORY_LIMIT
            }
        );
        assert!(parse_cli_args(&args(&["history"])).is_err());
    }

    #[test]
    fn rejects_missing_values_and_unknown_flags() {
        let err = parse_cli_args(&args(&["credits", "--grant"])).unwrap_err();
        assert!(err.to_string().contains("Missing value for --grant"));
        assert!(parse_cli_args(&args(&["run", "--verbose"])).is_err());
        assert!(parse_cli_args(&args(&[
            "run",
            "--request",
            "a.json",
            "--user",
            "ann",
            "--guest-credits",
            "2"
        ]))
        .is_err());
    }
}
