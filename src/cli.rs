//! Command-line surface.
//!
//! One subcommand per registered engine forces that engine as the session
//! default; flags control delivery mode, logging, and onboarding.

use std::path::PathBuf;

use clap::{Arg, ArgAction, Command};

use crate::model::EngineId;

#[derive(Debug, Clone)]
pub struct CliArgs {
    /// Engine forced by a subcommand, if any.
    pub engine: Option<EngineId>,
    pub config: Option<PathBuf>,
    pub final_notify: bool,
    pub debug: bool,
    pub onboard: bool,
}

pub fn command(engine_ids: &[EngineId]) -> Command {
    let mut cmd = Command::new("takopi")
        .about("Telegram bridge for coding-agent CLIs")
        .arg(
            Arg::new("config")
                .long("config")
                .value_name("PATH")
                .value_parser(clap::value_parser!(PathBuf))
                .help("Config file path (default: ~/.config/takopi/takopi.toml)"),
        )
        .arg(
            Arg::new("final-notify")
                .long("final-notify")
                .action(ArgAction::SetTrue)
                .overrides_with("no-final-notify")
                .help("Deliver the final answer as a new, notifying message (default)"),
        )
        .arg(
            Arg::new("no-final-notify")
                .long("no-final-notify")
                .action(ArgAction::SetTrue)
                .help("Edit the final answer into the progress message instead"),
        )
        .arg(
            Arg::new("debug")
                .long("debug")
                .action(ArgAction::SetTrue)
                .overrides_with("no-debug")
                .help("Verbose logging"),
        )
        .arg(
            Arg::new("no-debug")
                .long("no-debug")
                .action(ArgAction::SetTrue)
                .help("Default logging"),
        )
        .arg(
            Arg::new("onboard")
                .long("onboard")
                .action(ArgAction::SetTrue)
                .help("Print config guidance and exit"),
        );
    for engine in engine_ids {
        cmd = cmd.subcommand(
            Command::new(engine.as_str().to_string())
                .about(format!("Run with {engine} as the default engine")),
        );
    }
    cmd
}

pub fn parse(engine_ids: &[EngineId]) -> CliArgs {
    from_matches(command(engine_ids).get_matches(), engine_ids)
}

fn from_matches(matches: clap::ArgMatches, engine_ids: &[EngineId]) -> CliArgs {
    let engine = matches
        .subcommand_name()
        .and_then(|name| engine_ids.iter().find(|id| id.as_str() == name))
        .cloned();
    CliArgs {
        engine,
        config: matches.get_one::<PathBuf>("config").cloned(),
        final_notify: !matches.get_flag("no-final-notify"),
        debug: matches.get_flag("debug"),
        onboard: matches.get_flag("onboard"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids() -> Vec<EngineId> {
        vec![EngineId::new("codex"), EngineId::new("claude")]
    }

    fn parse_from(argv: &[&str]) -> CliArgs {
        let ids = ids();
        from_matches(
            command(&ids).try_get_matches_from(argv).unwrap(),
            &ids,
        )
    }

    #[test]
    fn defaults() {
        let args = parse_from(&["takopi"]);
        assert!(args.engine.is_none());
        assert!(args.final_notify);
        assert!(!args.debug);
        assert!(!args.onboard);
    }

    #[test]
    fn engine_subcommand_forces_default() {
        let args = parse_from(&["takopi", "claude"]);
        assert_eq!(args.engine.unwrap().as_str(), "claude");
    }

    #[test]
    fn no_final_notify_flips_delivery_mode() {
        let args = parse_from(&["takopi", "--no-final-notify"]);
        assert!(!args.final_notify);
    }

    #[test]
    fn unknown_subcommand_is_rejected() {
        let ids = ids();
        assert!(command(&ids)
            .try_get_matches_from(["takopi", "ghost"])
            .is_err());
    }
}
