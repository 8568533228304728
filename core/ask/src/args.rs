//! コマンドライン引数の解析

use clap::builder::ArgAction;
use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Config {
    pub help: bool,
    /// -c / --config: models.json のパス
    pub config_path: Option<PathBuf>,
    pub model: Option<String>,
    /// --stream / --no-stream。未指定ならモデル設定に従う
    pub stream: Option<bool>,
    pub system: Option<String>,
    /// --transcript: イベントを JSONL で追記するファイル
    pub transcript: Option<PathBuf>,
    pub list_models: bool,
    /// -v / --verbose: debug ログを stderr に出す
    pub verbose: bool,
    pub prompt_args: Vec<String>,
}

impl Config {
    /// 位置引数を空白で連結したプロンプト（空なら None）
    pub fn prompt(&self) -> Option<String> {
        let joined = self.prompt_args.join(" ");
        if joined.trim().is_empty() {
            None
        } else {
            Some(joined)
        }
    }
}

fn build_clap_command() -> clap::Command {
    clap::Command::new("ask")
        .about("Send a prompt to a configured LLM and stream the reply")
        .disable_help_flag(true)
        .arg(
            clap::Arg::new("help")
                .short('h')
                .long("help")
                .help("Show this help message")
                .action(ArgAction::SetTrue),
        )
        .arg(
            clap::Arg::new("config")
                .short('c')
                .long("config")
                .value_name("file")
                .help("Path to models.json (default: $ASK_CONFIG or ~/.config/ask/models.json)")
                .num_args(1),
        )
        .arg(
            clap::Arg::new("model")
                .short('m')
                .long("model")
                .value_name("model")
                .help("Model name from the models file")
                .num_args(1),
        )
        .arg(
            clap::Arg::new("stream")
                .long("stream")
                .help("Force streaming")
                .action(ArgAction::SetTrue)
                .conflicts_with("no-stream"),
        )
        .arg(
            clap::Arg::new("no-stream")
                .long("no-stream")
                .help("Disable streaming")
                .action(ArgAction::SetTrue),
        )
        .arg(
            clap::Arg::new("system")
                .short('S')
                .long("system")
                .value_name("instruction")
                .help("Set system prompt for this query")
                .num_args(1),
        )
        .arg(
            clap::Arg::new("transcript")
                .long("transcript")
                .value_name("file")
                .help("Append orchestrator events to a JSONL file")
                .num_args(1),
        )
        .arg(
            clap::Arg::new("list-models")
                .long("list-models")
                .help("List models in the models file")
                .action(ArgAction::SetTrue),
        )
        .arg(
            clap::Arg::new("verbose")
                .short('v')
                .long("verbose")
                .help("Emit debug logs to stderr")
                .action(ArgAction::SetTrue),
        )
        .arg(
            clap::Arg::new("prompt")
                .index(1)
                .help("Prompt words")
                .num_args(0..)
                .trailing_var_arg(true),
        )
}

fn matches_to_config(matches: &clap::ArgMatches) -> Config {
    let stream = if matches.get_flag("stream") {
        Some(true)
    } else if matches.get_flag("no-stream") {
        Some(false)
    } else {
        None
    };
    Config {
        help: matches.get_flag("help"),
        config_path: matches.get_one::<String>("config").map(PathBuf::from),
        model: matches.get_one::<String>("model").cloned(),
        stream,
        system: matches.get_one::<String>("system").cloned(),
        transcript: matches.get_one::<String>("transcript").map(PathBuf::from),
        list_models: matches.get_flag("list-models"),
        verbose: matches.get_flag("verbose"),
        prompt_args: matches
            .get_many::<String>("prompt")
            .map(|i| i.cloned().collect())
            .unwrap_or_default(),
    }
}

pub fn parse_args() -> Result<Config, clap::Error> {
    let matches = build_clap_command().try_get_matches()?;
    Ok(matches_to_config(&matches))
}

/// 引数スライスから解析する
#[cfg(test)]
fn parse_args_from(args: &[&str]) -> Result<Config, clap::Error> {
    let matches = build_clap_command().try_get_matches_from(args)?;
    Ok(matches_to_config(&matches))
}

pub fn print_help() {
    let _ = build_clap_command().print_help();
    println!();
}
