mod args;
mod console;

use args::{parse_args, print_help, Config};
use console::ConsoleSink;
use llm::{CancelFlag, Error, ErrorKind, EventHub, JsonlEventSink, ModelsFile, QueryRunner};
use serde_json::json;
use std::io::IsTerminal;
use std::path::PathBuf;
use std::process;
use tracing::{debug, warn};
use tracing_subscriber::EnvFilter;

/// Ctrl+C で中断したときの終了コード
const EXIT_CANCELLED: i32 = 130;

/// models.json の場所: --config → $ASK_CONFIG → $XDG_CONFIG_HOME/ask → ~/.config/ask
fn resolve_config_path(
    explicit: Option<PathBuf>,
    ask_config: Option<String>,
    xdg_config_home: Option<String>,
    home: Option<String>,
) -> Result<PathBuf, Error> {
    if let Some(path) = explicit {
        return Ok(path);
    }
    if let Some(path) = ask_config.filter(|s| !s.trim().is_empty()) {
        return Ok(PathBuf::from(path));
    }
    if let Some(dir) = xdg_config_home.filter(|s| !s.trim().is_empty()) {
        return Ok(PathBuf::from(dir).join("ask").join("models.json"));
    }
    match home.filter(|s| !s.trim().is_empty()) {
        Some(home) => Ok(PathBuf::from(home)
            .join(".config")
            .join("ask")
            .join("models.json")),
        None => Err(Error::config(
            "no models file: pass --config or set ASK_CONFIG",
        )),
    }
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(std::io::stderr().is_terminal())
        .try_init();
}

fn run(config: Config) -> Result<i32, Error> {
    let path = resolve_config_path(
        config.config_path.clone(),
        std::env::var("ASK_CONFIG").ok(),
        std::env::var("XDG_CONFIG_HOME").ok(),
        std::env::var("HOME").ok(),
    )?;
    debug!(path = %path.display(), "loading models file");
    let models = ModelsFile::load(&path)?;

    if config.list_models {
        for name in models.names() {
            if models.default.as_deref() == Some(name) {
                println!("{} (default)", name);
            } else {
                println!("{}", name);
            }
        }
        return Ok(0);
    }

    let prompt = config
        .prompt()
        .ok_or_else(|| Error::config("no prompt given (see ask --help)"))?;

    let mut model = models.select(config.model.as_deref())?.clone();
    if let Some(stream) = config.stream {
        model.inference.insert("stream".to_string(), json!(stream));
    }

    let mut runner = QueryRunner::from_config(model)?;
    if let Some(system) = &config.system {
        runner = runner.with_system_prompt(system.clone());
    }

    let cancel = CancelFlag::new();
    let handler_flag = cancel.clone();
    if let Err(e) = ctrlc::set_handler(move || handler_flag.cancel()) {
        warn!("failed to install Ctrl+C handler: {}", e);
    }

    let mut hub = EventHub::default();
    hub.push(Box::new(ConsoleSink::stdio(std::io::stderr().is_terminal())));
    if let Some(transcript) = &config.transcript {
        match JsonlEventSink::create(transcript) {
            Ok(sink) => hub.push(Box::new(sink)),
            Err(e) => warn!("transcript disabled: {:#}", e),
        }
    }

    let reply = runner.query(&prompt, &mut hub, &cancel);
    if reply.is_cancelled() {
        eprintln!("ask: cancelled");
        return Ok(EXIT_CANCELLED);
    }
    match reply.error_kind() {
        Some(kind) => {
            let message = reply.final_response();
            eprintln!("ask: {}", message.strip_prefix("ERROR: ").unwrap_or(message));
            Ok(kind.exit_code())
        }
        None => Ok(0),
    }
}

fn main() {
    let config = match parse_args() {
        Ok(c) => c,
        Err(e) => {
            let _ = e.print();
            process::exit(ErrorKind::Configuration.exit_code());
        }
    };
    if config.help {
        print_help();
        process::exit(0);
    }
    init_logging(config.verbose);

    let code = match run(config) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("ask: {}", e);
            e.exit_code()
        }
    };
    process::exit(code);
}
