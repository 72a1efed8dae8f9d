use std::path::PathBuf;

use feedline::app::RunOptions;
use feedline::feed::Tab;

const HELP: &str = "Feedline - unified prediction and daily-post feed.\n\n  --version, -V        Show version and exit\n  --help,    -h        Show this help message\n  --tab <name>         predictions, daily or all\n  --pages <n>          Number of pages to load per stream\n  --config <path>      Read configuration from <path>\n  --demo               Use built-in sample data instead of the API";

fn main() {
    let options = match parse_args(std::env::args().skip(1)) {
        Ok(Some(options)) => options,
        Ok(None) => return,
        Err(message) => {
            eprintln!("error: {message}\n\n{HELP}");
            std::process::exit(2);
        }
    };

    if let Err(err) = feedline::run(options) {
        eprintln!("error: {err:?}");
        std::process::exit(1);
    }
}

/// `Ok(None)` means an informational flag was handled and nothing should run.
fn parse_args(mut args: impl Iterator<Item = String>) -> Result<Option<RunOptions>, String> {
    let mut options = RunOptions::default();
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--version" | "-V" => {
                println!("Feedline {}", feedline::VERSION);
                return Ok(None);
            }
            "--help" | "-h" => {
                println!("{HELP}");
                return Ok(None);
            }
            "--demo" => options.demo = true,
            "--tab" => {
                let value = args.next().ok_or("--tab requires a value")?;
                options.tab =
                    Some(Tab::from_key(&value).ok_or_else(|| format!("unknown tab {value:?}"))?);
            }
            "--pages" => {
                let value = args.next().ok_or("--pages requires a value")?;
                options.pages = value
                    .parse::<usize>()
                    .map_err(|_| format!("invalid page count {value:?}"))?;
            }
            "--config" => {
                let value = args.next().ok_or("--config requires a value")?;
                options.config_file = Some(PathBuf::from(value));
            }
            other => return Err(format!("unknown argument {other:?}")),
        }
    }
    Ok(Some(options))
}
